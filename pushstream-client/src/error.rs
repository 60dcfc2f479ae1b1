//! Error types for the subscription engine.

/// Errors surfaced to callers of the subscription API.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The subscription has been disposed and can no longer subscribe.
    #[error("subscription has been disposed")]
    Disposed,

    /// A caller request was malformed, e.g. a patch modify without a delta.
    #[error("invalid action: {0}")]
    InvalidAction(String),
}

/// Convenience alias for results using [`SubscriptionError`].
pub type Result<T> = std::result::Result<T, SubscriptionError>;
