//! Subscription lifecycle states.

use std::fmt;

/// State of a single subscription.
///
/// The first five form the primary lifecycle; `ReadyForUnsubscribeByTag`
/// parks the subscription while the host performs a bulk unsubscribe of
/// everything sharing its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Unsubscribed,
    SubscribeRequested,
    Subscribed,
    UnsubscribeRequested,
    PatchRequested,
    ReadyForUnsubscribeByTag,
}

impl SubscriptionState {
    /// Whether an HTTP request is outstanding or a tag operation is parked.
    ///
    /// While transitioning, new caller actions queue instead of executing;
    /// this is what keeps at most one request in flight per subscription.
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            SubscriptionState::SubscribeRequested
                | SubscriptionState::UnsubscribeRequested
                | SubscriptionState::PatchRequested
                | SubscriptionState::ReadyForUnsubscribeByTag
        )
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::SubscribeRequested => "subscribe-requested",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::UnsubscribeRequested => "unsubscribe-requested",
            SubscriptionState::PatchRequested => "patch-requested",
            SubscriptionState::ReadyForUnsubscribeByTag => "ready-for-unsubscribe-by-tag",
        };
        f.write_str(name)
    }
}
