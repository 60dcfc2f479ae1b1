//! Error types for payload parsing.

/// Errors raised while decoding a streaming payload or registering a schema.
#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    /// The payload could not be decoded in this parser's format.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A payload referenced a schema that was never registered.
    #[error("schema not registered: {0}")]
    UnknownSchema(String),

    /// The server-provided schema could not be registered.
    #[error("schema registration failed for {name}: {reason}")]
    SchemaRejected { name: String, reason: String },
}
