//! Wire types and constants for the subscription engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default delta refresh rate requested from the server, in milliseconds.
pub const DEFAULT_REFRESH_RATE_MS: u64 = 1000;
/// Lowest refresh rate the server accepts; lower requests are rounded up.
pub const MIN_REFRESH_RATE_MS: u64 = 100;
/// Delay before retrying a subscribe that failed with a network error.
pub const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Server message identifying a subscribe that collided with an existing
/// (streaming session, reference id) key.
pub const DUPLICATE_KEY_MESSAGE: &str =
    "Subscription Key (Streaming Session, Reference Id) already in use";
/// Server error code for a wire format it cannot produce.
pub const ERROR_UNSUPPORTED_FORMAT: &str = "UnsupportedSubscriptionFormat";

/// Property name marking a record as deleted inside a delta. The engine
/// passes it through untouched; consumers use it to drop rows.
pub const DELETED_PROPERTY: &str = "__meta_deleted";

static NEXT_REFERENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next reference id.
///
/// The counter is process-wide: the server keys subscriptions by
/// (streaming session, reference id), so ids must never repeat across
/// subscriptions within a session.
pub(crate) fn next_reference_id() -> String {
    NEXT_REFERENCE_ID.fetch_add(1, Ordering::Relaxed).to_string()
}

/// Kind of payload handed to the update callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// Full state delivered in the subscribe response.
    Snapshot = 1,
    /// Incremental update streamed over the multiplexed connection.
    Delta = 2,
}

/// Arguments sent to the server when the subscription is created.
///
/// `top` never travels in the POST body; it is moved to a `$top` query
/// parameter. `arguments` is opaque to the engine.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip)]
    pub top: Option<u32>,
}

impl SubscriptionArgs {
    pub fn with_format(format: impl Into<String>) -> Self {
        Self {
            format: Some(format.into()),
            ..Self::default()
        }
    }
}

/// Normalize a requested refresh rate: absent means the default, anything
/// below the floor is rounded up to it.
pub(crate) fn normalize_refresh_rate(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(DEFAULT_REFRESH_RATE_MS)
        .max(MIN_REFRESH_RATE_MS)
}

/// Body of a successful subscribe response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SubscribeResponse {
    pub state: Option<String>,
    pub format: Option<String>,
    pub context_id: Option<String>,
    pub inactivity_timeout: Option<u64>,
    pub refresh_rate: Option<u64>,
    pub snapshot: Option<Value>,
    pub schema: Option<String>,
    pub schema_name: Option<String>,
}

/// One frame from the multiplexed streaming connection, routed to its
/// subscription by reference id. `data` is the raw payload on arrival and
/// the parsed payload when handed to the update callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamingMessage {
    pub reference_id: String,
    pub data: Value,
}

impl StreamingMessage {
    pub fn new(reference_id: impl Into<String>, data: Value) -> Self {
        Self {
            reference_id: reference_id.into(),
            data,
        }
    }
}
