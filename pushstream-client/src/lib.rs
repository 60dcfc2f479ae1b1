//! Per-subscription lifecycle engine for server-push streaming backends.
//!
//! Each [`Subscription`] is a client-side handle to one logical stream:
//! established with an HTTP POST, refreshed with deltas over a multiplexed
//! connection, modified in place with PATCH, and torn down with DELETE. The
//! engine reconciles caller intent against a transport that only partially
//! cooperates: racing responses, server-initiated resets, format fallbacks,
//! duplicate-key collisions, and connection churn all arrive asynchronously
//! and are serialized through a five-state machine plus a coalescing
//! [`ActionQueue`].
//!
//! The [`StreamingHost`] owns the subscriptions, routes transport replies
//! and streaming frames to them by reference id, and runs inactivity orphan
//! detection.
//!
//! ```ignore
//! use pushstream_client::{
//!     HostConfig, StreamingHost, Subscription, SubscriptionArgs, SubscriptionOptions,
//! };
//! use pushstream_parser::ParserFacade;
//! use pushstream_transport::HttpTransport;
//!
//! let mut host = StreamingHost::new(HostConfig::default());
//! let transport = Arc::new(HttpTransport::new(
//!     "https://gateway.example.com/",
//!     host.reply_sender(),
//! ));
//!
//! let subscription = Subscription::new(
//!     context_id,
//!     "trade/",
//!     "v1/prices/subscriptions",
//!     SubscriptionArgs::with_format("application/json"),
//!     SubscriptionOptions::new().on_update(|msg, kind| println!("{kind:?}: {:?}", msg.data)),
//!     transport,
//!     Arc::new(ParserFacade::new()),
//! );
//! let id = host.add_subscription(subscription);
//! host.subscription_mut(id).unwrap().on_subscribe()?;
//! host.run().await;
//! ```

mod config;
mod error;
mod host;
pub mod logging;
mod queue;
mod state;
mod subscription;
mod timer;
mod types;

pub use config::HostConfig;
pub use error::{Result, SubscriptionError};
pub use host::{HostEvent, StreamingHost};
pub use queue::{ActionArgs, ActionQueue, QueuedAction, StreamingAction};
pub use state::SubscriptionState;
pub use subscription::{ModifyOptions, ObserverId, Subscription, SubscriptionOptions};
pub use timer::{RetryTimer, TokioRetryTimer};
pub use types::{
    StreamingMessage, SubscribeResponse, SubscriptionArgs, UpdateType, DEFAULT_REFRESH_RATE_MS,
    DELETED_PROPERTY, DUPLICATE_KEY_MESSAGE, ERROR_UNSUPPORTED_FORMAT, MIN_REFRESH_RATE_MS,
    NETWORK_RETRY_DELAY,
};
