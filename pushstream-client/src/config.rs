//! Host configuration.

use std::time::Duration;

use crate::types::NETWORK_RETRY_DELAY;

/// Configuration for the streaming host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// How often subscriptions are checked for inactivity orphaning.
    pub orphan_check_interval: Duration,
    /// Delay before a subscribe that failed with a network error is retried.
    pub network_retry_delay: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            orphan_check_interval: Duration::from_secs(1),
            network_retry_delay: NETWORK_RETRY_DELAY,
        }
    }
}
