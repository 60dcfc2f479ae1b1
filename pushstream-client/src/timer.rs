//! Delayed-resubscribe timer used after transient network failures.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::host::HostEvent;

/// Arms and cancels the delayed resubscribe for one subscription.
///
/// At most one timer is pending per subscription: arming again replaces the
/// previous one, and any deliberate caller action cancels it. When the delay
/// elapses the host must call [`Subscription::on_network_retry`].
///
/// [`Subscription::on_network_retry`]: crate::Subscription::on_network_retry
pub trait RetryTimer: Send {
    fn arm(&mut self, delay: Duration);
    fn cancel(&mut self);
}

/// Tokio-backed [`RetryTimer`] delivering expiry through the host channel.
pub struct TokioRetryTimer {
    events: mpsc::UnboundedSender<HostEvent>,
    owner: u64,
    pending: Option<JoinHandle<()>>,
}

impl TokioRetryTimer {
    /// `owner` is the subscription instance id the expiry event is routed to.
    pub fn new(events: mpsc::UnboundedSender<HostEvent>, owner: u64) -> Self {
        Self {
            events,
            owner,
            pending: None,
        }
    }
}

impl RetryTimer for TokioRetryTimer {
    fn arm(&mut self, delay: Duration) {
        self.cancel();
        let events = self.events.clone();
        let owner = self.owner;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events.send(HostEvent::RetryElapsed { owner }).is_err() {
                debug!(owner, "host channel closed before the retry fired");
            }
        }));
    }

    fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

impl Drop for TokioRetryTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
