//! Streaming host façade.
//!
//! The host owns the subscriptions and serializes everything that reaches
//! them: transport replies, streaming frames, heartbeats, connection
//! signals, and retry timer expiries all arrive as [`HostEvent`]s on one
//! channel and are applied from one task, which is what lets the
//! subscription engine run without locks. It also sweeps subscriptions for
//! inactivity orphaning on a fixed interval.
//!
//! The multiplexed socket itself is out of scope: whatever owns it feeds
//! frames and connection signals into the host through
//! [`StreamingHost::event_sender`].

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use pushstream_transport::TransportReply;

use crate::config::HostConfig;
use crate::subscription::Subscription;
use crate::timer::TokioRetryTimer;
use crate::types::StreamingMessage;

/// Everything that can happen to the host's subscriptions.
#[derive(Debug)]
pub enum HostEvent {
    /// An HTTP request issued by a subscription settled.
    Reply(TransportReply),
    /// A delta frame arrived on the multiplexed connection.
    StreamingData(StreamingMessage),
    /// The connection signalled liveness for these reference ids.
    Heartbeat { reference_ids: Vec<String> },
    /// The multiplexed connection is up, under the given context id.
    ConnectionAvailable { context_id: String },
    /// The multiplexed connection dropped.
    ConnectionUnavailable,
    /// A subscription's network-error retry delay elapsed.
    RetryElapsed { owner: u64 },
}

/// Owns subscriptions and dispatches incoming events to them.
pub struct StreamingHost {
    subscriptions: HashMap<u64, Subscription>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<HostEvent>>,
    config: HostConfig,
}

impl StreamingHost {
    pub fn new(config: HostConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            subscriptions: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
            config,
        }
    }

    /// Sender for feeding events into the host: the connection's frames,
    /// heartbeats, and availability signals all use it.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<HostEvent> {
        self.events_tx.clone()
    }

    /// Reply channel for constructing a transport: completions sent here are
    /// forwarded into the host's event stream.
    pub fn reply_sender(&self) -> mpsc::UnboundedSender<TransportReply> {
        let (replies_tx, mut replies_rx) = mpsc::unbounded_channel();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(reply) = replies_rx.recv().await {
                if events.send(HostEvent::Reply(reply)).is_err() {
                    break;
                }
            }
        });
        replies_tx
    }

    /// Take ownership of a subscription, wiring its retry timer to this
    /// host. Returns the id used to address it afterwards.
    pub fn add_subscription(&mut self, mut subscription: Subscription) -> u64 {
        let id = subscription.id();
        subscription.set_retry_timer(Box::new(TokioRetryTimer::new(self.events_tx.clone(), id)));
        subscription.set_retry_delay(self.config.network_retry_delay);
        self.subscriptions.insert(id, subscription);
        id
    }

    pub fn subscription_mut(&mut self, id: u64) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(&id)
    }

    pub fn remove_subscription(&mut self, id: u64) -> Option<Subscription> {
        self.subscriptions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Apply one event. Exposed for hosts that drive the loop themselves.
    pub fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Reply(reply) => {
                match self.subscriptions.get_mut(&reply.handle.owner) {
                    Some(subscription) => subscription.handle_transport_reply(reply),
                    None => debug!(
                        owner = reply.handle.owner,
                        "reply for a removed subscription dropped"
                    ),
                }
            }
            HostEvent::StreamingData(message) => {
                if !self.route_streaming_data(message) {
                    // Not fatal: the server may still be flushing frames for
                    // a subscription we already tore down.
                    debug!("streaming frame had no live subscription");
                }
            }
            HostEvent::Heartbeat { reference_ids } => {
                for reference_id in reference_ids {
                    if let Some(subscription) = self.find_by_reference_id(&reference_id) {
                        subscription.on_heartbeat();
                    }
                }
            }
            HostEvent::ConnectionAvailable { context_id } => {
                info!(%context_id, "streaming connection available");
                for subscription in self.subscriptions.values_mut() {
                    subscription.set_streaming_context_id(context_id.clone());
                    subscription.on_connection_available();
                }
            }
            HostEvent::ConnectionUnavailable => {
                info!("streaming connection unavailable");
                for subscription in self.subscriptions.values_mut() {
                    subscription.on_connection_unavailable();
                }
            }
            HostEvent::RetryElapsed { owner } => {
                if let Some(subscription) = self.subscriptions.get_mut(&owner) {
                    subscription.on_network_retry();
                }
            }
        }
    }

    /// Route a frame to the subscription holding its reference id. Returns
    /// whether any subscription accepted it.
    pub fn route_streaming_data(&mut self, message: StreamingMessage) -> bool {
        match self.find_by_reference_id(&message.reference_id) {
            Some(subscription) => subscription.on_streaming_data(message),
            None => false,
        }
    }

    /// Park every subscription carrying `tag` for a bulk unsubscribe.
    /// Returns the ids of the parked subscriptions.
    pub fn mark_unsubscribe_by_tag(&mut self, tag: &str) -> Vec<u64> {
        let mut marked = Vec::new();
        for subscription in self.subscriptions.values_mut() {
            if subscription.tag() == Some(tag) {
                subscription.on_unsubscribe_by_tag_pending();
                marked.push(subscription.id());
            }
        }
        marked
    }

    /// Whether every subscription carrying `tag` is parked and ready for
    /// the bulk DELETE.
    pub fn is_ready_for_unsubscribe_by_tag(&self, tag: &str) -> bool {
        self.subscriptions
            .values()
            .filter(|subscription| subscription.tag() == Some(tag))
            .all(Subscription::is_ready_for_unsubscribe_by_tag)
    }

    /// The bulk DELETE for `tag` settled; release the parked subscriptions.
    pub fn complete_unsubscribe_by_tag(&mut self, tag: &str) {
        for subscription in self.subscriptions.values_mut() {
            if subscription.tag() == Some(tag) && subscription.is_ready_for_unsubscribe_by_tag() {
                subscription.on_unsubscribe_by_tag_complete();
            }
        }
    }

    /// Reset every subscription whose inactivity window has elapsed.
    pub fn sweep_orphans(&mut self, now: Instant) {
        let orphaned: Vec<u64> = self
            .subscriptions
            .values()
            .filter(|subscription| {
                subscription
                    .time_till_orphaned(now)
                    .is_some_and(|remaining| remaining.is_zero())
            })
            .map(Subscription::id)
            .collect();
        for id in orphaned {
            info!(id, "subscription went silent past its inactivity timeout; resetting");
            if let Some(subscription) = self.subscriptions.get_mut(&id) {
                subscription.reset();
            }
        }
    }

    /// Drive the host until the event channel closes.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub async fn run(&mut self) {
        let mut events_rx = self
            .events_rx
            .take()
            .expect("run() can only be called once");
        let mut orphan_check = tokio::time::interval(self.config.orphan_check_interval);
        orphan_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                _ = orphan_check.tick() => {
                    self.sweep_orphans(Instant::now());
                }
            }
        }
    }

    fn find_by_reference_id(&mut self, reference_id: &str) -> Option<&mut Subscription> {
        self.subscriptions
            .values_mut()
            .find(|subscription| subscription.reference_id() == Some(reference_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionOptions;
    use crate::types::SubscriptionArgs;
    use pushstream_parser::ParserFacade;
    use pushstream_transport::{Transport, TransportRequest};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<TransportRequest>>,
    }

    impl Transport for RecordingTransport {
        fn post(&self, request: TransportRequest) {
            self.requests.lock().unwrap().push(request);
        }

        fn delete(&self, request: TransportRequest) {
            self.requests.lock().unwrap().push(request);
        }

        fn patch(&self, request: TransportRequest) {
            self.requests.lock().unwrap().push(request);
        }
    }

    fn subscription(transport: Arc<RecordingTransport>, tag: Option<&str>) -> Subscription {
        let mut args = SubscriptionArgs::with_format("application/json");
        args.tag = tag.map(str::to_string);
        Subscription::new(
            "ctx-1",
            "trade/",
            "v1/prices/subscriptions",
            args,
            SubscriptionOptions::new(),
            transport,
            Arc::new(ParserFacade::new()),
        )
    }

    #[tokio::test]
    async fn test_replies_route_by_owner() {
        let transport = Arc::new(RecordingTransport::default());
        let mut host = StreamingHost::new(HostConfig::default());
        let id = host.add_subscription(subscription(transport.clone(), None));

        host.subscription_mut(id).unwrap().on_subscribe().unwrap();
        let handle = transport.requests.lock().unwrap()[0].handle.clone();
        host.handle_event(HostEvent::Reply(TransportReply {
            handle,
            result: Ok(serde_json::json!({"InactivityTimeout": 30})),
        }));

        assert_eq!(
            host.subscription_mut(id).unwrap().state(),
            crate::SubscriptionState::Subscribed
        );
    }

    #[tokio::test]
    async fn test_frames_route_by_reference_id() {
        let transport = Arc::new(RecordingTransport::default());
        let mut host = StreamingHost::new(HostConfig::default());
        let id = host.add_subscription(subscription(transport.clone(), None));

        host.subscription_mut(id).unwrap().on_subscribe().unwrap();
        let reference_id = host
            .subscription_mut(id)
            .unwrap()
            .reference_id()
            .unwrap()
            .to_string();

        // Buffered while the subscribe is still in flight.
        assert!(host.route_streaming_data(StreamingMessage::new(
            reference_id,
            serde_json::json!({"a": 1})
        )));
        // Unknown reference id is not for anyone.
        assert!(!host.route_streaming_data(StreamingMessage::new(
            "unknown",
            serde_json::json!({})
        )));
    }

    #[tokio::test]
    async fn test_bulk_unsubscribe_by_tag_flow() {
        let transport = Arc::new(RecordingTransport::default());
        let mut host = StreamingHost::new(HostConfig::default());
        let tagged = host.add_subscription(subscription(transport.clone(), Some("fx")));
        let untagged = host.add_subscription(subscription(transport.clone(), None));

        let marked = host.mark_unsubscribe_by_tag("fx");
        assert_eq!(marked, [tagged]);
        assert!(host.is_ready_for_unsubscribe_by_tag("fx"));
        assert!(host
            .subscription_mut(tagged)
            .unwrap()
            .is_ready_for_unsubscribe_by_tag());
        assert!(!host
            .subscription_mut(untagged)
            .unwrap()
            .is_ready_for_unsubscribe_by_tag());

        host.complete_unsubscribe_by_tag("fx");
        assert_eq!(
            host.subscription_mut(tagged).unwrap().state(),
            crate::SubscriptionState::Unsubscribed
        );
    }

    #[tokio::test]
    async fn test_connection_signals_fan_out() {
        let transport = Arc::new(RecordingTransport::default());
        let mut host = StreamingHost::new(HostConfig::default());
        let id = host.add_subscription(subscription(transport.clone(), None));

        host.handle_event(HostEvent::ConnectionUnavailable);
        host.subscription_mut(id).unwrap().on_subscribe().unwrap();
        assert!(transport.requests.lock().unwrap().is_empty());

        host.handle_event(HostEvent::ConnectionAvailable {
            context_id: "ctx-2".to_string(),
        });
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        // The reconnect context id is what the subscribe was issued under.
        assert_eq!(requests[0].handle.context_id, "ctx-2");
    }
}
