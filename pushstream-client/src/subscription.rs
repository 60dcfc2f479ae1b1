//! Per-subscription lifecycle engine.
//!
//! A [`Subscription`] mediates between caller intent (subscribe, modify,
//! unsubscribe, reset) and a transport that only partially cooperates:
//! responses race against resets, the server can reject a format or report a
//! duplicate key, and the connection comes and goes. The engine serializes
//! everything through a five-state machine plus a coalescing action queue,
//! keeping at most one request in flight per subscription.
//!
//! All methods assume the host drives them from one logical thread; there is
//! no internal locking. HTTP completions come back through
//! [`Subscription::handle_transport_reply`] carrying the reference id that
//! was captured when the request was issued, which is how responses for a
//! previous incarnation of the subscription are recognized and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use pushstream_parser::{ParserFacade, StreamParser, FORMAT_PROTOBUF};
use pushstream_transport::{
    RequestHandle, RequestKind, Transport, TransportFailure, TransportReply, TransportRequest,
};

use crate::error::SubscriptionError;
use crate::queue::{ActionQueue, QueuedAction, StreamingAction};
use crate::state::SubscriptionState;
use crate::timer::RetryTimer;
use crate::types::{
    next_reference_id, normalize_refresh_rate, StreamingMessage, SubscribeResponse,
    SubscriptionArgs, UpdateType, DUPLICATE_KEY_MESSAGE, ERROR_UNSUPPORTED_FORMAT,
    NETWORK_RETRY_DELAY,
};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

type UpdateCallback = Box<dyn FnMut(&StreamingMessage, UpdateType) + Send>;
type ErrorCallback = Box<dyn FnMut(&TransportFailure) + Send>;
type NotifyCallback = Box<dyn FnMut() + Send>;
type StateCallback = Box<dyn FnMut(SubscriptionState) + Send>;

/// Token returned by [`Subscription::add_state_changed_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// Delivery callbacks and per-subscription request options.
#[derive(Default)]
pub struct SubscriptionOptions {
    pub(crate) on_update: Option<UpdateCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_queue_empty: Option<NotifyCallback>,
    pub(crate) on_subscription_created: Option<NotifyCallback>,
    pub(crate) on_network_error: Option<NotifyCallback>,
    pub(crate) headers: Vec<(String, String)>,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivery callback for snapshots and deltas.
    pub fn on_update(mut self, cb: impl FnMut(&StreamingMessage, UpdateType) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(cb));
        self
    }

    /// Called with a non-recoverable subscribe error.
    pub fn on_error(mut self, cb: impl FnMut(&TransportFailure) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(cb));
        self
    }

    /// Fires when the final queued action is dispatched.
    pub fn on_queue_empty(mut self, cb: impl FnMut() + Send + 'static) -> Self {
        self.on_queue_empty = Some(Box::new(cb));
        self
    }

    /// Fires once, on the first successful subscribe.
    pub fn on_subscription_created(mut self, cb: impl FnMut() + Send + 'static) -> Self {
        self.on_subscription_created = Some(Box::new(cb));
        self
    }

    /// Fires when a network-error retry is armed.
    pub fn on_network_error(mut self, cb: impl FnMut() + Send + 'static) -> Self {
        self.on_network_error = Some(Box::new(cb));
        self
    }

    /// Extra header merged into the subscribe POST.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Options for [`Subscription::on_modify`].
#[derive(Debug, Clone, Default)]
pub struct ModifyOptions {
    /// Patch the live subscription instead of tearing it down and
    /// re-subscribing.
    pub is_patch: bool,
    /// The delta to PATCH; required when `is_patch` is set.
    pub patch_delta: Option<Value>,
}

/// A client-side handle to one server-push data stream.
pub struct Subscription {
    id: u64,
    service_path: String,
    url: String,
    args: SubscriptionArgs,
    options: SubscriptionOptions,
    transport: Arc<dyn Transport>,
    parsers: Arc<ParserFacade>,
    parser: Box<dyn StreamParser>,
    retry_timer: Option<Box<dyn RetryTimer>>,
    retry_armed: bool,
    retry_delay: Duration,
    streaming_context_id: String,
    /// Context id snapshotted at subscribe time, so a DELETE issued after a
    /// reconnect still targets the context the subscription was created on.
    current_streaming_context_id: String,
    reference_id: Option<String>,
    state: SubscriptionState,
    queue: ActionQueue,
    schema_name: Option<String>,
    /// Seconds of silence before the subscription counts as orphaned; zero
    /// means never.
    inactivity_timeout_secs: u64,
    latest_activity: Instant,
    updates_before_subscribed: Vec<StreamingMessage>,
    connection_available: bool,
    is_disposed: bool,
    created_notified: bool,
    observers: Vec<(ObserverId, StateCallback)>,
    next_observer_id: u64,
}

impl Subscription {
    pub fn new(
        streaming_context_id: impl Into<String>,
        service_path: impl Into<String>,
        url: impl Into<String>,
        mut args: SubscriptionArgs,
        options: SubscriptionOptions,
        transport: Arc<dyn Transport>,
        parsers: Arc<ParserFacade>,
    ) -> Self {
        args.refresh_rate = Some(normalize_refresh_rate(args.refresh_rate));
        let parser = parsers.parser_for(args.format.as_deref());
        let streaming_context_id = streaming_context_id.into();
        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            service_path: service_path.into(),
            url: url.into(),
            args,
            options,
            transport,
            parsers,
            parser,
            retry_timer: None,
            retry_armed: false,
            retry_delay: NETWORK_RETRY_DELAY,
            current_streaming_context_id: streaming_context_id.clone(),
            streaming_context_id,
            reference_id: None,
            state: SubscriptionState::Unsubscribed,
            queue: ActionQueue::new(),
            schema_name: None,
            inactivity_timeout_secs: 0,
            latest_activity: Instant::now(),
            updates_before_subscribed: Vec::new(),
            connection_available: true,
            is_disposed: false,
            created_notified: false,
            observers: Vec::new(),
            next_observer_id: 1,
        }
    }

    /// Instance id; routes transport replies and timer expiries back here.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn reference_id(&self) -> Option<&str> {
        self.reference_id.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.args.tag.as_deref()
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed
    }

    /// Install the timer used to retry after transient network failures.
    pub fn set_retry_timer(&mut self, timer: Box<dyn RetryTimer>) {
        self.retry_timer = Some(timer);
    }

    pub(crate) fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = delay;
    }

    /// Called by the host when the multiplexed connection is re-established
    /// under a new context id.
    pub fn set_streaming_context_id(&mut self, context_id: impl Into<String>) {
        self.streaming_context_id = context_id.into();
    }

    /// Register a state-change observer; observers are notified
    /// synchronously on every transition, in registration order.
    pub fn add_state_changed_callback(
        &mut self,
        cb: impl FnMut(SubscriptionState) + Send + 'static,
    ) -> ObserverId {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push((id, Box::new(cb)));
        id
    }

    /// Remove a previously registered observer. Returns whether it existed.
    pub fn remove_state_changed_callback(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    // ---- caller intent --------------------------------------------------

    /// Request a (re)subscribe.
    pub fn on_subscribe(&mut self) -> Result<(), SubscriptionError> {
        if self.is_disposed {
            return Err(SubscriptionError::Disposed);
        }
        self.try_perform(QueuedAction::new(StreamingAction::Subscribe));
        Ok(())
    }

    /// Replace the subscription arguments and apply them.
    ///
    /// With `is_patch` the live subscription is PATCHed with
    /// `patch_delta`; otherwise it is torn down with a forced unsubscribe
    /// and re-created.
    pub fn on_modify(
        &mut self,
        new_arguments: Option<Value>,
        modify: ModifyOptions,
    ) -> Result<(), SubscriptionError> {
        if modify.is_patch && modify.patch_delta.is_none() {
            return Err(SubscriptionError::InvalidAction(
                "patch modify requires a patch delta".to_string(),
            ));
        }
        self.args.arguments = new_arguments;
        if modify.is_patch {
            let delta = modify.patch_delta.unwrap_or(Value::Null);
            self.try_perform(QueuedAction::patch(delta));
        } else {
            self.try_perform(QueuedAction::unsubscribe(true));
            self.try_perform(QueuedAction::new(StreamingAction::Subscribe));
        }
        Ok(())
    }

    /// Request an unsubscribe. `force` survives coalescing against a
    /// subsequently queued subscribe.
    pub fn on_unsubscribe(&mut self, force: bool) {
        if self.is_disposed {
            warn!(id = self.id, "unsubscribe requested on a disposed subscription");
        }
        self.try_perform(QueuedAction::unsubscribe(force));
    }

    /// Server-initiated reset: tear down and re-establish the stream.
    ///
    /// Bursts of resets collapse to at most one pending resubscribe thanks
    /// to queue coalescing plus the head-is-unsubscribe check.
    pub fn reset(&mut self) {
        if self.is_disposed {
            return;
        }
        match self.state {
            SubscriptionState::Unsubscribed | SubscriptionState::UnsubscribeRequested => return,
            // The bulk tag path will complete the teardown on its own.
            SubscriptionState::ReadyForUnsubscribeByTag => return,
            SubscriptionState::PatchRequested => {
                // The patch is abandoned; pretend it settled so the forced
                // unsubscribe below can execute.
                self.set_state(SubscriptionState::Subscribed);
            }
            SubscriptionState::SubscribeRequested | SubscriptionState::Subscribed => {
                if self.queue.peek_action() == Some(StreamingAction::Unsubscribe) {
                    return;
                }
            }
        }
        self.try_perform(QueuedAction::unsubscribe(true));
        self.try_perform(QueuedAction::new(StreamingAction::Subscribe));
    }

    /// Mark the subscription terminal; no further HTTP will be issued.
    pub fn dispose(&mut self) {
        self.is_disposed = true;
        self.cancel_retry_timer();
    }

    // ---- connection signals ---------------------------------------------

    pub fn on_connection_available(&mut self) {
        self.connection_available = true;
        if !self.state.is_transitioning() {
            self.ready_for_next_action();
        }
    }

    pub fn on_connection_unavailable(&mut self) {
        self.connection_available = false;
        if self.retry_armed {
            // Keep the resubscribe intent: the retry timer dies with the
            // connection, so queue the subscribe for the reconnect drain.
            self.cancel_retry_timer();
            self.queue.enqueue(QueuedAction::new(StreamingAction::Subscribe));
        }
    }

    // ---- streaming input ------------------------------------------------

    /// Deliver one streaming frame. Returns `false` when the frame was not
    /// for this subscription (already unsubscribed), which the host uses for
    /// orphaned-frame accounting.
    pub fn on_streaming_data(&mut self, message: StreamingMessage) -> bool {
        if self.is_disposed {
            return false;
        }
        self.latest_activity = Instant::now();
        match self.state {
            SubscriptionState::UnsubscribeRequested => true,
            SubscriptionState::Unsubscribed => false,
            SubscriptionState::SubscribeRequested => {
                self.updates_before_subscribed.push(message);
                true
            }
            SubscriptionState::Subscribed | SubscriptionState::PatchRequested => {
                self.process_delta(message);
                true
            }
            SubscriptionState::ReadyForUnsubscribeByTag => {
                error!(
                    id = self.id,
                    state = %self.state,
                    "dropping streaming data received while parked for tag unsubscribe"
                );
                true
            }
        }
    }

    /// Connection-level heartbeat for this subscription.
    pub fn on_heartbeat(&mut self) {
        self.latest_activity = Instant::now();
    }

    // ---- bulk unsubscribe by tag ----------------------------------------

    /// The host is about to bulk-unsubscribe this subscription's tag.
    pub fn on_unsubscribe_by_tag_pending(&mut self) {
        self.try_perform(QueuedAction::new(StreamingAction::UnsubscribeByTagPending));
    }

    /// The bulk tag unsubscribe completed on the server.
    pub fn on_unsubscribe_by_tag_complete(&mut self) {
        self.set_state(SubscriptionState::Unsubscribed);
        self.ready_for_next_action();
    }

    pub fn is_ready_for_unsubscribe_by_tag(&self) -> bool {
        self.state == SubscriptionState::ReadyForUnsubscribeByTag
    }

    // ---- orphan detection -----------------------------------------------

    /// Time until this subscription counts as orphaned, or `None` when it
    /// never will (disconnected, no timeout, or not in a streaming state).
    pub fn time_till_orphaned(&self, now: Instant) -> Option<Duration> {
        if !self.connection_available || self.inactivity_timeout_secs == 0 {
            return None;
        }
        if matches!(
            self.state,
            SubscriptionState::Unsubscribed
                | SubscriptionState::UnsubscribeRequested
                | SubscriptionState::SubscribeRequested
        ) {
            return None;
        }
        let timeout = Duration::from_secs(self.inactivity_timeout_secs);
        let elapsed = now.saturating_duration_since(self.latest_activity);
        Some(timeout.saturating_sub(elapsed))
    }

    // ---- network retry --------------------------------------------------

    /// Called by the host when the network-error retry delay elapses.
    pub fn on_network_retry(&mut self) {
        if !self.retry_armed {
            return;
        }
        self.retry_armed = false;
        self.queue.enqueue(QueuedAction::new(StreamingAction::Subscribe));
        self.ready_for_next_action();
    }

    // ---- action dispatch ------------------------------------------------

    fn try_perform(&mut self, action: QueuedAction) {
        // Any deliberate action supersedes a pending retry.
        self.cancel_retry_timer();
        if !self.connection_available || self.state.is_transitioning() {
            self.queue.enqueue(action);
        } else {
            let is_last = self.queue.is_empty();
            self.perform_action(action, is_last);
        }
    }

    fn perform_action(&mut self, queued: QueuedAction, is_last: bool) {
        use StreamingAction::*;

        match (queued.action, self.state) {
            (Subscribe, SubscriptionState::Subscribed) => {}
            (Subscribe, SubscriptionState::Unsubscribed) => {
                self.queue.clear_patches();
                self.subscribe();
            }
            (ModifyPatch, SubscriptionState::Subscribed) => {
                self.modify_patch(queued.args.patch_delta);
            }
            (Unsubscribe, SubscriptionState::Subscribed) => self.unsubscribe(),
            (Unsubscribe, SubscriptionState::Unsubscribed) => {}
            (
                UnsubscribeByTagPending,
                SubscriptionState::Subscribed | SubscriptionState::Unsubscribed,
            ) => {
                self.set_state(SubscriptionState::ReadyForUnsubscribeByTag);
            }
            (action, state) => {
                error!(
                    id = self.id,
                    ?action,
                    %state,
                    "instruction cannot be processed in this state"
                );
            }
        }

        if is_last {
            if let Some(cb) = self.options.on_queue_empty.as_mut() {
                cb();
            }
        }
        self.ready_for_next_action();
    }

    fn ready_for_next_action(&mut self) {
        if !self.connection_available || self.state.is_transitioning() {
            return;
        }
        let Some(next) = self.queue.dequeue() else {
            return;
        };
        let is_last = self.queue.is_empty();
        self.perform_action(next, is_last);
    }

    // ---- request issue --------------------------------------------------

    fn subscribe(&mut self) {
        if self.is_disposed {
            warn!(id = self.id, "refusing to subscribe a disposed subscription");
            return;
        }
        let reference_id = next_reference_id();
        self.reference_id = Some(reference_id.clone());
        self.updates_before_subscribed.clear();
        self.current_streaming_context_id = self.streaming_context_id.clone();

        let mut body = serde_json::Map::new();
        if let Some(format) = &self.args.format {
            body.insert("Format".to_string(), Value::from(format.as_str()));
        }
        if let Some(refresh_rate) = self.args.refresh_rate {
            body.insert("RefreshRate".to_string(), Value::from(refresh_rate));
        }
        if let Some(arguments) = &self.args.arguments {
            body.insert("Arguments".to_string(), arguments.clone());
        }
        if let Some(tag) = &self.args.tag {
            body.insert("Tag".to_string(), Value::from(tag.as_str()));
        }
        body.insert(
            "ContextId".to_string(),
            Value::from(self.current_streaming_context_id.as_str()),
        );
        body.insert("ReferenceId".to_string(), Value::from(reference_id.as_str()));
        if let Some(schema_names) = self.parser.schema_names() {
            body.insert(
                "KnownSchemas".to_string(),
                Value::Array(schema_names.into_iter().map(Value::from).collect()),
            );
        }

        let query = match self.args.top {
            Some(top) => vec![("$top".to_string(), top.to_string())],
            None => vec![],
        };

        self.set_state(SubscriptionState::SubscribeRequested);
        debug!(id = self.id, %reference_id, "subscribing");
        self.transport.post(TransportRequest {
            path: format!("{}{}", self.service_path, self.url),
            template_args: vec![],
            query,
            body: Some(Value::Object(body)),
            headers: self.options.headers.clone(),
            handle: RequestHandle {
                kind: RequestKind::Subscribe,
                owner: self.id,
                reference_id,
                context_id: self.current_streaming_context_id.clone(),
            },
        });
    }

    fn unsubscribe(&mut self) {
        if self.is_disposed {
            warn!(id = self.id, "refusing to unsubscribe a disposed subscription");
            return;
        }
        let Some(reference_id) = self.reference_id.clone() else {
            error!(id = self.id, "unsubscribe without a reference id");
            return;
        };
        self.set_state(SubscriptionState::UnsubscribeRequested);
        debug!(id = self.id, %reference_id, "unsubscribing");
        self.transport.delete(self.teardown_request(
            RequestKind::Unsubscribe,
            reference_id,
            self.current_streaming_context_id.clone(),
            None,
        ));
    }

    fn modify_patch(&mut self, delta: Option<Value>) {
        if self.is_disposed {
            warn!(id = self.id, "refusing to patch a disposed subscription");
            return;
        }
        let Some(reference_id) = self.reference_id.clone() else {
            error!(id = self.id, "patch without a reference id");
            return;
        };
        self.set_state(SubscriptionState::PatchRequested);
        debug!(id = self.id, %reference_id, "patching");
        self.transport.patch(self.teardown_request(
            RequestKind::Patch,
            reference_id,
            self.current_streaming_context_id.clone(),
            delta,
        ));
    }

    /// Fire-and-forget DELETE removing the server-side entry left by a
    /// duplicate-key collision. Uses the ids captured with the failed
    /// request, which may no longer be the current ones.
    fn cleanup_delete(&mut self, reference_id: String, context_id: String) {
        if self.is_disposed {
            return;
        }
        debug!(id = self.id, %reference_id, "cleaning up duplicated subscription");
        self.transport.delete(self.teardown_request(
            RequestKind::Cleanup,
            reference_id,
            context_id,
            None,
        ));
    }

    /// Build a DELETE/PATCH request addressing one subscription instance on
    /// the server.
    fn teardown_request(
        &self,
        kind: RequestKind,
        reference_id: String,
        context_id: String,
        body: Option<Value>,
    ) -> TransportRequest {
        TransportRequest {
            path: format!("{}{}/{{contextId}}/{{referenceId}}", self.service_path, self.url),
            template_args: vec![
                ("contextId".to_string(), context_id.clone()),
                ("referenceId".to_string(), reference_id.clone()),
            ],
            query: vec![],
            body,
            headers: vec![],
            handle: RequestHandle {
                kind,
                owner: self.id,
                reference_id,
                context_id,
            },
        }
    }

    // ---- response handling ----------------------------------------------

    /// Dispatch a transport completion to the matching response handler.
    pub fn handle_transport_reply(&mut self, reply: TransportReply) {
        match reply.handle.kind {
            RequestKind::Subscribe => match reply.result {
                Ok(body) => self.on_subscribe_success(reply.handle, body),
                Err(failure) => self.on_subscribe_error(reply.handle, failure),
            },
            RequestKind::Unsubscribe => match reply.result {
                Ok(_) => self.on_unsubscribe_success(reply.handle),
                Err(failure) => self.on_unsubscribe_error(reply.handle, failure),
            },
            RequestKind::Patch => match reply.result {
                Ok(_) => self.on_patch_success(reply.handle),
                Err(failure) => self.on_patch_error(reply.handle, failure),
            },
            RequestKind::Cleanup => {
                debug!(
                    id = self.id,
                    reference_id = %reply.handle.reference_id,
                    ok = reply.result.is_ok(),
                    "cleanup delete settled"
                );
            }
        }
    }

    fn is_current(&self, handle: &RequestHandle) -> bool {
        self.reference_id.as_deref() == Some(handle.reference_id.as_str())
    }

    fn on_subscribe_success(&mut self, handle: RequestHandle, body: Value) {
        if !self.is_current(&handle) {
            debug!(
                id = self.id,
                reference_id = %handle.reference_id,
                "subscribe response received for a stale reference id"
            );
            return;
        }
        let response: SubscribeResponse = match serde_json::from_value(body) {
            Ok(response) => response,
            Err(e) => {
                error!(id = self.id, error = %e, "malformed subscribe response body");
                SubscribeResponse::default()
            }
        };

        self.set_state(SubscriptionState::Subscribed);
        self.inactivity_timeout_secs = response.inactivity_timeout.unwrap_or(0);
        if self.inactivity_timeout_secs == 0 {
            warn!(
                id = self.id,
                "InactivityTimeout is zero; inactivity orphaning is disabled"
            );
        }
        self.latest_activity = Instant::now();
        if !self.created_notified {
            self.created_notified = true;
            if let Some(cb) = self.options.on_subscription_created.as_mut() {
                cb();
            }
        }

        if self.queue.peek_action() != Some(StreamingAction::Unsubscribe) {
            self.process_snapshot(&response);
            let buffered = std::mem::take(&mut self.updates_before_subscribed);
            for message in buffered {
                self.on_streaming_data(message);
            }
        }
        self.updates_before_subscribed.clear();
        self.ready_for_next_action();
    }

    fn process_snapshot(&mut self, response: &SubscribeResponse) {
        if let Some(schema_name) = &response.schema_name {
            self.schema_name = Some(schema_name.clone());
            if let Some(schema) = &response.schema {
                if let Err(e) = self.parser.add_schema(schema, schema_name) {
                    error!(id = self.id, %schema_name, error = %e, "schema registration failed");
                }
            }
        } else if self.format_is_protobuf() && self.parser.schema_name().is_none() {
            // Binary decoding is impossible without a schema; fall back to
            // the default format for the rest of this subscription's life.
            warn!(
                id = self.id,
                "no schema in subscribe response; downgrading to {}",
                self.parsers.default_format()
            );
            self.args.format = Some(self.parsers.default_format().to_string());
            self.parser = self.parsers.parser_for(Some(self.parsers.default_format()));
        }

        if let Some(snapshot) = &response.snapshot {
            let reference_id = self.reference_id.clone().unwrap_or_default();
            let message = StreamingMessage::new(reference_id, snapshot.clone());
            self.deliver_update(&message, UpdateType::Snapshot);
        }
    }

    fn on_subscribe_error(&mut self, handle: RequestHandle, failure: TransportFailure) {
        let duplicate = failure.message() == Some(DUPLICATE_KEY_MESSAGE);
        if !self.is_current(&handle) {
            if duplicate {
                // The stale attempt still claimed a key on the server.
                self.cleanup_delete(handle.reference_id, handle.context_id);
            } else {
                debug!(
                    id = self.id,
                    reference_id = %handle.reference_id,
                    "subscribe error received for a stale reference id"
                );
            }
            return;
        }

        let will_unsubscribe = self.queue.peek_action() == Some(StreamingAction::Unsubscribe);
        self.set_state(SubscriptionState::Unsubscribed);
        // Anything buffered for the failed attempt is worthless now.
        self.updates_before_subscribed.clear();

        if duplicate {
            error!(
                id = self.id,
                reference_id = %handle.reference_id,
                "subscription key already in use; cleaning up and retrying"
            );
            self.cleanup_delete(handle.reference_id, handle.context_id);
            if !will_unsubscribe {
                self.queue.enqueue(QueuedAction::new(StreamingAction::Subscribe));
                self.ready_for_next_action();
            }
            return;
        }

        if failure.error_code() == Some(ERROR_UNSUPPORTED_FORMAT) && self.format_is_protobuf() {
            warn!(
                id = self.id,
                "server rejected {}; downgrading to {}",
                FORMAT_PROTOBUF,
                self.parsers.default_format()
            );
            self.args.format = Some(self.parsers.default_format().to_string());
            self.parser = self.parsers.parser_for(Some(self.parsers.default_format()));
            if !will_unsubscribe {
                self.queue.enqueue(QueuedAction::new(StreamingAction::Subscribe));
                self.ready_for_next_action();
            }
            return;
        }

        if failure.is_network_error {
            if !will_unsubscribe {
                self.arm_retry_timer();
                if let Some(cb) = self.options.on_network_error.as_mut() {
                    cb();
                }
            }
            return;
        }

        error!(id = self.id, %failure, "subscribe failed");
        if !will_unsubscribe {
            if let Some(cb) = self.options.on_error.as_mut() {
                cb(&failure);
            }
        }
        self.ready_for_next_action();
    }

    fn on_unsubscribe_success(&mut self, handle: RequestHandle) {
        if !self.is_current(&handle) {
            debug!(
                id = self.id,
                reference_id = %handle.reference_id,
                "unsubscribe response received for a stale reference id"
            );
            return;
        }
        if self.state != SubscriptionState::UnsubscribeRequested {
            // A reset already moved the machine on; the reference id alone
            // cannot tell because DELETE does not change it.
            debug!(id = self.id, state = %self.state, "late unsubscribe response ignored");
            return;
        }
        self.set_state(SubscriptionState::Unsubscribed);
        self.ready_for_next_action();
    }

    fn on_unsubscribe_error(&mut self, handle: RequestHandle, failure: TransportFailure) {
        if !self.is_current(&handle) {
            debug!(
                id = self.id,
                reference_id = %handle.reference_id,
                "unsubscribe error received for a stale reference id"
            );
            return;
        }
        if self.state != SubscriptionState::UnsubscribeRequested {
            debug!(id = self.id, state = %self.state, "late unsubscribe error ignored");
            return;
        }
        // The server has most likely dropped the subscription already, e.g.
        // on disconnect; treat it as gone either way.
        info!(id = self.id, %failure, "unsubscribe failed; assuming already unsubscribed");
        self.set_state(SubscriptionState::Unsubscribed);
        self.ready_for_next_action();
    }

    fn on_patch_success(&mut self, handle: RequestHandle) {
        if !self.is_current(&handle) {
            debug!(
                id = self.id,
                reference_id = %handle.reference_id,
                "patch response received for a stale reference id"
            );
            return;
        }
        if self.state != SubscriptionState::PatchRequested {
            debug!(id = self.id, state = %self.state, "late patch response ignored");
            return;
        }
        self.set_state(SubscriptionState::Subscribed);
        self.ready_for_next_action();
    }

    fn on_patch_error(&mut self, handle: RequestHandle, failure: TransportFailure) {
        if !self.is_current(&handle) {
            debug!(
                id = self.id,
                reference_id = %handle.reference_id,
                "patch error received for a stale reference id"
            );
            return;
        }
        if self.state != SubscriptionState::PatchRequested {
            debug!(id = self.id, state = %self.state, "late patch error ignored");
            return;
        }
        // The subscription itself survives a failed patch.
        error!(id = self.id, %failure, "patch failed");
        self.set_state(SubscriptionState::Subscribed);
        self.ready_for_next_action();
    }

    // ---- delta processing -----------------------------------------------

    fn process_delta(&mut self, message: StreamingMessage) {
        let parsed = self
            .parser
            .parse(&message.data, self.schema_name.as_deref());
        match parsed {
            Ok(data) => {
                let delivered = StreamingMessage {
                    reference_id: message.reference_id,
                    data,
                };
                self.deliver_update(&delivered, UpdateType::Delta);
            }
            Err(e) => {
                // We have to assume we lost synchronization; a reset makes
                // the server push a fresh snapshot.
                error!(id = self.id, error = %e, "delta parse failed; resetting");
                self.reset();
            }
        }
    }

    fn deliver_update(&mut self, message: &StreamingMessage, update_type: UpdateType) {
        if let Some(cb) = self.options.on_update.as_mut() {
            cb(message, update_type);
        }
    }

    // ---- internals ------------------------------------------------------

    fn format_is_protobuf(&self) -> bool {
        self.args.format.as_deref() == Some(FORMAT_PROTOBUF)
    }

    fn arm_retry_timer(&mut self) {
        match self.retry_timer.as_mut() {
            Some(timer) => {
                timer.arm(self.retry_delay);
                self.retry_armed = true;
            }
            None => warn!(
                id = self.id,
                "no retry timer configured; subscribe will not be retried"
            ),
        }
    }

    fn cancel_retry_timer(&mut self) {
        if self.retry_armed {
            if let Some(timer) = self.retry_timer.as_mut() {
                timer.cancel();
            }
            self.retry_armed = false;
        }
    }

    fn set_state(&mut self, state: SubscriptionState) {
        debug!(id = self.id, from = %self.state, to = %state, "state transition");
        self.state = state;
        for (_, cb) in self.observers.iter_mut() {
            cb(state);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("state", &self.state)
            .field("reference_id", &self.reference_id)
            .field("queued", &self.queue.len())
            .field("disposed", &self.is_disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<TransportRequest>>,
    }

    impl RecordingTransport {
        fn kinds(&self) -> Vec<RequestKind> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|request| request.handle.kind)
                .collect()
        }
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

    fn subscription(transport: Arc<RecordingTransport>) -> Subscription {
        Subscription::new(
            "ctx-1",
            "trade/",
            "v1/prices/subscriptions",
            SubscriptionArgs::with_format("application/json"),
            SubscriptionOptions::new(),
            transport,
            Arc::new(ParserFacade::new()),
        )
    }

    #[test]
    fn test_subscribe_posts_with_fresh_reference_id() {
        let transport = Arc::new(RecordingTransport::default());
        let mut sub = subscription(transport.clone());

        sub.on_subscribe().unwrap();
        assert_eq!(sub.state(), SubscriptionState::SubscribeRequested);

        let requests = transport.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.path, "trade/v1/prices/subscriptions");
        let body = request.body.as_ref().unwrap();
        assert_eq!(body["ContextId"], "ctx-1");
        assert_eq!(body["ReferenceId"], sub.reference_id().unwrap());
        assert_eq!(body["RefreshRate"], 1000);
    }

    #[test]
    fn test_subscribe_moves_top_to_query() {
        let transport = Arc::new(RecordingTransport::default());
        let mut args = SubscriptionArgs::with_format("application/json");
        args.top = Some(25);
        let mut sub = Subscription::new(
            "ctx-1",
            "trade/",
            "v1/prices/subscriptions",
            args,
            SubscriptionOptions::new(),
            transport.clone(),
            Arc::new(ParserFacade::new()),
        );

        sub.on_subscribe().unwrap();
        let requests = transport.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.query, [("$top".to_string(), "25".to_string())]);
        assert!(request.body.as_ref().unwrap().get("Top").is_none());
    }

    #[test]
    fn test_subscribe_after_dispose_fails() {
        let transport = Arc::new(RecordingTransport::default());
        let mut sub = subscription(transport.clone());
        sub.dispose();
        assert!(matches!(
            sub.on_subscribe(),
            Err(SubscriptionError::Disposed)
        ));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_patch_modify_requires_a_delta() {
        let transport = Arc::new(RecordingTransport::default());
        let mut sub = subscription(transport);
        let result = sub.on_modify(
            None,
            ModifyOptions {
                is_patch: true,
                patch_delta: None,
            },
        );
        assert!(matches!(result, Err(SubscriptionError::InvalidAction(_))));
    }

    #[test]
    fn test_actions_queue_while_transitioning() {
        let transport = Arc::new(RecordingTransport::default());
        let mut sub = subscription(transport.clone());

        sub.on_subscribe().unwrap();
        sub.on_unsubscribe(false);
        // Only the POST went out; the unsubscribe waits for the response.
        assert_eq!(transport.kinds(), [RequestKind::Subscribe]);
    }

    #[test]
    fn test_actions_queue_while_disconnected() {
        let transport = Arc::new(RecordingTransport::default());
        let mut sub = subscription(transport.clone());

        sub.on_connection_unavailable();
        sub.on_subscribe().unwrap();
        assert!(transport.kinds().is_empty());
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);

        sub.on_connection_available();
        assert_eq!(transport.kinds(), [RequestKind::Subscribe]);
        assert_eq!(sub.state(), SubscriptionState::SubscribeRequested);
    }

    #[test]
    fn test_observers_notified_in_registration_order() {
        let transport = Arc::new(RecordingTransport::default());
        let mut sub = subscription(transport);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = seen.clone();
        sub.add_state_changed_callback(move |state| first.lock().unwrap().push((1, state)));
        let second = seen.clone();
        let second_id =
            sub.add_state_changed_callback(move |state| second.lock().unwrap().push((2, state)));

        sub.on_subscribe().unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [
                (1, SubscriptionState::SubscribeRequested),
                (2, SubscriptionState::SubscribeRequested),
            ]
        );

        assert!(sub.remove_state_changed_callback(second_id));
        assert!(!sub.remove_state_changed_callback(second_id));
    }

    #[test]
    fn test_orphan_timing_requires_connection_and_timeout() {
        let transport = Arc::new(RecordingTransport::default());
        let mut sub = subscription(transport);
        let now = Instant::now();

        // Not subscribed yet: never orphaned.
        assert_eq!(sub.time_till_orphaned(now), None);

        sub.on_subscribe().unwrap();
        let handle = RequestHandle {
            kind: RequestKind::Subscribe,
            owner: sub.id(),
            reference_id: sub.reference_id().unwrap().to_string(),
            context_id: "ctx-1".to_string(),
        };
        sub.handle_transport_reply(TransportReply {
            handle,
            result: Ok(serde_json::json!({"InactivityTimeout": 10})),
        });
        assert_eq!(sub.state(), SubscriptionState::Subscribed);

        let remaining = sub.time_till_orphaned(Instant::now()).unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(8));

        // Disconnected: never orphaned regardless of elapsed time.
        sub.on_connection_unavailable();
        assert_eq!(sub.time_till_orphaned(Instant::now()), None);
    }

    #[test]
    fn test_time_till_orphaned_is_non_increasing() {
        let transport = Arc::new(RecordingTransport::default());
        let mut sub = subscription(transport);
        sub.on_subscribe().unwrap();
        let handle = RequestHandle {
            kind: RequestKind::Subscribe,
            owner: sub.id(),
            reference_id: sub.reference_id().unwrap().to_string(),
            context_id: "ctx-1".to_string(),
        };
        sub.handle_transport_reply(TransportReply {
            handle,
            result: Ok(serde_json::json!({"InactivityTimeout": 10})),
        });

        let base = Instant::now();
        let mut previous = sub.time_till_orphaned(base).unwrap();
        for offset in 1..5u64 {
            let next = sub
                .time_till_orphaned(base + Duration::from_secs(offset))
                .unwrap();
            assert!(next <= previous);
            previous = next;
        }
    }
}
