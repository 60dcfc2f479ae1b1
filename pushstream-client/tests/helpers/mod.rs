//! Shared mock transport, timer, and callback recorders for engine tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use pushstream_client::{
    RetryTimer, StreamingMessage, Subscription, SubscriptionArgs, SubscriptionOptions, UpdateType,
};
use pushstream_parser::ParserFacade;
use pushstream_transport::{
    HttpMethod, RequestHandle, ServerError, Transport, TransportFailure, TransportReply,
    TransportRequest,
};

/// One request captured by the mock transport.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: HttpMethod,
    pub request: TransportRequest,
}

impl RecordedRequest {
    pub fn handle(&self) -> RequestHandle {
        self.request.handle.clone()
    }

    pub fn body(&self) -> &Value {
        self.request.body.as_ref().expect("request had no body")
    }
}

/// Transport double that records every request instead of sending it.
/// Tests resolve requests by handing replies back to the subscription.
#[derive(Default)]
pub struct MockTransport {
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All requests captured so far, oldest first.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Remove and return all captured requests.
    pub fn take_requests(&self) -> Vec<RecordedRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }

    /// Remove and return the single captured request, panicking if there is
    /// not exactly one.
    pub fn take_single(&self) -> RecordedRequest {
        let mut requests = self.take_requests();
        assert_eq!(requests.len(), 1, "expected exactly one request: {requests:?}");
        requests.remove(0)
    }

    pub fn pending(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn record(&self, method: HttpMethod, request: TransportRequest) {
        self.requests
            .lock()
            .unwrap()
            .push(RecordedRequest { method, request });
    }
}

impl Transport for MockTransport {
    fn post(&self, request: TransportRequest) {
        self.record(HttpMethod::Post, request);
    }

    fn delete(&self, request: TransportRequest) {
        self.record(HttpMethod::Delete, request);
    }

    fn patch(&self, request: TransportRequest) {
        self.record(HttpMethod::Patch, request);
    }
}

/// Probe into a [`ManualRetryTimer`]'s armed state.
#[derive(Clone, Default)]
pub struct TimerProbe(Arc<Mutex<Option<Duration>>>);

impl TimerProbe {
    pub fn armed(&self) -> Option<Duration> {
        *self.0.lock().unwrap()
    }
}

/// Retry timer double: records the armed delay, never fires on its own.
/// Tests fire it by calling `Subscription::on_network_retry` directly.
pub struct ManualRetryTimer(TimerProbe);

impl ManualRetryTimer {
    pub fn new() -> (Box<dyn RetryTimer>, TimerProbe) {
        let probe = TimerProbe::default();
        (Box::new(Self(probe.clone())), probe)
    }
}

impl RetryTimer for ManualRetryTimer {
    fn arm(&mut self, delay: Duration) {
        *self.0 .0.lock().unwrap() = Some(delay);
    }

    fn cancel(&mut self) {
        *self.0 .0.lock().unwrap() = None;
    }
}

/// Records every callback a subscription fires.
#[derive(Clone, Default)]
pub struct CallbackLog {
    pub updates: Arc<Mutex<Vec<(StreamingMessage, UpdateType)>>>,
    pub errors: Arc<Mutex<Vec<TransportFailure>>>,
    pub created: Arc<AtomicU32>,
    pub queue_empty: Arc<AtomicU32>,
    pub network_errors: Arc<AtomicU32>,
}

impl CallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscription options wired to record into this log.
    pub fn options(&self) -> SubscriptionOptions {
        let updates = self.updates.clone();
        let errors = self.errors.clone();
        let created = self.created.clone();
        let queue_empty = self.queue_empty.clone();
        let network_errors = self.network_errors.clone();
        SubscriptionOptions::new()
            .on_update(move |message, update_type| {
                updates.lock().unwrap().push((message.clone(), update_type));
            })
            .on_error(move |failure| {
                errors.lock().unwrap().push(failure.clone());
            })
            .on_subscription_created(move || {
                created.fetch_add(1, Ordering::Relaxed);
            })
            .on_queue_empty(move || {
                queue_empty.fetch_add(1, Ordering::Relaxed);
            })
            .on_network_error(move || {
                network_errors.fetch_add(1, Ordering::Relaxed);
            })
    }

    pub fn update_data(&self) -> Vec<(Value, UpdateType)> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(message, update_type)| (message.data.clone(), *update_type))
            .collect()
    }

    pub fn created_count(&self) -> u32 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn network_error_count(&self) -> u32 {
        self.network_errors.load(Ordering::Relaxed)
    }
}

/// A JSON subscription against the mock transport with recording callbacks.
pub fn json_subscription(
    transport: Arc<MockTransport>,
    log: &CallbackLog,
) -> Subscription {
    subscription_with_args(
        transport,
        log,
        SubscriptionArgs::with_format("application/json"),
    )
}

pub fn subscription_with_args(
    transport: Arc<MockTransport>,
    log: &CallbackLog,
    args: SubscriptionArgs,
) -> Subscription {
    Subscription::new(
        "ctx-1",
        "trade/",
        "v1/prices/subscriptions",
        args,
        log.options(),
        transport,
        Arc::new(ParserFacade::new()),
    )
}

/// A successful subscribe reply for `handle`.
pub fn subscribe_ok(handle: RequestHandle, body: Value) -> TransportReply {
    TransportReply {
        handle,
        result: Ok(body),
    }
}

/// A server-rejection reply with the given error payload.
pub fn server_error(
    handle: RequestHandle,
    status: u16,
    error_code: Option<&str>,
    message: Option<&str>,
) -> TransportReply {
    TransportReply {
        handle,
        result: Err(TransportFailure::server(
            status,
            Some(ServerError {
                error_code: error_code.map(str::to_string),
                message: message.map(str::to_string),
            }),
        )),
    }
}

/// A network-failure reply.
pub fn network_error(handle: RequestHandle) -> TransportReply {
    TransportReply {
        handle,
        result: Err(TransportFailure::network()),
    }
}

/// An empty-bodied success reply (DELETE and PATCH).
pub fn empty_ok(handle: RequestHandle) -> TransportReply {
    TransportReply {
        handle,
        result: Ok(Value::Null),
    }
}
