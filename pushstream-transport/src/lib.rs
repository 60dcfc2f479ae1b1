//! HTTP transport seam for streaming subscriptions.
//!
//! This crate owns the request and reply envelopes that flow between the
//! subscription engine and the wire. The engine issues requests
//! fire-and-forget through the [`Transport`] trait; completions travel back
//! as [`TransportReply`] values carrying the [`RequestHandle`] captured at
//! issue time, so a late reply can always be matched against the reference
//! id that produced it.

mod error;
mod http;

pub use error::{HttpError, ServerError, TransportFailure};
pub use http::{HttpBackend, HttpResponse, HttpTransport, ReqwestBackend};

use serde_json::Value;

/// HTTP verb used for a streaming subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Delete,
    Patch,
}

/// What a request was issued for.
///
/// `Cleanup` marks the fire-and-forget DELETE issued when the server reports
/// a duplicate subscription key; its replies are logged and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Patch,
    Cleanup,
}

/// Identity captured when a request is issued.
///
/// The reference id and context id are snapshotted here so the reply handler
/// can discard responses that arrive after the subscription has been reset or
/// re-subscribed under a fresh reference id. `owner` is the issuing
/// subscription's instance id and is what the host routes replies by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHandle {
    pub kind: RequestKind,
    pub owner: u64,
    pub reference_id: String,
    pub context_id: String,
}

/// A single outbound request.
///
/// `path` may contain `{name}` placeholders which are expanded from
/// `template_args` when the URL is built. Query parameters are appended
/// verbatim.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub path: String,
    pub template_args: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub handle: RequestHandle,
}

impl TransportRequest {
    /// Expand template placeholders and append the query string.
    pub fn url(&self) -> String {
        let mut url = expand_template(&self.path, &self.template_args);
        for (i, (key, value)) in self.query.iter().enumerate() {
            let separator = if i == 0 { '?' } else { '&' };
            url.push(separator);
            url.push_str(key);
            url.push('=');
            url.push_str(value);
        }
        url
    }
}

/// Replace `{name}` placeholders in `template` with the matching values.
///
/// Unknown placeholders are left untouched so a malformed template shows up
/// verbatim in logs rather than silently producing a truncated URL.
pub fn expand_template(template: &str, args: &[(String, String)]) -> String {
    let mut url = template.to_string();
    for (name, value) in args {
        url = url.replace(&format!("{{{name}}}"), value);
    }
    url
}

/// Completion of a previously issued request.
///
/// `Ok` carries the parsed response body (JSON `null` when the server sent
/// none); `Err` carries the failure envelope with the network-error flag and
/// any server error payload.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub handle: RequestHandle,
    pub result: Result<Value, TransportFailure>,
}

/// Fire-and-forget HTTP issue path used by the subscription engine.
///
/// Implementations must deliver exactly one [`TransportReply`] for every
/// request, through whatever channel the host drains. The engine never
/// blocks on a request; ordering per subscription is guaranteed by the
/// engine itself, which keeps at most one request in flight.
pub trait Transport: Send + Sync {
    fn post(&self, request: TransportRequest);
    fn delete(&self, request: TransportRequest);
    fn patch(&self, request: TransportRequest);
}
