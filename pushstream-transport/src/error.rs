//! Failure envelopes for transport requests.

use serde::Deserialize;
use std::fmt;

/// Error payload returned by the streaming backend on a rejected request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerError {
    pub error_code: Option<String>,
    pub message: Option<String>,
}

/// Outcome envelope for a failed request.
///
/// `is_network_error` distinguishes transport-level failures (connect,
/// timeout, DNS) from a reachable server rejecting the request; the engine
/// retries the former on a timer and inspects the latter's
/// `ErrorCode`/`Message` for recoverable cases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportFailure {
    pub is_network_error: bool,
    pub status: Option<u16>,
    pub error: Option<ServerError>,
}

impl TransportFailure {
    /// A transport-level failure with no server response.
    pub fn network() -> Self {
        Self {
            is_network_error: true,
            status: None,
            error: None,
        }
    }

    /// A server rejection with the given status and optional error payload.
    pub fn server(status: u16, error: Option<ServerError>) -> Self {
        Self {
            is_network_error: false,
            status: Some(status),
            error,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref()?.error_code.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.error.as_ref()?.message.as_deref()
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_network_error {
            return write!(f, "network error");
        }
        match (self.status, self.error_code(), self.message()) {
            (Some(status), Some(code), _) => write!(f, "HTTP {status}: {code}"),
            (Some(status), None, Some(message)) => write!(f, "HTTP {status}: {message}"),
            (Some(status), None, None) => write!(f, "HTTP {status}"),
            _ => write!(f, "request failed"),
        }
    }
}

/// Error raised by an HTTP backend before a response envelope exists.
#[derive(Debug, thiserror::Error)]
#[error("request failed: {0}")]
pub struct HttpError(pub String);
