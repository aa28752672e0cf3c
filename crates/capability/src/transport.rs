//! Transport capability: executes one rendered request with a deadline

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;

/// A fully rendered request, ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Query parameters appended to `url` by the transport
    pub query: Vec<(String, String)>,
    /// Serialized body, `None` for bodiless requests
    pub body: Option<String>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw result of executing a request.
///
/// Transports only report what happened on the wire. Interpreting status
/// codes and envelopes is the orchestrator's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResult {
    HttpResponse {
        status: u16,
        headers: BTreeMap<String, String>,
        body: String,
    },
    /// The request did not complete before its deadline
    Timeout,
    /// Connection refused, reset, DNS failure, TLS failure
    ConnectionError(String),
}

impl TransportResult {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TransportResult::HttpResponse { .. } => "http_response",
            TransportResult::Timeout => "timeout",
            TransportResult::ConnectionError(_) => "connection_error",
        }
    }

    /// Case-insensitive response header lookup; `None` for non-HTTP results.
    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            TransportResult::HttpResponse { headers, .. } => headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// Executes rendered requests against the marketplace API.
pub trait Transport: Send + Sync {
    /// Execute `request`, giving up after `timeout`.
    ///
    /// Implementations must map their own timeout and connection failures to
    /// `TransportResult::Timeout` / `TransportResult::ConnectionError` rather
    /// than panicking.
    fn execute<'a>(
        &'a self,
        request: &'a HttpRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = TransportResult> + Send + 'a>>;
}
