//! Response classification
//!
//! The marketplace answers most application errors with HTTP 200 and an
//! `{"error": {"errorcode": .., "errorname": ..}}` envelope, so the status
//! code alone is not enough: 2xx bodies are inspected for an error object
//! before they count as a success.

use std::time::Duration;

use capability::TransportResult;

/// Error-name fragments that mean the session ticket was refused.
const AUTH_MARKERS: &[&str] = &["AUTH", "SESSION", "TICKET", "EXPIRED", "UNAUTHORIZED"];

/// Error-name fragments that mean the caller is being throttled.
const RATE_MARKERS: &[&str] = &["RATE", "THROTTL", "TOO_MANY"];

/// Result of one poll, as seen by the credential pool and the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Success { payload: serde_json::Value },
    /// HTTP 401/403, or a 2xx envelope naming an auth/session error
    AuthRejected { status_code: u16 },
    RateLimited { retry_after: Option<Duration> },
    TransientError { cause: String },
    FatalError { cause: String },
}

impl PollOutcome {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            PollOutcome::Success { .. } => "success",
            PollOutcome::AuthRejected { .. } => "auth_rejected",
            PollOutcome::RateLimited { .. } => "rate_limited",
            PollOutcome::TransientError { .. } => "transient_error",
            PollOutcome::FatalError { .. } => "fatal_error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Success { .. })
    }
}

/// Classify a raw transport result.
///
/// `success_key` is the top-level field a well-formed success envelope
/// carries (`responseInfo` for the auction search command).
pub fn classify(result: &TransportResult, success_key: &str) -> PollOutcome {
    let (status, body) = match result {
        TransportResult::Timeout => {
            return PollOutcome::TransientError {
                cause: "request timed out".into(),
            };
        }
        TransportResult::ConnectionError(e) => {
            return PollOutcome::TransientError {
                cause: format!("connection error: {e}"),
            };
        }
        TransportResult::HttpResponse { status, body, .. } => (*status, body),
    };

    match status {
        401 | 403 => PollOutcome::AuthRejected {
            status_code: status,
        },
        429 => PollOutcome::RateLimited {
            retry_after: result.header("retry-after").and_then(parse_retry_after),
        },
        408 | 500 | 502 | 503 | 504 => PollOutcome::TransientError {
            cause: format!("upstream returned {status}"),
        },
        200..=299 => classify_envelope(status, body, success_key),
        _ => PollOutcome::FatalError {
            cause: format!("unexpected status {status}: {}", preview(body)),
        },
    }
}

fn classify_envelope(status: u16, body: &str, success_key: &str) -> PollOutcome {
    let parsed: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            return PollOutcome::FatalError {
                cause: format!("unparseable response body ({e}): {}", preview(body)),
            };
        }
    };

    let Some(object) = parsed.as_object() else {
        return PollOutcome::FatalError {
            cause: format!("response body is not an object: {}", preview(body)),
        };
    };

    if let Some(error) = object.get("error").and_then(|e| e.as_object()) {
        let name = error
            .get("errorname")
            .and_then(|n| n.as_str())
            .unwrap_or("UNKNOWN_ERROR")
            .to_uppercase();
        let code = error
            .get("errorcode")
            .map(|c| c.to_string())
            .unwrap_or_else(|| "null".into());

        if AUTH_MARKERS.iter().any(|m| name.contains(m)) {
            return PollOutcome::AuthRejected {
                status_code: status,
            };
        }
        if RATE_MARKERS.iter().any(|m| name.contains(m)) {
            return PollOutcome::RateLimited { retry_after: None };
        }
        return PollOutcome::FatalError {
            cause: format!("api error {code} ({name})"),
        };
    }

    if object.contains_key(success_key) {
        return PollOutcome::Success { payload: parsed };
    }

    PollOutcome::FatalError {
        cause: format!("response missing '{success_key}' envelope: {}", preview(body)),
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored, as are
/// values too large to represent; the loop caps the rest at its backoff
/// ceiling.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let secs = value.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn preview(body: &str) -> String {
    body.chars().take(200).collect()
}
