//! Result sink capability: normalization and storage boundary

use std::future::Future;
use std::pin::Pin;

/// Downstream failure after a successful poll.
///
/// Sink errors never feed back into credential health: a storage outage is
/// not a credential problem.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("payload rejected: {0}")]
    Validation(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl SinkError {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SinkError::Validation(_) => "validation",
            SinkError::Storage(_) => "storage",
        }
    }
}

/// Accepts raw decoded payloads from successful polls.
pub trait ResultSink: Send + Sync {
    /// Identifier for logging (e.g. "auctions-jsonl")
    fn id(&self) -> &str;

    /// Validate and store one payload.
    fn accept<'a>(
        &'a self,
        payload: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}
