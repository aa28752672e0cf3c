//! Error types for polling

use capability::SinkError;

/// Template loading and rendering failures.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("missing template context key '{0}'")]
    MissingKey(String),

    #[error("malformed placeholder in {field}: {detail}")]
    Malformed { field: String, detail: String },

    #[error("template load failed: {0}")]
    Load(String),
}

/// Failures of a poll cycle that are not credential outcomes.
///
/// Credential problems are absorbed by the pool and show up as a
/// `PollOutcome`; these reach the caller instead.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("credential pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("credential pool error: {0}")]
    Pool(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("result sink rejected payload: {0}")]
    Sink(#[from] SinkError),
}

impl PollError {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            PollError::PoolExhausted(_) => "pool_exhausted",
            PollError::Pool(_) => "pool_error",
            PollError::Template(_) => "template_error",
            PollError::Sink(_) => "sink_error",
        }
    }
}

impl From<companion_pool::Error> for PollError {
    fn from(err: companion_pool::Error) -> Self {
        match err {
            companion_pool::Error::PoolExhausted(msg) => PollError::PoolExhausted(msg),
            other => PollError::Pool(other.to_string()),
        }
    }
}
