//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("bundle not found: {0}")]
    NotFound(String),

    #[error("duplicate bundle id: {0}")]
    Duplicate(String),

    #[error("invalid bundle: {0}")]
    Invalid(String),

    #[error("pool state error: {0}")]
    Store(String),

    #[error("mint failed: {0}")]
    MintFailed(String),
}

impl From<companion_auth::Error> for Error {
    fn from(err: companion_auth::Error) -> Self {
        match err {
            companion_auth::Error::Io(msg) | companion_auth::Error::CredentialParse(msg) => {
                Error::Store(msg)
            }
            other => Error::MintFailed(other.to_string()),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
