//! Error types for credential and minting operations

/// Errors from credential, persistence, and minting operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("session login failed: {0}")]
    Login(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("mint failed: {0}")]
    MintFailed(String),

    #[error("invalid credential bundle: {0}")]
    InvalidBundle(String),

    #[error("captured auth error: {0}")]
    CapturedAuth(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
