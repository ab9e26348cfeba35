//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no refresh credentials configured")]
    NoCredentials,

    #[error("token exchange failed for every credential: {0}")]
    AuthExchange(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
