//! Error types for token-exchange operations

/// Errors from the token exchange.
///
/// `RateLimited` is a distinct variant because the pool reacts to it
/// differently from every other failure: the credential is penalized and the
/// exchange is retried with the next one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint rate limited: {0}")]
    RateLimited(String),

    #[error("token exchange returned {status}: {body}")]
    Exchange { status: u16, body: String },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

/// Result alias for exchange operations.
pub type Result<T> = std::result::Result<T, Error>;
