//! Workspace-level error types

use thiserror::Error;

/// Errors shared across the workspace: configuration loading and the
/// filesystem/TOML failures it can run into.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using the workspace Error
pub type Result<T> = std::result::Result<T, Error>;
