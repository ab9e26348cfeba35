//! Shared types for the Copilot relay workspace

mod error;
mod sanitize;
mod secret;

pub use error::{Error, Result};
pub use sanitize::{SanitizeOutcome, sanitize};
pub use secret::Secret;
