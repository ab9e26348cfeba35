//! Refresh-credential pool for the Copilot relay
//!
//! Owns the set of long-lived refresh credentials, per-credential rate-limit
//! state, and the cached short-lived access token. The relay asks the pool
//! for a valid access token before every upstream call; the pool rotates
//! credentials when the token endpoint or the inference API rate-limits one.
//!
//! Credential lifecycle:
//! 1. Loaded once at startup from configuration (duplicates collapsed)
//! 2. Selected circularly, skipping credentials inside a penalty window
//! 3. Penalized with a flat 60-second window on any 429
//! 4. Healed automatically when a lapsed window is observed at selection
//!
//! There is no persistence: a restart starts every credential clean.

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{
    CredentialPool, CredentialReport, IssuedToken, PoolStatus, RotationReport,
};
