//! GitHub Copilot token exchange
//!
//! Turns a long-lived refresh credential into a short-lived Copilot access
//! token via the `copilot_internal/v2/token` endpoint. This crate is a
//! standalone library with no dependency on the relay binary; the pool and
//! the service both build on it.
//!
//! Token flow:
//! 1. Pool selects a refresh credential
//! 2. `token::exchange_token()` GETs the token endpoint with
//!    `Authorization: token <credential>`
//! 3. The returned `AccessToken` is cached by the pool until it nears expiry
//! 4. Upstream API calls carry `Authorization: Bearer <access token>`

pub mod constants;
pub mod error;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use token::{AccessToken, exchange_token};
