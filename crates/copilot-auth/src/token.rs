//! Access-token exchange
//!
//! One operation: trade a refresh credential for a short-lived access token.
//! The endpoint responds 200 with `{token, expires_at}` on success and 429
//! when the credential itself is being rate limited; the two failure shapes
//! map to distinct error variants so the pool can rotate on the latter.

use serde::Deserialize;
use tracing::debug;

use crate::constants::EDITOR_VERSION;
use crate::error::{Error, Result};

/// Short-lived bearer token for the inference API.
///
/// `expires_at` is an absolute unix timestamp in seconds, taken verbatim
/// from the endpoint response. The endpoint returns additional fields
/// (endpoint hints, feature flags); they are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: u64,
}

/// Exchange a refresh credential for an access token.
///
/// GETs `token_url` with `Authorization: token <credential>`. Status
/// handling:
/// - 200 → parsed `AccessToken`
/// - 429 → `Error::RateLimited` (credential should be penalized and rotated)
/// - anything else → `Error::Exchange` with status and body preserved
pub async fn exchange_token(
    client: &reqwest::Client,
    token_url: &str,
    credential: &str,
) -> Result<AccessToken> {
    let response = client
        .get(token_url)
        .header("Authorization", format!("token {credential}"))
        .header("editor-version", EDITOR_VERSION)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if status.as_u16() == 429 {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::RateLimited(body));
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Exchange {
            status: status.as_u16(),
            body,
        });
    }

    let token = response
        .json::<AccessToken>()
        .await
        .map_err(|e| Error::InvalidResponse(e.to_string()))?;
    debug!(expires_at = token.expires_at, "token exchange succeeded");
    Ok(token)
}
