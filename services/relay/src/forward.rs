//! Upstream forwarding with credential rotation
//!
//! Every upstream call goes through [`send_with_rotation`]: fetch a bearer
//! token from the pool, send, and on an upstream 429 report the credential
//! behind that token and try again with the next one, up to [`MAX_RETRIES`]
//! attempts. Non-429 upstream responses are returned as-is; the caller sees
//! the upstream status and body unchanged.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use copilot_auth::EDITOR_VERSION;
use copilot_pool::CredentialPool;
use futures_util::StreamExt;
use reqwest::Method;
use tracing::{error, warn};

use crate::preprocess::ChatRequest;
use crate::sse::{error_frame, is_non_streaming_model, messages_to_deltas, to_sse_frames};

/// Total attempts per caller request before giving up on rotation.
pub const MAX_RETRIES: u32 = 3;

/// Shared state for the forwarding handlers.
#[derive(Clone)]
pub struct ForwardState {
    pub client: reqwest::Client,
    pub pool: Arc<CredentialPool>,
    pub chat_url: String,
    pub models_url: String,
}

#[derive(Debug)]
pub enum ForwardError {
    /// Token exchange failed; no bearer token could be minted.
    Auth(copilot_pool::Error),
    /// Every attempt ended in an upstream 429 and rotation ran out of
    /// credentials to try.
    PoolExhausted,
    /// Upstream answered with a non-429 error; relayed verbatim.
    Upstream {
        status: StatusCode,
        content_type: Option<String>,
        body: Bytes,
    },
    /// The request never produced an upstream response.
    Transport(String),
}

/// JSON error body: `{"error":{"type":...,"message":...}}`.
pub fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        match self {
            ForwardError::Auth(e) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "auth_exchange_error",
                &e.to_string(),
            ),
            ForwardError::PoolExhausted => error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "pool_exhausted",
                "All credentials are rate limited. Please try again later.",
            ),
            ForwardError::Upstream {
                status,
                content_type,
                body,
            } => {
                let mut response = Response::builder().status(status);
                if let Some(ct) = content_type {
                    response = response.header(header::CONTENT_TYPE, ct);
                }
                response.body(Body::from(body)).unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "relay_error",
                        &format!("response build error: {e}"),
                    )
                })
            }
            ForwardError::Transport(message) => {
                error_response(StatusCode::BAD_GATEWAY, "bad_gateway", &message)
            }
        }
    }
}

/// Send one upstream request, rotating credentials on 429.
///
/// A 429 penalizes the credential that produced the bearer token and drops
/// the cached token in the same pool-lock acquisition, so the next attempt
/// mints from a different credential. Transport errors also consume an
/// attempt. The final classification depends on how the last attempt
/// failed.
pub async fn send_with_rotation(
    state: &ForwardState,
    method: Method,
    url: &str,
    json_body: Option<Bytes>,
) -> Result<reqwest::Response, ForwardError> {
    let mut last_transport = String::new();
    let mut last_was_rate_limit = false;

    for attempt in 1..=MAX_RETRIES {
        let issued = state
            .pool
            .get_valid_access_token()
            .await
            .map_err(ForwardError::Auth)?;

        let mut req = state
            .client
            .request(method.clone(), url)
            .header(header::AUTHORIZATION, format!("Bearer {}", issued.token))
            .header(header::ACCEPT, "text/event-stream")
            .header("editor-version", EDITOR_VERSION);
        if let Some(body) = &json_body {
            req = req
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        match req.send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                metrics::counter!("relay_rate_limited_total").increment(1);
                warn!(
                    credential = issued.credential_index + 1,
                    attempt, "upstream rate limited, rotating credential"
                );
                state.pool.report_rate_limited(issued.credential_index).await;
                last_was_rate_limit = true;
            }
            Ok(resp) => return Ok(resp),
            Err(e) => {
                warn!(error = %e, attempt, "upstream request failed");
                last_transport = e.to_string();
                last_was_rate_limit = false;
            }
        }
    }

    if last_was_rate_limit {
        Err(ForwardError::PoolExhausted)
    } else {
        Err(ForwardError::Transport(last_transport))
    }
}

/// Forward a preprocessed chat completion request.
///
/// Errors before the first body byte surface as real HTTP statuses. Once
/// streaming starts, failures end the stream with a single terminal
/// `data: {"error": ...}` frame instead of a broken connection.
pub async fn forward_chat(
    state: &ForwardState,
    request: &ChatRequest,
) -> Result<Response, ForwardError> {
    let adapt = request.wants_stream() && is_non_streaming_model(request.model());

    let body = serde_json::to_vec(request)
        .map_err(|e| ForwardError::Transport(format!("request serialization failed: {e}")))?;
    let resp =
        send_with_rotation(state, Method::POST, &state.chat_url, Some(Bytes::from(body))).await?;

    let status = resp.status();
    if !status.is_success() {
        return Err(upstream_error(resp).await);
    }

    if adapt {
        Ok(adapted_stream(resp).await)
    } else {
        Ok(passthrough_stream(resp))
    }
}

/// Forward a models listing request; the upstream JSON is relayed verbatim.
pub async fn forward_models(state: &ForwardState) -> Result<Response, ForwardError> {
    let resp = send_with_rotation(state, Method::GET, &state.models_url, None).await?;

    let status = resp.status();
    if !status.is_success() {
        return Err(upstream_error(resp).await);
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| ForwardError::Transport(format!("upstream response read error: {e}")))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

async fn upstream_error(resp: reqwest::Response) -> ForwardError {
    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    match resp.bytes().await {
        Ok(body) => {
            error!(status = status.as_u16(), "upstream error relayed to caller");
            ForwardError::Upstream {
                status,
                content_type,
                body,
            }
        }
        Err(e) => ForwardError::Transport(format!("upstream response read error: {e}")),
    }
}

/// Relay the upstream body as-is. A mid-stream read error becomes one
/// terminal error frame; the scan state fuses the stream so nothing follows
/// it. Dropping the response future or body drops the upstream connection.
fn passthrough_stream(resp: reqwest::Response) -> Response {
    let stream = resp.bytes_stream().scan(false, |failed, chunk| {
        let item: Option<Result<Bytes, std::convert::Infallible>> = if *failed {
            None
        } else {
            Some(Ok(match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(error = %e, "upstream stream interrupted");
                    *failed = true;
                    Bytes::from(error_frame(&format!("upstream error: {e}")))
                }
            }))
        };
        futures_util::future::ready(item)
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Buffer a non-streaming body and replay it as SSE frames. Used for models
/// that cannot stream upstream when the caller asked for a stream.
async fn adapted_stream(resp: reqwest::Response) -> Response {
    let frames = match resp.bytes().await {
        Ok(body) => match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(data) => to_sse_frames(&messages_to_deltas(&data)),
            Err(e) => {
                error!(error = %e, "upstream body is not valid JSON, cannot adapt");
                vec![error_frame(&format!("response adaptation failed: {e}"))]
            }
        },
        Err(e) => {
            error!(error = %e, "failed to read upstream body for adaptation");
            vec![error_frame(&format!("upstream response read error: {e}"))]
        }
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from(frames.concat()),
    )
        .into_response()
}
