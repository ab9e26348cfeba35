//! Chat request preprocessing
//!
//! Incoming bodies are parsed into typed structs with open flatten bags so
//! unknown fields survive the round trip to the upstream. Before forwarding
//! we sanitize message text, flatten array-form content into plain text
//! messages, rewrite roles for models that reject system messages, and fill
//! in the default token limit.

use common::sanitize;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::sse::is_non_streaming_model;

/// Applied when the caller leaves `max_tokens` out of the request.
pub const DEFAULT_MAX_TOKENS: u64 = 10240;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("only text type is supported in content array")]
    UnsupportedContent,
}

/// A chat completion request. Fields the relay does not act on ride in
/// `extra` and are forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Message content is either a plain string, an array of typed parts, or
/// something else entirely (null, objects from future API revisions). The
/// first two forms are rewritten, arrays that fail to parse as parts are
/// rejected in [`preprocess`], and the rest pass through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Other(Value),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Other(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("")
    }

    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

fn sanitize_logged(text: &str) -> String {
    let outcome = sanitize(text);
    if !outcome.success() {
        warn!(warnings = ?outcome.warnings, "message text sanitized");
    }
    outcome.text
}

/// Normalize a request in place.
///
/// Array-form content is flattened into one plain-text message per part;
/// parts of any type other than `text` are rejected. On models that do not
/// accept system messages the `system` role becomes `user`. A missing
/// `max_tokens` gets [`DEFAULT_MAX_TOKENS`]. Requests without messages are
/// left alone.
pub fn preprocess(request: &mut ChatRequest) -> Result<(), PreprocessError> {
    if request.messages.is_empty() {
        return Ok(());
    }

    let mut processed = Vec::with_capacity(request.messages.len());
    for mut message in request.messages.drain(..) {
        match message.content {
            MessageContent::Text(ref text) => {
                message.content = MessageContent::Text(sanitize_logged(text));
                processed.push(message);
            }
            MessageContent::Parts(ref parts) => {
                for part in parts {
                    if part.kind != "text" {
                        return Err(PreprocessError::UnsupportedContent);
                    }
                    let text = part.text.as_deref().unwrap_or("");
                    processed.push(Message {
                        role: message.role.clone(),
                        content: MessageContent::Text(sanitize_logged(text)),
                        extra: Map::new(),
                    });
                }
            }
            // An array that did not parse as text parts is malformed, not
            // opaque content to forward.
            MessageContent::Other(Value::Array(_)) => {
                return Err(PreprocessError::UnsupportedContent);
            }
            MessageContent::Other(_) => processed.push(message),
        }
    }
    request.messages = processed;

    if is_non_streaming_model(request.model()) {
        for message in &mut request.messages {
            if message.role == "system" {
                message.role = "user".to_string();
            }
        }
    }

    if request.max_tokens.is_none() {
        request.max_tokens = Some(DEFAULT_MAX_TOKENS);
    }
    Ok(())
}
