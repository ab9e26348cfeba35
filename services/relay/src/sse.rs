//! Response reshaping for non-streaming-only models
//!
//! The o1 model family only answers with a complete JSON body, but callers
//! that asked for streaming expect Server-Sent-Events frames. This module
//! rewrites each `choices[i].message` into a `delta`-shaped choice and emits
//! the result as one `data: {...}\n\n` frame per choice, terminated by the
//! literal `data: [DONE]\n\n` frame. It also builds the terminal error frame
//! used whenever a stream has to end early.

use serde_json::{Value, json};

/// Model prefixes that only support non-streaming upstream responses.
pub const NON_STREAMING_MODEL_PREFIXES: &[&str] = &["o1"];

/// Whether a model's responses must be converted to SSE when the caller
/// requested streaming.
pub fn is_non_streaming_model(model: &str) -> bool {
    NON_STREAMING_MODEL_PREFIXES
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

/// Rewrite `message`-shaped choices into `delta`-shaped ones.
///
/// Choices without a `message` entry are dropped; `finish_reason` is carried
/// over when present. A body with no `choices` array is returned untouched.
pub fn messages_to_deltas(data: &Value) -> Value {
    let Some(choices) = data.get("choices").and_then(Value::as_array) else {
        return data.clone();
    };
    if choices.is_empty() {
        return data.clone();
    }

    let converted: Vec<Value> = choices
        .iter()
        .filter_map(|choice| {
            let message = choice.get("message")?;
            let mut delta_choice = json!({
                "index": choice.get("index").cloned().unwrap_or(Value::from(0)),
                "delta": {
                    "content": message.get("content").cloned().unwrap_or(Value::Null),
                },
            });
            if let Some(reason) = choice.get("finish_reason") {
                delta_choice["finish_reason"] = reason.clone();
            }
            Some(delta_choice)
        })
        .collect();

    let mut out = data.clone();
    out["choices"] = Value::Array(converted);
    out
}

/// Split a response body into SSE frames, one per choice, plus the
/// terminating `[DONE]` frame. Each frame repeats the body's `id`,
/// `created`, and `model` with a single-element `choices` array.
pub fn to_sse_frames(data: &Value) -> Vec<String> {
    let mut frames = Vec::new();
    if let Some(choices) = data.get("choices").and_then(Value::as_array) {
        for choice in choices {
            let event = json!({
                "id": data.get("id").cloned().unwrap_or(Value::from("")),
                "created": data.get("created").cloned().unwrap_or(Value::from(0)),
                "model": data.get("model").cloned().unwrap_or(Value::from("")),
                "choices": [choice],
            });
            frames.push(format!("data: {event}\n\n"));
        }
    }
    frames.push("data: [DONE]\n\n".to_string());
    frames
}

/// Terminal in-stream error frame. Emitted instead of breaking the
/// connection so the caller's stream parser terminates cleanly.
pub fn error_frame(message: &str) -> String {
    format!("data: {}\n\n", json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn o1_prefixes_are_recognized() {
        assert!(is_non_streaming_model("o1"));
        assert!(is_non_streaming_model("o1-preview"));
        assert!(is_non_streaming_model("o1-mini"));
        assert!(!is_non_streaming_model("gpt-4o"));
        assert!(!is_non_streaming_model(""));
    }

    #[test]
    fn message_choices_become_deltas() {
        let body = json!({
            "id": "chatcmpl-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "hello"}},
                {"index": 1, "message": {"content": "world"}, "finish_reason": "stop"},
            ],
        });
        let converted = messages_to_deltas(&body);
        let choices = converted["choices"].as_array().unwrap();
        assert_eq!(choices.len(), 2);
        assert_eq!(choices[0]["delta"]["content"], "hello");
        assert!(choices[0].get("message").is_none());
        assert!(choices[0].get("finish_reason").is_none());
        assert_eq!(choices[1]["delta"]["content"], "world");
        assert_eq!(choices[1]["finish_reason"], "stop");
    }

    #[test]
    fn body_without_choices_is_untouched() {
        let body = json!({"error": {"message": "nope"}});
        assert_eq!(messages_to_deltas(&body), body);

        let body = json!({"choices": []});
        assert_eq!(messages_to_deltas(&body), body);
    }

    #[test]
    fn frames_repeat_envelope_and_end_with_done() {
        let body = json!({
            "id": "chatcmpl-1",
            "created": 1700000000,
            "model": "o1-preview",
            "choices": [
                {"index": 0, "delta": {"content": "a"}},
                {"index": 1, "delta": {"content": "b"}},
            ],
        });
        let frames = to_sse_frames(&body);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], "data: [DONE]\n\n");

        for (i, frame) in frames[..2].iter().enumerate() {
            let payload = frame.strip_prefix("data: ").unwrap().trim_end();
            let event: serde_json::Value = serde_json::from_str(payload).unwrap();
            assert_eq!(event["id"], "chatcmpl-1");
            assert_eq!(event["created"], 1700000000);
            assert_eq!(event["model"], "o1-preview");
            assert_eq!(event["choices"].as_array().unwrap().len(), 1);
            assert_eq!(event["choices"][0]["index"], i);
        }
    }

    #[test]
    fn choiceless_body_yields_only_done() {
        let frames = to_sse_frames(&json!({"id": "x"}));
        assert_eq!(frames, vec!["data: [DONE]\n\n".to_string()]);
    }

    #[test]
    fn error_frame_is_a_data_frame() {
        let frame = error_frame("upstream went away");
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        let payload: serde_json::Value =
            serde_json::from_str(frame.strip_prefix("data: ").unwrap().trim_end()).unwrap();
        assert_eq!(payload["error"], "upstream went away");
    }
}
