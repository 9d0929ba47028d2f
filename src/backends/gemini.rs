use super::{
    ChatTurn, MessageStream, NormalizedMessage, StreamNormalizer, StreamingChatBackend,
    spawn_reader, sse_frames,
};
use crate::error::BackendError;
use crate::upstream::{self, join_url};
use async_trait::async_trait;
use serde_json::{Value, json};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-pro";

pub struct GeminiBackend {
    http: reqwest::Client,
    base_url: String,
    default_api_key: Option<String>,
}

impl GeminiBackend {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        default_api_key: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            default_api_key,
        }
    }
}

/// `gemini` is accepted as a shorthand for the default model.
pub fn resolve_model(requested: Option<&str>) -> String {
    match requested.map(str::trim) {
        None | Some("") | Some("gemini") => DEFAULT_MODEL.to_string(),
        Some(model) => model.to_string(),
    }
}

#[async_trait]
impl StreamingChatBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn start_chat(&self, turn: ChatTurn) -> Result<MessageStream, BackendError> {
        let api_key = turn
            .credential
            .as_deref()
            .or(self.default_api_key.as_deref())
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BackendError::Validation("missing Gemini API key".to_string()))?;
        let model = resolve_model(turn.model.as_deref());
        let path = format!("/v1beta/models/{model}:streamGenerateContent");

        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": turn.prompt }] }]
        });
        let req = self
            .http
            .post(join_url(&self.base_url, &path))
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", api_key)
            .json(&body);
        let resp = upstream::send_checked(req).await?;

        tracing::debug!(model = %model, "gemini stream opened");
        Ok(spawn_reader(
            "gemini",
            sse_frames(resp.bytes_stream()),
            GeminiNormalizer,
        ))
    }
}

const NORMAL_FINISH_REASONS: &[&str] = &["STOP", "MAX_TOKENS", "FINISH_REASON_UNSPECIFIED"];

/// Candidate text parts become deltas. Error objects, blocked prompts and
/// abnormal finish reasons become errors. The SSE body has no terminal
/// frame, so a clean EOF is reported as done.
pub struct GeminiNormalizer;

impl StreamNormalizer for GeminiNormalizer {
    fn normalize(&mut self, frame: &str) -> Result<Vec<NormalizedMessage>, BackendError> {
        let value: Value =
            serde_json::from_str(frame).map_err(|err| BackendError::Parse(err.to_string()))?;
        if !value.is_object() {
            return Err(BackendError::Parse("frame is not an object".to_string()));
        }

        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| error.to_string());
            return Ok(vec![NormalizedMessage::error(message)]);
        }

        if let Some(reason) = value
            .pointer("/promptFeedback/blockReason")
            .and_then(|v| v.as_str())
        {
            return Ok(vec![NormalizedMessage::error(format!(
                "prompt blocked: {reason}"
            ))]);
        }

        let mut out = Vec::new();
        let Some(candidate) = value
            .get("candidates")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
        else {
            return Ok(out);
        };

        let text: String = candidate
            .pointer("/content/parts")
            .and_then(|v| v.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter(|p| p.get("thought").and_then(|v| v.as_bool()) != Some(true))
                    .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        if !text.is_empty() {
            out.push(NormalizedMessage::text(text));
        }

        if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            if !NORMAL_FINISH_REASONS.contains(&reason) {
                out.push(NormalizedMessage::error(format!(
                    "generation stopped: {reason}"
                )));
            }
        }
        Ok(out)
    }

    fn finish(&mut self) -> Vec<NormalizedMessage> {
        vec![NormalizedMessage::done()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_parts_are_concatenated() {
        let out = GeminiNormalizer
            .normalize(
                r#"{"candidates":[{"content":{"parts":[{"text":"He"},{"text":"llo"}],"role":"model"}}]}"#,
            )
            .unwrap();
        assert_eq!(out, vec![NormalizedMessage::text("Hello")]);
    }

    #[test]
    fn thought_parts_are_dropped() {
        let out = GeminiNormalizer
            .normalize(
                r#"{"candidates":[{"content":{"parts":[{"text":"plan","thought":true},{"text":"answer"}]}}]}"#,
            )
            .unwrap();
        assert_eq!(out, vec![NormalizedMessage::text("answer")]);
    }

    #[test]
    fn safety_stop_is_an_error_after_partial_text() {
        let out = GeminiNormalizer
            .normalize(
                r#"{"candidates":[{"content":{"parts":[{"text":"par"}]},"finishReason":"SAFETY"}]}"#,
            )
            .unwrap();
        assert_eq!(
            out,
            vec![
                NormalizedMessage::text("par"),
                NormalizedMessage::error("generation stopped: SAFETY")
            ]
        );
    }

    #[test]
    fn normal_stop_adds_nothing() {
        let out = GeminiNormalizer
            .normalize(r#"{"candidates":[{"content":{"parts":[]},"finishReason":"STOP"}]}"#)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn error_object_and_block_reason() {
        let out = GeminiNormalizer
            .normalize(r#"{"error":{"code":400,"message":"API key not valid"}}"#)
            .unwrap();
        assert_eq!(out, vec![NormalizedMessage::error("API key not valid")]);
        let out = GeminiNormalizer
            .normalize(r#"{"promptFeedback":{"blockReason":"OTHER"}}"#)
            .unwrap();
        assert_eq!(out, vec![NormalizedMessage::error("prompt blocked: OTHER")]);
    }

    #[test]
    fn non_json_frame_is_a_parse_error() {
        assert!(matches!(
            GeminiNormalizer.normalize("[DONE"),
            Err(BackendError::Parse(_))
        ));
        assert!(matches!(
            GeminiNormalizer.normalize("42"),
            Err(BackendError::Parse(_))
        ));
    }

    #[test]
    fn model_shorthand_resolves_to_default() {
        assert_eq!(resolve_model(None), "gemini-pro");
        assert_eq!(resolve_model(Some("gemini")), "gemini-pro");
        assert_eq!(resolve_model(Some("gemini-1.5-flash")), "gemini-1.5-flash");
    }
}
