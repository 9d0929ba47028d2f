use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default, rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "useSearch")]
    pub use_search: Option<bool>,
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
}

impl ChatCompletionRequest {
    /// Rejects requests with no usable `user` message.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.messages.is_empty() {
            return Err(BackendError::Validation("messages is required".to_string()));
        }
        if !self.messages.iter().any(|m| m.role == "user") {
            return Err(BackendError::Validation(
                "at least one user message is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::text)
            .unwrap_or_default()
    }

    pub fn image_url(&self) -> Option<&str> {
        self.content.as_ref().and_then(MessageContent::image_url)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Plain(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text parts joined by newlines; images and unknown parts are skipped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Plain(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } | ContentPart::Unsupported => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match self {
            MessageContent::Plain(_) => None,
            MessageContent::Parts(parts) => parts.iter().find_map(|part| match part {
                ContentPart::ImageUrl { image_url } => Some(image_url.url()),
                ContentPart::Text { .. } | ContentPart::Unsupported => None,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        #[serde(default)]
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    #[serde(other)]
    Unsupported,
}

/// Clients send either `"image_url": "https://…"` or `{"url": …, "detail": …}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageUrl {
    Bare(String),
    Detailed {
        url: String,
        #[serde(default)]
        detail: Option<String>,
    },
}

impl ImageUrl {
    pub fn url(&self) -> &str {
        match self {
            ImageUrl::Bare(url) => url,
            ImageUrl::Detailed { url, .. } => url,
        }
    }
}

/// `role:text\n` per message, with `decorate` applied to the text.
pub fn flatten_transcript(messages: &[ChatMessage], decorate: impl Fn(&str) -> String) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&message.role);
        out.push(':');
        out.push_str(&decorate(&message.text()));
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptWithContext {
    pub prompt: String,
    pub image_url: Option<String>,
    pub context: String,
}

/// The last user message becomes the prompt; everything else becomes tagged
/// context in conversation order.
pub fn split_prompt_and_context(
    messages: &[ChatMessage],
) -> Result<PromptWithContext, BackendError> {
    let last_user = messages
        .iter()
        .rposition(|m| m.role == "user")
        .ok_or_else(|| {
            BackendError::Validation("at least one user message is required".to_string())
        })?;

    let prompt = messages[last_user].text();
    if prompt.trim().is_empty() {
        return Err(BackendError::Validation("prompt is empty".to_string()));
    }

    let context = messages
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != last_user)
        .map(|(_, message)| {
            let tag = match message.role.as_str() {
                "system" => "[system](#instructions)",
                "assistant" => "[assistant](#message)",
                _ => "[user](#message)",
            };
            format!("{tag}\n{}", message.text())
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    Ok(PromptWithContext {
        prompt,
        image_url: messages[last_user].image_url().map(str::to_string),
        context,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
}

impl FinishReason {
    pub fn for_outcome(errored: bool) -> Self {
        if errored {
            FinishReason::Length
        } else {
            FinishReason::Stop
        }
    }
}

/// Renders a mid-stream backend error as visible completion text.
pub fn error_marker(text: &str) -> String {
    format!("`Error: {text}`")
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub system_fingerprint: Option<String>,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageGenerationResponse {
    pub created: i64,
    pub data: Vec<ImageData>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageData {
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn content_accepts_plain_and_parts() {
        let req = request(json!({
            "model": "kimi",
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": [
                    { "type": "text", "text": "what is" },
                    { "type": "image_url", "image_url": { "url": "https://x/cat.png" } },
                    { "type": "input_audio", "input_audio": {} },
                    { "type": "text", "text": "this?" }
                ] }
            ]
        }));
        assert_eq!(req.messages[0].text(), "be brief");
        assert_eq!(req.messages[1].text(), "what is\nthis?");
        assert_eq!(req.messages[1].image_url(), Some("https://x/cat.png"));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn bare_image_url_string_is_accepted() {
        let req = request(json!({
            "messages": [{ "role": "user", "content": [
                { "type": "image_url", "image_url": "https://x/a.png" }
            ] }]
        }));
        assert_eq!(req.messages[0].image_url(), Some("https://x/a.png"));
    }

    #[test]
    fn validation_requires_a_user_message() {
        let empty = request(json!({ "model": "kimi", "messages": [] }));
        assert!(matches!(empty.validate(), Err(BackendError::Validation(_))));
        let no_user = request(json!({
            "messages": [{ "role": "system", "content": "x" }]
        }));
        assert!(matches!(no_user.validate(), Err(BackendError::Validation(_))));
    }

    #[test]
    fn transcript_is_role_prefixed_per_line() {
        let req = request(json!({
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello" },
                { "role": "user", "content": [{ "type": "text", "text": "bye" }] }
            ]
        }));
        assert_eq!(
            flatten_transcript(&req.messages, |s| s.to_uppercase()),
            "user:HI\nassistant:HELLO\nuser:BYE\n"
        );
    }

    #[test]
    fn last_user_message_is_the_prompt() {
        let req = request(json!({
            "messages": [
                { "role": "system", "content": "rules" },
                { "role": "user", "content": "first" },
                { "role": "assistant", "content": "answer" },
                { "role": "user", "content": [
                    { "type": "text", "text": "second" },
                    { "type": "image_url", "image_url": { "url": "https://img" } }
                ] }
            ]
        }));
        let split = split_prompt_and_context(&req.messages).unwrap();
        assert_eq!(split.prompt, "second");
        assert_eq!(split.image_url.as_deref(), Some("https://img"));
        assert_eq!(
            split.context,
            "[system](#instructions)\nrules\n\n[user](#message)\nfirst\n\n[assistant](#message)\nanswer"
        );
    }

    #[test]
    fn blank_prompt_is_rejected() {
        let req = request(json!({ "messages": [{ "role": "user", "content": "  " }] }));
        assert!(matches!(
            split_prompt_and_context(&req.messages),
            Err(BackendError::Validation(_))
        ));
    }

    #[test]
    fn finish_reason_serializes_lowercase() {
        assert_eq!(serde_json::to_value(FinishReason::for_outcome(true)).unwrap(), "length");
        assert_eq!(serde_json::to_value(FinishReason::for_outcome(false)).unwrap(), "stop");
        assert_eq!(error_marker("boom"), "`Error: boom`");
    }
}
