use super::{
    ChatTurn, MessageStream, NormalizedMessage, StreamNormalizer, StreamingChatBackend,
    spawn_reader, sse_frames,
};
use crate::credentials::{Credential, CredentialManager, TokenExchange};
use crate::error::BackendError;
use crate::upstream::{self, join_url};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::LazyLock;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://kimi.moonshot.cn";
const DEFAULT_CHAT_NAME: &str = "未命名会话";
const STREAM_TIMEOUT: Duration = Duration::from_secs(120);

const COMMON_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "zh-CN,zh;q=0.9"),
    ("r-timezone", "Asia/Shanghai"),
    (
        "sec-ch-ua",
        "\"Chromium\";v=\"122\", \"Not(A:Brand\";v=\"24\", \"Google Chrome\";v=\"122\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
    (
        "user-agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    ),
];

fn with_browser_headers(
    req: reqwest::RequestBuilder,
    base_url: &str,
    referer_path: &str,
) -> reqwest::RequestBuilder {
    let mut req = req.header("origin", base_url.trim_end_matches('/'));
    for (k, v) in COMMON_HEADERS {
        req = req.header(*k, *v);
    }
    req.header("referer", join_url(base_url, referer_path))
}

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"https?://(www\.)?[-a-zA-Z0-9@:%._+~#=]{2,256}\.[a-z]{2,6}\b([-a-zA-Z0-9@:%_+.~#?&/=]*)",
    )
    .unwrap_or_else(|err| panic!("url pattern: {err}"))
});

/// Wraps bare URLs in the tag Kimi's web client uses to trigger page reading.
pub fn wrap_urls_to_tags(content: &str) -> String {
    URL_PATTERN
        .replace_all(
            content,
            r#"<url id="" type="url" status="" title="" wc="">${0}</url>"#,
        )
        .into_owned()
}

/// Exchanges a Kimi refresh token at `/api/auth/token/refresh`.
#[derive(Clone)]
pub struct KimiTokenExchange {
    http: reqwest::Client,
    base_url: String,
}

impl KimiTokenExchange {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

#[async_trait]
impl TokenExchange for KimiTokenExchange {
    async fn exchange(&self, refresh_token: &str) -> Result<Credential, BackendError> {
        let req = self
            .http
            .get(join_url(&self.base_url, "/api/auth/token/refresh"))
            .bearer_auth(refresh_token);
        let req = with_browser_headers(req, &self.base_url, "/");
        let resp: TokenResponse = upstream::send_json(req)
            .await
            .map_err(|err| BackendError::Auth(err.message))?;
        Ok(Credential {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
        })
    }
}

pub struct KimiBackend {
    http: reqwest::Client,
    base_url: String,
    credentials: CredentialManager,
    default_refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateChatResponse {
    id: String,
}

impl KimiBackend {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        credentials: CredentialManager,
        default_refresh_token: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            credentials,
            default_refresh_token,
        }
    }

    fn refresh_token_for(&self, turn: &ChatTurn) -> Result<String, BackendError> {
        turn.credential
            .as_deref()
            .or(self.default_refresh_token.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Validation("missing Kimi refresh token".to_string()))
    }

    pub async fn create_chat(
        &self,
        access_token: &str,
        name: &str,
    ) -> Result<String, BackendError> {
        let req = self
            .http
            .post(join_url(&self.base_url, "/api/chat"))
            .bearer_auth(access_token)
            .json(&json!({ "name": name, "is_example": false }));
        let req = with_browser_headers(req, &self.base_url, "/");
        let resp: CreateChatResponse = upstream::send_json(req).await.map_err(|err| {
            BackendError::Connection(format!("error creating conversation: {}", err.message))
        })?;
        Ok(resp.id)
    }
}

#[async_trait]
impl StreamingChatBackend for KimiBackend {
    fn name(&self) -> &'static str {
        "kimi"
    }

    async fn start_chat(&self, turn: ChatTurn) -> Result<MessageStream, BackendError> {
        let refresh_token = self.refresh_token_for(&turn)?;
        let credential = self.credentials.obtain(&refresh_token).await?;

        let conversation_id = match turn.session_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                self.create_chat(&credential.access_token, DEFAULT_CHAT_NAME)
                    .await?
            }
        };

        let body = json!({
            "messages": [{ "role": "user", "content": turn.prompt }],
            "refs": Vec::<Value>::new(),
            "use_search": turn.search,
        });
        let path = format!("/api/chat/{conversation_id}/completion/stream");
        let req = self
            .http
            .post(join_url(&self.base_url, &path))
            .timeout(STREAM_TIMEOUT)
            .bearer_auth(&credential.access_token)
            .json(&body);
        let req = with_browser_headers(req, &self.base_url, &format!("/chat/{conversation_id}"));
        let resp = upstream::send_checked(req).await?;

        tracing::debug!(conversation_id = %conversation_id, "kimi stream opened");
        Ok(spawn_reader(
            "kimi",
            sse_frames(resp.bytes_stream()),
            KimiNormalizer::new(Some(conversation_id)),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct KimiFrame {
    event: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

impl KimiFrame {
    fn error_text(&self) -> String {
        if let Some(text) = self.text.as_deref().filter(|t| !t.is_empty()) {
            return text.to_string();
        }
        if let Some(message) = self
            .error
            .as_ref()
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(|v| v.as_str())
        {
            return message.to_string();
        }
        self.error_type
            .clone()
            .unwrap_or_else(|| "unknown kimi error".to_string())
    }
}

/// `cmpl` → text, `all_done` → done, `error` → error; everything else
/// (search progress, pings, references) is dropped.
pub struct KimiNormalizer {
    conversation_id: Option<String>,
}

impl KimiNormalizer {
    pub fn new(conversation_id: Option<String>) -> Self {
        Self { conversation_id }
    }
}

impl StreamNormalizer for KimiNormalizer {
    fn normalize(&mut self, frame: &str) -> Result<Vec<NormalizedMessage>, BackendError> {
        let frame: KimiFrame =
            serde_json::from_str(frame).map_err(|err| BackendError::Parse(err.to_string()))?;
        let message = match frame.event.as_str() {
            "cmpl" => NormalizedMessage::text(frame.text.unwrap_or_default()),
            "all_done" => NormalizedMessage::done(),
            "error" => NormalizedMessage::error(frame.error_text()),
            _ => return Ok(Vec::new()),
        };
        Ok(vec![message])
    }

    fn finish(&mut self) -> Vec<NormalizedMessage> {
        self.conversation_id
            .take()
            .map(|id| {
                vec![NormalizedMessage::new(
                    super::MessageKind::ConversationId,
                    id,
                )]
            })
            .unwrap_or_default()
    }
}
