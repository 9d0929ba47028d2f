use crate::backends::kimi::wrap_urls_to_tags;
use crate::backends::{ChatTurn, StreamingChatBackend, gemini, sydney};
use crate::error::{AppError, AppResult, BackendError};
use crate::openai::{ChatCompletionRequest, flatten_transcript, split_prompt_and_context};
use axum::http::HeaderMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// A backend turn plus the model name reported back to the client.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub turn: ChatTurn,
    pub display_model: String,
}

pub type TurnBuilder = fn(&ChatCompletionRequest, &HeaderMap) -> Result<PreparedTurn, BackendError>;

#[derive(Clone)]
pub struct Route {
    pub backend: Arc<dyn StreamingChatBackend>,
    pub build_turn: TurnBuilder,
}

impl Route {
    /// Parses the buffered body in full and builds the backend turn.
    pub fn prepare(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> AppResult<(ChatCompletionRequest, PreparedTurn)> {
        let request = parse_request(body)?;
        let prepared = (self.build_turn)(&request, headers)?;
        Ok((request, prepared))
    }
}

pub fn parse_request(body: &[u8]) -> AppResult<ChatCompletionRequest> {
    serde_json::from_slice(body).map_err(|err| {
        AppError::bad_request("invalid_json", format!("invalid request body: {err}"))
    })
}

#[derive(Deserialize)]
struct ModelProbe {
    #[serde(default)]
    model: String,
}

/// Exact model name → backend route, fixed at startup.
#[derive(Clone, Default)]
pub struct ModelDispatcher {
    routes: HashMap<String, Route>,
}

impl ModelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        model: impl Into<String>,
        backend: Arc<dyn StreamingChatBackend>,
        build_turn: TurnBuilder,
    ) -> Self {
        self.routes.insert(model.into(), Route { backend, build_turn });
        self
    }

    /// The model table the gateway serves.
    pub fn standard(
        kimi: Arc<dyn StreamingChatBackend>,
        gemini: Arc<dyn StreamingChatBackend>,
        sydney: Arc<dyn StreamingChatBackend>,
    ) -> Self {
        let mut dispatcher = Self::new()
            .register("kimi", kimi, kimi_turn)
            .register("gemini-pro", gemini, gemini_turn);
        for model in ["Creative", "Balanced", "Precise", "gpt-3.5-turbo"] {
            dispatcher = dispatcher.register(model, sydney.clone(), sydney_turn);
        }
        dispatcher
    }

    pub fn models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        models.sort_unstable();
        models
    }

    /// Probes the model name from the buffered body and looks up its route.
    pub fn resolve(&self, body: &[u8]) -> AppResult<&Route> {
        let probe: ModelProbe = serde_json::from_slice(body).map_err(|err| {
            AppError::bad_request("invalid_json", format!("invalid request body: {err}"))
        })?;
        self.routes
            .get(&probe.model)
            .ok_or_else(|| BackendError::UnsupportedModel(probe.model).into())
    }
}

pub fn kimi_turn(
    request: &ChatCompletionRequest,
    _headers: &HeaderMap,
) -> Result<PreparedTurn, BackendError> {
    request.validate()?;
    Ok(PreparedTurn {
        turn: ChatTurn {
            prompt: flatten_transcript(&request.messages, wrap_urls_to_tags),
            credential: request.refresh_token.clone(),
            search: request.use_search.unwrap_or(true),
            ..ChatTurn::default()
        },
        display_model: "KIMI".to_string(),
    })
}

pub fn gemini_turn(
    request: &ChatCompletionRequest,
    _headers: &HeaderMap,
) -> Result<PreparedTurn, BackendError> {
    request.validate()?;
    let model = gemini::resolve_model(Some(&request.model));
    Ok(PreparedTurn {
        turn: ChatTurn {
            prompt: flatten_transcript(&request.messages, str::to_string),
            credential: request.api_key.clone(),
            model: Some(model.clone()),
            ..ChatTurn::default()
        },
        display_model: model.to_uppercase(),
    })
}

/// `gpt-3.5-turbo` is served as the Balanced style; other Sydney models name their style.
pub fn sydney_style(model: &str) -> &str {
    match model {
        "gpt-3.5-turbo" => "Balanced",
        "" => sydney::DEFAULT_STYLE,
        other => other,
    }
}

pub fn sydney_turn(
    request: &ChatCompletionRequest,
    headers: &HeaderMap,
) -> Result<PreparedTurn, BackendError> {
    request.validate()?;
    let split = split_prompt_and_context(&request.messages)?;
    let style = sydney_style(&request.model).to_string();
    let cookies = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string);
    Ok(PreparedTurn {
        turn: ChatTurn {
            prompt: split.prompt,
            context: Some(split.context).filter(|c| !c.is_empty()),
            image_url: split.image_url,
            credential: cookies,
            style: Some(style.clone()),
            search: request.tool_choice.is_some(),
            gpt4_turbo: true,
            ..ChatTurn::default()
        },
        display_model: style,
    })
}
