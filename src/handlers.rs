use crate::app::AppState;
use crate::assembler::{CompletionAssembler, await_generative_image, now_ts, relay_raw};
use crate::backends::sydney::{DEFAULT_STYLE, IMAGE_GENERATOR_CONTEXT};
use crate::backends::{ChatTurn, GenerativeImage, MessageStream, StreamingChatBackend};
use crate::dispatch::{self, PreparedTurn, TurnBuilder};
use crate::error::{AppError, AppResult, BackendError};
use crate::openai::{ImageData, ImageGenerationRequest, ImageGenerationResponse};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;

pub async fn health() -> Json<Value> {
    Json(json!({ "message": "Everything is OK!" }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .dispatcher
        .models()
        .into_iter()
        .map(|id| json!({ "id": id, "object": "model", "created": 0, "owned_by": "ollm-gateway" }))
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> AppResult<T> {
    serde_json::from_slice(body).map_err(|err| {
        AppError::bad_request("invalid_json", format!("invalid request body: {err}"))
    })
}

fn request_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn upstream_failure(backend: &'static str) -> impl Fn(BackendError) -> AppError {
    move |err| {
        metrics::counter!("ollm_upstream_errors_total", "backend" => backend).increment(1);
        tracing::warn!(backend, "upstream call failed: {err}");
        AppError::from(err)
    }
}

async fn open_stream<B>(backend: &B, turn: ChatTurn, mode: &'static str) -> AppResult<MessageStream>
where
    B: StreamingChatBackend + ?Sized,
{
    let name = backend.name();
    metrics::counter!("ollm_requests_total", "backend" => name, "mode" => mode).increment(1);
    backend
        .start_chat(turn)
        .await
        .map_err(upstream_failure(name))
}

async fn complete(
    backend: Arc<dyn StreamingChatBackend>,
    prepared: PreparedTurn,
    stream: bool,
) -> AppResult<Response> {
    let mode = if stream { "stream" } else { "aggregate" };
    let prompt = prepared.turn.prompt.clone();
    let messages = open_stream(backend.as_ref(), prepared.turn, mode).await?;
    let assembler = CompletionAssembler::new(prepared.display_model).with_prompt(prompt);
    if stream {
        let events = assembler
            .relay(messages)
            .map(|frame| Ok::<_, Infallible>(frame.into_event()));
        return Ok(Sse::new(events).into_response());
    }
    Ok(Json(assembler.aggregate(messages).await).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let route = state.dispatcher.resolve(&body)?;
    let (request, prepared) = route.prepare(&body, &headers)?;
    complete(route.backend.clone(), prepared, request.stream).await
}

async fn backend_completions(
    backend: Arc<dyn StreamingChatBackend>,
    build_turn: TurnBuilder,
    headers: &HeaderMap,
    body: &[u8],
) -> AppResult<Response> {
    let request = dispatch::parse_request(body)?;
    let prepared = build_turn(&request, headers)?;
    complete(backend, prepared, request.stream).await
}

pub async fn kimi_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    backend_completions(state.backends.kimi.clone(), dispatch::kimi_turn, &headers, &body).await
}

pub async fn gemini_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    backend_completions(state.backends.gemini.clone(), dispatch::gemini_turn, &headers, &body).await
}

async fn raw_stream<B>(backend: &B, turn: ChatTurn) -> AppResult<Response>
where
    B: StreamingChatBackend + ?Sized,
{
    let messages = open_stream(backend, turn, "raw").await?;
    let events = relay_raw(messages).map(Ok::<_, Infallible>);
    Ok(Sse::new(events).into_response())
}

fn require_text(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::bad_request("invalid_request", format!("{field} is required"))
            .with_param(field));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KimiStreamRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub conv_id: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub use_search: Option<bool>,
}

pub async fn kimi_stream(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let req: KimiStreamRequest = parse_json(&body)?;
    require_text("text", &req.text)?;
    let turn = ChatTurn {
        prompt: req.text,
        session_id: req.conv_id,
        credential: req.refresh_token,
        search: req.use_search.unwrap_or(true),
        ..ChatTurn::default()
    };
    raw_stream(state.backends.kimi.as_ref(), turn).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiStreamRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

pub async fn gemini_stream(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let req: GeminiStreamRequest = parse_json(&body)?;
    require_text("text", &req.text)?;
    let turn = ChatTurn {
        prompt: req.text,
        credential: req.api_key,
        model: req.model,
        ..ChatTurn::default()
    };
    raw_stream(state.backends.gemini.as_ref(), turn).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SydneyStreamRequest {
    pub prompt: String,
    pub webpage_context: Option<String>,
    pub image_url: Option<String>,
    pub cookies: Option<String>,
    pub conversation_style: Option<String>,
    pub no_search: bool,
    #[serde(rename = "useGPT4Turbo")]
    pub use_gpt4_turbo: bool,
    pub use_classic: bool,
    pub plugins: Vec<String>,
}

pub async fn sydney_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let req: SydneyStreamRequest = parse_json(&body)?;
    require_text("prompt", &req.prompt)?;
    let turn = ChatTurn {
        prompt: req.prompt,
        context: req.webpage_context,
        image_url: req.image_url,
        credential: req.cookies.or_else(|| request_cookies(&headers)),
        style: req.conversation_style,
        search: !req.no_search,
        gpt4_turbo: req.use_gpt4_turbo,
        use_classic: req.use_classic,
        plugins: req.plugins,
        ..ChatTurn::default()
    };
    raw_stream(state.backends.sydney.as_ref(), turn).await
}

pub async fn upload_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Response> {
    let invalid = |err: axum::extract::multipart::MultipartError| {
        AppError::bad_request("invalid_multipart", err.to_string())
    };
    let mut cookies = None;
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("cookies") => cookies = Some(field.text().await.map_err(invalid)?),
            Some("file") => file = Some(field.bytes().await.map_err(invalid)?),
            _ => {}
        }
    }
    let file = file.ok_or_else(|| {
        AppError::bad_request("invalid_request", "file is required").with_param("file")
    })?;
    let cookies = cookies
        .filter(|c| !c.trim().is_empty())
        .or_else(|| request_cookies(&headers));

    let url = state
        .backends
        .images
        .upload_image(file.to_vec(), cookies.as_deref())
        .await
        .map_err(upstream_failure("sydney"))?;
    Ok(Json(json!({ "imgUrl": url })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ImageCreateRequest {
    pub image: GenerativeImage,
    #[serde(default)]
    pub cookies: Option<String>,
}

pub async fn create_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let req: ImageCreateRequest = parse_json(&body)?;
    let cookies = req.cookies.or_else(|| request_cookies(&headers));
    let generated = state
        .backends
        .images
        .generate_image(&req.image, cookies.as_deref())
        .await
        .map_err(upstream_failure("sydney"))?;
    Ok(Json(generated).into_response())
}

pub async fn create_image_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let req: ImageGenerationRequest = parse_json(&body)?;
    require_text("prompt", &req.prompt)?;
    let cookies = request_cookies(&headers);
    let turn = ChatTurn {
        prompt: format!("Create image for the description: {}", req.prompt),
        context: Some(IMAGE_GENERATOR_CONTEXT.to_string()),
        credential: cookies.clone(),
        style: Some(DEFAULT_STYLE.to_string()),
        search: true,
        ..ChatTurn::default()
    };

    let images = state.backends.images.clone();
    let messages = open_stream(images.as_ref(), turn, "image").await?;
    let image = await_generative_image(messages).await?;
    let generated = images
        .generate_image(&image, cookies.as_deref())
        .await
        .map_err(upstream_failure("sydney"))?;

    let response = ImageGenerationResponse {
        created: now_ts(),
        data: generated
            .image_urls
            .into_iter()
            .map(|url| ImageData { url })
            .collect(),
    };
    Ok(Json(response).into_response())
}
