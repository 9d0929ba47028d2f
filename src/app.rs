use crate::backends::gemini::{self, GeminiBackend};
use crate::backends::kimi::{self, KimiBackend, KimiTokenExchange};
use crate::backends::sydney::{self, SydneyBackend};
use crate::backends::{ImageBackend, StreamingChatBackend};
use crate::cache::TtlCache;
use crate::credentials::{Credential, CredentialManager};
use crate::dispatch::ModelDispatcher;
use crate::error::{AppError, AppResult};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Image uploads travel as multipart bodies.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;
const CORS_MAX_AGE: Duration = Duration::from_secs(86400);

#[derive(Clone)]
pub struct Backends {
    pub kimi: Arc<dyn StreamingChatBackend>,
    pub gemini: Arc<dyn StreamingChatBackend>,
    pub sydney: Arc<dyn StreamingChatBackend>,
    pub images: Arc<dyn ImageBackend>,
}

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub metrics: PrometheusHandle,
    pub credential_cache: TtlCache<Credential>,
    pub backends: Backends,
    pub dispatcher: Arc<ModelDispatcher>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub auth_token: Option<String>,
    pub allowed_origins: Vec<String>,
    pub proxy: Option<String>,
    pub kimi_refresh_token: Option<String>,
    pub gemini_api_key: Option<String>,
    /// Rendered `Cookie` header used when a request carries none.
    pub default_cookies: String,
    pub kimi_base_url: String,
    pub gemini_base_url: String,
    pub bing_base_url: String,
    pub sydney_ws_url: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen = var("OLLM_LISTEN").unwrap_or_else(|| {
            let port = var("PORT").unwrap_or_else(|| "8080".to_string());
            format!("0.0.0.0:{}", port.trim())
        });
        let metrics_path = var("OLLM_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let allowed_origins = var("ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec!["*".to_string()]);
        let cookie_file = var("OLLM_COOKIES_FILE").unwrap_or_else(|| "cookies.json".to_string());
        let default_cookies = crate::config::resolve_default_cookies(
            var("DEFAULT_COOKIES").as_deref(),
            &PathBuf::from(cookie_file),
        );

        Self {
            listen,
            metrics_path,
            auth_token: var("AUTH_TOKEN").map(|v| v.trim().to_string()),
            allowed_origins,
            proxy: var("HTTPS_PROXY").or_else(|| var("HTTP_PROXY")),
            kimi_refresh_token: var("KIMI_REFRESH_TOKEN"),
            gemini_api_key: var("GEMINI_API_KEY"),
            default_cookies,
            kimi_base_url: var("KIMI_BASE_URL")
                .unwrap_or_else(|| kimi::DEFAULT_BASE_URL.to_string()),
            gemini_base_url: var("GEMINI_BASE_URL")
                .unwrap_or_else(|| gemini::DEFAULT_BASE_URL.to_string()),
            bing_base_url: var("BING_BASE_URL")
                .unwrap_or_else(|| sydney::DEFAULT_BING_BASE_URL.to_string()),
            sydney_ws_url: var("SYDNEY_WS_URL")
                .unwrap_or_else(|| sydney::DEFAULT_CHATHUB_URL.to_string()),
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = crate::upstream::build_http_client(runtime.proxy.as_deref())?;
    let credential_cache = TtlCache::new();

    let exchange = Arc::new(KimiTokenExchange::new(
        http.clone(),
        runtime.kimi_base_url.clone(),
    ));
    let kimi = Arc::new(KimiBackend::new(
        http.clone(),
        runtime.kimi_base_url.clone(),
        CredentialManager::new(credential_cache.clone(), exchange),
        runtime.kimi_refresh_token.clone(),
    ));
    let gemini = Arc::new(GeminiBackend::new(
        http.clone(),
        runtime.gemini_base_url.clone(),
        runtime.gemini_api_key.clone(),
    ));
    let sydney = Arc::new(SydneyBackend::new(
        http,
        runtime.bing_base_url.clone(),
        runtime.sydney_ws_url.clone(),
        runtime.default_cookies.clone(),
    ));

    if runtime.kimi_refresh_token.is_none() {
        tracing::info!("KIMI_REFRESH_TOKEN not set; kimi requests must carry refreshToken");
    }
    if runtime.gemini_api_key.is_none() {
        tracing::info!("GEMINI_API_KEY not set; gemini requests must carry apiKey");
    }

    let backends = Backends {
        kimi,
        gemini,
        sydney: sydney.clone(),
        images: sydney,
    };
    state_with_backends(runtime, credential_cache, backends)
}

/// Assembles state around already constructed backends.
pub fn state_with_backends(
    runtime: RuntimeConfig,
    credential_cache: TtlCache<Credential>,
    backends: Backends,
) -> AppResult<AppState> {
    let metrics = init_metrics()?;
    let dispatcher = ModelDispatcher::standard(
        backends.kimi.clone(),
        backends.gemini.clone(),
        backends.sydney.clone(),
    );
    Ok(AppState {
        runtime: Arc::new(runtime),
        metrics,
        credential_cache,
        backends,
        dispatcher: Arc::new(dispatcher),
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect::<Vec<_>>(),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(CORS_MAX_AGE)
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let cors = cors_layer(&state.runtime.allowed_origins);
    let api_router = build_api_router().route_layer(middleware::from_fn_with_state(
        state.clone(),
        crate::auth::require_bearer,
    ));
    Router::<AppState>::new()
        .route("/", get(crate::handlers::health))
        .route(&metrics_path, get(crate::handlers::metrics))
        .merge(api_router)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(
            "/v1/kimi/chat/completions",
            post(crate::handlers::kimi_chat_completions),
        )
        .route(
            "/v1/gemini/chat/completions",
            post(crate::handlers::gemini_chat_completions),
        )
        .route(
            "/v1/images/generations",
            post(crate::handlers::create_image_generation),
        )
        .route("/kimi/chat/stream", post(crate::handlers::kimi_stream))
        .route("/gemini/chat/stream", post(crate::handlers::gemini_stream))
        .route("/chat/stream", post(crate::handlers::sydney_stream))
        .route("/image/upload", post(crate::handlers::upload_image))
        .route("/image/create", post(crate::handlers::create_image))
}

#[cfg(test)]
mod tests {
    use super::RuntimeConfig;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset_or_blank() {
        let runtime = RuntimeConfig::from_lookup(lookup(&[
            ("AUTH_TOKEN", "   "),
            ("OLLM_COOKIES_FILE", "/nonexistent/cookies.json"),
        ]));
        assert_eq!(runtime.listen, "0.0.0.0:8080");
        assert_eq!(runtime.metrics_path, "/metrics");
        assert_eq!(runtime.auth_token, None);
        assert_eq!(runtime.allowed_origins, vec!["*".to_string()]);
        assert_eq!(runtime.kimi_base_url, "https://kimi.moonshot.cn");
        assert_eq!(runtime.default_cookies, "");
        assert_eq!(runtime.kimi_refresh_token, None);
    }

    #[test]
    fn port_origins_proxy_and_cookies_are_read() {
        let runtime = RuntimeConfig::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("HTTP_PROXY", "http://proxy:3128"),
            ("DEFAULT_COOKIES", "_U=abc; MUID=1"),
            ("KIMI_REFRESH_TOKEN", "rt"),
        ]));
        assert_eq!(runtime.listen, "0.0.0.0:9000");
        assert_eq!(
            runtime.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(runtime.proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(runtime.default_cookies, "MUID=1; _U=abc");
        assert_eq!(runtime.kimi_refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn explicit_listen_overrides_port() {
        let runtime = RuntimeConfig::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("OLLM_LISTEN", "127.0.0.1:7000"),
        ]));
        assert_eq!(runtime.listen, "127.0.0.1:7000");
    }
}
