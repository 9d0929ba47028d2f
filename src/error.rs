use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures raised while talking to a chat backend.
///
/// `Parse` and `UpstreamRead` never leave a reader task; they exist so the
/// reader can log them with the same vocabulary as the synchronous errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("upstream connection failed: {0}")]
    Connection(String),
    #[error("credential exchange failed: {0}")]
    Auth(String),
    #[error("malformed upstream frame: {0}")]
    Parse(String),
    #[error("upstream read failed: {0}")]
    UpstreamRead(String),
    #[error("{0}")]
    Validation(String),
    #[error("model not supported: {0}")]
    UnsupportedModel(String),
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        let message = err.to_string();
        match err {
            BackendError::Connection(_)
            | BackendError::UpstreamRead(_)
            | BackendError::Parse(_) => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "upstream_error", message)
                    .with_type("api_error")
            }
            BackendError::Auth(_) => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "auth_failed", message)
                    .with_type("api_error")
            }
            BackendError::Validation(_) => AppError::bad_request("invalid_request", message),
            BackendError::UnsupportedModel(_) => {
                AppError::new(StatusCode::NOT_FOUND, "model_not_supported", message)
                    .with_param("model")
            }
        }
    }
}
