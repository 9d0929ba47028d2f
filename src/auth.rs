use crate::app::AppState;
use crate::error::AppError;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Extracts the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Static bearer check; a no-op when no token is configured.
pub async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.runtime.auth_token.as_deref() else {
        return next.run(req).await;
    };
    if bearer_token(req.headers()) == Some(expected) {
        return next.run(req).await;
    }
    tracing::debug!(path = %req.uri().path(), "rejected request without valid bearer token");
    AppError::new(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "missing or invalid bearer token",
    )
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::bearer_token;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        assert_eq!(bearer_token(&headers), Some("secret"));
        headers.insert("authorization", HeaderValue::from_static("Basic secret"));
        assert_eq!(bearer_token(&headers), None);
    }
}
