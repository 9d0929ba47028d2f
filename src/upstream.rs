use crate::error::{AppError, BackendError};
use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(status: Option<StatusCode>, message: String) -> Self {
        Self { status, message }
    }
}

impl From<UpstreamCallError> for BackendError {
    /// Rejected credentials (401/403) are reported as auth failures.
    fn from(err: UpstreamCallError) -> Self {
        match err.status {
            Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                BackendError::Auth(err.message)
            }
            _ => BackendError::Connection(err.message),
        }
    }
}

pub fn build_http_client(proxy: Option<&str>) -> Result<reqwest::Client, AppError> {
    let mut builder = reqwest::Client::builder().user_agent("ollm-gateway/0.1");
    // Proxy settings come from the runtime config only.
    match proxy.map(str::trim).filter(|p| !p.is_empty()) {
        Some(proxy) => {
            let proxy = reqwest::Proxy::all(proxy).map_err(|err| {
                AppError::new(StatusCode::BAD_REQUEST, "proxy_invalid", err.to_string())
            })?;
            builder = builder.proxy(proxy);
        }
        None => builder = builder.no_proxy(),
    }
    builder.build().map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "http_client_init_failed",
            err.to_string(),
        )
    })
}

/// Sends `req` and fails on transport errors or any non-success status.
pub async fn send_checked(
    req: reqwest::RequestBuilder,
) -> Result<reqwest::Response, UpstreamCallError> {
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let detail = extract_error_message(&text).unwrap_or(text);
        return Err(UpstreamCallError::new(
            Some(status),
            format!("upstream status {}: {}", status, detail),
        ));
    }
    Ok(resp)
}

pub async fn send_json<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T, UpstreamCallError> {
    let resp = send_checked(req).await?;
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|err| UpstreamCallError::new(Some(status), err.to_string()))?;
    serde_json::from_str(&text).map_err(|err| UpstreamCallError::new(Some(status), err.to_string()))
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let error = value.get("error")?;
    if let Some(s) = error.as_str() {
        return Some(s.to_string());
    }
    error
        .get("message")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::{UpstreamCallError, extract_error_message, join_url};
    use crate::error::BackendError;
    use axum::http::StatusCode;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("https://kimi.moonshot.cn/", "/api/chat"),
            "https://kimi.moonshot.cn/api/chat"
        );
        assert_eq!(join_url("http://127.0.0.1:1", ""), "http://127.0.0.1:1");
    }

    #[test]
    fn extract_error_message_reads_string_and_object_shapes() {
        assert_eq!(
            extract_error_message(r#"{"error":"denied"}"#).as_deref(),
            Some("denied")
        );
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"quota","code":429}}"#).as_deref(),
            Some("quota")
        );
        assert_eq!(extract_error_message("<html>"), None);
    }

    #[test]
    fn rejected_credentials_map_to_auth_errors() {
        let denied = UpstreamCallError::new(Some(StatusCode::FORBIDDEN), "denied".to_string());
        assert!(matches!(BackendError::from(denied), BackendError::Auth(_)));

        let unavailable =
            UpstreamCallError::new(Some(StatusCode::BAD_GATEWAY), "bad gateway".to_string());
        assert!(matches!(BackendError::from(unavailable), BackendError::Connection(_)));

        let refused = UpstreamCallError::new(None, "connection refused".to_string());
        assert!(matches!(BackendError::from(refused), BackendError::Connection(_)));
    }
}
