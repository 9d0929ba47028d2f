use crate::cache::TtlCache;
use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kimi access tokens are treated as valid for five minutes.
pub const DEFAULT_CREDENTIAL_TTL_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

/// Network exchange of a long-lived refresh credential for a fresh pair.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<Credential, BackendError>;
}

#[derive(Clone)]
pub struct CredentialManager {
    cache: TtlCache<Credential>,
    exchange: Arc<dyn TokenExchange>,
    ttl_secs: i64,
}

impl CredentialManager {
    pub fn new(cache: TtlCache<Credential>, exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            cache,
            exchange,
            ttl_secs: DEFAULT_CREDENTIAL_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Returns the cached credential for `refresh_token`, refreshing on a miss.
    ///
    /// No lock is held across the exchange, so concurrent misses for the same
    /// token may each refresh; the last writer wins.
    pub async fn obtain(&self, refresh_token: &str) -> Result<Credential, BackendError> {
        if refresh_token.trim().is_empty() {
            return Err(BackendError::Auth("missing refresh token".to_string()));
        }
        if let Some(credential) = self.cache.get(refresh_token).await {
            return Ok(credential);
        }

        tracing::debug!("refreshing backend credential");
        metrics::counter!("ollm_credential_refresh_total").increment(1);
        let credential = self.exchange.exchange(refresh_token).await?;
        self.cache
            .set(refresh_token, credential.clone(), self.ttl_secs)
            .await;
        Ok(credential)
    }
}
