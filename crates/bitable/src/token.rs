//! Tenant access token acquisition and caching.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::config::BitableConfig;
use crate::error::{BitableError, Operation};
use crate::types::{TenantTokenRequest, TenantTokenResponse};

/// A short-lived bearer credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    /// Whether the credential is still usable `margin` from now.
    fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(margin)
            .is_some_and(|deadline| self.expires_at > deadline)
    }
}

/// Outcome of the most recent credential exchange.
#[derive(Debug, Default)]
struct LastExchange {
    generation: u64,
    failure: Option<Arc<BitableError>>,
}

/// Acquires and caches the tenant access token.
///
/// One store belongs to one client instance and lives as long as it does;
/// nothing is persisted, so a new process always exchanges credentials again.
/// Refreshes are single-flight: callers that find the cache stale while a
/// refresh is running wait for it and share its result, including a failure.
/// Exchange failures surface as [`BitableError::RefreshFailed`] wrapping the
/// underlying error.
pub struct TokenStore {
    client: Client,
    endpoint: String,
    app_id: String,
    app_secret: String,
    margin: Duration,
    cached: RwLock<Option<Credential>>,
    last: RwLock<LastExchange>,
    refresh: Mutex<()>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("endpoint", &self.endpoint)
            .field("app_id", &self.app_id)
            .field("margin", &self.margin)
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    pub fn new(config: &BitableConfig, client: Client) -> Self {
        Self {
            client,
            endpoint: format!("{}/auth/v3/tenant_access_token/internal", config.api_base()),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            margin: config.refresh_margin(),
            cached: RwLock::new(None),
            last: RwLock::new(LastExchange::default()),
            refresh: Mutex::new(()),
        }
    }

    /// Return the cached credential, refreshing it first when it expires
    /// within the safety margin.
    pub async fn token(&self) -> Result<Credential, BitableError> {
        if let Some(credential) = self.fresh_cached() {
            return Ok(credential);
        }

        let observed = self.last.read().generation;
        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(credential) = self.fresh_cached() {
            return Ok(credential);
        }
        self.failure_since(observed)?;
        self.refresh_locked().await
    }

    /// Replace a credential the API rejected.
    ///
    /// If another caller already replaced `rejected`, the newer cached
    /// credential is returned without a second exchange.
    pub async fn refresh_rejected(&self, rejected: &Credential) -> Result<Credential, BitableError> {
        let observed = self.last.read().generation;
        let _guard = self.refresh.lock().await;
        if let Some(current) = self.cached.read().clone()
            && current.token != rejected.token
            && current.expires_at > Utc::now()
        {
            return Ok(current);
        }
        self.failure_since(observed)?;
        self.refresh_locked().await
    }

    /// Drop the cached credential.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    fn fresh_cached(&self) -> Option<Credential> {
        self.cached
            .read()
            .as_ref()
            .filter(|c| c.is_fresh(Utc::now(), self.margin))
            .cloned()
    }

    /// The failure of an exchange that completed after `observed`, so a
    /// caller that queued behind it gets the same error.
    fn failure_since(&self, observed: u64) -> Result<(), BitableError> {
        let last = self.last.read();
        match &last.failure {
            Some(failure) if last.generation != observed => {
                Err(BitableError::RefreshFailed(Arc::clone(failure)))
            }
            _ => Ok(()),
        }
    }

    /// Exchange credentials and store the result. Caller holds `refresh`.
    async fn refresh_locked(&self) -> Result<Credential, BitableError> {
        let result = self.exchange().await;
        let mut last = self.last.write();
        last.generation += 1;
        match result {
            Ok(credential) => {
                last.failure = None;
                *self.cached.write() = Some(credential.clone());
                Ok(credential)
            }
            Err(e) => {
                let failure = Arc::new(e);
                last.failure = Some(Arc::clone(&failure));
                *self.cached.write() = None;
                Err(BitableError::RefreshFailed(failure))
            }
        }
    }

    #[instrument(skip(self), fields(app_id = %self.app_id))]
    async fn exchange(&self) -> Result<Credential, BitableError> {
        let operation = Operation::TokenExchange;
        debug!("exchanging app credentials for tenant access token");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&TenantTokenRequest {
                app_id: &self.app_id,
                app_secret: &self.app_secret,
            })
            .send()
            .await
            .map_err(|e| BitableError::from_reqwest(operation, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BitableError::from_reqwest(operation, e))?;

        let parsed: TenantTokenResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(BitableError::Auth {
                    code: None,
                    message: format!("HTTP {status}: {body}"),
                });
            }
            Err(e) => {
                return Err(BitableError::Deserialization {
                    operation,
                    message: e.to_string(),
                });
            }
        };

        if parsed.code != 0 || !status.is_success() {
            return Err(BitableError::Auth {
                code: Some(parsed.code),
                message: parsed.msg,
            });
        }

        let token = parsed
            .tenant_access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BitableError::Auth {
                code: Some(parsed.code),
                message: "token exchange returned no tenant_access_token".into(),
            })?;

        let expire = parsed.expire.unwrap_or(0);
        if expire <= 0 {
            return Err(BitableError::Auth {
                code: Some(parsed.code),
                message: format!("token exchange returned non-positive expiry {expire}"),
            });
        }

        let expires_at = Utc::now() + chrono::Duration::seconds(expire);
        debug!(%expires_at, "tenant access token acquired");

        Ok(Credential { token, expires_at })
    }
}
