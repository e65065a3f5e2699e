//! Per-user platform credentials.
//!
//! Jobs run under the owning user's credentials. [`CachedCredentialProvider`]
//! keeps one token per user and refreshes it from a [`TokenSource`] once it
//! is within the refresh margin of expiry. Refreshes for all users are
//! serialised behind a single async lock, so concurrent dispatches for the
//! same user trigger at most one refresh.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// Default margin before expiry at which tokens are refreshed.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("no credential on file for user {0}")]
    Missing(String),

    #[error("credential refresh failed for user {user_id}: {reason}")]
    RefreshFailed { user_id: String, reason: String },
}

/// A bearer token and its expiry.
#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - margin > now
    }
}

/// Yields a valid token for a user.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn valid_credential(&self, user_id: &str) -> Result<String, CredentialError>;
}

/// Fetches a brand-new token for a user (e.g. an OAuth refresh grant).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, user_id: &str) -> Result<AccessToken, CredentialError>;
}

/// One shared token for every user.
#[derive(Clone)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("configured", &self.token.is_some())
            .finish()
    }
}

impl StaticCredentials {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn valid_credential(&self, user_id: &str) -> Result<String, CredentialError> {
        self.token
            .clone()
            .ok_or_else(|| CredentialError::Missing(user_id.to_string()))
    }
}

/// Caches tokens per user and refreshes them ahead of expiry.
pub struct CachedCredentialProvider<S> {
    source: S,
    refresh_margin: Duration,
    tokens: Mutex<HashMap<String, AccessToken>>,
}

impl<S> std::fmt::Debug for CachedCredentialProvider<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCredentialProvider")
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

impl<S: TokenSource> CachedCredentialProvider<S> {
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source,
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }
}

#[async_trait]
impl<S: TokenSource> CredentialProvider for CachedCredentialProvider<S> {
    async fn valid_credential(&self, user_id: &str) -> Result<String, CredentialError> {
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(user_id) {
            if token.is_fresh(Utc::now(), self.refresh_margin) {
                return Ok(token.value.clone());
            }
        }

        tracing::debug!(user_id = %user_id, "Refreshing platform credential");
        let token = self.source.fetch(user_id).await?;
        let value = token.value.clone();
        tokens.insert(user_id.to_string(), token);
        Ok(value)
    }
}
