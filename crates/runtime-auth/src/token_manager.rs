//! OAuth Token Manager (C6).
//!
//! Owns the in-memory view of the single persisted `TokenRecord` and
//! serializes refreshes behind a `tokio::sync::Mutex`, the same way the
//! teacher's connectors serialize a pending-request table: whichever caller
//! takes the lock first does the work, everyone else re-checks the (now
//! fresh) cached token instead of issuing a second provider round-trip.

use crate::token_store::{TokenRecord, TokenStore, TokenStoreError};
use async_trait::async_trait;
use bus_protocol::{ErrorKind, ScopeSet};
use chrono::{DateTime, Utc};
use runtime_core::RetryClassify;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

const DEFAULT_REFRESH_BUFFER_SECS: u64 = 300;

/// Tokens returned by a successful provider refresh.
#[derive(Debug, Clone)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Subject + scope set returned by a successful provider validation call.
#[derive(Debug, Clone)]
pub struct ValidationInfo {
    pub subject: String,
    pub scopes: ScopeSet,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("network error talking to provider: {0}")]
    Network(String),
    #[error("provider denied the request: {0}")]
    Denied(String),
    #[error("provider rejected the request: {0}")]
    Rejected(String),
}

/// The HTTP calls a concrete OAuth provider (e.g. Twitch) must supply.
/// Kept as a trait so the manager is testable without real network access.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens, ProviderError>;
    async fn validate(&self, access_token: &str) -> Result<ValidationInfo, ProviderError>;
}

/// Failure taxonomy per §4.4.
#[derive(Debug, thiserror::Error)]
pub enum TokenManagerError {
    #[error("no token has been loaded or persisted")]
    Missing,
    #[error("token is expired and no refresh token is available")]
    ExpiredNoRefresh,
    #[error("provider denied the refresh request: {0}")]
    RefreshDenied(String),
    #[error("network error talking to the provider: {0}")]
    Network(String),
    #[error("provider rejected the request: {0}")]
    ProviderRejected(String),
    #[error("token store error: {0}")]
    Store(#[from] TokenStoreError),
}

impl RetryClassify for TokenManagerError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            TokenManagerError::Missing | TokenManagerError::ExpiredNoRefresh => ErrorKind::AuthExpired,
            TokenManagerError::RefreshDenied(_) | TokenManagerError::ProviderRejected(_) => ErrorKind::AuthDenied,
            TokenManagerError::Network(_) => ErrorKind::Network,
            TokenManagerError::Store(_) => ErrorKind::Internal,
        }
    }
}

fn classify_provider_error(err: ProviderError) -> TokenManagerError {
    match err {
        ProviderError::Network(m) => TokenManagerError::Network(m),
        ProviderError::Denied(m) => TokenManagerError::RefreshDenied(m),
        ProviderError::Rejected(m) => TokenManagerError::ProviderRejected(m),
    }
}

pub struct TokenManager {
    store: TokenStore,
    provider: Arc<dyn OAuthProvider>,
    refresh_buffer: StdDuration,
    state: RwLock<Option<TokenRecord>>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    #[must_use]
    pub fn new(store: TokenStore, provider: Arc<dyn OAuthProvider>) -> Self {
        Self::with_refresh_buffer(store, provider, StdDuration::from_secs(DEFAULT_REFRESH_BUFFER_SECS))
    }

    #[must_use]
    pub fn with_refresh_buffer(store: TokenStore, provider: Arc<dyn OAuthProvider>, refresh_buffer: StdDuration) -> Self {
        Self { store, provider, refresh_buffer, state: RwLock::new(None), refresh_lock: Mutex::new(()) }
    }

    /// Populate in-memory state from the backing store. Safe to call repeatedly.
    pub async fn load(&self) -> Result<(), TokenManagerError> {
        let record = self.store.load().await?;
        *self.state.write().await = record;
        Ok(())
    }

    fn needs_refresh(&self, record: &TokenRecord) -> bool {
        let buffer = chrono::Duration::from_std(self.refresh_buffer).unwrap_or(chrono::Duration::zero());
        record.expires_at - Utc::now() <= buffer
    }

    /// Return an unexpired access token, refreshing first if within the
    /// refresh buffer of expiry.
    pub async fn get_valid_token(&self) -> Result<String, TokenManagerError> {
        if self.state.read().await.is_none() {
            self.load().await?;
        }
        let needs_refresh = {
            let state = self.state.read().await;
            let record = state.as_ref().ok_or(TokenManagerError::Missing)?;
            self.needs_refresh(record)
        };
        if needs_refresh {
            self.refresh().await?;
        }
        let state = self.state.read().await;
        let record = state.as_ref().ok_or(TokenManagerError::Missing)?;
        Ok(record.access_token.clone())
    }

    /// Consult the provider's validation endpoint directly.
    pub async fn validate(&self, access_token: &str) -> Result<ValidationInfo, TokenManagerError> {
        self.provider.validate(access_token).await.map_err(classify_provider_error)
    }

    /// Refresh the current token. Single-flight: concurrent callers block on
    /// the same `refresh_lock` and, once it's free, re-check whether the
    /// refresh they were waiting on already happened before doing their own.
    pub async fn refresh(&self) -> Result<(), TokenManagerError> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(record) = self.state.read().await.as_ref() {
            if !self.needs_refresh(record) {
                return Ok(());
            }
        }

        let (refresh_token, scopes, subject) = {
            let state = self.state.read().await;
            let record = state.as_ref().ok_or(TokenManagerError::Missing)?;
            let refresh_token = record.refresh_token.clone().ok_or(TokenManagerError::ExpiredNoRefresh)?;
            (refresh_token, record.scopes.clone(), record.subject.clone())
        };

        let refreshed = match self.provider.refresh(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(err) => {
                let mapped = classify_provider_error(err);
                warn!(error = %mapped, "token refresh failed");
                return Err(mapped);
            }
        };

        let record = TokenRecord {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
            expires_at: refreshed.expires_at,
            scopes,
            subject,
        };
        self.store.save(&record).await?;
        *self.state.write().await = Some(record);
        info!("token refreshed");
        Ok(())
    }

    /// Drop the in-memory cache. The persisted record is untouched; the next
    /// `get_valid_token`/`load` call re-reads it from disk.
    pub async fn close(&self) {
        *self.state.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeProvider {
        refresh_calls: AtomicU32,
        fail_refresh: bool,
    }

    impl FakeProvider {
        fn new(fail_refresh: bool) -> Self {
            Self { refresh_calls: AtomicU32::new(0), fail_refresh }
        }
    }

    #[async_trait]
    impl OAuthProvider for FakeProvider {
        async fn refresh(&self, _refresh_token: &str) -> Result<ProviderTokens, ProviderError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            if self.fail_refresh {
                return Err(ProviderError::Denied("invalid_grant".into()));
            }
            Ok(ProviderTokens {
                access_token: "new-access".into(),
                refresh_token: Some("new-refresh".into()),
                expires_at: Utc::now() + Duration::hours(4),
            })
        }

        async fn validate(&self, _access_token: &str) -> Result<ValidationInfo, ProviderError> {
            Ok(ValidationInfo { subject: "u1".into(), scopes: ScopeSet::new() })
        }
    }

    fn store_at(dir: &tempfile::TempDir) -> TokenStore {
        TokenStore::new(dir.path().join("tokens.json"))
    }

    #[tokio::test]
    async fn get_valid_token_without_any_record_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TokenManager::new(store_at(&dir), Arc::new(FakeProvider::new(false)));
        assert!(matches!(manager.get_valid_token().await, Err(TokenManagerError::Missing)));
    }

    #[tokio::test]
    async fn get_valid_token_returns_unexpired_without_refreshing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        store
            .save(&TokenRecord {
                access_token: "still-good".into(),
                refresh_token: Some("r".into()),
                expires_at: Utc::now() + Duration::hours(4),
                scopes: ScopeSet::new(),
                subject: Some("u1".into()),
            })
            .await
            .unwrap();
        let provider = Arc::new(FakeProvider::new(false));
        let manager = TokenManager::new(store, provider.clone());
        let token = manager.get_valid_token().await.unwrap();
        assert_eq!(token, "still-good");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_valid_token_refreshes_within_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        store
            .save(&TokenRecord {
                access_token: "about-to-expire".into(),
                refresh_token: Some("r".into()),
                expires_at: Utc::now() + Duration::seconds(10),
                scopes: ScopeSet::new(),
                subject: Some("u1".into()),
            })
            .await
            .unwrap();
        let provider = Arc::new(FakeProvider::new(false));
        let manager = TokenManager::new(store, provider.clone());
        let token = manager.get_valid_token().await.unwrap();
        assert_eq!(token, "new-access");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_refreshes_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        store
            .save(&TokenRecord {
                access_token: "about-to-expire".into(),
                refresh_token: Some("r".into()),
                expires_at: Utc::now() + Duration::seconds(1),
                scopes: ScopeSet::new(),
                subject: Some("u1".into()),
            })
            .await
            .unwrap();
        let provider = Arc::new(FakeProvider::new(false));
        let manager = Arc::new(TokenManager::new(store, provider.clone()));
        let m1 = manager.clone();
        let m2 = manager.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { m1.refresh().await }),
            tokio::spawn(async move { m2.refresh().await }),
        );
        a.unwrap().unwrap();
        b.unwrap().unwrap();
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_with_no_refresh_token_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        store
            .save(&TokenRecord {
                access_token: "expired".into(),
                refresh_token: None,
                expires_at: Utc::now() - Duration::seconds(1),
                scopes: ScopeSet::new(),
                subject: Some("u1".into()),
            })
            .await
            .unwrap();
        let manager = TokenManager::new(store, Arc::new(FakeProvider::new(false)));
        assert!(matches!(manager.get_valid_token().await, Err(TokenManagerError::ExpiredNoRefresh)));
    }

    #[tokio::test]
    async fn provider_denial_is_surfaced_as_refresh_denied() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        store
            .save(&TokenRecord {
                access_token: "expiring".into(),
                refresh_token: Some("r".into()),
                expires_at: Utc::now() - Duration::seconds(1),
                scopes: ScopeSet::new(),
                subject: Some("u1".into()),
            })
            .await
            .unwrap();
        let manager = TokenManager::new(store, Arc::new(FakeProvider::new(true)));
        assert!(matches!(manager.get_valid_token().await, Err(TokenManagerError::RefreshDenied(_))));
    }
}
