//! Twitch-specific HTTP calls: the OAuth provider (C6) and the Helix
//! subscription API used by the subscription coordinator (§4.7).

use async_trait::async_trait;
use bus_protocol::{Condition, ErrorKind};
use chrono::{DateTime, Utc};
use runtime_auth::{OAuthProvider, ProviderError, ProviderTokens, ValidationInfo};
use runtime_core::RetryClassify;
use std::time::Duration;

use crate::config::TwitchConfig;

pub struct TwitchOAuthProvider {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    oauth_base_url: String,
}

impl TwitchOAuthProvider {
    #[must_use]
    pub fn new(client: reqwest::Client, config: &TwitchConfig) -> Self {
        Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            oauth_base_url: config.oauth_base_url.clone(),
        }
    }
}

#[async_trait]
impl OAuthProvider for TwitchOAuthProvider {
    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens, ProviderError> {
        let response = self
            .client
            .post(format!("{}/token", self.oauth_base_url))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Denied(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!("{status}: {body}")));
        }

        #[derive(serde::Deserialize)]
        struct RefreshResponse {
            access_token: String,
            refresh_token: Option<String>,
            expires_in: i64,
        }
        let parsed: RefreshResponse = response.json().await.map_err(|e| ProviderError::Rejected(e.to_string()))?;
        Ok(ProviderTokens {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in),
        })
    }

    async fn validate(&self, access_token: &str) -> Result<ValidationInfo, ProviderError> {
        let response = self
            .client
            .get(format!("{}/validate", self.oauth_base_url))
            .header("Authorization", format!("OAuth {access_token}"))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Denied("token is no longer valid".to_owned()));
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(body));
        }

        #[derive(serde::Deserialize)]
        struct ValidateResponse {
            user_id: String,
            scopes: Vec<String>,
        }
        let parsed: ValidateResponse = response.json().await.map_err(|e| ProviderError::Rejected(e.to_string()))?;
        Ok(ValidationInfo { subject: parsed.user_id, scopes: parsed.scopes.into_iter().collect() })
    }
}

/// Errors from the Helix EventSub subscription endpoints, classified per §7.
#[derive(Debug, thiserror::Error)]
pub enum TwitchApiError {
    #[error("network error calling helix: {0}")]
    Network(String),
    #[error("helix rejected the request as unauthorized")]
    Unauthorized,
    #[error("helix rejected the request as forbidden")]
    Forbidden,
    #[error("subscription already exists")]
    Duplicate,
    #[error("rate limited by helix, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("helix returned {status}: {body}")]
    Other { status: u16, body: String },
}

impl RetryClassify for TwitchApiError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            TwitchApiError::Network(_) => ErrorKind::Network,
            TwitchApiError::Unauthorized => ErrorKind::AuthExpired,
            TwitchApiError::Forbidden => ErrorKind::AuthDenied,
            TwitchApiError::Duplicate => ErrorKind::Duplicate,
            TwitchApiError::RateLimited { .. } => ErrorKind::RateLimited,
            TwitchApiError::Other { .. } => ErrorKind::ServiceUnavailable,
        }
    }

    fn retry_after_hint(&self) -> Option<Duration> {
        match self {
            TwitchApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A created subscription, as returned by Helix.
#[derive(Debug, Clone)]
pub struct CreatedSubscription {
    pub id: String,
    pub cost: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HelixClient {
    client: reqwest::Client,
    client_id: String,
    base_url: String,
}

impl HelixClient {
    #[must_use]
    pub fn new(client: reqwest::Client, config: &TwitchConfig) -> Self {
        Self { client, client_id: config.client_id.clone(), base_url: config.helix_base_url.clone() }
    }

    pub async fn create_subscription(
        &self,
        token: &str,
        event_type: &str,
        condition: &Condition,
        session_id: &str,
    ) -> Result<CreatedSubscription, TwitchApiError> {
        let body = serde_json::json!({
            "type": event_type,
            "version": "1",
            "condition": condition,
            "transport": { "method": "websocket", "session_id": session_id },
        });

        let response = self
            .client
            .post(format!("{}/eventsub/subscriptions", self.base_url))
            .header("Authorization", format!("Bearer {token}"))
            .header("Client-Id", &self.client_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| TwitchApiError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(TwitchApiError::Duplicate);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TwitchApiError::Unauthorized);
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(TwitchApiError::Forbidden);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            // `Retry-After` is delta-seconds; `ratelimit-reset` (when Twitch sends it)
            // is a Unix epoch second and is not a wait duration.
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(TwitchApiError::RateLimited { retry_after });
        }
        if status != reqwest::StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            return Err(TwitchApiError::Other { status: status.as_u16(), body });
        }

        #[derive(serde::Deserialize)]
        struct CreateResponse {
            data: Vec<CreateResponseEntry>,
        }
        #[derive(serde::Deserialize)]
        struct CreateResponseEntry {
            id: String,
            cost: u32,
        }
        let parsed: CreateResponse =
            response.json().await.map_err(|e| TwitchApiError::Other { status: 202, body: e.to_string() })?;
        let entry = parsed.data.into_iter().next().ok_or(TwitchApiError::Other { status: 202, body: "empty data[]".to_owned() })?;
        Ok(CreatedSubscription { id: entry.id, cost: entry.cost, created_at: Utc::now() })
    }

    pub async fn delete_subscription(&self, token: &str, id: &str) -> Result<(), TwitchApiError> {
        let response = self
            .client
            .delete(format!("{}/eventsub/subscriptions", self.base_url))
            .query(&[("id", id)])
            .header("Authorization", format!("Bearer {token}"))
            .header("Client-Id", &self.client_id)
            .send()
            .await
            .map_err(|e| TwitchApiError::Network(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::NO_CONTENT | reqwest::StatusCode::NOT_FOUND => Ok(()),
            reqwest::StatusCode::UNAUTHORIZED => Err(TwitchApiError::Unauthorized),
            reqwest::StatusCode::TOO_MANY_REQUESTS => Err(TwitchApiError::RateLimited { retry_after: None }),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TwitchApiError::Other { status: status.as_u16(), body })
            }
        }
    }
}
