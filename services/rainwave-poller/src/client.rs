//! Rainwave HTTP client (§6): form-encoded POST to `<base>/info`, grounded
//! on `HelixClient`'s request-building style in the Twitch connector.

use bus_protocol::ErrorKind;
use runtime_core::RetryClassify;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::RainwaveConfig;

#[derive(Debug, thiserror::Error)]
pub enum RainwaveApiError {
    #[error("network error calling rainwave: {0}")]
    Network(String),
    #[error("rainwave rejected the request as unauthorized")]
    Unauthorized,
    #[error("rainwave returned {status}: {body}")]
    Other { status: u16, body: String },
}

impl RetryClassify for RainwaveApiError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            RainwaveApiError::Network(_) => ErrorKind::Network,
            RainwaveApiError::Unauthorized => ErrorKind::AuthDenied,
            RainwaveApiError::Other { .. } => ErrorKind::ServiceUnavailable,
        }
    }

    fn retry_after_hint(&self) -> Option<Duration> {
        None
    }
}

/// The fields this connector tracks for change detection (§4.10).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoSnapshot {
    pub song: Option<String>,
    pub station: Option<String>,
    pub listening: bool,
}

#[derive(Deserialize)]
struct RawUser {
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Deserialize)]
struct RawSong {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct RawSchedule {
    #[serde(default)]
    songs: Vec<RawSong>,
}

#[derive(Deserialize)]
struct RawInfoResponse {
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    station_name: Option<String>,
    #[serde(default)]
    sched_current: Option<RawSchedule>,
}

/// True if the response's user id (string or integer) equals `configured`.
fn user_id_matches(raw: Option<&Value>, configured: &str) -> bool {
    match raw {
        Some(Value::String(s)) => s == configured,
        Some(Value::Number(n)) => n.to_string() == configured,
        _ => false,
    }
}

#[derive(Clone)]
pub struct RainwaveClient {
    client: reqwest::Client,
    base_url: String,
}

impl RainwaveClient {
    #[must_use]
    pub fn new(client: reqwest::Client, config: &RainwaveConfig) -> Self {
        Self { client, base_url: config.base_url.clone() }
    }

    pub async fn fetch_info(&self, config: &RainwaveConfig) -> Result<InfoSnapshot, RainwaveApiError> {
        let sid = config.station.sid().to_string();
        let key = config.api_key.as_deref().unwrap_or_default();
        let user_id = config.user_id.as_deref().unwrap_or_default();

        let response = self
            .client
            .post(format!("{}/info", self.base_url))
            .form(&[("sid", sid.as_str()), ("key", key), ("user_id", user_id)])
            .send()
            .await
            .map_err(|e| RainwaveApiError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RainwaveApiError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RainwaveApiError::Other { status: status.as_u16(), body });
        }

        let parsed: RawInfoResponse =
            response.json().await.map_err(|e| RainwaveApiError::Other { status: status.as_u16(), body: e.to_string() })?;

        let user_id_raw = parsed.user.as_ref().and_then(|u| u.id.as_ref());
        let listening = user_id_matches(user_id_raw, user_id);
        let song = parsed.sched_current.as_ref().and_then(|s| s.songs.first()).and_then(|s| s.title.clone());

        Ok(InfoSnapshot { song, station: parsed.station_name, listening })
    }
}
