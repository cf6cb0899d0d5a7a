//! Config & Bootstrap (C14).
//!
//! Grounded on the forwarder's `Raw*` + explicit-defaulting pattern, except
//! the primary source is environment variables (§6); an optional TOML file
//! (`RUNTIME_CONFIG_PATH`) overlays tunables that have no dedicated env var.
//! `load()` never panics. A missing connector credential only disables that
//! connector; a present-but-unparseable config file is the one hard error.

use obs_connector::ObsConfig;
use rainwave_poller::{RainwaveConfig, Station};
use serde::Deserialize;
use std::path::PathBuf;
use twitch_connector::TwitchConfig;

pub struct RuntimeConfig {
    /// `None` when Twitch credentials are absent; the connector is then
    /// never constructed and the rest of the runtime proceeds without it.
    pub twitch: Option<TwitchConfig>,
    pub obs: ObsConfig,
    pub rainwave: RainwaveConfig,
    pub ironmon_bind: String,
    pub status_bind: String,
    pub token_store_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("config file '{path}' could not be parsed: {source}")]
    ConfigFile { path: String, source: String },
}

#[derive(Debug, Deserialize, Default)]
struct RawOverlay {
    obs: Option<RawObsOverlay>,
    rainwave: Option<RawRainwaveOverlay>,
}

#[derive(Debug, Deserialize)]
struct RawObsOverlay {
    event_subscriptions: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawRainwaveOverlay {
    base_url: Option<String>,
    station: Option<String>,
    poll_interval_secs: Option<u64>,
}

fn parse_station(name: &str) -> Option<Station> {
    match name {
        "game" => Some(Station::Game),
        "ocremix" => Some(Station::OcRemix),
        "covers" => Some(Station::Covers),
        "chiptunes" => Some(Station::Chiptunes),
        "all" => Some(Station::All),
        _ => None,
    }
}

fn load_overlay() -> Result<RawOverlay, BootstrapError> {
    let Ok(path) = std::env::var("RUNTIME_CONFIG_PATH") else {
        return Ok(RawOverlay::default());
    };
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path, error = %e, "RUNTIME_CONFIG_PATH set but unreadable, proceeding without overlay");
            return Ok(RawOverlay::default());
        }
    };
    toml::from_str(&text).map_err(|e| BootstrapError::ConfigFile { path, source: e.to_string() })
}

/// Load the runtime configuration from the environment, layering an
/// optional TOML overlay on top. Never panics.
pub fn load() -> Result<RuntimeConfig, BootstrapError> {
    let overlay = load_overlay()?;

    let twitch = match (
        std::env::var("TWITCH_CLIENT_ID"),
        std::env::var("TWITCH_CLIENT_SECRET"),
        std::env::var("TWITCH_USER_ID"),
    ) {
        (Ok(client_id), Ok(client_secret), Ok(user_id)) => Some(TwitchConfig::new(client_id, client_secret, user_id)),
        _ => {
            tracing::warn!("twitch credentials incomplete, twitch connector starts disabled");
            None
        }
    };

    let mut obs = ObsConfig::new(std::env::var("OBS_WEBSOCKET_URL").unwrap_or_else(|_| ObsConfig::default_url()));
    if let Some(sub) = overlay.obs.as_ref().and_then(|o| o.event_subscriptions) {
        obs.event_subscriptions = sub;
    }

    let api_key = std::env::var("RAINWAVE_API_KEY").ok();
    let user_id = std::env::var("RAINWAVE_USER_ID").ok();
    if api_key.is_none() || user_id.is_none() {
        tracing::warn!("rainwave credentials incomplete, rainwave poller starts disabled");
    }
    let mut rainwave = RainwaveConfig::new(api_key, user_id);
    if let Some(rw) = overlay.rainwave.as_ref() {
        if let Some(base_url) = rw.base_url.clone() {
            rainwave.base_url = base_url;
        }
        if let Some(station) = rw.station.as_deref().and_then(parse_station) {
            rainwave.station = station;
        }
        if let Some(secs) = rw.poll_interval_secs {
            rainwave.poll_interval = std::time::Duration::from_secs(secs);
        }
    }

    let ironmon_bind = std::env::var("IRONMON_BIND").unwrap_or_else(|_| "0.0.0.0:9001".to_owned());
    let status_bind = std::env::var("RUNTIME_STATUS_BIND").unwrap_or_else(|_| "127.0.0.1:7070".to_owned());
    let token_store_path = std::env::var("RUNTIME_TOKEN_STORE_PATH").unwrap_or_else(|_| "./data/tokens.json".to_owned());

    Ok(RuntimeConfig {
        twitch,
        obs,
        rainwave,
        ironmon_bind,
        status_bind,
        token_store_path: PathBuf::from(token_store_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "TWITCH_CLIENT_ID",
            "TWITCH_CLIENT_SECRET",
            "TWITCH_USER_ID",
            "RAINWAVE_API_KEY",
            "RAINWAVE_USER_ID",
            "OBS_WEBSOCKET_URL",
            "RUNTIME_CONFIG_PATH",
            "IRONMON_BIND",
            "RUNTIME_STATUS_BIND",
            "RUNTIME_TOKEN_STORE_PATH",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn missing_twitch_credentials_degrade_to_disabled_not_a_bootstrap_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();

        let config = load().expect("missing connector credentials must not fail bootstrap");
        assert!(config.twitch.is_none());
        assert!(!config.rainwave.should_poll());
    }

    #[test]
    fn full_credentials_populate_every_connector() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var("TWITCH_CLIENT_ID", "cid");
            std::env::set_var("TWITCH_CLIENT_SECRET", "secret");
            std::env::set_var("TWITCH_USER_ID", "123");
            std::env::set_var("RAINWAVE_API_KEY", "key");
            std::env::set_var("RAINWAVE_USER_ID", "42");
        }

        let config = load().unwrap();
        assert!(config.twitch.is_some());
        assert!(config.rainwave.should_poll());
        clear_all();
    }

    #[test]
    fn malformed_config_file_is_a_hard_bootstrap_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.toml");
        std::fs::write(&path, "this is not valid toml [[[").unwrap();
        unsafe { std::env::set_var("RUNTIME_CONFIG_PATH", &path) };

        let result = load();
        assert!(matches!(result, Err(BootstrapError::ConfigFile { .. })));
        clear_all();
    }

    #[test]
    fn toml_overlay_sets_rainwave_tunables_without_a_dedicated_env_var() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.toml");
        std::fs::write(&path, "[rainwave]\nstation = \"ocremix\"\npoll_interval_secs = 30\n").unwrap();
        unsafe { std::env::set_var("RUNTIME_CONFIG_PATH", &path) };

        let config = load().unwrap();
        assert_eq!(config.rainwave.station, Station::OcRemix);
        assert_eq!(config.rainwave.poll_interval, std::time::Duration::from_secs(30));
        clear_all();
    }
}
