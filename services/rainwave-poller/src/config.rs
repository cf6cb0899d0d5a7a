use std::time::Duration;

/// Station identifiers per the Rainwave HTTP API (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Station {
    Game,
    OcRemix,
    Covers,
    Chiptunes,
    All,
}

impl Station {
    #[must_use]
    pub fn sid(self) -> u8 {
        match self {
            Station::Game => 1,
            Station::OcRemix => 2,
            Station::Covers => 3,
            Station::Chiptunes => 4,
            Station::All => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RainwaveConfig {
    pub base_url: String,
    pub station: Station,
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub poll_interval: Duration,
    pub enabled: bool,
}

impl RainwaveConfig {
    #[must_use]
    pub fn new(api_key: Option<String>, user_id: Option<String>) -> Self {
        Self {
            base_url: Self::default_base_url(),
            station: Station::Game,
            api_key,
            user_id,
            poll_interval: Duration::from_secs(10),
            enabled: true,
        }
    }

    #[must_use]
    pub fn default_base_url() -> String {
        "https://rainwave.cc/api4".to_owned()
    }

    /// Polling only proceeds when both enabled and credentialed; a missing
    /// key or user id degrades this connector to disabled rather than
    /// failing the whole process (§4.12).
    #[must_use]
    pub fn should_poll(&self) -> bool {
        self.enabled && self.api_key.is_some() && self.user_id.is_some()
    }
}
