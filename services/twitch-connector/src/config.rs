//! Connector configuration, owned by bootstrap (C14) and passed in whole.

/// Everything the Twitch EventSub connector needs to run. Constructed by the
/// runtime's config loader; absent credentials are the loader's problem, not
/// this connector's — by the time this reaches `TwitchConnector::new` it is
/// either fully populated or the connector is never constructed.
#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    pub user_id: String,
    pub eventsub_url: String,
    pub helix_base_url: String,
    pub oauth_base_url: String,
}

impl TwitchConfig {
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            user_id: user_id.into(),
            eventsub_url: "wss://eventsub.wss.twitch.tv/ws".to_owned(),
            helix_base_url: "https://api.twitch.tv/helix".to_owned(),
            oauth_base_url: "https://id.twitch.tv/oauth2".to_owned(),
        }
    }
}
