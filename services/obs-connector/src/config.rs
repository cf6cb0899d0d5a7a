//! OBS connector configuration.

/// Bit-OR event subscription categories (§6): general, config, scenes,
/// inputs, transitions, filters, outputs, scene items, media inputs,
/// vendors, UI. The connector asks for all of them.
pub const EVENT_SUBSCRIPTION_ALL: u32 = 1 | 2 | 4 | 8 | 16 | 32 | 64 | 128 | 256 | 512 | 1024;

#[derive(Debug, Clone)]
pub struct ObsConfig {
    pub url: String,
    pub password: Option<String>,
    pub event_subscriptions: u32,
}

impl ObsConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), password: None, event_subscriptions: EVENT_SUBSCRIPTION_ALL }
    }

    #[must_use]
    pub fn default_url() -> String {
        "ws://localhost:4455".to_owned()
    }
}
