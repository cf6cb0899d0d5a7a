//! Twitch EventSub connector (C9): session handshake, subscription
//! coordination, and notification validation/publishing.

pub mod config;
pub mod connector;
pub mod provider;
pub mod subscriptions;
pub mod wire;

pub use config::TwitchConfig;
pub use connector::TwitchConnector;
pub use provider::{HelixClient, TwitchApiError, TwitchOAuthProvider};
