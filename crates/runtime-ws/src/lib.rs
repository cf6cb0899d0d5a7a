//! WebSocket Transport (C7): a single-connection client transport shared by
//! the Twitch EventSub and OBS connectors.

pub mod transport;

pub use transport::{DisconnectReason, TransportError, TransportEvent, WebSocketTransport};
pub use tokio_tungstenite::tungstenite::protocol::Message;
