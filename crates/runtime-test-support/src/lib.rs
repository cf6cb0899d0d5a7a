//! Test doubles shared by every connector's integration tests: a mock
//! WebSocket endpoint (Twitch EventSub, OBS v5) and a mock HTTP endpoint
//! (Twitch subscription API, Rainwave polling).

pub mod mock_http_server;
pub mod mock_ws_server;

pub use mock_http_server::{MockHttpServer, RecordedRequest};
pub use mock_ws_server::MockWsServer;
