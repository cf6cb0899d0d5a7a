//! OBS WebSocket v5 connector (C10): handshake, pending-request tracking,
//! periodic stats polling, and a cached scene/output projection.

pub mod config;
pub mod connector;
pub mod wire;

pub use config::ObsConfig;
pub use connector::{ObsConnector, ObsProjection};
