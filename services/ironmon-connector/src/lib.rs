//! IronMON TCP telemetry connector (C11) and its persistence port (C16).

pub mod challenge_store;
pub mod connector;
pub mod framing;
pub mod types;

pub use challenge_store::{AttemptId, AttemptRecord, ChallengeStore, InMemoryChallengeStore};
pub use connector::IronmonConnector;
