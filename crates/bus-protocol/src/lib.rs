//! Shared wire/event types for the service integration runtime.
//!
//! Mirrors the frozen `rt-protocol` crate from the timing system this
//! workspace grew out of: plain data, `Serialize`/`Deserialize` everywhere,
//! no behavior. Connectors, the topic bus, and the status HTTP surface all
//! depend on this crate so that the published shapes are frozen in one place.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Stable error-kind vocabulary. Connector-local error enums map into this
/// set so that retry policy and the status surface can reason about errors
/// without depending on each connector's concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    Network,
    Tls,
    Protocol,
    AuthExpired,
    AuthDenied,
    ScopeMissing,
    RateLimited,
    Duplicate,
    NotFound,
    LimitExceeded,
    Timeout,
    ValidationFailed,
    CircuitOpen,
    ServiceUnavailable,
    KeepaliveTimeout,
    Internal,
}

impl ErrorKind {
    /// Whether the retry/circuit-breaker layer (C4) is expected to recover
    /// this kind of failure on its own, per §7.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::Protocol
        )
    }
}

// ---------------------------------------------------------------------------
// Connection / health state (§3)
// ---------------------------------------------------------------------------

/// Connection state machine shared by every connector.
///
/// Transitions are the only way `session_id` may change; see
/// `service-host`'s state cell for the enforcement point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Upgrading,
    Connected,
    Ready,
    Reconnecting,
    KeepaliveTimeout,
    Error,
}

impl ConnectionState {
    /// True for the states in which a `session_id` is expected to be present.
    #[must_use]
    pub fn implies_session(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Ready)
    }
}

/// Health status bucket (§3 Health Record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
}

/// Running health counters for a connector.
///
/// `down_threshold` defaults to 5 consecutive errors per §3; connectors may
/// override it at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub total_errors: u64,
    pub consecutive_errors: u64,
    pub last_success: Option<chrono::DateTime<chrono::Utc>>,
    pub last_attempt: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip)]
    down_threshold: u64,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Ok,
            total_errors: 0,
            consecutive_errors: 0,
            last_success: None,
            last_attempt: None,
            down_threshold: 5,
        }
    }
}

impl HealthRecord {
    #[must_use]
    pub fn with_down_threshold(down_threshold: u64) -> Self {
        Self {
            down_threshold: down_threshold.max(1),
            ..Self::default()
        }
    }

    pub fn record_attempt(&mut self, now: chrono::DateTime<chrono::Utc>) {
        self.last_attempt = Some(now);
    }

    /// Reset consecutive errors to zero and raise status to `ok`.
    pub fn record_success(&mut self, now: chrono::DateTime<chrono::Utc>) {
        self.last_success = Some(now);
        self.last_attempt = Some(now);
        self.consecutive_errors = 0;
        self.status = HealthStatus::Ok;
    }

    /// Bump error counters and recompute status: degraded at >=1 consecutive
    /// error, down at >= `down_threshold`.
    pub fn record_error(&mut self, now: chrono::DateTime<chrono::Utc>) {
        self.last_attempt = Some(now);
        self.total_errors += 1;
        self.consecutive_errors += 1;
        self.status = if self.consecutive_errors >= self.down_threshold {
            HealthStatus::Down
        } else {
            HealthStatus::Degraded
        };
    }
}

/// Snapshot returned by a connector's `get_status`/`get_health` (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorStatus {
    pub connector: String,
    pub state: ConnectionState,
    pub session_id: Option<String>,
    pub health: HealthRecord,
    /// Connector-specific extra fields (e.g. OBS's scene projection).
    pub detail: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Subscriptions & fingerprinting (§3, §8)
// ---------------------------------------------------------------------------

/// A subscription condition: key -> string value, canonically ordered.
pub type Condition = BTreeMap<String, String>;

/// The set of authorization scopes granted to a token.
pub type ScopeSet = BTreeSet<String>;

/// A realized subscription record (§3 Subscription).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub event_type: String,
    pub condition: Condition,
    pub cost: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub fingerprint: String,
}

/// Canonical, order-insensitive fingerprint for an event type + condition.
///
/// Lower-cases the event type and renders the condition as the JSON of its
/// entries sorted lexicographically by key. `Condition` is a `BTreeMap`, so
/// iteration order is already canonical; this function exists as the single
/// named place that defines the fingerprint format.
#[must_use]
pub fn fingerprint(event_type: &str, condition: &Condition) -> String {
    let lower = event_type.to_lowercase();
    let entries: Vec<(&String, &String)> = condition.iter().collect();
    let rendered = serde_json::to_string(&entries).expect("string pairs always serialize");
    format!("{lower}|{rendered}")
}

// ---------------------------------------------------------------------------
// Topic bus envelope
// ---------------------------------------------------------------------------

/// Envelope published on the topic bus. Every publication carries a
/// correlation id so that every log record produced while handling one
/// inbound wire message can be tied back to the event it produced (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub correlation_id: Uuid,
    /// Connector name, e.g. "twitch", "obs", "tcp", "rainwave".
    pub source: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            source: source.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Frozen well-known topic names (§6).
pub mod topics {
    pub const IRONMON_EVENTS: &str = "ironmon:events";
    pub const OBS_EVENTS: &str = "obs:events";
    pub const RAINWAVE_UPDATE: &str = "rainwave:update";
    pub const DASHBOARD: &str = "dashboard";

    /// Per-event-type topic of the form `<provider>.<event_type>`.
    #[must_use]
    pub fn provider_event(provider: &str, event_type: &str) -> String {
        format!("{provider}.{event_type}")
    }
}
