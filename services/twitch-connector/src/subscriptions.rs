//! Subscription coordinator (§4.7): a `{fingerprint -> subscription}`
//! registry plus the static required-scope capability table.

use bus_protocol::{fingerprint, Condition, ErrorKind, ScopeSet, Subscription};
use chrono::Utc;
use runtime_core::RetryClassify;
use std::collections::HashMap;
use std::time::Duration;

use crate::provider::TwitchApiError;

/// Required scopes per event type. Event types absent from this table need
/// no scope beyond whatever the app token itself carries.
fn required_scopes(event_type: &str) -> &'static [&'static str] {
    match event_type {
        "channel.follow" => &["moderator:read:followers"],
        "channel.chat.message" => &["user:read:chat"],
        "channel.subscribe" | "channel.subscription.end" | "channel.subscription.gift" | "channel.subscription.message" => {
            &["channel:read:subscriptions"]
        }
        "channel.cheer" => &["bits:read"],
        "channel.raid" | "stream.online" | "stream.offline" | "channel.update" => &[],
        _ => &[],
    }
}

/// The default subscription set created once a session and subject are both
/// known. `critical` drives the retry policy in §4.7.
pub struct DefaultSubscription {
    pub event_type: &'static str,
    pub critical: bool,
}

pub const DEFAULT_SUBSCRIPTIONS: &[DefaultSubscription] = &[
    DefaultSubscription { event_type: "stream.online", critical: true },
    DefaultSubscription { event_type: "stream.offline", critical: true },
    DefaultSubscription { event_type: "channel.update", critical: true },
    DefaultSubscription { event_type: "channel.follow", critical: true },
    DefaultSubscription { event_type: "channel.chat.message", critical: true },
    DefaultSubscription { event_type: "channel.cheer", critical: false },
    DefaultSubscription { event_type: "channel.raid", critical: false },
];

/// Build the broadcaster-scoped condition used by every default subscription.
#[must_use]
pub fn broadcaster_condition(user_id: &str, event_type: &str) -> Condition {
    let mut condition = Condition::new();
    condition.insert("broadcaster_user_id".to_owned(), user_id.to_owned());
    if event_type == "channel.follow" {
        condition.insert("moderator_user_id".to_owned(), user_id.to_owned());
    }
    condition
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("not connected to a session")]
    NotConnected,
    #[error("subscription limit exceeded")]
    LimitExceeded,
    #[error("missing required scopes: {0:?}")]
    ScopeMissing(Vec<String>),
    #[error(transparent)]
    Provider(#[from] TwitchApiError),
}

impl RetryClassify for SubscriptionError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            SubscriptionError::NotConnected => ErrorKind::ServiceUnavailable,
            SubscriptionError::LimitExceeded => ErrorKind::LimitExceeded,
            SubscriptionError::ScopeMissing(_) => ErrorKind::ScopeMissing,
            SubscriptionError::Provider(e) => e.error_kind(),
        }
    }

    fn retry_after_hint(&self) -> Option<Duration> {
        match self {
            SubscriptionError::Provider(e) => e.retry_after_hint(),
            _ => None,
        }
    }
}

const DEFAULT_MAX_COUNT: usize = 300;
const DEFAULT_MAX_COST: u32 = 10;

/// In-memory view of every live subscription, keyed by its canonical
/// fingerprint (§8 idempotency invariant) with a side table of per-id
/// last-seen timestamps for notification bookkeeping.
#[derive(Default)]
pub struct SubscriptionRegistry {
    by_fingerprint: HashMap<String, Subscription>,
    by_id: HashMap<String, String>,
    last_seen: HashMap<String, chrono::DateTime<Utc>>,
    max_count: usize,
    max_cost: u32,
    total_cost: u32,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { max_count: DEFAULT_MAX_COUNT, max_cost: DEFAULT_MAX_COST, ..Default::default() }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.by_fingerprint.len()
    }

    #[must_use]
    pub fn total_cost(&self) -> u32 {
        self.total_cost
    }

    #[must_use]
    pub fn find_by_fingerprint(&self, fp: &str) -> Option<&Subscription> {
        self.by_fingerprint.get(fp)
    }

    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.by_fingerprint.len() >= self.max_count || self.total_cost >= self.max_cost
    }

    pub fn insert(&mut self, sub: Subscription) {
        self.by_id.insert(sub.id.clone(), sub.fingerprint.clone());
        self.total_cost += sub.cost;
        self.by_fingerprint.insert(sub.fingerprint.clone(), sub);
    }

    /// Mark a notification as seen for its subscription id. A no-op if the
    /// id isn't registered (e.g. a subscription created out-of-band).
    pub fn record_seen(&mut self, subscription_id: &str, when: chrono::DateTime<Utc>) {
        if self.by_id.contains_key(subscription_id) {
            self.last_seen.insert(subscription_id.to_owned(), when);
        }
    }

    #[must_use]
    pub fn last_seen(&self, subscription_id: &str) -> Option<chrono::DateTime<Utc>> {
        self.last_seen.get(subscription_id).copied()
    }

    /// Remove by remote subscription id (e.g. on revocation). Returns
    /// whether anything was removed.
    pub fn remove_by_id(&mut self, subscription_id: &str) -> bool {
        let Some(fp) = self.by_id.remove(subscription_id) else { return false };
        self.last_seen.remove(subscription_id);
        if let Some(sub) = self.by_fingerprint.remove(&fp) {
            self.total_cost = self.total_cost.saturating_sub(sub.cost);
            true
        } else {
            false
        }
    }

    /// Every live subscription, for bulk cleanup on shutdown.
    #[must_use]
    pub fn all(&self) -> Vec<Subscription> {
        self.by_fingerprint.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.by_fingerprint.clear();
        self.by_id.clear();
        self.last_seen.clear();
        self.total_cost = 0;
    }
}

/// Validate a subscription request against capacity and scopes before any
/// network call is made. Returns the fingerprint to look up / insert under.
pub fn precheck(
    registry: &SubscriptionRegistry,
    connected: bool,
    event_type: &str,
    condition: &Condition,
    granted_scopes: &ScopeSet,
) -> Result<PrecheckOutcome, SubscriptionError> {
    if !connected {
        return Err(SubscriptionError::NotConnected);
    }
    let fp = fingerprint(event_type, condition);
    if let Some(existing) = registry.find_by_fingerprint(&fp) {
        return Ok(PrecheckOutcome::AlreadyExists(existing.clone()));
    }
    if registry.at_capacity() {
        return Err(SubscriptionError::LimitExceeded);
    }
    let missing: Vec<String> = required_scopes(event_type)
        .iter()
        .filter(|s| !granted_scopes.contains(**s))
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(SubscriptionError::ScopeMissing(missing));
    }
    Ok(PrecheckOutcome::Proceed(fp))
}

pub enum PrecheckOutcome {
    AlreadyExists(Subscription),
    Proceed(String),
}
