//! Retry & Circuit Breaker (C4).
//!
//! `retry` drives an async operation through exponential backoff with
//! jitter and provider rate-limit hints (§4.3). `CircuitBreakerRegistry`
//! layers a per-named-target closed/open/half-open guard on top, in the
//! spirit of the teacher's per-stream state tables (one entry per key,
//! behind a single mutex, pruned lazily).

use bus_protocol::ErrorKind;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Backoff policy: `delay(attempt) = min(base * 2^(attempt-1), ceiling) + jitter`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub ceiling: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base: Duration, ceiling: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base, ceiling }
    }

    fn delay_for_attempt(&self, attempt: u32, retry_after_hint: Option<Duration>) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let ceiling_ms = u64::try_from(self.ceiling.as_millis()).unwrap_or(u64::MAX);
        let scaled_ms = base_ms.saturating_mul(exp).min(ceiling_ms);
        let mut delay = Duration::from_millis(scaled_ms);
        if let Some(hint) = retry_after_hint {
            delay = delay.max(hint);
        }
        let jitter_bound_ms = base_ms.max(1);
        let jitter_ms = rand::thread_rng().gen_range(0..=jitter_bound_ms);
        delay + Duration::from_millis(jitter_ms)
    }
}

/// Implemented by connector-local error types so `retry` can classify
/// failures without depending on their concrete shape.
pub trait RetryClassify {
    fn error_kind(&self) -> ErrorKind;

    /// A provider-supplied minimum delay before the next attempt (e.g. a
    /// `Retry-After` header or a 429 body hint). `None` if not applicable.
    fn retry_after_hint(&self) -> Option<Duration> {
        None
    }
}

/// Execute `f`, retrying on non-terminal errors per `policy`.
///
/// `f` receives the 1-based attempt number. Returns the last error once
/// `max_attempts` is exhausted or the error classifies as terminal.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClassify,
{
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let terminal = !err.error_kind().is_retryable();
                if terminal || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt, err.retry_after_hint());
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after delay");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Distinct error returned when a call is short-circuited.
#[derive(Debug, thiserror::Error)]
#[error("circuit open for target '{target}'")]
pub struct CircuitOpenError {
    pub target: String,
}

struct BreakerEntry {
    state: BreakerState,
    failure_count: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerEntry {
    fn new(now: Instant) -> Self {
        Self { state: BreakerState::Closed, failure_count: 0, window_start: now, opened_at: None, probe_in_flight: false }
    }
}

/// Per-named-target circuit breaker registry.
pub struct CircuitBreakerRegistry {
    targets: Mutex<HashMap<String, BreakerEntry>>,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self { targets: Mutex::new(HashMap::new()), threshold: threshold.max(1), window, cooldown }
    }

    /// Call before attempting an operation against `target`. `Err` means
    /// fail fast without performing the call.
    pub fn allow(&self, target: &str) -> Result<(), CircuitOpenError> {
        let now = Instant::now();
        let mut targets = self.targets.lock().unwrap();
        let entry = targets.entry(target.to_owned()).or_insert_with(|| BreakerEntry::new(now));
        match entry.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed_enough = entry.opened_at.is_some_and(|opened| now.duration_since(opened) >= self.cooldown);
                if elapsed_enough {
                    entry.state = BreakerState::HalfOpen;
                    entry.probe_in_flight = true;
                    debug!(target, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(CircuitOpenError { target: target.to_owned() })
                }
            }
            BreakerState::HalfOpen => {
                if entry.probe_in_flight {
                    Err(CircuitOpenError { target: target.to_owned() })
                } else {
                    entry.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Report a successful call. Closes the breaker and resets counters.
    pub fn record_success(&self, target: &str) {
        let now = Instant::now();
        let mut targets = self.targets.lock().unwrap();
        let entry = targets.entry(target.to_owned()).or_insert_with(|| BreakerEntry::new(now));
        entry.state = BreakerState::Closed;
        entry.failure_count = 0;
        entry.window_start = now;
        entry.opened_at = None;
        entry.probe_in_flight = false;
    }

    /// Report a failed call. May transition closed->open or half-open->open.
    pub fn record_failure(&self, target: &str) {
        let now = Instant::now();
        let mut targets = self.targets.lock().unwrap();
        let entry = targets.entry(target.to_owned()).or_insert_with(|| BreakerEntry::new(now));
        match entry.state {
            BreakerState::Closed => {
                if now.duration_since(entry.window_start) > self.window {
                    entry.window_start = now;
                    entry.failure_count = 0;
                }
                entry.failure_count += 1;
                if entry.failure_count >= self.threshold {
                    warn!(target, "circuit opening after {} failures", entry.failure_count);
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                warn!(target, "probe failed, circuit re-opening");
                entry.state = BreakerState::Open;
                entry.opened_at = Some(now);
                entry.probe_in_flight = false;
                entry.failure_count = entry.failure_count.max(self.threshold);
            }
            BreakerState::Open => {}
        }
    }

    #[must_use]
    pub fn state(&self, target: &str) -> BreakerState {
        self.targets.lock().unwrap().get(target).map_or(BreakerState::Closed, |e| e.state)
    }
}
