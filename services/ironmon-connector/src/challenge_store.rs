//! IronMON Persistence Port (C16).
//!
//! Grounded on the teacher's `JournalAccess` pattern in `status_http.rs`:
//! storage is a narrow trait the connector depends on, with an in-memory
//! stand-in shipped by default so the connector is testable and the crate
//! never requires an external database.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub type AttemptId = u64;

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub game: i64,
    pub challenge_hint: String,
    pub seed_count: i64,
    pub cleared_checkpoints: Vec<(i64, String)>,
}

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn start_attempt(&self, game: i64, challenge_hint: &str, seed_count: i64) -> AttemptId;
    async fn record_checkpoint(&self, attempt_id: AttemptId, checkpoint_id: i64, name: &str, cleared: bool);
}

/// Default in-memory implementation. Attempts are never pruned; this is a
/// test/dev stand-in, not meant to back a long-running deployment.
#[derive(Default)]
pub struct InMemoryChallengeStore {
    next_id: AtomicU64,
    attempts: Mutex<HashMap<AttemptId, AttemptRecord>>,
}

impl InMemoryChallengeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn attempt(&self, id: AttemptId) -> Option<AttemptRecord> {
        self.attempts.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl ChallengeStore for InMemoryChallengeStore {
    async fn start_attempt(&self, game: i64, challenge_hint: &str, seed_count: i64) -> AttemptId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.attempts.lock().unwrap().insert(
            id,
            AttemptRecord { game, challenge_hint: challenge_hint.to_owned(), seed_count, cleared_checkpoints: Vec::new() },
        );
        id
    }

    async fn record_checkpoint(&self, attempt_id: AttemptId, checkpoint_id: i64, name: &str, cleared: bool) {
        if !cleared {
            return;
        }
        if let Some(attempt) = self.attempts.lock().unwrap().get_mut(&attempt_id) {
            attempt.cleared_checkpoints.push((checkpoint_id, name.to_owned()));
        }
    }
}
