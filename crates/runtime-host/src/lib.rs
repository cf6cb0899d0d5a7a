//! Service Host (C8): a generic supervised session wrapping a connector's
//! run loop with status reporting and bounded-intensity restart, in the
//! manner of the timing system's `ClientConnector::begin` accept loop paired
//! with a watching parent task, except the watcher here is the host itself
//! and shutdown is signaled with a `tokio::sync::watch<bool>` exactly as the
//! receiver session loop does.

use async_trait::async_trait;
use bus_protocol::{ConnectorStatus, HealthRecord};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Why a connector's run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested; the host must not restart.
    Shutdown,
    /// An unexpected internal failure; eligible for a bounded restart.
    Internal,
}

/// Implemented once per connector kind (Twitch, OBS, IronMON, Rainwave).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Drive the connector until `shutdown` fires or an unrecoverable error
    /// occurs. Must return promptly once `*shutdown.borrow()` is true.
    async fn run(&self, shutdown: watch::Receiver<bool>) -> ExitReason;

    fn get_status(&self) -> ConnectorStatus;

    /// Health snapshot; defaults to the health embedded in `get_status`.
    fn get_health(&self) -> HealthRecord {
        self.get_status().health
    }

    /// Free-form connector metadata (name, configuration summary, etc).
    fn get_info(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

/// Bounded restart intensity: at most `max_restarts` within `window`.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

impl RestartPolicy {
    #[must_use]
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self { max_restarts, window }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self { max_restarts: 5, window: Duration::from_secs(60) }
    }
}

/// Supervises a single connector instance.
pub struct ServiceHost<C: Connector> {
    connector: Arc<C>,
    restart_policy: RestartPolicy,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ServiceHost<C> {
    #[must_use]
    pub fn new(connector: Arc<C>, restart_policy: RestartPolicy) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self { connector, restart_policy, shutdown_tx, shutdown_rx, supervisor: Mutex::new(None) }
    }

    /// Begin supervising: spawn the connector's run loop, restarting it per
    /// `restart_policy` on `ExitReason::Internal`. Idempotent — a second
    /// call while already running is a no-op.
    pub async fn start(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return;
        }
        let connector = self.connector.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let policy = self.restart_policy.clone();
        *supervisor = Some(tokio::spawn(supervise(connector, shutdown_rx, policy)));
    }

    #[must_use]
    pub fn get_status(&self) -> ConnectorStatus {
        self.connector.get_status()
    }

    #[must_use]
    pub fn get_health(&self) -> HealthRecord {
        self.connector.get_health()
    }

    #[must_use]
    pub fn get_info(&self) -> serde_json::Value {
        self.connector.get_info()
    }

    /// Stop supervising and wait for the connector task to exit. Idempotent.
    pub async fn terminate(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.supervisor.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn supervise<C: Connector>(connector: Arc<C>, shutdown: watch::Receiver<bool>, policy: RestartPolicy) {
    let mut restart_times: VecDeque<Instant> = VecDeque::new();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let reason = connector.run(shutdown.clone()).await;
        match reason {
            ExitReason::Shutdown => break,
            ExitReason::Internal => {
                if *shutdown.borrow() {
                    break;
                }
                let now = Instant::now();
                while let Some(front) = restart_times.front() {
                    if now.duration_since(*front) > policy.window {
                        restart_times.pop_front();
                    } else {
                        break;
                    }
                }
                restart_times.push_back(now);
                if restart_times.len() as u32 > policy.max_restarts {
                    warn!(
                        max_restarts = policy.max_restarts,
                        "restart intensity exceeded, leaving connector stopped"
                    );
                    break;
                }
                info!(restart_count = restart_times.len(), "restarting connector after internal error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_protocol::ConnectionState;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyConnector {
        run_count: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ExitReason {
            let n = self.run_count.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return ExitReason::Internal;
            }
            let _ = shutdown.changed().await;
            ExitReason::Shutdown
        }

        fn get_status(&self) -> ConnectorStatus {
            ConnectorStatus {
                connector: "flaky".into(),
                state: ConnectionState::Ready,
                session_id: None,
                health: HealthRecord::default(),
                detail: serde_json::json!({}),
            }
        }
    }

    #[tokio::test]
    async fn restarts_after_internal_error_then_runs_to_shutdown() {
        let connector = Arc::new(FlakyConnector { run_count: AtomicU32::new(0), fail_times: 2 });
        let host = ServiceHost::new(connector.clone(), RestartPolicy::new(5, Duration::from_secs(60)));
        host.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.terminate().await;
        assert_eq!(connector.run_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_once_restart_intensity_exceeded() {
        let connector = Arc::new(FlakyConnector { run_count: AtomicU32::new(0), fail_times: u32::MAX });
        let host = ServiceHost::new(connector.clone(), RestartPolicy::new(2, Duration::from_secs(60)));
        host.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let count_after_giving_up = connector.run_count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.run_count.load(Ordering::SeqCst), count_after_giving_up);
        host.terminate().await;
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let connector = Arc::new(FlakyConnector { run_count: AtomicU32::new(0), fail_times: 0 });
        let host = ServiceHost::new(connector, RestartPolicy::default());
        host.start().await;
        host.terminate().await;
        host.terminate().await;
    }

    #[tokio::test]
    async fn status_and_info_delegate_to_connector() {
        let connector = Arc::new(FlakyConnector { run_count: AtomicU32::new(0), fail_times: 0 });
        let host = ServiceHost::new(connector, RestartPolicy::default());
        assert_eq!(host.get_status().connector, "flaky");
        assert_eq!(host.get_health().status, bus_protocol::HealthStatus::Ok);
    }
}
