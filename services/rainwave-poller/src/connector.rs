//! Rainwave Poller (C12): a periodic HTTP poll performed directly on the
//! owning task, per the poller carve-out in the concurrency model (no
//! transport to delegate to a child task).

use async_trait::async_trait;
use bus_protocol::{topics, ConnectionState, ConnectorStatus, EventEnvelope, HealthRecord};
use chrono::Utc;
use runtime_core::TopicBus;
use runtime_host::{Connector, ExitReason};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::client::{InfoSnapshot, RainwaveClient};
use crate::config::RainwaveConfig;

pub struct RainwaveConnector {
    config: RainwaveConfig,
    client: RainwaveClient,
    bus: TopicBus,
    health: Mutex<HealthRecord>,
    last: Mutex<InfoSnapshot>,
}

impl RainwaveConnector {
    #[must_use]
    pub fn new(config: RainwaveConfig, client: RainwaveClient, bus: TopicBus) -> Self {
        Self {
            config,
            client,
            bus,
            health: Mutex::new(HealthRecord::default()),
            last: Mutex::new(InfoSnapshot::default()),
        }
    }

    fn record_success(&self) {
        self.health.lock().unwrap().record_success(Utc::now());
    }

    fn record_error(&self) {
        self.health.lock().unwrap().record_error(Utc::now());
    }

    async fn poll_once(&self) {
        match self.client.fetch_info(&self.config).await {
            Ok(snapshot) => {
                self.record_success();
                let changed = {
                    let mut last = self.last.lock().unwrap();
                    let changed = *last != snapshot;
                    *last = snapshot.clone();
                    changed
                };
                if changed {
                    self.publish(&snapshot);
                }
            }
            Err(e) => {
                warn!(error = %e, "rainwave poll failed");
                self.record_error();
            }
        }
    }

    fn publish(&self, snapshot: &InfoSnapshot) {
        let payload = serde_json::json!({
            "song": snapshot.song,
            "station": snapshot.station,
            "listening": snapshot.listening,
        });
        match runtime_validation::validate_event("rainwave", "update", &payload) {
            Ok(validated) => {
                debug!(?snapshot, "rainwave state changed");
                let envelope = EventEnvelope::new("rainwave", "update", validated);
                self.bus.publish(topics::RAINWAVE_UPDATE, envelope);
            }
            Err(e) => {
                warn!(error = %e, "dropping rainwave update that failed validation");
            }
        }
    }
}

#[async_trait]
impl Connector for RainwaveConnector {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> ExitReason {
        let mut shutdown = shutdown;

        if !self.config.should_poll() {
            info!("rainwave connector disabled: missing credentials or explicitly disabled");
            let _ = shutdown.changed().await;
            return ExitReason::Shutdown;
        }

        let mut ticker = interval(self.config.poll_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return ExitReason::Shutdown;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    fn get_status(&self) -> ConnectorStatus {
        let state = if !self.config.should_poll() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Ready
        };
        let last = self.last.lock().unwrap().clone();
        ConnectorStatus {
            connector: "rainwave".to_owned(),
            state,
            session_id: None,
            health: self.health.lock().unwrap().clone(),
            detail: serde_json::json!({
                "song": last.song,
                "station": last.station,
                "listening": last.listening,
            }),
        }
    }
}
