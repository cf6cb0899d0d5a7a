//! IronMON TCP Connector (C11): one owning task accepting connections and
//! processing framed messages; TCP reads happen in short-lived per-connection
//! child tasks that feed complete frames back to the owner, so connector
//! state (per-connection game/attempt tracking) is mutated only on the
//! owning task.

use async_trait::async_trait;
use bus_protocol::{topics, ConnectionState, ConnectorStatus, EventEnvelope, HealthRecord};
use chrono::Utc;
use runtime_core::TopicBus;
use runtime_host::{Connector, ExitReason};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::challenge_store::{AttemptId, ChallengeStore};
use crate::framing::FrameParser;
use crate::types;

const READ_CHUNK_BYTES: usize = 8192;

enum ConnEvent {
    Frame { conn_id: u64, bytes: Vec<u8> },
    Closed { conn_id: u64 },
}

#[derive(Default)]
struct ConnState {
    game: Option<i64>,
    attempt_id: Option<AttemptId>,
}

pub struct IronmonConnector<S: ChallengeStore + 'static> {
    bind_addr: String,
    store: Arc<S>,
    bus: TopicBus,
    health: Mutex<HealthRecord>,
    active_connections: AtomicUsize,
}

impl<S: ChallengeStore + 'static> IronmonConnector<S> {
    #[must_use]
    pub fn new(bind_addr: impl Into<String>, store: Arc<S>, bus: TopicBus) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            store,
            bus,
            health: Mutex::new(HealthRecord::default()),
            active_connections: AtomicUsize::new(0),
        }
    }

    fn record_success(&self) {
        self.health.lock().unwrap().record_success(Utc::now());
    }

    fn record_error(&self) {
        self.health.lock().unwrap().record_error(Utc::now());
    }

    async fn handle_message(&self, conn_state: &mut ConnState, message_type: &str, payload: &serde_json::Value) {
        let should_publish = match types::validate(message_type, payload) {
            Ok(should_publish) => should_publish,
            Err(e) => {
                warn!(message_type, error = %e, "dropping ironmon message that failed type validation");
                return;
            }
        };

        match message_type {
            "init" => {
                conn_state.game = types::field(payload, "game").and_then(serde_json::Value::as_i64);
            }
            "seed" => {
                let count = types::field(payload, "count").and_then(serde_json::Value::as_i64).unwrap_or(0);
                let game = conn_state.game.unwrap_or(0);
                let hint = format!("game-{game}");
                let attempt_id = self.store.start_attempt(game, &hint, count).await;
                conn_state.attempt_id = Some(attempt_id);
                info!(game, count, "ironmon attempt started");
            }
            "checkpoint" => match conn_state.attempt_id {
                Some(attempt_id) => {
                    let id = types::field(payload, "id").and_then(serde_json::Value::as_i64).unwrap_or_default();
                    let name = types::field(payload, "name").and_then(serde_json::Value::as_str).unwrap_or_default();
                    self.store.record_checkpoint(attempt_id, id, name, true).await;
                }
                None => warn!("checkpoint received with no active attempt on this connection"),
            },
            "error" => {
                let code = types::field(payload, "code").and_then(serde_json::Value::as_str).unwrap_or_default();
                let message = types::field(payload, "message").and_then(serde_json::Value::as_str).unwrap_or_default();
                warn!(code, message, "ironmon reported an error");
            }
            _ => {}
        }

        if !should_publish {
            return;
        }

        match runtime_validation::validate_event("ironmon", message_type, payload) {
            Ok(validated) => {
                let envelope = EventEnvelope::new("tcp", message_type.to_owned(), validated);
                self.bus.publish(topics::IRONMON_EVENTS, envelope);
            }
            Err(e) => {
                warn!(message_type, error = %e, "dropping ironmon message that failed validation");
            }
        }
    }
}

async fn read_connection(mut stream: TcpStream, conn_id: u64, tx: mpsc::Sender<ConnEvent>) {
    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                parser.push(&buf[..n]);
                for message in parser.drain_messages() {
                    if tx.send(ConnEvent::Frame { conn_id, bytes: message }).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    let _ = tx.send(ConnEvent::Closed { conn_id }).await;
}

#[async_trait]
impl<S: ChallengeStore + 'static> Connector for IronmonConnector<S> {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> ExitReason {
        let mut shutdown = shutdown;
        let listener = match TcpListener::bind(&self.bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, addr = %self.bind_addr, "ironmon listener failed to bind");
                self.record_error();
                return ExitReason::Internal;
            }
        };
        info!(addr = %self.bind_addr, "ironmon listener bound");

        let (tx, mut rx) = mpsc::channel::<ConnEvent>(256);
        let mut next_conn_id: u64 = 0;
        let mut conns: HashMap<u64, ConnState> = HashMap::new();
        let mut reader_tasks: HashMap<u64, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        for (_, handle) in reader_tasks.drain() {
                            handle.abort();
                        }
                        return ExitReason::Shutdown;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let conn_id = next_conn_id;
                            next_conn_id += 1;
                            self.active_connections.fetch_add(1, Ordering::Relaxed);
                            conns.insert(conn_id, ConnState::default());
                            debug!(conn_id, %peer, "ironmon connection accepted");
                            let task_tx = tx.clone();
                            reader_tasks.insert(conn_id, tokio::spawn(read_connection(stream, conn_id, task_tx)));
                        }
                        Err(e) => {
                            warn!(error = %e, "ironmon accept failed");
                            self.record_error();
                        }
                    }
                }
                event = rx.recv() => {
                    match event {
                        Some(ConnEvent::Frame { conn_id, bytes }) => {
                            let payload: serde_json::Value = match serde_json::from_slice(&bytes) {
                                Ok(v) => v,
                                Err(e) => {
                                    warn!(conn_id, error = %e, "ironmon message is not valid json");
                                    continue;
                                }
                            };
                            let Some(message_type) = payload.get("type").and_then(serde_json::Value::as_str).map(str::to_owned) else {
                                warn!(conn_id, "ironmon message missing type field");
                                continue;
                            };
                            self.record_success();
                            if let Some(conn_state) = conns.get_mut(&conn_id) {
                                self.handle_message(conn_state, &message_type, &payload).await;
                            }
                        }
                        Some(ConnEvent::Closed { conn_id }) => {
                            debug!(conn_id, "ironmon connection closed");
                            conns.remove(&conn_id);
                            reader_tasks.remove(&conn_id);
                            self.active_connections.fetch_sub(1, Ordering::Relaxed);
                        }
                        None => {}
                    }
                }
            }
        }
    }

    fn get_status(&self) -> ConnectorStatus {
        let state = if self.active_connections.load(Ordering::Relaxed) > 0 {
            ConnectionState::Ready
        } else {
            ConnectionState::Connecting
        };
        ConnectorStatus {
            connector: "ironmon".to_owned(),
            state,
            session_id: None,
            health: self.health.lock().unwrap().clone(),
            detail: serde_json::json!({ "active_connections": self.active_connections.load(Ordering::Relaxed) }),
        }
    }
}
