//! OBS WebSocket v5 connector (§4.8): `hello -> identify -> identified`
//! handshake, a deadline-tracked pending-request table for request/response
//! pairs, a periodic untracked stats poll, and a cached projection of scene
//! and output state.

use async_trait::async_trait;
use bus_protocol::{topics, ConnectionState, ConnectorStatus, EventEnvelope, HealthRecord};
use chrono::Utc;
use runtime_host::{Connector, ExitReason};
use runtime_ws::{DisconnectReason, Message, TransportEvent, WebSocketTransport};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ObsConfig;
use crate::wire::{self, ObsMessage};

const DISCONNECT_BACKOFF: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const STATS_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    AwaitingHello,
    Identifying,
    Identified,
    Ready,
    Disconnecting,
}

fn as_connection_state(phase: Phase) -> ConnectionState {
    match phase {
        Phase::Connecting => ConnectionState::Connecting,
        Phase::AwaitingHello => ConnectionState::Upgrading,
        Phase::Identifying => ConnectionState::Connected,
        Phase::Identified | Phase::Ready => ConnectionState::Ready,
        Phase::Disconnecting => ConnectionState::Disconnected,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    CurrentScene,
    StreamStatus,
    RecordStatus,
    StudioMode,
    VirtualCam,
    ReplayBuffer,
}

struct PendingRequest {
    kind: PendingKind,
    deadline: Instant,
}

/// Cached projection of the state the connector tracks without re-asking OBS.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ObsProjection {
    pub current_scene: Option<String>,
    pub streaming: Option<bool>,
    pub recording: Option<bool>,
    pub studio_mode: Option<bool>,
    pub virtual_cam: Option<bool>,
    pub replay_buffer: Option<bool>,
}

struct InternalState {
    phase: Phase,
    rpc_version: u32,
    projection: ObsProjection,
}

impl Default for InternalState {
    fn default() -> Self {
        Self { phase: Phase::Connecting, rpc_version: 1, projection: ObsProjection::default() }
    }
}

pub struct ObsConnector {
    config: ObsConfig,
    bus: runtime_core::TopicBus,
    state: RwLock<InternalState>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    health: Mutex<HealthRecord>,
}

impl ObsConnector {
    #[must_use]
    pub fn new(config: ObsConfig, bus: runtime_core::TopicBus) -> Self {
        Self {
            config,
            bus,
            state: RwLock::new(InternalState::default()),
            pending: Mutex::new(HashMap::new()),
            health: Mutex::new(HealthRecord::default()),
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.state.write().unwrap().phase = phase;
    }

    fn record_success(&self) {
        self.health.lock().unwrap().record_success(Utc::now());
    }

    fn record_error(&self) {
        self.health.lock().unwrap().record_error(Utc::now());
    }

    async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, dur: Duration) -> bool {
        if *shutdown.borrow() {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep(dur) => false,
            _ = shutdown.changed() => true,
        }
    }

    async fn send_request(&self, transport: &WebSocketTransport, request_type: &str, kind: Option<PendingKind>) {
        let request_id = Uuid::new_v4().to_string();
        if let Some(kind) = kind {
            self.pending.lock().unwrap().insert(request_id.clone(), PendingRequest { kind, deadline: Instant::now() + REQUEST_TIMEOUT });
        }
        let frame = wire::build_request(&request_id, request_type, None);
        if let Err(e) = transport.send(Message::Text(frame.into())).await {
            warn!(error = %e, request_type, "failed to send obs request");
        }
    }

    async fn seed_projection(&self, transport: &WebSocketTransport) {
        let seeds: [(&str, PendingKind); 6] = [
            ("GetCurrentProgramScene", PendingKind::CurrentScene),
            ("GetStreamStatus", PendingKind::StreamStatus),
            ("GetRecordStatus", PendingKind::RecordStatus),
            ("GetStudioModeEnabled", PendingKind::StudioMode),
            ("GetVirtualCamStatus", PendingKind::VirtualCam),
            ("GetReplayBufferStatus", PendingKind::ReplayBuffer),
        ];
        for (request_type, kind) in seeds {
            self.send_request(transport, request_type, Some(kind)).await;
        }
    }

    fn apply_seed_response(&self, kind: PendingKind, data: &Value) {
        let mut state = self.state.write().unwrap();
        match kind {
            PendingKind::CurrentScene => state.projection.current_scene = data["sceneName"].as_str().map(str::to_owned),
            PendingKind::StreamStatus => state.projection.streaming = data["outputActive"].as_bool(),
            PendingKind::RecordStatus => state.projection.recording = data["outputActive"].as_bool(),
            PendingKind::StudioMode => state.projection.studio_mode = data["studioModeEnabled"].as_bool(),
            PendingKind::VirtualCam => state.projection.virtual_cam = data["outputActive"].as_bool(),
            PendingKind::ReplayBuffer => state.projection.replay_buffer = data["outputActive"].as_bool(),
        }
    }

    fn handle_event(&self, event_type: &str, data: &Value) {
        let (changed, field): (bool, &str) = match event_type {
            "CurrentProgramSceneChanged" => {
                self.state.write().unwrap().projection.current_scene = data["sceneName"].as_str().map(str::to_owned);
                (true, "current_scene")
            }
            "StreamStateChanged" => {
                self.state.write().unwrap().projection.streaming = data["outputActive"].as_bool();
                (true, "streaming")
            }
            "RecordStateChanged" => {
                self.state.write().unwrap().projection.recording = data["outputActive"].as_bool();
                (true, "recording")
            }
            "StudioModeStateChanged" => {
                self.state.write().unwrap().projection.studio_mode = data["studioModeEnabled"].as_bool();
                (true, "studio_mode")
            }
            "VirtualcamStateChanged" => {
                self.state.write().unwrap().projection.virtual_cam = data["outputActive"].as_bool();
                (true, "virtual_cam")
            }
            "ReplayBufferStateChanged" => {
                self.state.write().unwrap().projection.replay_buffer = data["outputActive"].as_bool();
                (true, "replay_buffer")
            }
            _ => (false, ""),
        };

        match runtime_validation::validate_event("obs", event_type, data) {
            Ok(payload) => {
                if changed {
                    debug!(field, "obs projection updated");
                }
                let envelope = EventEnvelope::new("obs", event_type.to_owned(), payload);
                self.bus.publish(&topics::provider_event("obs", event_type), envelope);
            }
            Err(e) => {
                warn!(event_type, error = %e, "dropping obs event that failed validation");
            }
        }
    }

    fn sweep_expired_requests(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();
        let expired: Vec<String> = pending.iter().filter(|(_, p)| p.deadline <= now).map(|(id, _)| id.clone()).collect();
        for id in expired {
            pending.remove(&id);
            warn!(request_id = id, "obs request timed out waiting for response");
        }
    }

    async fn drive_session(&self, transport: &WebSocketTransport, owner_rx: &mut mpsc::Receiver<TransportEvent>, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut stats_ticker = tokio::time::interval(STATS_POLL_INTERVAL);
        let mut sweep_ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return true;
                    }
                }
                _ = stats_ticker.tick() => {
                    self.send_request(transport, "GetStats", None).await;
                }
                _ = sweep_ticker.tick() => {
                    self.sweep_expired_requests();
                }
                event = owner_rx.recv() => {
                    let Some(event) = event else { return false };
                    match event {
                        TransportEvent::Connected | TransportEvent::Upgraded { .. } => {
                            self.set_phase(Phase::AwaitingHello);
                        }
                        TransportEvent::Message(Message::Text(text)) => {
                            match wire::parse(&text) {
                                Ok(ObsMessage::Hello(hello)) => {
                                    self.set_phase(Phase::Identifying);
                                    self.state.write().unwrap().rpc_version = hello.rpc_version;
                                    let identify = wire::build_identify(
                                        hello.rpc_version,
                                        self.config.event_subscriptions,
                                        self.config.password.as_deref(),
                                        hello.auth_challenge.as_ref(),
                                    );
                                    if let Err(e) = transport.send(Message::Text(identify.into())).await {
                                        warn!(error = %e, "failed to send obs identify");
                                    }
                                }
                                Ok(ObsMessage::Identified(identified)) => {
                                    self.set_phase(Phase::Identified);
                                    self.record_success();
                                    info!(rpc_version = identified.negotiated_rpc_version, "obs session identified");
                                    self.seed_projection(transport).await;
                                    self.set_phase(Phase::Ready);
                                }
                                Ok(ObsMessage::Event(event)) => {
                                    let phase = self.state.read().unwrap().phase;
                                    let identified = matches!(phase, Phase::Identified | Phase::Ready);
                                    if !identified {
                                        warn!(event_type = event.event_type, "discarding obs event received before identification");
                                    } else {
                                        self.handle_event(&event.event_type, &event.event_data);
                                    }
                                }
                                Ok(ObsMessage::RequestResponse(response)) => {
                                    let pending = self.pending.lock().unwrap().remove(&response.request_id);
                                    match pending {
                                        Some(p) => {
                                            if response.success {
                                                self.apply_seed_response(p.kind, &response.response_data);
                                            } else {
                                                warn!(request_type = response.request_type, comment = ?response.comment, "obs request failed");
                                            }
                                        }
                                        None => {
                                            debug!(request_id = response.request_id, request_type = response.request_type, "unclaimed obs response");
                                        }
                                    }
                                }
                                Ok(ObsMessage::Other(op)) => {
                                    debug!(op, "unhandled obs opcode, ignoring");
                                }
                                Err(e) => {
                                    warn!(error = %e, "failed to parse obs message");
                                }
                            }
                        }
                        TransportEvent::Message(_) => {}
                        TransportEvent::Disconnected { reason } => {
                            debug!(?reason, "obs transport disconnected");
                            if reason != DisconnectReason::Normal {
                                self.record_error();
                            }
                            return false;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Connector for ObsConnector {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> ExitReason {
        let mut shutdown = shutdown;

        loop {
            if *shutdown.borrow() {
                return ExitReason::Shutdown;
            }

            self.set_phase(Phase::Connecting);
            self.pending.lock().unwrap().clear();
            let (owner_tx, mut owner_rx) = mpsc::channel(128);
            let transport = WebSocketTransport::new(self.config.url.clone(), owner_tx, Duration::from_secs(30));

            if let Err(e) = transport.connect(&[]).await {
                self.record_error();
                warn!(error = %e, "obs transport connect failed");
                if Self::sleep_or_shutdown(&mut shutdown, DISCONNECT_BACKOFF).await {
                    return ExitReason::Shutdown;
                }
                continue;
            }

            let shutdown_requested = self.drive_session(&transport, &mut owner_rx, &mut shutdown).await;
            transport.close().await;

            if shutdown_requested {
                self.set_phase(Phase::Disconnecting);
                return ExitReason::Shutdown;
            }

            self.set_phase(Phase::Disconnecting);
            if Self::sleep_or_shutdown(&mut shutdown, DISCONNECT_BACKOFF).await {
                return ExitReason::Shutdown;
            }
        }
    }

    fn get_status(&self) -> ConnectorStatus {
        let state = self.state.read().unwrap();
        ConnectorStatus {
            connector: "obs".to_owned(),
            state: as_connection_state(state.phase),
            session_id: None,
            health: self.health.lock().unwrap().clone(),
            detail: serde_json::to_value(&state.projection).unwrap_or(Value::Null),
        }
    }
}
