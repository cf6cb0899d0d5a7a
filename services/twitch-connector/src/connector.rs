//! Twitch EventSub connector (§4.7): one owning task driving the state
//! machine `no-token -> validating -> connecting -> upgrading -> welcomed ->
//! ready <-> reconnect-requested`, with disconnection paths back to
//! `disconnecting -> no-token|connecting`.

use async_trait::async_trait;
use bus_protocol::{topics, ConnectionState, ConnectorStatus, EventEnvelope, HealthRecord, ScopeSet};
use chrono::Utc;
use runtime_auth::TokenManager;
use runtime_core::{retry, RetryPolicy, StatusCache, TopicBus};
use runtime_host::{Connector, ExitReason};
use runtime_ws::{DisconnectReason, Message, TransportError, TransportEvent, WebSocketTransport};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::TwitchConfig;
use crate::provider::HelixClient;
use crate::subscriptions::{broadcaster_condition, precheck, PrecheckOutcome, SubscriptionRegistry, DEFAULT_SUBSCRIPTIONS};
use crate::wire::{self, EventSubMessage};

const TOKEN_RETRY_BACKOFF: Duration = Duration::from_secs(10);
const DISCONNECT_BACKOFF: Duration = Duration::from_secs(5);
const CLEANUP_CONCURRENCY: usize = 10;
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NoToken,
    Validating,
    Connecting,
    Upgrading,
    Welcomed,
    Ready,
    ReconnectRequested,
    Disconnecting,
}

fn as_connection_state(phase: Phase) -> ConnectionState {
    match phase {
        Phase::NoToken | Phase::Disconnecting => ConnectionState::Disconnected,
        Phase::Validating | Phase::Connecting => ConnectionState::Connecting,
        Phase::Upgrading => ConnectionState::Upgrading,
        Phase::Welcomed => ConnectionState::Connected,
        Phase::Ready => ConnectionState::Ready,
        Phase::ReconnectRequested => ConnectionState::Reconnecting,
    }
}

struct InternalState {
    phase: Phase,
    session_id: Option<String>,
    keepalive_timeout_seconds: u64,
    subject: Option<String>,
    scopes: ScopeSet,
}

impl Default for InternalState {
    fn default() -> Self {
        Self { phase: Phase::NoToken, session_id: None, keepalive_timeout_seconds: 10, subject: None, scopes: ScopeSet::new() }
    }
}

enum DriveResult {
    Shutdown,
    Reconnect(String),
    Disconnected,
}

pub struct TwitchConnector {
    config: TwitchConfig,
    token_manager: Arc<TokenManager>,
    helix: HelixClient,
    bus: TopicBus,
    status_cache: StatusCache,
    critical_retry: RetryPolicy,
    noncritical_retry: RetryPolicy,
    state: RwLock<InternalState>,
    registry: Mutex<SubscriptionRegistry>,
    health: Mutex<HealthRecord>,
}

impl TwitchConnector {
    #[must_use]
    pub fn new(config: TwitchConfig, token_manager: Arc<TokenManager>, bus: TopicBus, status_cache: StatusCache) -> Self {
        let client = reqwest::Client::new();
        let helix = HelixClient::new(client, &config);
        Self {
            config,
            token_manager,
            helix,
            bus,
            status_cache,
            critical_retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(5)),
            noncritical_retry: RetryPolicy::new(1, Duration::from_secs(1), Duration::from_secs(5)),
            state: RwLock::new(InternalState::default()),
            registry: Mutex::new(SubscriptionRegistry::new()),
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

    /// Create one subscription, idempotent by fingerprint (§4.7 steps 1-5).
    async fn create_subscription(&self, token: &str, event_type: &str, critical: bool) -> Result<(), crate::subscriptions::SubscriptionError> {
        let user_id = self.config.user_id.clone();
        let condition = broadcaster_condition(&user_id, event_type);

        let (connected, session_id, scopes) = {
            let state = self.state.read().unwrap();
            (state.phase == Phase::Ready || state.phase == Phase::Welcomed, state.session_id.clone(), state.scopes.clone())
        };

        let outcome = {
            let registry = self.registry.lock().unwrap();
            precheck(&registry, connected, event_type, &condition, &scopes)?
        };
        let fp = match outcome {
            PrecheckOutcome::AlreadyExists(_) => return Ok(()),
            PrecheckOutcome::Proceed(fp) => fp,
        };
        let Some(session_id) = session_id else {
            return Err(crate::subscriptions::SubscriptionError::NotConnected);
        };

        let policy = if critical { &self.critical_retry } else { &self.noncritical_retry };
        let helix = &self.helix;
        let created = retry(policy, |_attempt| helix.create_subscription(token, event_type, &condition, &session_id)).await?;

        let sub = bus_protocol::Subscription {
            id: created.id,
            event_type: event_type.to_owned(),
            condition,
            cost: created.cost,
            created_at: created.created_at,
            fingerprint: fp,
        };
        self.registry.lock().unwrap().insert(sub);
        self.status_cache.invalidate_namespace("twitch");
        Ok(())
    }

    async fn ensure_default_subscriptions(&self, token: &str) {
        for default_sub in DEFAULT_SUBSCRIPTIONS {
            match self.create_subscription(token, default_sub.event_type, default_sub.critical).await {
                Ok(()) => {}
                Err(e) => warn!(event_type = default_sub.event_type, error = %e, "default subscription failed"),
            }
        }
    }

    async fn cleanup_subscriptions(&self, token: &str) {
        let subs = self.registry.lock().unwrap().all();
        let semaphore = Arc::new(Semaphore::new(CLEANUP_CONCURRENCY));
        let mut handles = Vec::new();
        for sub in subs {
            let helix = self.helix.clone();
            let token = token.to_owned();
            let sem = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await;
                match tokio::time::timeout(CLEANUP_TIMEOUT, helix.delete_subscription(&token, &sub.id)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(id = %sub.id, error = %e, "failed to delete subscription during shutdown"),
                    Err(_) => warn!(id = %sub.id, "timed out deleting subscription during shutdown"),
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        self.registry.lock().unwrap().clear();
    }

    fn handle_notification(&self, notification: wire::Notification) {
        self.registry.lock().unwrap().record_seen(&notification.subscription_id, Utc::now());
        match runtime_validation::validate_event("twitch", &notification.event_type, &notification.event) {
            Ok(payload) => {
                let envelope = EventEnvelope::new("twitch", notification.event_type.clone(), payload);
                self.bus.publish(&topics::provider_event("twitch", &notification.event_type), envelope);
            }
            Err(e) => {
                warn!(event_type = notification.event_type, error = %e, "dropping notification that failed validation");
            }
        }
    }

    /// Drive a single transport connection until it reconnects, disconnects,
    /// or shutdown is requested.
    async fn drive_session(
        &self,
        token: &str,
        owner_rx: &mut mpsc::Receiver<TransportEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DriveResult {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return DriveResult::Shutdown;
                    }
                }
                event = owner_rx.recv() => {
                    let Some(event) = event else { return DriveResult::Disconnected };
                    match event {
                        TransportEvent::Connected | TransportEvent::Upgraded { .. } => {
                            self.set_phase(Phase::Upgrading);
                        }
                        TransportEvent::Message(Message::Text(text)) => {
                            match wire::parse(&text) {
                                Ok(EventSubMessage::Welcome(welcome)) => {
                                    {
                                        let mut state = self.state.write().unwrap();
                                        state.session_id = Some(welcome.session_id.clone());
                                        state.keepalive_timeout_seconds = welcome.keepalive_timeout_seconds;
                                        state.phase = Phase::Welcomed;
                                    }
                                    self.record_success();
                                    let known_subject = self.state.read().unwrap().subject.is_some();
                                    if known_subject {
                                        self.ensure_default_subscriptions(token).await;
                                    }
                                    self.set_phase(Phase::Ready);
                                    info!(session_id = welcome.session_id, "twitch session ready");
                                }
                                Ok(EventSubMessage::Notification(notification)) => {
                                    self.handle_notification(notification);
                                }
                                Ok(EventSubMessage::Reconnect(reconnect)) => {
                                    info!("twitch requested reconnect to new session url");
                                    return DriveResult::Reconnect(reconnect.reconnect_url);
                                }
                                Ok(EventSubMessage::Revocation(revocation)) => {
                                    warn!(subscription_id = revocation.subscription_id, status = revocation.status, "subscription revoked");
                                    self.registry.lock().unwrap().remove_by_id(&revocation.subscription_id);
                                }
                                Ok(EventSubMessage::Keepalive) => {}
                                Ok(EventSubMessage::Other(kind)) => {
                                    debug!(message_type = kind, "unrecognized eventsub message, ignoring");
                                }
                                Err(e) => {
                                    warn!(error = %e, "failed to parse eventsub message");
                                }
                            }
                        }
                        TransportEvent::Message(_) => {}
                        TransportEvent::Disconnected { reason } => {
                            debug!(?reason, "twitch transport disconnected");
                            self.record_error();
                            return DriveResult::Disconnected;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Connector for TwitchConnector {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> ExitReason {
        let mut shutdown = shutdown;
        let mut url = self.config.eventsub_url.clone();

        loop {
            if *shutdown.borrow() {
                return ExitReason::Shutdown;
            }

            self.set_phase(Phase::NoToken);
            let token = match self.token_manager.get_valid_token().await {
                Ok(t) => t,
                Err(e) => {
                    self.record_error();
                    warn!(error = %e, "twitch token unavailable, retrying");
                    if Self::sleep_or_shutdown(&mut shutdown, TOKEN_RETRY_BACKOFF).await {
                        return ExitReason::Shutdown;
                    }
                    continue;
                }
            };

            self.set_phase(Phase::Validating);
            match self.token_manager.validate(&token).await {
                Ok(info) => {
                    let mut state = self.state.write().unwrap();
                    state.subject = Some(info.subject);
                    state.scopes = info.scopes;
                }
                Err(e) => {
                    self.record_error();
                    warn!(error = %e, "twitch token validation failed, retrying");
                    if Self::sleep_or_shutdown(&mut shutdown, TOKEN_RETRY_BACKOFF).await {
                        return ExitReason::Shutdown;
                    }
                    continue;
                }
            }

            self.set_phase(Phase::Connecting);
            let (owner_tx, mut owner_rx) = mpsc::channel(128);
            let keepalive = Duration::from_secs(self.state.read().unwrap().keepalive_timeout_seconds);
            let transport = WebSocketTransport::new(url.clone(), owner_tx, keepalive);
            let headers = [("User-Agent", "twitch-connector/1.0"), ("Origin", "https://eventsub.wss.twitch.tv")];

            if let Err(e) = transport.connect(&headers).await {
                self.record_error();
                warn!(error = %e, "twitch transport connect failed");
                if matches!(e, TransportError::AuthRejected { .. }) {
                    let _ = self.token_manager.refresh().await;
                }
                if Self::sleep_or_shutdown(&mut shutdown, DISCONNECT_BACKOFF).await {
                    return ExitReason::Shutdown;
                }
                continue;
            }

            self.set_phase(Phase::Upgrading);
            let result = self.drive_session(&token, &mut owner_rx, &mut shutdown).await;
            transport.close().await;

            match result {
                DriveResult::Shutdown => {
                    self.set_phase(Phase::Disconnecting);
                    self.cleanup_subscriptions(&token).await;
                    return ExitReason::Shutdown;
                }
                DriveResult::Reconnect(new_url) => {
                    self.set_phase(Phase::ReconnectRequested);
                    {
                        let mut state = self.state.write().unwrap();
                        state.session_id = None;
                    }
                    url = new_url;
                    continue;
                }
                DriveResult::Disconnected => {
                    self.set_phase(Phase::Disconnecting);
                    {
                        let mut state = self.state.write().unwrap();
                        state.session_id = None;
                    }
                    if Self::sleep_or_shutdown(&mut shutdown, DISCONNECT_BACKOFF).await {
                        return ExitReason::Shutdown;
                    }
                    continue;
                }
            }
        }
    }

    fn get_status(&self) -> ConnectorStatus {
        // `full_state` detail is cached for up to 2s and invalidated on every
        // subscription change (see `create_subscription`), so a reader never
        // sees a subscription count more than 2s stale or one update behind,
        // whichever comes first.
        let detail = match self.status_cache.get("twitch", "full_state") {
            Some(cached) => cached,
            None => {
                let state = self.state.read().unwrap();
                let registry = self.registry.lock().unwrap();
                let detail = serde_json::json!({
                    "subject": state.subject,
                    "subscription_count": registry.count(),
                    "subscription_cost": registry.total_cost(),
                });
                self.status_cache.set("twitch", "full_state", detail.clone(), Duration::from_secs(2));
                detail
            }
        };

        let state = self.state.read().unwrap();
        ConnectorStatus {
            connector: "twitch".to_owned(),
            state: as_connection_state(state.phase),
            session_id: state.session_id.clone(),
            health: self.health.lock().unwrap().clone(),
            detail,
        }
    }
}

