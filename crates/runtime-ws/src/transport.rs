//! WebSocket Transport (C7).
//!
//! Each transport owns exactly one connection and is driven by a single
//! background task — mirroring the forwarder's `UplinkSession`, except the
//! read loop here posts every frame back to an owner channel instead of
//! returning it from a blocking `recv`, since several connectors (not just
//! one request/response client) share this transport.

use bus_protocol::ErrorKind;
use futures_util::{SinkExt, StreamExt};
use runtime_core::RetryClassify;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOUDFRONT_MAX_RETRIES: u32 = 2;
const ALTERNATE_USER_AGENTS: [&str; CLOUDFRONT_MAX_RETRIES as usize] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15",
];
const ALTERNATE_ORIGINS: [&str; CLOUDFRONT_MAX_RETRIES as usize] =
    ["https://www.twitch.tv", "https://dashboard.twitch.tv"];

/// Notifications the transport's background task pushes to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Message(Message),
    Disconnected { reason: DisconnectReason },
    Upgraded { response_headers: HashMap<String, String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Normal,
    RemoteClosed,
    KeepaliveTimeout,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("upgrade rejected with status {status}: {body_prefix}")]
    UpgradeRejected { status: u16, body_prefix: String },
    #[error("authorization rejected with status {status}")]
    AuthRejected { status: u16 },
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transport is not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl RetryClassify for TransportError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            TransportError::Connect(_) | TransportError::SendFailed(_) => ErrorKind::Network,
            TransportError::UpgradeRejected { .. } => ErrorKind::Protocol,
            TransportError::AuthRejected { status: 401 } => ErrorKind::AuthExpired,
            TransportError::AuthRejected { .. } => ErrorKind::AuthDenied,
            TransportError::RateLimited { .. } => ErrorKind::RateLimited,
            TransportError::NotConnected => ErrorKind::Internal,
        }
    }

    fn retry_after_hint(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

enum Command {
    Send(Message),
    Close,
}

struct Live {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// A single-connection WebSocket transport. `new` binds configuration;
/// `connect` performs the handshake and spawns the owning task.
pub struct WebSocketTransport {
    url: String,
    owner: mpsc::Sender<TransportEvent>,
    keepalive_timeout: Duration,
    live: Mutex<Option<Live>>,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(url: impl Into<String>, owner: mpsc::Sender<TransportEvent>, keepalive_timeout: Duration) -> Self {
        Self { url: url.into(), owner, keepalive_timeout, live: Mutex::new(None) }
    }

    /// Dial, perform the HTTP upgrade with `headers`, and spawn the frame
    /// loop. Resolves once the handshake completes (or fails).
    pub async fn connect(&self, headers: &[(&str, &str)]) -> Result<(), TransportError> {
        let mut attempt_headers: Vec<(String, String)> =
            headers.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();

        let mut last_err = None;
        for attempt in 0..=CLOUDFRONT_MAX_RETRIES {
            match self.try_connect_once(&attempt_headers).await {
                Ok((stream, response_headers)) => {
                    self.spawn_owning_task(stream).await;
                    let _ = self.owner.send(TransportEvent::Connected).await;
                    let _ = self.owner.send(TransportEvent::Upgraded { response_headers }).await;
                    return Ok(());
                }
                Err(TransportError::UpgradeRejected { status: 400, body_prefix })
                    if looks_like_cloudfront(&body_prefix) && attempt < CLOUDFRONT_MAX_RETRIES =>
                {
                    let idx = attempt as usize;
                    info!(attempt, "CDN rejected upgrade, retrying with alternate headers");
                    set_header(&mut attempt_headers, "User-Agent", ALTERNATE_USER_AGENTS[idx]);
                    set_header(&mut attempt_headers, "Origin", ALTERNATE_ORIGINS[idx]);
                    last_err = Some(TransportError::UpgradeRejected { status: 400, body_prefix });
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(TransportError::Connect("exhausted CDN retries".into())))
    }

    async fn try_connect_once(&self, headers: &[(String, String)]) -> Result<(WsStream, HashMap<String, String>), TransportError> {
        let mut request =
            self.url.clone().into_client_request().map_err(|e| TransportError::Connect(e.to_string()))?;
        for (name, value) in headers {
            let header_value =
                value.parse().map_err(|_| TransportError::Connect(format!("invalid header value for {name}")))?;
            request.headers_mut().insert(
                http_header_name(name).map_err(|_| TransportError::Connect(format!("invalid header name {name}")))?,
                header_value,
            );
        }

        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, response)) => {
                let response_headers = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_owned())))
                    .collect();
                Ok((stream, response_headers))
            }
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                let body_prefix = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(&b[..b.len().min(256)]).into_owned())
                    .unwrap_or_default();
                match status {
                    401 | 403 => Err(TransportError::AuthRejected { status }),
                    429 => {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(Duration::from_secs);
                        Err(TransportError::RateLimited { retry_after })
                    }
                    _ => Err(TransportError::UpgradeRejected { status, body_prefix }),
                }
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }

    async fn spawn_owning_task(&self, stream: WsStream) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let owner = self.owner.clone();
        let keepalive_timeout = self.keepalive_timeout;
        let task = tokio::spawn(run_frame_loop(stream, cmd_rx, owner, keepalive_timeout));
        *self.live.lock().await = Some(Live { cmd_tx, task });
    }

    /// Best-effort write. Returns `SendFailed` if the command channel (and
    /// therefore the connection) is already gone.
    pub async fn send(&self, frame: Message) -> Result<(), TransportError> {
        let live = self.live.lock().await;
        match live.as_ref() {
            Some(live) => live
                .cmd_tx
                .send(Command::Send(frame))
                .await
                .map_err(|_| TransportError::SendFailed("connection closed".into())),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Close the connection. Idempotent; a no-op if never connected.
    pub async fn close(&self) {
        let live = self.live.lock().await.take();
        if let Some(live) = live {
            let _ = live.cmd_tx.send(Command::Close).await;
            let _ = live.task.await;
        }
    }
}

async fn run_frame_loop(
    mut stream: WsStream,
    mut cmd_rx: mpsc::Receiver<Command>,
    owner: mpsc::Sender<TransportEvent>,
    keepalive_timeout: Duration,
) {
    let mut last_seen = Instant::now();
    let keepalive_deadline = keepalive_timeout.saturating_mul(2);
    let mut ticker = tokio::time::interval(keepalive_timeout);

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send(msg)) => {
                        if let Err(e) = stream.send(msg).await {
                            break DisconnectReason::Error(e.to_string());
                        }
                    }
                    Some(Command::Close) => {
                        let _ = stream.close(None).await;
                        break DisconnectReason::Normal;
                    }
                    None => {
                        let _ = stream.close(None).await;
                        break DisconnectReason::Normal;
                    }
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        let _ = stream.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        break DisconnectReason::RemoteClosed;
                    }
                    Some(Ok(msg)) => {
                        last_seen = Instant::now();
                        if owner.send(TransportEvent::Message(msg)).await.is_err() {
                            break DisconnectReason::Normal;
                        }
                    }
                    Some(Err(e)) => {
                        break DisconnectReason::Error(e.to_string());
                    }
                    None => {
                        break DisconnectReason::RemoteClosed;
                    }
                }
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() > keepalive_deadline {
                    warn!("keepalive timeout, no frames received");
                    break DisconnectReason::KeepaliveTimeout;
                }
            }
        }
    };
    debug!(?reason, "transport frame loop exiting");
    let _ = owner.send(TransportEvent::Disconnected { reason }).await;
}

fn looks_like_cloudfront(body_prefix: &str) -> bool {
    let lower = body_prefix.to_lowercase();
    lower.contains("cloudfront") || lower.contains("request could not be satisfied")
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(entry) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        entry.1 = value.to_owned();
    } else {
        headers.push((name.to_owned(), value.to_owned()));
    }
}

fn http_header_name(name: &str) -> Result<tokio_tungstenite::tungstenite::http::HeaderName, tokio_tungstenite::tungstenite::http::header::InvalidHeaderName> {
    name.parse()
}
