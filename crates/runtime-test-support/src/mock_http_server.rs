//! A mock HTTP server for connector integration tests (Twitch subscription
//! API, Rainwave polling), built on axum the same way the timing system's
//! HTTP surface is, rather than a general-purpose mocking crate.
//!
//! Routes aren't declared up front; every request falls through to a single
//! handler that looks up a queued `(status, body)` response keyed by
//! `(method, path)`, so a test can script a sequence like "500 then 200" to
//! exercise retry behavior.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::Value;
use tokio::sync::Mutex;

/// A single captured inbound request, for assertions on what a connector sent.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Value,
}

type RouteKey = (Method, String);

struct ServerState {
    queued: Mutex<HashMap<RouteKey, VecDeque<(StatusCode, Value)>>>,
    default_response: Mutex<(StatusCode, Value)>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// A mock HTTP endpoint for testing Twitch's subscription API and Rainwave's
/// polling API without reaching the network.
pub struct MockHttpServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockHttpServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            queued: Mutex::new(HashMap::new()),
            default_response: Mutex::new((StatusCode::NOT_FOUND, serde_json::json!({ "error": "unscripted route" }))),
            requests: Mutex::new(Vec::new()),
        });

        let router = Router::new().fallback(handler).with_state(state.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self { addr, state, _task: task })
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queue a response to return the next time `method path` is requested.
    /// Multiple calls for the same route queue in order (FIFO).
    pub async fn queue_response(&self, method: Method, path: impl Into<String>, status: StatusCode, body: Value) {
        let mut queued = self.state.queued.lock().await;
        queued.entry((method, path.into())).or_default().push_back((status, body));
    }

    /// Set what unscripted requests get back. Defaults to 404.
    pub async fn set_default_response(&self, status: StatusCode, body: Value) {
        *self.state.default_response.lock().await = (status, body);
    }

    /// All requests received so far, in arrival order.
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().await.clone()
    }
}

async fn handler(State(state): State<Arc<ServerState>>, method: Method, uri: Uri, headers: HeaderMap, body: Body) -> Response {
    let path = uri.path().to_owned();
    let bytes = to_bytes(body, 10 * 1024 * 1024).await.unwrap_or_default();
    let body_value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    state.requests.lock().await.push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        headers,
        body: body_value,
    });

    let mut queued = state.queued.lock().await;
    let (status, response_body) = match queued.get_mut(&(method, path)).and_then(VecDeque::pop_front) {
        Some(scripted) => scripted,
        None => state.default_response.lock().await.clone(),
    };

    (status, axum::Json(response_body)).into_response()
}
