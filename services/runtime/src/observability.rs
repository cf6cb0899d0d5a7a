//! Observability (C15): a single `tracing-subscriber` install at process
//! start, plus the local status HTTP surface (§4.13).

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use bus_protocol::ConnectorStatus;
use runtime_core::StatusCache;
use runtime_host::{Connector, ServiceHost};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber from `RUST_LOG`, defaulting to
/// `info`. Called exactly once, at process start.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Type-erased status source so `/status` can aggregate connectors of
/// different concrete types behind one `ServiceHost<C>` each.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> ConnectorStatus;
}

impl<C: Connector> StatusSource for ServiceHost<C> {
    fn status(&self) -> ConnectorStatus {
        self.get_status()
    }
}

#[derive(Clone)]
struct AppState {
    sources: Arc<Vec<Arc<dyn StatusSource>>>,
    status_cache: StatusCache,
}

/// Build the `/healthz` + `/status` router (§4.13). `/healthz` is always
/// 200 while the process runs; it never reflects connector connectivity.
#[must_use]
pub fn router(sources: Vec<Arc<dyn StatusSource>>, status_cache: StatusCache) -> Router {
    let state = AppState { sources: Arc::new(sources), status_cache };
    Router::new().route("/healthz", get(healthz)).route("/status", get(status)).with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let connectors: Vec<ConnectorStatus> = state.sources.iter().map(|s| s.status()).collect();
    Json(serde_json::json!({
        "connectors": connectors,
        "status_cache": state.status_cache.stats(),
    }))
}

pub async fn serve(
    bind: &str,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "status http listening");
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}
