mod config;
mod observability;

use ironmon_connector::{InMemoryChallengeStore, IronmonConnector};
use obs_connector::ObsConnector;
use observability::StatusSource;
use rainwave_poller::{RainwaveClient, RainwaveConnector};
use runtime_auth::{TokenManager, TokenStore};
use runtime_core::{StatusCache, TopicBus};
use runtime_host::{RestartPolicy, ServiceHost};
use std::sync::Arc;
use tracing::{error, warn};
use twitch_connector::{TwitchConnector, TwitchOAuthProvider};

#[tokio::main]
async fn main() {
    observability::init_tracing();

    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "bootstrap failed, exiting");
            std::process::exit(1);
        }
    };

    let bus = TopicBus::new();
    let status_cache = StatusCache::new();
    let mut sources: Vec<Arc<dyn StatusSource>> = Vec::new();

    if let Some(twitch_config) = config.twitch {
        let http_client = reqwest::Client::new();
        let provider = Arc::new(TwitchOAuthProvider::new(http_client, &twitch_config));
        let token_store = TokenStore::new(config.token_store_path.clone());
        let token_manager = Arc::new(TokenManager::new(token_store, provider));
        if let Err(e) = token_manager.load().await {
            warn!(error = %e, "failed to load persisted twitch token, connector starts unauthenticated");
        }
        let connector = Arc::new(TwitchConnector::new(twitch_config, token_manager, bus.clone(), status_cache.clone()));
        let host = Arc::new(ServiceHost::new(connector, RestartPolicy::default()));
        host.start().await;
        sources.push(host as Arc<dyn StatusSource>);
    }

    let obs_connector = Arc::new(ObsConnector::new(config.obs, bus.clone()));
    let obs_host = Arc::new(ServiceHost::new(obs_connector, RestartPolicy::default()));
    obs_host.start().await;
    sources.push(obs_host as Arc<dyn StatusSource>);

    let ironmon_store = Arc::new(InMemoryChallengeStore::new());
    let ironmon_connector = Arc::new(IronmonConnector::new(config.ironmon_bind, ironmon_store, bus.clone()));
    let ironmon_host = Arc::new(ServiceHost::new(ironmon_connector, RestartPolicy::default()));
    ironmon_host.start().await;
    sources.push(ironmon_host as Arc<dyn StatusSource>);

    let rainwave_client = RainwaveClient::new(reqwest::Client::new(), &config.rainwave);
    let rainwave_connector = Arc::new(RainwaveConnector::new(config.rainwave, rainwave_client, bus.clone()));
    let rainwave_host = Arc::new(ServiceHost::new(rainwave_connector, RestartPolicy::default()));
    rainwave_host.start().await;
    sources.push(rainwave_host as Arc<dyn StatusSource>);

    let router = observability::router(sources, status_cache);
    if let Err(e) = observability::serve(&config.status_bind, router, shutdown_signal()).await {
        error!(error = %e, "status http server exited unexpectedly");
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received Ctrl+C, shutting down"); },
        _ = terminate => { tracing::info!("received SIGTERM, shutting down"); },
    }
}
