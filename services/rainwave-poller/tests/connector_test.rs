use std::time::Duration;

use bus_protocol::topics;
use rainwave_poller::{RainwaveClient, RainwaveConfig, RainwaveConnector};
use runtime_core::TopicBus;
use runtime_host::Connector;
use runtime_test_support::MockHttpServer;

fn config_for(base_url: String) -> RainwaveConfig {
    let mut config = RainwaveConfig::new(Some("secret-key".to_owned()), Some("42".to_owned()));
    config.base_url = base_url;
    config.poll_interval = Duration::from_millis(50);
    config
}

#[tokio::test]
async fn song_change_publishes_rainwave_update() {
    let server = MockHttpServer::start().await.unwrap();
    server
        .queue_response(
            reqwest::Method::POST,
            "/info",
            reqwest::StatusCode::OK,
            serde_json::json!({
                "user": { "id": 42 },
                "station_name": "Game",
                "sched_current": { "songs": [{ "title": "Song One" }] },
            }),
        )
        .await;
    server
        .queue_response(
            reqwest::Method::POST,
            "/info",
            reqwest::StatusCode::OK,
            serde_json::json!({
                "user": { "id": 42 },
                "station_name": "Game",
                "sched_current": { "songs": [{ "title": "Song Two" }] },
            }),
        )
        .await;

    let config = config_for(server.base_url());
    let client = RainwaveClient::new(reqwest::Client::new(), &config);
    let bus = TopicBus::new();
    let (_handle, mut rx) = bus.subscribe(topics::RAINWAVE_UPDATE);

    let connector = RainwaveConnector::new(config, client, bus);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_task = tokio::spawn(async move { connector.run(shutdown_rx).await });

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload["song"], "Song One");
    assert_eq!(first.payload["listening"], true);

    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.payload["song"], "Song Two");

    let _ = shutdown_tx.send(true);
    let exit_reason = tokio::time::timeout(Duration::from_secs(2), run_task).await.unwrap().unwrap();
    assert!(matches!(exit_reason, runtime_host::ExitReason::Shutdown));
}

#[tokio::test]
async fn missing_credentials_disables_the_connector_without_polling() {
    let server = MockHttpServer::start().await.unwrap();
    let mut config = RainwaveConfig::new(None, None);
    config.base_url = server.base_url();
    config.poll_interval = Duration::from_millis(20);

    let client = RainwaveClient::new(reqwest::Client::new(), &config);
    let bus = TopicBus::new();
    let connector = RainwaveConnector::new(config, client, bus);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_task = tokio::spawn(async move { connector.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.requests().await.is_empty(), "a disabled poller must never issue a request");

    let _ = shutdown_tx.send(true);
    let exit_reason = tokio::time::timeout(Duration::from_secs(2), run_task).await.unwrap().unwrap();
    assert!(matches!(exit_reason, runtime_host::ExitReason::Shutdown));
}

#[tokio::test]
async fn unchanged_response_does_not_republish() {
    let server = MockHttpServer::start().await.unwrap();
    server
        .set_default_response(
            reqwest::StatusCode::OK,
            serde_json::json!({
                "user": { "id": 42 },
                "station_name": "Game",
                "sched_current": { "songs": [{ "title": "Same Song" }] },
            }),
        )
        .await;

    let config = config_for(server.base_url());
    let client = RainwaveClient::new(reqwest::Client::new(), &config);
    let bus = TopicBus::new();
    let (_handle, mut rx) = bus.subscribe(topics::RAINWAVE_UPDATE);

    let connector = RainwaveConnector::new(config, client, bus);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_task = tokio::spawn(async move { connector.run(shutdown_rx).await });

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload["song"], "Same Song");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err(), "identical polls must not republish");

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task).await;
}
