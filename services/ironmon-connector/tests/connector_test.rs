use std::sync::Arc;
use std::time::Duration;

use bus_protocol::topics;
use ironmon_connector::{InMemoryChallengeStore, IronmonConnector};
use runtime_core::TopicBus;
use runtime_host::Connector;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

async fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

#[tokio::test]
async fn seed_then_checkpoint_records_attempt_and_publishes_events() {
    let addr = free_addr().await;
    let store = Arc::new(InMemoryChallengeStore::new());
    let bus = TopicBus::new();
    let (_handle, mut rx) = bus.subscribe(topics::IRONMON_EVENTS);

    let connector = Arc::new(IronmonConnector::new(addr.clone(), store.clone(), bus));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_connector = connector.clone();
    let run_task = tokio::spawn(async move { run_connector.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    let init = br#"{"type":"init","version":"1.0","game":2}"#;
    stream.write_all(format!("{} ", init.len()).as_bytes()).await.unwrap();
    stream.write_all(init).await.unwrap();

    let seed = br#"{"type":"seed","count":5}"#;
    stream.write_all(format!("{} ", seed.len()).as_bytes()).await.unwrap();
    stream.write_all(seed).await.unwrap();

    let checkpoint = br#"{"type":"checkpoint","id":1,"name":"Route 1"}"#;
    stream.write_all(format!("{} ", checkpoint.len()).as_bytes()).await.unwrap();
    stream.write_all(checkpoint).await.unwrap();

    let init_event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(init_event.event_type, "init");
    let seed_event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(seed_event.event_type, "seed");
    let checkpoint_event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(checkpoint_event.event_type, "checkpoint");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let attempt = store.attempt(0).expect("attempt 0 should have been started");
    assert_eq!(attempt.game, 2);
    assert_eq!(attempt.cleared_checkpoints, vec![(1, "Route 1".to_owned())]);

    drop(stream);
    let _ = shutdown_tx.send(true);
    let exit_reason = tokio::time::timeout(Duration::from_secs(2), run_task).await.unwrap().unwrap();
    assert!(matches!(exit_reason, runtime_host::ExitReason::Shutdown));
}

#[tokio::test]
async fn init_with_metadata_nested_fields_publishes_with_tcp_source() {
    let addr = free_addr().await;
    let store = Arc::new(InMemoryChallengeStore::new());
    let bus = TopicBus::new();
    let (_handle, mut rx) = bus.subscribe(topics::IRONMON_EVENTS);

    let connector = Arc::new(IronmonConnector::new(addr.clone(), store, bus));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_connector = connector.clone();
    let run_task = tokio::spawn(async move { run_connector.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let init = br#"{"type":"init","metadata":{"version":"1.0.0","game":1}}"#;
    stream.write_all(format!("{} ", init.len()).as_bytes()).await.unwrap();
    stream.write_all(init).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_type, "init");
    assert_eq!(event.source, "tcp");
    assert_eq!(event.payload["metadata"]["version"], "1.0.0");
    assert_eq!(event.payload["metadata"]["game"], 1);
    assert!(rx.try_recv().is_err(), "exactly one publication expected");

    drop(stream);
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task).await;
}

#[tokio::test]
async fn heartbeat_is_not_published() {
    let addr = free_addr().await;
    let store = Arc::new(InMemoryChallengeStore::new());
    let bus = TopicBus::new();
    let (_handle, mut rx) = bus.subscribe(topics::IRONMON_EVENTS);

    let connector = Arc::new(IronmonConnector::new(addr.clone(), store, bus));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_connector = connector.clone();
    let run_task = tokio::spawn(async move { run_connector.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let heartbeat = br#"{"type":"heartbeat"}"#;
    stream.write_all(format!("{} ", heartbeat.len()).as_bytes()).await.unwrap();
    stream.write_all(heartbeat).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err(), "heartbeat must not publish");

    drop(stream);
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task).await;
}

#[tokio::test]
async fn split_reads_across_packets_still_parse_correctly() {
    let addr = free_addr().await;
    let store = Arc::new(InMemoryChallengeStore::new());
    let bus = TopicBus::new();
    let (_handle, mut rx) = bus.subscribe(topics::IRONMON_EVENTS);

    let connector = Arc::new(IronmonConnector::new(addr.clone(), store, bus));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_connector = connector.clone();
    let run_task = tokio::spawn(async move { run_connector.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    let location = br#"{"type":"location","id":42}"#;
    let prefix = format!("{} ", location.len());
    stream.write_all(prefix.as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(&location[..10]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(&location[10..]).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_type, "location");
    assert_eq!(event.payload["id"], 42);

    drop(stream);
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task).await;
}
