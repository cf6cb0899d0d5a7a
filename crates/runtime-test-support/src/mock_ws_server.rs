//! A mock WebSocket server for connector integration tests.
//!
//! Binds to port 0 (random) and hands every accepted connection to a
//! shared `handler` closure: one JSON value in, an optional JSON value
//! out. Unlike a real upstream, this server also exposes `push`, which
//! fans an unsolicited message out to every currently connected client —
//! used to simulate Twitch reconnect notices, OBS unsolicited stats
//! responses, and the like.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;

type Handler = dyn Fn(Value) -> Option<Value> + Send + Sync;

/// A mock WebSocket endpoint for testing Twitch EventSub / OBS v5 clients.
pub struct MockWsServer {
    addr: SocketAddr,
    push_tx: broadcast::Sender<Message>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockWsServer {
    /// Start the server with `handler` applied to every text frame received
    /// from any client. Returning `None` sends nothing back for that frame.
    pub async fn start<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handler: Arc<Handler> = Arc::new(handler);
        let (push_tx, _) = broadcast::channel(64);
        let push_tx_for_task = push_tx.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let handler = handler.clone();
                        let push_rx = push_tx_for_task.subscribe();
                        tokio::spawn(async move {
                            let _ = Self::handle_connection(stream, handler, push_rx).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, push_tx, _task: task })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Broadcast an unsolicited message to every currently connected client.
    /// Silently does nothing if nobody is connected yet.
    pub fn push(&self, message: &Value) {
        let text = serde_json::to_string(message).expect("value serializes");
        let _ = self.push_tx.send(Message::Text(text.into()));
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        handler: Arc<Handler>,
        mut push_rx: broadcast::Receiver<Message>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                incoming = read.next() => {
                    let Some(msg_result) = incoming else { break };
                    match msg_result? {
                        Message::Text(text) => {
                            let value: Value = serde_json::from_str(&text)?;
                            if let Some(reply) = handler(value) {
                                let json = serde_json::to_string(&reply)?;
                                write.send(Message::Text(json.into())).await?;
                            }
                        }
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                pushed = push_rx.recv() => {
                    match pushed {
                        Ok(msg) => write.send(msg).await?,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn echoes_handler_response() {
        let server = MockWsServer::start(|req| {
            Some(json!({ "echo": req }))
        })
        .await
        .unwrap();

        let (mut ws, _) = connect_async(server.url()).await.unwrap();
        ws.send(Message::Text(json!({"hello": true}).to_string().into())).await.unwrap();

        let reply = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = reply else { panic!("expected text frame") };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({ "echo": { "hello": true } }));
    }

    #[tokio::test]
    async fn pushes_unsolicited_message_to_connected_client() {
        let server = MockWsServer::start(|_| None).await.unwrap();
        let (mut ws, _) = connect_async(server.url()).await.unwrap();
        // give the server a moment to register the accepted connection
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        server.push(&json!({ "notice": "reconnect" }));

        let reply = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = reply else { panic!("expected text frame") };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({ "notice": "reconnect" }));
    }
}
