/*
[INPUT]:  Test configuration and mock relay requirements
[OUTPUT]: Shared test utilities, fixtures, and a scriptable mock relay server
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for market-relay-client tests

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use market_relay_client::{ReconnectPolicy, RelayConfig};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use wiremock::MockServer;

pub const WAIT: Duration = Duration::from_secs(5);

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Relay config with short delays and no heartbeat noise
pub fn fast_config(base_delay_ms: u64, max_attempts: u32) -> RelayConfig {
    RelayConfig {
        reconnect: ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            multiplier: 1.5,
            max_delay: Duration::from_millis(base_delay_ms * 10),
        },
        connect_timeout: Duration::from_secs(2),
        heartbeat_interval: None,
    }
}

/// URL on which nothing is listening
pub async fn unused_ws_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind free port");
    let addr = listener.local_addr().expect("free port addr");
    drop(listener);
    format!("ws://{addr}")
}

/// WebSocket server that hands every accepted session to the test
pub struct MockRelay {
    url: String,
    connections: mpsc::UnboundedReceiver<MockConnection>,
}

/// One accepted session on the mock relay
pub struct MockConnection {
    inbound: mpsc::UnboundedReceiver<Value>,
    outbound: mpsc::UnboundedSender<Option<String>>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock relay");
        let addr = listener.local_addr().expect("mock relay addr");
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();
                    let (in_tx, in_rx) = mpsc::unbounded_channel();
                    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Option<String>>();
                    if conn_tx
                        .send(MockConnection {
                            inbound: in_rx,
                            outbound: out_tx,
                        })
                        .is_err()
                    {
                        return;
                    }

                    loop {
                        tokio::select! {
                            outbound = out_rx.recv() => {
                                match outbound {
                                    Some(Some(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    // abrupt drop: no closing handshake
                                    Some(None) | None => break,
                                }
                            }
                            incoming = read.next() => {
                                match incoming {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                                            let _ = in_tx.send(value);
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}"),
            connections: conn_rx,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn next_connection(&mut self) -> MockConnection {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a relay connection")
            .expect("mock relay stopped")
    }

    pub async fn try_next_connection(&mut self, wait: Duration) -> Option<MockConnection> {
        timeout(wait, self.connections.recv()).await.ok().flatten()
    }
}

impl MockConnection {
    pub fn send(&self, frame: Value) {
        let _ = self.outbound.send(Some(frame.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.outbound.send(Some(text.to_string()));
    }

    /// Drop the TCP connection without a close frame
    pub fn drop_connection(&self) {
        let _ = self.outbound.send(None);
    }

    pub async fn next_frame(&mut self) -> Value {
        timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("connection closed")
    }

    /// Everything the client sends within `wait`
    pub async fn frames_within(&mut self, wait: Duration) -> Vec<Value> {
        let mut frames = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.inbound.recv()).await {
            frames.push(frame);
        }
        frames
    }
}
