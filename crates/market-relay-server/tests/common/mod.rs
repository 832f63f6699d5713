/*
[INPUT]:  Relay server configuration for tests
[OUTPUT]: Running relay instances, raw WebSocket peers and polling helpers
[POS]:    Test utilities - shared across server integration tests
[UPDATE]: When adding new test helpers or changing server startup
*/

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use market_relay_server::{RelayHub, RelayServer, RelayServerConfig, RelayStats, UpstreamConfig};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestRelay {
    pub url: String,
    pub hub: RelayHub,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

pub async fn start_relay(upstream: Option<UpstreamConfig>) -> TestRelay {
    let config = RelayServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        welcome_message: "test relay".to_string(),
        upstream,
    };
    let shutdown = CancellationToken::new();
    let server = RelayServer::bind(config, shutdown.clone())
        .await
        .expect("bind relay");
    let url = format!("ws://{}", server.local_addr().expect("local addr"));
    let hub = server.hub();
    let handle = tokio::spawn(server.run());
    TestRelay {
        url,
        hub,
        shutdown,
        handle,
    }
}

/// Poll hub stats until `predicate` holds
pub async fn wait_for_stats(hub: &RelayHub, predicate: impl Fn(&RelayStats) -> bool) -> RelayStats {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(stats) = hub.stats().await {
                if predicate(&stats) {
                    return stats;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("hub stats condition not reached")
}

/// Plain WebSocket peer speaking JSON text frames
pub struct RawPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawPeer {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("connect to relay");
        Self { ws }
    }

    pub async fn send(&mut self, frame: Value) {
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("send frame");
    }

    pub async fn next_json(&mut self) -> Value {
        next_json(&mut self.ws).await
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Stand-in for the Binance combined stream
pub struct MockUpstream {
    pub url: String,
    listener: TcpListener,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let url = format!("ws://{}", listener.local_addr().expect("upstream addr"));
        Self { url, listener }
    }

    pub fn config(&self) -> UpstreamConfig {
        UpstreamConfig {
            url: self.url.clone(),
            max_attempts: 3,
            base_delay_ms: 20,
            multiplier: 1.5,
            max_delay_ms: 200,
        }
    }

    pub async fn accept(&self) -> WebSocketStream<TcpStream> {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("relay connected upstream")
            .expect("accept upstream connection");
        accept_async(stream).await.expect("upstream handshake")
    }
}

pub async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(text.as_str()).expect("json frame");
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("frame within timeout")
}
