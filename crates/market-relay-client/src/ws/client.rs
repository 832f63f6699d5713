/*
[INPUT]:  Relay WebSocket URL, subscriptions and update handlers
[OUTPUT]: One managed relay session with reconnect, replay and routed updates
[POS]:    WebSocket layer - connection manager and subscription front end
[UPDATE]: When changing reconnect semantics, heartbeat, or the session loop
*/

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use super::config::RelayConfig;
use super::message::ClientFrame;
use super::router::MessageRouter;
use super::subscription::{SubscriptionKey, SubscriptionRegistry, UpdateHandler};
use crate::error::{RelayError, Result};
use crate::types::{Channel, ConnectionState};

const SUBSCRIPTION_LOG_LIMIT: usize = 10;

const CLOSED_STREAM_LOG_EVERY: usize = 100;

static SUBSCRIBE_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static CLOSED_STREAM_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

pub type ConnectionHook = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&RelayError) + Send + Sync>;

/// Lifecycle callbacks registered by the host application
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    on_connect: Option<ConnectionHook>,
    on_disconnect: Option<ConnectionHook>,
    on_error: Option<ErrorHook>,
    on_fatal: Option<ErrorHook>,
}

impl ConnectionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after every successful open, once the replay frames are queued
    pub fn on_connect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Called when an established session drops unexpectedly
    pub fn on_disconnect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Called for transport failures (handshake or live socket)
    pub fn on_error(mut self, hook: impl Fn(&RelayError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Called once automatic reconnection has given up
    pub fn on_fatal(mut self, hook: impl Fn(&RelayError) + Send + Sync + 'static) -> Self {
        self.on_fatal = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_fatal", &self.on_fatal.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    Caller,
    Reconnect,
}

#[derive(Debug)]
enum SessionEnd {
    Local,
    Remote,
    Failed(RelayError),
}

#[derive(Debug, Default)]
struct SessionState {
    connection: ConnectionState,
    url: Option<String>,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    /// Bumped whenever a session is opened or torn down
    generation: u64,
    registry: SubscriptionRegistry,
    attempts: u32,
    exhausted: bool,
    manual_disconnect: bool,
    reconnect_task: Option<JoinHandle<()>>,
}

impl SessionState {
    fn live_outbound(&self) -> Option<mpsc::UnboundedSender<WsMessage>> {
        if self.connection.is_connected() {
            self.outbound.clone()
        } else {
            None
        }
    }
}

struct Inner {
    config: RelayConfig,
    hooks: ConnectionHooks,
    router: MessageRouter,
    state: Mutex<SessionState>,
    connect_lock: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Client side of the market data relay.
///
/// Owns at most one transport session at a time. Subscriptions are kept in a
/// registry that outlives sessions and is replayed after every reconnect.
/// Clones share the same session; `disconnect` is the explicit teardown.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_hooks(config, ConnectionHooks::default())
    }

    pub fn with_hooks(config: RelayConfig, hooks: ConnectionHooks) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                hooks,
                router: MessageRouter::new(),
                state: Mutex::new(SessionState::default()),
                connect_lock: Mutex::new(()),
                state_tx,
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection state changes
    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether automatic reconnection has given up
    pub async fn is_exhausted(&self) -> bool {
        self.inner.state.lock().await.exhausted
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().await.attempts
    }

    /// Keys currently wanted, sorted
    pub async fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        let state = self.inner.state.lock().await;
        let mut keys: Vec<SubscriptionKey> = state.registry.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Open the relay session. Resolves immediately when already connected.
    pub async fn connect(&self, url: &str) -> Result<()> {
        self.open_session(url.to_string(), ConnectOrigin::Caller).await
    }

    /// Close the session without scheduling a reconnect
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.manual_disconnect = true;
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        state.generation = state.generation.wrapping_add(1);
        state.outbound = None;
        state.connection = ConnectionState::Disconnected;
        self.publish_state(ConnectionState::Disconnected);
        info!("relay disconnected by request");
    }

    /// Best-effort heartbeat. Returns whether a ping was queued.
    pub async fn ping(&self) -> bool {
        let state = self.inner.state.lock().await;
        let Some(outbound) = state.live_outbound() else {
            debug!("relay ping skipped: not connected");
            return false;
        };
        let frame = ClientFrame::ping(chrono::Utc::now().timestamp_millis());
        match send_frame(&outbound, &frame) {
            Ok(()) => {
                debug!("relay ping sent");
                true
            }
            Err(err) => {
                debug!(error = %err, "relay ping not sent");
                false
            }
        }
    }

    /// Register `handler` for a key and ask the relay to start streaming it
    pub async fn subscribe<F>(
        &self,
        channel: Channel,
        symbol: &str,
        interval: Option<&str>,
        handler: F,
    ) -> Result<SubscriptionKey>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscribe_handler(channel, symbol, interval, Arc::new(handler))
            .await
    }

    /// Like `subscribe`, but updates are forwarded into a channel.
    ///
    /// Dropping the receiver does not end the subscription; call `unsubscribe`
    /// to stop the relay streaming the key.
    pub async fn subscribe_stream(
        &self,
        channel: Channel,
        symbol: &str,
        interval: Option<&str>,
    ) -> Result<mpsc::UnboundedReceiver<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = stream_handler(SubscriptionKey::new(channel, symbol, interval), tx);
        self.subscribe_handler(channel, symbol, interval, handler)
            .await?;
        Ok(rx)
    }

    pub async fn subscribe_handler(
        &self,
        channel: Channel,
        symbol: &str,
        interval: Option<&str>,
        handler: UpdateHandler,
    ) -> Result<SubscriptionKey> {
        let key = SubscriptionKey::new(channel, symbol, interval);
        let mut state = self.inner.state.lock().await;
        let Some(outbound) = state.live_outbound() else {
            error!(key = %key, "subscribe rejected: relay not connected");
            return Err(RelayError::NotConnected {
                operation: "subscribe",
            });
        };

        let replaced = state.registry.insert(key.clone(), handler);
        if replaced {
            debug!(key = %key, "subscription handler replaced");
        }

        let frame = ClientFrame::subscribe(&key);
        match send_frame(&outbound, &frame) {
            Ok(()) => log_subscription_sent("subscribe", &key),
            Err(err) => {
                // kept in the registry; the next session replays it
                warn!(key = %key, error = %err, "subscribe frame not sent");
            }
        }
        Ok(key)
    }

    /// Drop a subscription. Returns `false` when the key was not registered.
    pub async fn unsubscribe(&self, channel: Channel, symbol: &str, interval: Option<&str>) -> bool {
        let key = SubscriptionKey::new(channel, symbol, interval);
        let mut state = self.inner.state.lock().await;
        if !state.registry.remove(&key) {
            debug!(key = %key, "unsubscribe ignored: key not registered");
            return false;
        }

        if let Some(outbound) = state.live_outbound() {
            match send_frame(&outbound, &ClientFrame::unsubscribe(&key)) {
                Ok(()) => log_subscription_sent("unsubscribe", &key),
                Err(err) => warn!(key = %key, error = %err, "unsubscribe frame not sent"),
            }
        }
        true
    }

    /// Drop every subscription with a single cancel-all frame
    pub async fn unsubscribe_all(&self) {
        let mut state = self.inner.state.lock().await;
        let dropped = state.registry.len();
        state.registry.clear();

        if let Some(outbound) = state.live_outbound() {
            if let Err(err) = send_frame(&outbound, &ClientFrame::unsubscribe_all()) {
                warn!(error = %err, "unsubscribe-all frame not sent");
            }
        }
        info!(dropped, "relay subscriptions cleared");
    }

    fn open_session(&self, url: String, origin: ConnectOrigin) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move { this.open_session_inner(url, origin).await }.boxed()
    }

    async fn open_session_inner(&self, url: String, origin: ConnectOrigin) -> Result<()> {
        let _serial = self.inner.connect_lock.lock().await;

        let generation = {
            let mut state = self.inner.state.lock().await;
            if state.connection.is_connected() {
                debug!("relay connect skipped: already connected");
                return Ok(());
            }
            match origin {
                ConnectOrigin::Caller => {
                    state.manual_disconnect = false;
                    if let Some(task) = state.reconnect_task.take() {
                        task.abort();
                    }
                    if state.exhausted {
                        state.exhausted = false;
                        state.attempts = 0;
                    }
                }
                ConnectOrigin::Reconnect => {
                    if state.manual_disconnect {
                        debug!("relay reconnect skipped: disconnected by request");
                        return Ok(());
                    }
                }
            }

            // tear down whatever stale session is left
            state.outbound = None;
            state.generation = state.generation.wrapping_add(1);
            state.url = Some(url.clone());
            state.connection = ConnectionState::Connecting;
            self.publish_state(ConnectionState::Connecting);
            state.generation
        };

        info!(url = %url, attempt = ?origin, "connecting to market relay");
        let timeout = self.inner.config.connect_timeout;
        let stream = match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => {
                return Err(self
                    .handle_connect_failure(generation, RelayError::from(err))
                    .await);
            }
            Err(_) => {
                let err = RelayError::timeout(timeout);
                return Err(self.handle_connect_failure(generation, err).await);
            }
        };

        let (write, read) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let replayed = {
            let mut state = self.inner.state.lock().await;
            if state.generation != generation {
                debug!("relay session superseded during handshake");
                return Err(RelayError::Transport(
                    "connection torn down before it opened".to_string(),
                ));
            }
            state.outbound = Some(outbound_tx.clone());
            state.connection = ConnectionState::Connected;
            state.attempts = 0;
            state.exhausted = false;
            state.reconnect_task = None;

            // queued before the lock drops so later (un)subscribe frames follow the replay
            let mut replayed = 0;
            for frame in state.registry.replay_frames() {
                if let Err(err) = send_frame(&outbound_tx, &frame) {
                    warn!(error = %err, "subscription replay interrupted");
                    break;
                }
                replayed += 1;
            }
            self.publish_state(ConnectionState::Connected);
            replayed
        };

        tokio::spawn(self.clone().run_session(generation, write, read, outbound_rx));
        info!(url = %url, replay = replayed, "market relay connected");

        if let Some(hook) = &self.inner.hooks.on_connect {
            hook();
        }
        Ok(())
    }

    async fn handle_connect_failure(&self, generation: u64, err: RelayError) -> RelayError {
        warn!(error = %err, "market relay connect failed");
        self.emit_error(&err);

        let fatal = {
            let mut state = self.inner.state.lock().await;
            if state.generation != generation {
                return err;
            }
            state.connection = ConnectionState::Disconnected;
            self.publish_state(ConnectionState::Disconnected);
            if state.manual_disconnect {
                None
            } else {
                self.schedule_reconnect(&mut state)
            }
        };

        if let Some(fatal) = fatal {
            self.emit_fatal(&fatal);
        }
        err
    }

    async fn run_session(
        self,
        generation: u64,
        mut write: WsSink,
        mut read: WsSource,
        mut outbound_rx: mpsc::UnboundedReceiver<WsMessage>,
    ) {
        let mut heartbeat = self.inner.config.heartbeat_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let end = loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(message) => {
                            if let Err(err) = write.send(message).await {
                                break SessionEnd::Failed(err.into());
                            }
                        }
                        None => {
                            let _ = write.send(WsMessage::Close(None)).await;
                            break SessionEnd::Local;
                        }
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Close(_))) | None => break SessionEnd::Remote,
                        Some(Ok(message)) => self.handle_inbound(message).await,
                        Some(Err(err)) => break SessionEnd::Failed(err.into()),
                    }
                }
                _ = next_heartbeat(&mut heartbeat) => {
                    let frame = ClientFrame::ping(chrono::Utc::now().timestamp_millis());
                    match frame.to_json() {
                        Ok(text) => {
                            if let Err(err) = write.send(WsMessage::Text(text.into())).await {
                                break SessionEnd::Failed(err.into());
                            }
                            debug!("relay heartbeat sent");
                        }
                        Err(err) => warn!(error = %err, "heartbeat frame encode failed"),
                    }
                }
            }
        };

        match &end {
            SessionEnd::Local => debug!("relay session closed locally"),
            SessionEnd::Remote => warn!("relay session closed by peer"),
            SessionEnd::Failed(err) => {
                warn!(error = %err, "relay session failed");
                self.emit_error(err);
            }
        }
        self.handle_session_closed(generation).await;
    }

    async fn handle_inbound(&self, message: WsMessage) {
        let route = {
            let state = self.inner.state.lock().await;
            self.inner.router.route(message, &state.registry)
        };
        route.dispatch();
    }

    async fn handle_session_closed(&self, generation: u64) {
        let (was_connected, fatal) = {
            let mut state = self.inner.state.lock().await;
            if state.generation != generation {
                debug!("stale relay session ended");
                return;
            }
            state.outbound = None;
            let was_connected = state.connection.is_connected();
            state.connection = ConnectionState::Disconnected;
            self.publish_state(ConnectionState::Disconnected);
            let fatal = if state.manual_disconnect {
                None
            } else {
                self.schedule_reconnect(&mut state)
            };
            (was_connected, fatal)
        };

        if was_connected {
            if let Some(hook) = &self.inner.hooks.on_disconnect {
                hook();
            }
        }
        if let Some(fatal) = fatal {
            self.emit_fatal(&fatal);
        }
    }

    /// Arm the reconnect timer, or report exhaustion
    fn schedule_reconnect(&self, state: &mut SessionState) -> Option<RelayError> {
        let policy = &self.inner.config.reconnect;
        if policy.is_exhausted(state.attempts) {
            state.exhausted = true;
            error!(
                attempts = state.attempts,
                max_attempts = policy.max_attempts,
                "market relay reconnect attempts exhausted"
            );
            return Some(RelayError::ReconnectExhausted {
                attempts: state.attempts,
            });
        }
        let Some(url) = state.url.clone() else {
            return None;
        };

        state.attempts += 1;
        let attempt = state.attempts;
        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "market relay reconnect scheduled"
        );

        let this = self.clone();
        state.reconnect_task = Some(tokio::spawn(async move {
            this.reconnect_after(delay, url).await;
        }));
        None
    }

    async fn reconnect_after(self, delay: Duration, url: String) {
        tokio::time::sleep(delay).await;
        {
            let state = self.inner.state.lock().await;
            if state.manual_disconnect || state.connection != ConnectionState::Disconnected {
                debug!(state = ?state.connection, "relay reconnect no longer needed");
                return;
            }
        }
        if let Err(err) = self.open_session(url, ConnectOrigin::Reconnect).await {
            debug!(error = %err, "relay reconnect attempt failed");
        }
    }

    fn publish_state(&self, state: ConnectionState) {
        self.inner.state_tx.send_replace(state);
    }

    fn emit_error(&self, err: &RelayError) {
        if let Some(hook) = &self.inner.hooks.on_error {
            hook(err);
        }
    }

    fn emit_fatal(&self, err: &RelayError) {
        if let Some(hook) = &self.inner.hooks.on_fatal {
            hook(err);
        }
    }
}

impl fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayClient")
            .field("config", &self.inner.config)
            .field("hooks", &self.inner.hooks)
            .field("state", &self.state())
            .finish()
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn send_frame(outbound: &mpsc::UnboundedSender<WsMessage>, frame: &ClientFrame) -> Result<()> {
    let text = frame.to_json()?;
    outbound
        .send(WsMessage::Text(text.into()))
        .map_err(|_| RelayError::Transport("relay session send channel closed".to_string()))
}

/// Handler forwarding updates into `tx`, logging (sampled) once the receiver is gone
fn stream_handler(key: SubscriptionKey, tx: mpsc::UnboundedSender<Value>) -> UpdateHandler {
    Arc::new(move |payload| {
        if tx.send(payload).is_err() {
            log_closed_stream(&key);
        }
    })
}

fn log_closed_stream(key: &SubscriptionKey) {
    let count = CLOSED_STREAM_LOG_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    if count <= 3 || count % CLOSED_STREAM_LOG_EVERY == 0 {
        warn!(
            key = %key,
            dropped_updates = count,
            "relay update dropped: stream receiver closed, unsubscribe the key"
        );
    }
}

fn log_subscription_sent(action: &'static str, key: &SubscriptionKey) {
    let count = SUBSCRIBE_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count >= SUBSCRIPTION_LOG_LIMIT {
        return;
    }
    info!(
        sample_index = count + 1,
        sample_limit = SUBSCRIPTION_LOG_LIMIT,
        action,
        channel = %key.channel(),
        symbol = key.symbol(),
        interval = key.interval(),
        "relay subscription sent"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_rejected_while_disconnected() {
        let client = RelayClient::new(RelayConfig::default());
        let result = client
            .subscribe(Channel::Trade, "BTCUSDT", None, |_| {})
            .await;
        assert!(matches!(
            result,
            Err(RelayError::NotConnected { operation: "subscribe" })
        ));
        assert!(client.active_subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_key_is_noop() {
        let client = RelayClient::new(RelayConfig::default());
        assert!(!client.unsubscribe(Channel::Depth, "ETHUSDT", None).await);
        client.unsubscribe_all().await;
        assert!(!client.ping().await);
    }

    #[tokio::test]
    async fn new_client_starts_disconnected() {
        let client = RelayClient::new(RelayConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_exhausted().await);
        assert_eq!(client.reconnect_attempts().await, 0);
        assert_eq!(
            *client.subscribe_connection_state().borrow(),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn stream_handler_survives_dropped_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = stream_handler(SubscriptionKey::new(Channel::Trade, "BTCUSDT", None), tx);

        handler(serde_json::json!({"p": "1"}));
        assert_eq!(rx.try_recv().unwrap(), serde_json::json!({"p": "1"}));

        drop(rx);
        handler(serde_json::json!({"p": "2"}));
        handler(serde_json::json!({"p": "3"}));
    }

    #[tokio::test]
    async fn disconnect_without_session_is_harmless() {
        let client = RelayClient::new(RelayConfig::default());
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
