/*
[INPUT]:  Session registrations, per-session subscriptions, upstream or published updates
[OUTPUT]: Fan-out of data frames to every session subscribed to a key
[POS]:    Core layer - single-writer relay state (sessions, demand, upstream lifecycle)
[UPDATE]: When changing demand accounting, fan-out, or upstream reconnection semantics
*/

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use market_relay_client::{ReconnectPolicy, RelayError, ServerFrame, SubscriptionKey};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::UpstreamConfig;
use crate::upstream::{DemandChange, UpstreamFeed};

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type SessionId = Uuid;

#[derive(Debug)]
pub(crate) enum HubCommand {
    Register {
        session: SessionId,
        tx: mpsc::UnboundedSender<ServerFrame>,
    },
    Subscribe {
        session: SessionId,
        key: SubscriptionKey,
    },
    Unsubscribe {
        session: SessionId,
        key: SubscriptionKey,
    },
    UnsubscribeAll {
        session: SessionId,
    },
    Deregister {
        session: SessionId,
    },
    Publish {
        key: SubscriptionKey,
        data: Value,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
    Shutdown,
}

/// Point-in-time view of the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    pub sessions: usize,
    /// Distinct keys with at least one subscriber
    pub subscriptions: usize,
    pub upstream_connected: bool,
}

/// Handle to the hub worker. Cloning shares the same worker.
#[derive(Debug, Clone)]
pub struct RelayHub {
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
    shutdown: CancellationToken,
}

impl RelayHub {
    /// Start the hub worker. Without an upstream the hub only fans out `publish`ed updates.
    pub fn spawn(upstream: Option<UpstreamConfig>, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = HubWorker::new(upstream, cmd_rx, shutdown.clone());
        let handle = tokio::spawn(worker.run());
        (Self { cmd_tx, shutdown }, handle)
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> (Self, mpsc::UnboundedReceiver<HubCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                cmd_tx,
                shutdown: CancellationToken::new(),
            },
            cmd_rx,
        )
    }

    pub fn register(&self, session: SessionId, tx: mpsc::UnboundedSender<ServerFrame>) {
        self.send(HubCommand::Register { session, tx });
    }

    pub fn subscribe(&self, session: SessionId, key: SubscriptionKey) {
        self.send(HubCommand::Subscribe { session, key });
    }

    pub fn unsubscribe(&self, session: SessionId, key: SubscriptionKey) {
        self.send(HubCommand::Unsubscribe { session, key });
    }

    pub fn unsubscribe_all(&self, session: SessionId) {
        self.send(HubCommand::UnsubscribeAll { session });
    }

    pub fn deregister(&self, session: SessionId) {
        self.send(HubCommand::Deregister { session });
    }

    /// Inject an update as if it came from upstream
    pub fn publish(&self, key: SubscriptionKey, data: Value) {
        self.send(HubCommand::Publish { key, data });
    }

    /// `None` once the worker has stopped
    pub async fn stats(&self) -> Option<RelayStats> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(HubCommand::Stats { reply }).is_err() {
            return None;
        }
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.cmd_tx.send(HubCommand::Shutdown);
    }

    fn send(&self, cmd: HubCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!("relay hub stopped; command dropped");
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    tx: mpsc::UnboundedSender<ServerFrame>,
    keys: HashSet<SubscriptionKey>,
}

/// Per-key subscriber sets with reference-counted upstream demand
#[derive(Debug, Default)]
pub(crate) struct SubscriberTable {
    sessions: HashMap<SessionId, SessionEntry>,
    subscribers: HashMap<SubscriptionKey, HashSet<SessionId>>,
}

impl SubscriberTable {
    pub(crate) fn register(&mut self, session: SessionId, tx: mpsc::UnboundedSender<ServerFrame>) {
        self.sessions.insert(
            session,
            SessionEntry {
                tx,
                keys: HashSet::new(),
            },
        );
    }

    /// `Added` when the session is the key's first subscriber
    pub(crate) fn subscribe(&mut self, session: SessionId, key: SubscriptionKey) -> Option<DemandChange> {
        let entry = self.sessions.get_mut(&session)?;
        if !entry.keys.insert(key.clone()) {
            return None;
        }
        let subscribers = self.subscribers.entry(key.clone()).or_default();
        subscribers.insert(session);
        (subscribers.len() == 1).then_some(DemandChange::Added(key))
    }

    /// `Removed` when the session was the key's last subscriber
    pub(crate) fn unsubscribe(&mut self, session: SessionId, key: &SubscriptionKey) -> Option<DemandChange> {
        let entry = self.sessions.get_mut(&session)?;
        if !entry.keys.remove(key) {
            return None;
        }
        self.release(session, key)
    }

    pub(crate) fn unsubscribe_all(&mut self, session: SessionId) -> Vec<DemandChange> {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return Vec::new();
        };
        let keys: Vec<SubscriptionKey> = entry.keys.drain().collect();
        keys.iter()
            .filter_map(|key| self.release(session, key))
            .collect()
    }

    pub(crate) fn deregister(&mut self, session: SessionId) -> Vec<DemandChange> {
        let changes = self.unsubscribe_all(session);
        self.sessions.remove(&session);
        changes
    }

    fn release(&mut self, session: SessionId, key: &SubscriptionKey) -> Option<DemandChange> {
        let subscribers = self.subscribers.get_mut(key)?;
        subscribers.remove(&session);
        if !subscribers.is_empty() {
            return None;
        }
        self.subscribers.remove(key);
        Some(DemandChange::Removed(key.clone()))
    }

    /// Send the update to every subscriber of `key`; returns the number reached
    pub(crate) fn fan_out(&self, key: &SubscriptionKey, data: Value) -> usize {
        let Some(subscribers) = self.subscribers.get(key) else {
            return 0;
        };
        let frame = ServerFrame::update(key, data);
        subscribers
            .iter()
            .filter_map(|session| self.sessions.get(session))
            .filter(|entry| entry.tx.send(frame.clone()).is_ok())
            .count()
    }

    /// Keys with at least one subscriber, sorted
    pub(crate) fn demand(&self) -> Vec<SubscriptionKey> {
        let keys: BTreeSet<&SubscriptionKey> = self.subscribers.keys().collect();
        keys.into_iter().cloned().collect()
    }

    pub(crate) fn has_demand(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn key_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    UpstreamLost,
    Shutdown,
}

struct HubWorker {
    upstream: Option<UpstreamConfig>,
    policy: ReconnectPolicy,
    table: SubscriberTable,
    cmd_rx: mpsc::UnboundedReceiver<HubCommand>,
    shutdown: CancellationToken,
    upstream_connected: bool,
    gave_up: bool,
}

impl HubWorker {
    fn new(
        upstream: Option<UpstreamConfig>,
        cmd_rx: mpsc::UnboundedReceiver<HubCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let policy = upstream
            .as_ref()
            .map(UpstreamConfig::reconnect_policy)
            .unwrap_or_default();
        Self {
            upstream,
            policy,
            table: SubscriberTable::default(),
            cmd_rx,
            shutdown,
            upstream_connected: false,
            gave_up: false,
        }
    }

    async fn run(mut self) {
        let mut attempts: u32 = 0;

        'run: loop {
            if self.shutdown.is_cancelled() {
                break 'run;
            }

            let upstream_url = self
                .upstream
                .as_ref()
                .filter(|_| !self.gave_up && self.table.has_demand())
                .map(|upstream| upstream.url.clone());

            let Some(upstream_url) = upstream_url else {
                let shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = shutdown.cancelled() => break 'run,
                    cmd = self.cmd_rx.recv() => {
                        if self.apply(cmd, None).await == Flow::Shutdown {
                            break 'run;
                        }
                    }
                }
                continue 'run;
            };

            match self.connect_upstream(&upstream_url).await {
                Ok(mut feed) => {
                    attempts = 0;
                    self.upstream_connected = true;
                    info!(streams = self.table.key_count(), "upstream connected");

                    let exit = self.stream_loop(&mut feed).await;
                    self.upstream_connected = false;
                    match exit {
                        Flow::Shutdown => break 'run,
                        Flow::UpstreamLost => {
                            let backoff = self.policy.delay_for_attempt(1);
                            warn!(?backoff, "upstream connection lost; reconnecting after backoff");
                            if self.wait_backoff(backoff).await == Flow::Shutdown {
                                break 'run;
                            }
                        }
                        Flow::Continue => {}
                    }
                }
                Err(err) => {
                    attempts = attempts.saturating_add(1);

                    if self.policy.is_exhausted(attempts) {
                        warn!(
                            attempts,
                            max_attempts = self.policy.max_attempts,
                            error = %err,
                            "upstream gave up reconnecting; serving published updates only"
                        );
                        self.gave_up = true;
                        continue 'run;
                    }

                    let backoff = self.policy.delay_for_attempt(attempts);
                    warn!(attempts, ?backoff, error = %err, "upstream connect failed; retrying with backoff");

                    if self.wait_backoff(backoff).await == Flow::Shutdown {
                        break 'run;
                    }
                }
            }
        }

        debug!("relay hub stopped");
    }

    /// Sleep for `backoff` while still serving commands
    async fn wait_backoff(&mut self, backoff: Duration) -> Flow {
        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Flow::Shutdown,
                _ = &mut sleep => return Flow::Continue,
                cmd = self.cmd_rx.recv() => {
                    if self.apply(cmd, None).await == Flow::Shutdown {
                        return Flow::Shutdown;
                    }
                }
            }
        }
    }

    async fn connect_upstream(&self, url: &str) -> Result<UpstreamFeed, RelayError> {
        let demand = self.table.demand();
        match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, UpstreamFeed::connect(url, &demand)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::timeout(UPSTREAM_CONNECT_TIMEOUT)),
        }
    }

    async fn stream_loop(&mut self, feed: &mut UpstreamFeed) -> Flow {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Flow::Shutdown,
                cmd = self.cmd_rx.recv() => {
                    match self.apply(cmd, Some(&mut *feed)).await {
                        Flow::Continue => {}
                        exit => return exit,
                    }
                    if !self.table.has_demand() {
                        debug!("no remaining demand; closing upstream");
                        return Flow::Continue;
                    }
                }
                update = feed.next_update() => {
                    match update {
                        Ok(Some((key, data))) => {
                            self.table.fan_out(&key, data);
                        }
                        Ok(None) => return Flow::UpstreamLost,
                        Err(err) => {
                            warn!(error = %err, "upstream read failed");
                            return Flow::UpstreamLost;
                        }
                    }
                }
            }
        }
    }

    async fn apply(&mut self, cmd: Option<HubCommand>, feed: Option<&mut UpstreamFeed>) -> Flow {
        let changes = match cmd {
            Some(HubCommand::Register { session, tx }) => {
                debug!(%session, "session registered");
                self.table.register(session, tx);
                Vec::new()
            }
            Some(HubCommand::Subscribe { session, key }) => {
                debug!(%session, key = %key, "session subscribed");
                self.table.subscribe(session, key).into_iter().collect()
            }
            Some(HubCommand::Unsubscribe { session, key }) => {
                debug!(%session, key = %key, "session unsubscribed");
                self.table.unsubscribe(session, &key).into_iter().collect()
            }
            Some(HubCommand::UnsubscribeAll { session }) => self.table.unsubscribe_all(session),
            Some(HubCommand::Deregister { session }) => {
                debug!(%session, "session deregistered");
                self.table.deregister(session)
            }
            Some(HubCommand::Publish { key, data }) => {
                let reached = self.table.fan_out(&key, data);
                debug!(key = %key, reached, "published update");
                Vec::new()
            }
            Some(HubCommand::Stats { reply }) => {
                let _ = reply.send(RelayStats {
                    sessions: self.table.session_count(),
                    subscriptions: self.table.key_count(),
                    upstream_connected: self.upstream_connected,
                });
                Vec::new()
            }
            Some(HubCommand::Shutdown) | None => return Flow::Shutdown,
        };

        if changes.is_empty() {
            return Flow::Continue;
        }
        let Some(feed) = feed else {
            return Flow::Continue;
        };
        if let Err(err) = feed.apply_demand(&changes).await {
            warn!(error = %err, "failed to update upstream demand");
            return Flow::UpstreamLost;
        }
        Flow::Continue
    }
}
