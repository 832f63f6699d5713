/*
[INPUT]:  (channel, symbol, interval) tuples and update handlers
[OUTPUT]: Subscription keys and the registry of wanted streams
[POS]:    WebSocket layer - single source of truth for "what should be streaming"
[UPDATE]: When changing key derivation or replay semantics
*/

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use super::message::ClientFrame;
use crate::error::RelayError;
use crate::types::Channel;

/// Callback invoked with the payload of every update routed to a key
pub type UpdateHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Composite `channel:symbol:interval` identifier
///
/// Symbols are trimmed and uppercased. The interval is only retained for
/// channels that use one; for the others it is always the empty string. Keys
/// built at subscribe time and keys derived from inbound frames therefore agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    channel: Channel,
    symbol: String,
    interval: String,
}

impl SubscriptionKey {
    pub fn new(channel: Channel, symbol: &str, interval: Option<&str>) -> Self {
        let interval = if channel.uses_interval() {
            interval.unwrap_or_default().to_string()
        } else {
            String::new()
        };
        Self {
            channel,
            symbol: normalize_symbol(symbol),
            interval,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Interval, empty when not applicable
    pub fn interval(&self) -> &str {
        &self.interval
    }

    pub fn interval_opt(&self) -> Option<&str> {
        if self.interval.is_empty() {
            None
        } else {
            Some(&self.interval)
        }
    }
}

/// Canonical symbol form shared by subscribers and the relay
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.channel, self.symbol, self.interval)
    }
}

impl FromStr for SubscriptionKey {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(channel), Some(symbol), Some(interval)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RelayError::Protocol(format!("malformed subscription key: {s}")));
        };
        if symbol.trim().is_empty() {
            return Err(RelayError::Protocol(format!("subscription key without symbol: {s}")));
        }
        let channel = channel.parse::<Channel>()?;
        Ok(Self::new(channel, symbol, Some(interval)))
    }
}

/// Wanted subscriptions and the handler that owns each one.
///
/// A key is active exactly when it has a handler; both live in the same map.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<SubscriptionKey, UpdateHandler>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the handler for a key, returning `true` when it replaced one
    pub fn insert(&mut self, key: SubscriptionKey, handler: UpdateHandler) -> bool {
        self.entries.insert(key, handler).is_some()
    }

    /// Remove a key, returning `true` when it was present
    pub fn remove(&mut self, key: &SubscriptionKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn handler(&self, key: &SubscriptionKey) -> Option<UpdateHandler> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SubscriptionKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One subscribe frame per active key, in key order
    pub fn replay_frames(&self) -> Vec<ClientFrame> {
        let mut keys: Vec<&SubscriptionKey> = self.entries.keys().collect();
        keys.sort();
        keys.into_iter().map(ClientFrame::subscribe).collect()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.entries.keys().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("SubscriptionRegistry").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> UpdateHandler {
        Arc::new(|_| {})
    }

    #[rstest]
    #[case(Channel::Trade, "BTCUSDT", None, "trade:BTCUSDT:")]
    #[case(Channel::Trade, "BTCUSDT", Some("1m"), "trade:BTCUSDT:")]
    #[case(Channel::Depth, "ETHUSDT", None, "depth:ETHUSDT:")]
    #[case(Channel::Candle, "BTCUSDT", Some("1m"), "candle:BTCUSDT:1m")]
    #[case(Channel::Candle, "BTCUSDT", None, "candle:BTCUSDT:")]
    fn key_renders_with_empty_interval_placeholder(
        #[case] channel: Channel,
        #[case] symbol: &str,
        #[case] interval: Option<&str>,
        #[case] expected: &str,
    ) {
        let key = SubscriptionKey::new(channel, symbol, interval);
        assert_eq!(key.to_string(), expected);
        assert_eq!(expected.parse::<SubscriptionKey>().unwrap(), key);
    }

    #[rstest]
    #[case(Channel::Trade, "btcusdt", "BTCUSDT")]
    #[case(Channel::Depth, " ethusdt ", "ETHUSDT")]
    #[case(Channel::Candle, "SolUsdt", "SOLUSDT")]
    fn key_symbol_is_canonical(#[case] channel: Channel, #[case] symbol: &str, #[case] expected: &str) {
        let key = SubscriptionKey::new(channel, symbol, Some("1m"));
        assert_eq!(key.symbol(), expected);
        assert_eq!(key, SubscriptionKey::new(channel, expected, Some("1m")));
    }

    #[rstest]
    #[case("trade:BTCUSDT")]
    #[case("ticker:BTCUSDT:")]
    #[case("candle::1m")]
    #[case("trade: :")]
    fn malformed_keys_are_rejected(#[case] raw: &str) {
        assert!(raw.parse::<SubscriptionKey>().is_err());
    }

    #[test]
    fn resubscribe_overwrites_handler() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let key = SubscriptionKey::new(Channel::Trade, "BTCUSDT", None);

        let mut registry = SubscriptionRegistry::new();
        let first = first_calls.clone();
        assert!(!registry.insert(key.clone(), Arc::new(move |_| {
            first.fetch_add(1, Ordering::SeqCst);
        })));
        let second = second_calls.clone();
        assert!(registry.insert(key.clone(), Arc::new(move |_| {
            second.fetch_add(1, Ordering::SeqCst);
        })));

        assert_eq!(registry.len(), 1);
        (registry.handler(&key).unwrap())(Value::Null);
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_missing_key_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        let key = SubscriptionKey::new(Channel::Depth, "ETHUSDT", None);
        assert!(!registry.remove(&key));
        assert!(registry.is_empty());
    }

    #[test]
    fn active_keys_always_have_handlers() {
        let keys = [
            SubscriptionKey::new(Channel::Trade, "BTCUSDT", None),
            SubscriptionKey::new(Channel::Candle, "BTCUSDT", Some("1m")),
            SubscriptionKey::new(Channel::Candle, "BTCUSDT", Some("5m")),
            SubscriptionKey::new(Channel::Depth, "ETHUSDT", None),
        ];
        // subscribe/unsubscribe interleavings driven by a fixed op pattern
        let ops = [0usize, 1, 2, 1, 3, 0, 0, 2, 3, 1, 1, 2];
        let mut registry = SubscriptionRegistry::new();
        for (step, op) in ops.iter().enumerate() {
            let key = &keys[*op];
            if step % 3 == 2 {
                registry.remove(key);
            } else {
                registry.insert(key.clone(), noop());
            }
            for active in registry.keys() {
                assert!(registry.handler(active).is_some());
            }
        }
        registry.clear();
        assert_eq!(registry.keys().count(), 0);
    }

    #[test]
    fn replay_emits_one_frame_per_key() {
        let mut registry = SubscriptionRegistry::new();
        let candle = SubscriptionKey::new(Channel::Candle, "BTCUSDT", Some("1m"));
        registry.insert(candle.clone(), noop());
        registry.insert(candle.clone(), noop());
        registry.insert(SubscriptionKey::new(Channel::Trade, "ETHUSDT", None), noop());

        let frames = registry.replay_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames.iter().filter(|frame| frame.key().as_ref() == Some(&candle)).count(),
            1
        );
        assert!(frames.iter().all(|frame| matches!(frame, ClientFrame::Subscribe { .. })));
    }
}
