/*
[INPUT]:  Binance combined-stream WebSocket + the relay's current demand
[OUTPUT]: (SubscriptionKey, payload) updates decoded from upstream envelopes
[POS]:    Data layer - upstream market data transport (no fan-out logic)
[UPDATE]: When changing stream naming, upstream protocol, or envelope parsing
*/

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use market_relay_client::{Channel, RelayError, SubscriptionKey};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

const DEPTH_STREAM_SUFFIX: &str = "depth20@100ms";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Binance stream name for a relay key, symbol lowercased
pub fn stream_name(key: &SubscriptionKey) -> String {
    let symbol = key.symbol().to_lowercase();
    match key.channel() {
        Channel::Trade => format!("{symbol}@trade"),
        Channel::Candle => format!("{symbol}@kline_{}", key.interval()),
        Channel::Depth => format!("{symbol}@{DEPTH_STREAM_SUFFIX}"),
    }
}

/// Relay key for a Binance stream name
pub fn key_for_stream(stream: &str) -> Option<SubscriptionKey> {
    let (symbol, kind) = stream.split_once('@')?;
    if symbol.is_empty() {
        return None;
    }
    if kind == "trade" {
        return Some(SubscriptionKey::new(Channel::Trade, symbol, None));
    }
    if let Some(interval) = kind.strip_prefix("kline_") {
        if interval.is_empty() {
            return None;
        }
        return Some(SubscriptionKey::new(Channel::Candle, symbol, Some(interval)));
    }
    if kind.starts_with("depth") {
        return Some(SubscriptionKey::new(Channel::Depth, symbol, None));
    }
    None
}

#[derive(Debug, Deserialize)]
struct Envelope {
    stream: String,
    data: Value,
}

/// Decode a combined-stream envelope. Candle updates forward the inner `k` object.
pub fn parse_envelope(text: &str) -> Option<(SubscriptionKey, Value)> {
    let envelope: Envelope = serde_json::from_str(text).ok()?;
    let key = key_for_stream(&envelope.stream)?;
    let data = match key.channel() {
        Channel::Candle => match envelope.data.get("k") {
            Some(kline) => kline.clone(),
            None => envelope.data,
        },
        _ => envelope.data,
    };
    Some((key, data))
}

/// Build a live `SUBSCRIBE`/`UNSUBSCRIBE` method frame
pub fn method_frame(method: &str, keys: &[SubscriptionKey], id: u64) -> Value {
    let params: Vec<String> = keys.iter().map(stream_name).collect();
    json!({
        "method": method,
        "params": params,
        "id": id,
    })
}

/// Demand delta produced by the hub's subscriber table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemandChange {
    Added(SubscriptionKey),
    Removed(SubscriptionKey),
}

/// One connection to the upstream combined stream
pub struct UpstreamFeed {
    write: SplitSink<WsStream, WsMessage>,
    read: SplitStream<WsStream>,
    next_id: u64,
}

impl UpstreamFeed {
    /// Connect and subscribe to every key in `demand`
    pub async fn connect(base_url: &str, demand: &[SubscriptionKey]) -> Result<Self, RelayError> {
        let url = format!("{}/stream", base_url.trim_end_matches('/'));
        info!(url = %url, streams = demand.len(), "connecting to upstream market stream");
        let (stream, _response) = connect_async(url.as_str()).await?;
        let (write, read) = stream.split();
        let mut feed = Self {
            write,
            read,
            next_id: 1,
        };
        feed.send_method("SUBSCRIBE", demand).await?;
        Ok(feed)
    }

    /// Forward demand changes upstream, batching adds and removals
    pub async fn apply_demand(&mut self, changes: &[DemandChange]) -> Result<(), RelayError> {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        for change in changes {
            match change {
                DemandChange::Added(key) => added.push(key.clone()),
                DemandChange::Removed(key) => removed.push(key.clone()),
            }
        }
        self.send_method("SUBSCRIBE", &added).await?;
        self.send_method("UNSUBSCRIBE", &removed).await
    }

    async fn send_method(&mut self, method: &str, keys: &[SubscriptionKey]) -> Result<(), RelayError> {
        if keys.is_empty() {
            return Ok(());
        }
        let id = self.next_id;
        self.next_id += 1;
        let frame = method_frame(method, keys, id);
        self.write.send(WsMessage::Text(frame.to_string().into())).await?;
        debug!(method, id, streams = keys.len(), "upstream method sent");
        Ok(())
    }

    /// Next data update; `Ok(None)` once the upstream closed the stream
    pub async fn next_update(&mut self) -> Result<Option<(SubscriptionKey, Value)>, RelayError> {
        loop {
            let text = match self.read.next().await {
                Some(Ok(WsMessage::Text(text))) => text.to_string(),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            };

            match parse_envelope(&text) {
                Some(update) => return Ok(Some(update)),
                None => debug!(bytes = text.len(), "upstream frame without market data"),
            }
        }
    }
}
