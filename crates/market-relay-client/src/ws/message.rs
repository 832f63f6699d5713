/*
[INPUT]:  Raw relay WebSocket frames (JSON text)
[OUTPUT]: Typed ClientFrame / ServerFrame sum types
[POS]:    WebSocket layer - wire protocol definitions
[UPDATE]: When adding new frame types or changing the wire format
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::subscription::SubscriptionKey;
use crate::types::Channel;

/// Frames sent from a subscriber to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe {
        channel: Channel,
        symbol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<String>,
    },
    /// Either a single key or, with `all: true`, every subscription
    Unsubscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<Channel>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        all: bool,
    },
    Ping {
        timestamp: i64,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ClientFrame {
    pub fn subscribe(key: &SubscriptionKey) -> Self {
        ClientFrame::Subscribe {
            channel: key.channel(),
            symbol: key.symbol().to_string(),
            interval: key.interval_opt().map(str::to_string),
        }
    }

    pub fn unsubscribe(key: &SubscriptionKey) -> Self {
        ClientFrame::Unsubscribe {
            channel: Some(key.channel()),
            symbol: Some(key.symbol().to_string()),
            interval: key.interval_opt().map(str::to_string),
            all: false,
        }
    }

    pub fn unsubscribe_all() -> Self {
        ClientFrame::Unsubscribe {
            channel: None,
            symbol: None,
            interval: None,
            all: true,
        }
    }

    pub fn ping(timestamp: i64) -> Self {
        ClientFrame::Ping { timestamp }
    }

    /// Key addressed by a subscribe or single-key unsubscribe frame
    pub fn key(&self) -> Option<SubscriptionKey> {
        match self {
            ClientFrame::Subscribe {
                channel,
                symbol,
                interval,
            } => Some(SubscriptionKey::new(*channel, symbol, interval.as_deref())),
            ClientFrame::Unsubscribe {
                channel: Some(channel),
                symbol: Some(symbol),
                interval,
                all: false,
            } => Some(SubscriptionKey::new(*channel, symbol, interval.as_deref())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Market data update carried by trade/candle/depth frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdate {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Frames sent from the relay to a subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Welcome {
        #[serde(default)]
        message: String,
    },
    Subscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<Channel>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<String>,
    },
    Unsubscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<Channel>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Trade(DataUpdate),
    Candle(DataUpdate),
    Depth(DataUpdate),
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Build the data frame for a key
    pub fn update(key: &SubscriptionKey, data: Value) -> Self {
        let update = DataUpdate {
            symbol: key.symbol().to_string(),
            interval: key.interval_opt().map(str::to_string),
            data,
        };
        match key.channel() {
            Channel::Trade => ServerFrame::Trade(update),
            Channel::Candle => ServerFrame::Candle(update),
            Channel::Depth => ServerFrame::Depth(update),
        }
    }

    /// Channel and payload of a data frame, `None` for control frames
    pub fn as_update(&self) -> Option<(Channel, &DataUpdate)> {
        match self {
            ServerFrame::Trade(update) => Some((Channel::Trade, update)),
            ServerFrame::Candle(update) => Some((Channel::Candle, update)),
            ServerFrame::Depth(update) => Some((Channel::Depth, update)),
            _ => None,
        }
    }

    pub fn into_update(self) -> Option<(Channel, DataUpdate)> {
        match self {
            ServerFrame::Trade(update) => Some((Channel::Trade, update)),
            ServerFrame::Candle(update) => Some((Channel::Candle, update)),
            ServerFrame::Depth(update) => Some((Channel::Depth, update)),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Welcome { .. } => "welcome",
            ServerFrame::Subscribed { .. } => "subscribed",
            ServerFrame::Unsubscribed { .. } => "unsubscribed",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Trade(_) => "trade",
            ServerFrame::Candle(_) => "candle",
            ServerFrame::Depth(_) => "depth",
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::Unknown => "unknown",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
