/*
[INPUT]:  Wire protocol channel names and connection lifecycle
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - shared enums for relay client and server
[UPDATE]: When adding market data channels or connection states
*/

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Category of market data carried by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Trade,
    Candle,
    Depth,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Trade, Channel::Candle, Channel::Depth];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Trade => "trade",
            Channel::Candle => "candle",
            Channel::Depth => "depth",
        }
    }

    /// Whether subscriptions on this channel are keyed by an interval
    pub fn uses_interval(&self) -> bool {
        matches!(self, Channel::Candle)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" => Ok(Channel::Trade),
            "candle" => Ok(Channel::Candle),
            "depth" => Ok(Channel::Depth),
            other => Err(RelayError::Protocol(format!("unknown channel: {other}"))),
        }
    }
}

/// Lifecycle of the single transport session owned by a relay client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}
