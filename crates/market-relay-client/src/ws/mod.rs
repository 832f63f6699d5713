/*
[INPUT]:  Relay WebSocket URL, subscriptions and reconnect configuration
[OUTPUT]: Real-time trade/candle/depth updates routed to subscribers
[POS]:    WebSocket layer - real-time data streams
[UPDATE]: When adding new channels or changing connection logic
*/

pub mod client;
pub mod config;
pub mod message;
pub mod router;
pub mod subscription;

pub use client::{ConnectionHooks, RelayClient};
pub use config::{ReconnectPolicy, RelayConfig};
pub use message::{ClientFrame, DataUpdate, ServerFrame};
pub use router::{MessageRouter, Route};
pub use subscription::{SubscriptionKey, SubscriptionRegistry, UpdateHandler, normalize_symbol};
