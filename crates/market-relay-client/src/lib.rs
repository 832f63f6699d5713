/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public market relay client crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod error;
pub mod http;
pub mod types;
pub mod ws;

pub use error::{RelayError, Result};

// Re-export commonly used types from http
pub use http::{ClientConfig, MarketSnapshotSource, MarketsClient};

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{
    ClientFrame,
    ConnectionHooks,
    DataUpdate,
    MessageRouter,
    ReconnectPolicy,
    RelayClient,
    RelayConfig,
    Route,
    ServerFrame,
    SubscriptionKey,
    SubscriptionRegistry,
    UpdateHandler,
    normalize_symbol,
};
