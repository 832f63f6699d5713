/*
[INPUT]:  Backend base URL and HTTP client configuration
[OUTPUT]: Market snapshots from the dashboard REST backend
[POS]:    HTTP layer - REST fallback used when the relay is unavailable
[UPDATE]: When adding new endpoints or changing client behavior
*/

pub mod client;
pub mod public;

pub use client::{ClientConfig, MarketsClient};
pub use public::MarketSnapshotSource;
