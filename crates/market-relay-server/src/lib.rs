/*
[INPUT]:  Public API exports for market-relay-server crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod hub;
pub mod server;
pub mod session;
pub mod upstream;

// Re-export main types for convenience
pub use config::{RelayServerConfig, UpstreamConfig};
pub use hub::{RelayHub, RelayStats, SessionId};
pub use server::{RelayServer, serve};
