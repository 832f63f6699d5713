/*
[INPUT]:  Error sources (WebSocket transport, wire protocol, HTTP, serialization)
[OUTPUT]: Structured error types with context and retry hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or improving error messages
*/

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Main error type for the market relay client
#[derive(Error, Debug)]
pub enum RelayError {
    /// WebSocket handshake or socket failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Transport-level failure that has no tungstenite source
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Subscription change attempted without a live session
    #[error("Cannot {operation}: relay not connected")]
    NotConnected { operation: &'static str },

    /// Automatic reconnection gave up
    #[error("Reconnect attempts exhausted after {attempts} tries, manual reconnect required")]
    ReconnectExhausted { attempts: u32 },

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend returned an error response
    #[error("API error (code {code}): {message}")]
    Api { code: i32, message: String },

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Check if the error is worth retrying automatically
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::WebSocket(_)
                | RelayError::Transport(_)
                | RelayError::Timeout { .. }
                | RelayError::Http(_)
        )
    }

    /// Check if the error requires operator intervention
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::ReconnectExhausted { .. })
    }

    /// Timeout error for `duration`, saturating at `u64::MAX` milliseconds
    pub fn timeout(duration: Duration) -> Self {
        RelayError::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create an API error from status code and message
    pub fn api_error(status: StatusCode, message: impl Into<String>) -> Self {
        RelayError::Api {
            code: status.as_u16() as i32,
            message: message.into(),
        }
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
