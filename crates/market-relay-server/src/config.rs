/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed relay server configuration
[POS]:    Configuration layer - listener and upstream setup
[UPDATE]: When adding new configuration options
*/

use std::time::Duration;

use market_relay_client::ReconnectPolicy;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the relay server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayServerConfig {
    /// Address the WebSocket listener binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Message sent in the welcome frame of every session
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
    /// Upstream market data feed; without one the relay only forwards published updates
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
}

/// Binance combined-stream upstream configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Base WebSocket URL, `/stream` is appended
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Consecutive failed connects before the relay stops retrying
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            welcome_message: default_welcome_message(),
            upstream: Some(UpstreamConfig::default()),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl UpstreamConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_welcome_message() -> String {
    "Connected to market data relay".to_string()
}

fn default_upstream_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RelayServerConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        if config.upstream.as_ref().is_some_and(|upstream| upstream.multiplier < 1.0) {
            anyhow::bail!("upstream.multiplier must be >= 1.0");
        }
        Ok(config)
    }
}
