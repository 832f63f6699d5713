/*
[INPUT]:  Reconnect / heartbeat tuning chosen by the host application
[OUTPUT]: RelayConfig and ReconnectPolicy with backoff math
[POS]:    WebSocket layer - connection manager configuration
[UPDATE]: When adding connection options or changing backoff semantics
*/

use std::time::Duration;

/// Bounded exponential backoff used between reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: `min(max_delay, base * multiplier^(attempt-1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub reconnect: ReconnectPolicy,
    /// Upper bound on the WebSocket handshake
    pub connect_timeout: Duration,
    /// Send a ping frame on this period while connected
    pub heartbeat_interval: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_attempt_waits_2250ms() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2250));
    }

    #[test]
    fn backoff_grows_then_clamps_at_ceiling() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs_f64(1.5f64.powi(4)));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn exhaustion_at_max_attempts() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }
}
