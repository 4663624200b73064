use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the broker transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Websocket endpoint, e.g. "wss://broker.example.com/websockets/v3".
    pub endpoint: String,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Maximum outbound frames queued while disconnected; oldest are dropped
    /// beyond this bound.
    pub outbound_queue_limit: usize,
    /// Buffer capacity of each push stream channel.
    pub push_buffer: usize,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://broker.example.com/websockets/v3".to_string(),
            request_timeout_ms: 10_000,
            outbound_queue_limit: 64,
            push_buffer: 64,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Keepalive and staleness watchdog settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Keepalive ping interval while connected.
    pub interval_secs: u64,
    /// Inbound silence beyond this forces the connection closed. Must exceed
    /// the ping interval to tolerate jitter.
    pub stale_after_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            stale_after_secs: 45,
        }
    }
}

/// Exponential backoff settings for the reconnection supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub growth_factor: f64,
    pub max_delay_ms: u64,
    /// Attempts before the supervisor gives up with a fatal error.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            growth_factor: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given zero-based attempt, capped at the maximum.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self.base_delay_ms as f64 * self.growth_factor.powi(attempt.min(64) as i32);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = ReconnectConfig {
            base_delay_ms: 500,
            growth_factor: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 10,
        };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(500));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(cfg.delay_for(4), Duration::from_millis(8_000));
        assert_eq!(cfg.delay_for(10), Duration::from_millis(30_000));
        assert_eq!(cfg.delay_for(60), Duration::from_millis(30_000));
    }
}
