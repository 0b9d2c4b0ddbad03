//! Endpoint configuration
//!
//! Both endpoints are tuned through plain serde-deserializable structs so an
//! embedding daemon can load them from its own config file. Defaults match
//! the protocol constants the peers expect from each other: the coordinator
//! pings every 15 s and evicts after five silent periods, sources re-register
//! after 30 s without a ping.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coordinator endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Liveness supervision period in seconds
    #[serde(default = "default_ping_period_secs")]
    pub ping_period_secs: u64,

    /// Deadline for downstream request acknowledgements in seconds
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Delay before tearing down a refused peer's socket, giving the Nack
    /// time to flush
    #[serde(default = "default_drain_delay_secs")]
    pub drain_delay_secs: u64,

    /// Buffer size of inbound and per-source outbound channels
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Maximum wire frame payload size in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_ping_period_secs() -> u64 {
    15
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_drain_delay_secs() -> u64 {
    2
}

fn default_channel_buffer() -> usize {
    100
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ping_period_secs: default_ping_period_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
            drain_delay_secs: default_drain_delay_secs(),
            channel_buffer: default_channel_buffer(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl CoordinatorConfig {
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_secs(self.drain_delay_secs)
    }

    /// A source lagging this far behind on pings is evicted
    pub fn eviction_timeout(&self) -> Duration {
        self.ping_period() * 5
    }
}

/// Source endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Deadline for coordinator acknowledgements in seconds
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// How often the ping supervision task wakes, in seconds
    #[serde(default = "default_ping_check_period_secs")]
    pub ping_check_period_secs: u64,

    /// Silence threshold after which the source re-registers, in seconds
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Buffer size of inbound and outbound channels
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Maximum wire frame payload size in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_ping_check_period_secs() -> u64 {
    15
}

fn default_ping_timeout_secs() -> u64 {
    30
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: default_ack_timeout_secs(),
            ping_check_period_secs: default_ping_check_period_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            channel_buffer: default_channel_buffer(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl SourceConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn ping_check_period(&self) -> Duration {
        Duration::from_secs(self.ping_check_period_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.ping_period_secs, 15);
        assert_eq!(config.ack_timeout_secs, 10);
        assert_eq!(config.drain_delay_secs, 2);
        assert_eq!(config.eviction_timeout(), Duration::from_secs(75));
    }

    #[test]
    fn test_source_defaults() {
        let config = SourceConfig::default();
        assert_eq!(config.ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.ping_check_period(), Duration::from_secs(15));
        assert_eq!(config.ping_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: CoordinatorConfig = serde_json::from_str(r#"{"ping_period_secs": 1}"#).unwrap();
        assert_eq!(config.ping_period_secs, 1);
        assert_eq!(config.eviction_timeout(), Duration::from_secs(5));
        assert_eq!(config.ack_timeout_secs, 10);
        assert_eq!(config.max_frame_bytes, 1024 * 1024);
    }
}
