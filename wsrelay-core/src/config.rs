//! Server configuration.
//!
//! [`ServerConfig`] collects every tunable the runtime reads. It is plain
//! data: build it with the `with_*` setters, or deserialize it with serde
//! (missing fields fall back to the defaults below).
//!
//! | Field | Default |
//! |-------|---------|
//! | `host` | `127.0.0.1` |
//! | `port` | `8085` |
//! | `accept_timeout_ms` | `0` |
//! | `tick_ms` | `100` |
//! | `ping_timeout_secs` | `10` |
//! | `read_poll_ms` | `200` |
//! | `read_chunk` | `4096` |
//! | `max_frame_size` | `1048576` |
//! | `max_accepts_per_tick` | `64` |
//! | `broker` | `127.0.0.1:6379`, lazy publisher |
//!
//! # Examples
//!
//! ```
//! use wsrelay_core::config::ServerConfig;
//!
//! let config = ServerConfig::default()
//!     .with_port(9000)
//!     .without_broker();
//!
//! assert_eq!(config.bind_addr(), "127.0.0.1:9000");
//! assert!(config.broker.is_none());
//! assert!(config.validate().is_ok());
//! ```

use crate::client::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the runtime and its clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// How long one tick waits for a connection while tasks are queued.
    pub accept_timeout_ms: u64,
    /// Pause between ticks.
    pub tick_ms: u64,
    /// Silence after which a client is pinged.
    pub ping_timeout_secs: u64,
    /// How long a listener waits for readable data per turn.
    pub read_poll_ms: u64,
    /// Bytes read from a socket per attempt.
    pub read_chunk: usize,
    /// Largest outbound frame before a reply is streamed.
    pub max_frame_size: usize,
    /// Upper bound on connections accepted in one tick.
    pub max_accepts_per_tick: usize,
    /// Pub/sub broker; `None` keeps the server single-node.
    pub broker: Option<BrokerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8085,
            accept_timeout_ms: 0,
            tick_ms: 100,
            ping_timeout_secs: 10,
            read_poll_ms: 200,
            read_chunk: 4096,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_accepts_per_tick: 64,
            broker: Some(BrokerConfig::default()),
        }
    }
}

impl ServerConfig {
    /// Sets the listen host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the listen port. `0` picks a free port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the keepalive timeout.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the pause between ticks.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_ms = tick.as_millis() as u64;
        self
    }

    /// Sets the listener read wait.
    pub fn with_read_poll(mut self, poll: Duration) -> Self {
        self.read_poll_ms = poll.as_millis() as u64;
        self
    }

    /// Sets the outbound fragmentation threshold.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Uses the given broker.
    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Runs without a broker.
    pub fn without_broker(mut self) -> Self {
        self.broker = None;
        self
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Accept wait as a duration.
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// Tick pause as a duration.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Keepalive timeout as a duration.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// Listener read wait as a duration.
    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host cannot be empty".into()));
        }
        if self.read_chunk == 0 {
            return Err(Error::Config("read_chunk must be positive".into()));
        }
        if self.max_frame_size <= 2 {
            return Err(Error::Config(format!(
                "max_frame_size must exceed 2 bytes, got {}",
                self.max_frame_size
            )));
        }
        if self.max_accepts_per_tick == 0 {
            return Err(Error::Config("max_accepts_per_tick must be positive".into()));
        }
        if let Some(broker) = &self.broker {
            if broker.host.is_empty() {
                return Err(Error::Config("broker host cannot be empty".into()));
            }
        }
        Ok(())
    }
}

/// Location of the Redis-compatible broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Connect the publisher on first publish instead of at startup.
    pub lazy_publisher: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            lazy_publisher: true,
        }
    }
}

impl BrokerConfig {
    /// Broker at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// `host:port` string for connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:8085");
        assert_eq!(config.ping_timeout(), Duration::from_secs(10));
        assert_eq!(config.tick(), Duration::from_millis(100));
        assert_eq!(config.accept_timeout(), Duration::ZERO);
        assert_eq!(config.max_frame_size, 1024 * 1024);
        assert_eq!(config.broker.unwrap().addr(), "127.0.0.1:6379");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 9001, "broker": null}"#).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.host, "127.0.0.1");
        assert!(config.broker.is_none());
    }

    #[test]
    fn test_validate_rejects_tiny_frames() {
        let config = ServerConfig::default().with_max_frame_size(2);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_setters() {
        let config = ServerConfig::default()
            .with_host("0.0.0.0")
            .with_ping_timeout(Duration::from_secs(30))
            .with_broker(BrokerConfig::new("redis", 6380));
        assert_eq!(config.bind_addr(), "0.0.0.0:8085");
        assert_eq!(config.ping_timeout_secs, 30);
        assert_eq!(config.broker.unwrap().addr(), "redis:6380");
    }
}
