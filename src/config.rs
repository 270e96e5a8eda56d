//! Broker configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 7666
//! transport = "queue"
//! max_workers = 32
//!
//! [link.writer]
//! max_pending_frames = 2048
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Serializer;
use crate::error::ConfigError;
use crate::transport::{LinkConfig, TransportKind};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7666;
pub const DEFAULT_MAX_WORKERS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub serializer: Serializer,
    /// Concurrent calls the server runs; 0 means unbounded.
    pub max_workers: usize,
    pub request_timeout_ms: u64,
    /// Per-handler timeout when delivering events.
    pub event_timeout_ms: u64,
    pub link: LinkConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            transport: TransportKind::default(),
            serializer: Serializer::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            request_timeout_ms: 30_000,
            event_timeout_ms: 5_000,
            link: LinkConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// `host:port` of the bus this broker serves.
    pub fn bus(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.transport = kind;
        self
    }

    pub fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Set the maximum number of concurrent calls.
    ///
    /// Default: 64
    pub fn max_workers(mut self, limit: usize) -> Self {
        self.max_workers = limit;
        self
    }

    /// Default: 30 seconds
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Default: 5 seconds
    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.link.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.link.writer.channel_capacity = capacity;
        self
    }

    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.link.writer.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.link.max_payload_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.bus(), "127.0.0.1:7666");
        assert_eq!(config.transport, TransportKind::Socket);
        assert_eq!(config.serializer, Serializer::MsgPack);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml() {
        let config = BrokerConfig::from_toml_str(
            r#"
            port = 9000
            transport = "queue"
            max_workers = 0

            [link.writer]
            max_pending_frames = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.transport, TransportKind::Queue);
        assert_eq!(config.max_workers, 0);
        assert_eq!(config.link.writer.max_pending_frames, 8);
        assert_eq!(config.link.writer.channel_capacity, LinkConfig::default().writer.channel_capacity);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            BrokerConfig::from_toml_str("transport = \"carrier-pigeon\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BrokerConfig::from_file("/nonexistent/skywire.toml"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_builder_and_round_trip() {
        let config = BrokerConfig::new()
            .host("0.0.0.0")
            .port(7000)
            .serializer(Serializer::Bincode)
            .with_request_timeout(Duration::from_secs(2))
            .max_pending_frames(16);

        let text = config.to_toml_string().unwrap();
        assert_eq!(BrokerConfig::from_toml_str(&text).unwrap(), config);
    }
}
