//! Configuration for connection behavior.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fragment::ChecksumType;
use crate::frame::MAX_PAYLOAD_SIZE;

/// Configuration for one connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Timeout for the TCP connect.
    #[serde(with = "crate::serde_ms")]
    pub connect_timeout: Duration,

    /// Timeout for the init handshake once connected.
    #[serde(with = "crate::serde_ms")]
    pub handshake_timeout: Duration,

    /// Largest frame payload this side writes. Capped at [`MAX_PAYLOAD_SIZE`].
    pub max_frame_payload: usize,

    /// Initial capacity of the read buffer.
    pub read_buffer_size: usize,

    /// Number of frames that may wait in the write queue.
    pub write_queue_size: usize,

    /// Checksum applied to outbound calls and responses.
    pub checksum_type: ChecksumType,

    /// Process name advertised in the handshake.
    pub process_name: String,

    /// Interval between liveness pings.
    ///
    /// Set to `Duration::ZERO` to disable ping monitoring.
    #[serde(with = "crate::serde_ms")]
    pub ping_interval: Duration,

    /// Maximum time to wait for a ping response before closing the
    /// connection.
    #[serde(with = "crate::serde_ms")]
    pub ping_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_frame_payload: MAX_PAYLOAD_SIZE,
            read_buffer_size: 64 * 1024,
            write_queue_size: 1024,
            checksum_type: ChecksumType::Crc32C,
            process_name: default_process_name(),
            ping_interval: Duration::ZERO,
            ping_timeout: Duration::from_secs(2),
        }
    }
}

fn default_process_name() -> String {
    format!("tributary[{}]", std::process::id())
}

impl ConnectionConfig {
    /// Create a configuration with the given timeouts.
    pub fn new(connect_timeout: Duration, handshake_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            handshake_timeout,
            ..Self::default()
        }
    }

    /// Enable ping monitoring with the given interval and timeout.
    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    /// Use `checksum_type` for outbound calls.
    pub fn with_checksum(mut self, checksum_type: ChecksumType) -> Self {
        self.checksum_type = checksum_type;
        self
    }

    /// Limit outbound frame payloads to `max_frame_payload` bytes.
    pub fn with_max_frame_payload(mut self, max_frame_payload: usize) -> Self {
        self.max_frame_payload = max_frame_payload.min(MAX_PAYLOAD_SIZE);
        self
    }

    /// Advertise `process_name` in the handshake.
    pub fn with_process_name(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = process_name.into();
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
            ping_interval: Duration::from_millis(500),
            ping_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(2),
            ping_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub(crate) fn frame_payload_limit(&self) -> usize {
        self.max_frame_payload.min(MAX_PAYLOAD_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let local = ConnectionConfig::local_network();
        let wan = ConnectionConfig::wan_network();
        assert!(local.connect_timeout < wan.connect_timeout);
        assert!(local.ping_interval > Duration::ZERO);
        assert_eq!(ConnectionConfig::default().ping_interval, Duration::ZERO);
    }

    #[test]
    fn test_builders() {
        let config = ConnectionConfig::default()
            .with_checksum(ChecksumType::Crc32)
            .with_max_frame_payload(usize::MAX)
            .with_process_name("indexer");
        assert_eq!(config.checksum_type, ChecksumType::Crc32);
        assert_eq!(config.max_frame_payload, MAX_PAYLOAD_SIZE);
        assert_eq!(config.process_name, "indexer");
    }

    #[test]
    fn test_json_durations_in_millis() {
        let config = ConnectionConfig::new(Duration::from_millis(250), Duration::from_secs(1));
        let json = serde_json::to_value(&config).expect("serialize");
        assert_eq!(json["connect_timeout"], 250);
        assert_eq!(json["handshake_timeout"], 1000);

        let parsed: ConnectionConfig =
            serde_json::from_str(r#"{"ping_interval": 100, "checksum_type": "Crc32"}"#)
                .expect("deserialize");
        assert_eq!(parsed.ping_interval, Duration::from_millis(100));
        assert_eq!(parsed.checksum_type, ChecksumType::Crc32);
        assert_eq!(parsed.connect_timeout, Duration::from_secs(5));
    }
}
