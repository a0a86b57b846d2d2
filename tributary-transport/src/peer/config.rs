//! Configuration structures for peer behavior.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnection and health-scoring parameters shared by every peer of a
/// channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Initial delay before attempting reconnection
    #[serde(with = "crate::serde_ms")]
    pub initial_reconnect_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "crate::serde_ms")]
    pub max_reconnect_delay: Duration,

    /// Score added per consecutive failure when ranking peers.
    ///
    /// One unit equals one outstanding call.
    pub failure_penalty: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
            failure_penalty: 8,
        }
    }
}

impl PeerConfig {
    /// Create a new configuration with the given reconnect delays.
    pub fn new(initial_reconnect_delay: Duration, max_reconnect_delay: Duration) -> Self {
        Self {
            initial_reconnect_delay,
            max_reconnect_delay,
            ..Self::default()
        }
    }

    /// Set the per-failure scoring penalty.
    pub fn with_failure_penalty(mut self, failure_penalty: u64) -> Self {
        self.failure_penalty = failure_penalty;
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_secs(1))
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}
