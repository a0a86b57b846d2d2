//! Metrics and health bookkeeping for peers.

use std::time::Duration;

use tokio::time::Instant;
use tributary_core::ErrorType;

use crate::error::CallError;

/// Counters and health state for one peer.
#[derive(Debug, Clone)]
pub struct PeerMetrics {
    /// Total number of connection attempts made
    pub connection_attempts: u64,

    /// Total number of successful connections established
    pub connections_established: u64,

    /// Total number of connection failures
    pub connection_failures: u64,

    /// Total number of call attempts sent to this peer
    pub calls_sent: u64,

    /// Calls that got a response (including application errors)
    pub calls_succeeded: u64,

    /// Calls that failed with a transport error
    pub calls_failed: u64,

    /// Busy errors returned by the peer
    pub busy_responses: u64,

    /// Time when the peer was created
    pub created_at: Instant,

    /// Time of last successful connection (None if never connected)
    pub last_connected: Option<Instant>,

    /// Time of last failure (None if no failures)
    pub last_failure: Option<Instant>,

    /// Failures since the last success, across connects and calls
    pub consecutive_failures: u32,

    /// Current reconnection delay
    pub current_reconnect_delay: Duration,
}

impl Default for PeerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerMetrics {
    /// Create new metrics starting now.
    pub fn new() -> Self {
        Self {
            connection_attempts: 0,
            connections_established: 0,
            connection_failures: 0,
            calls_sent: 0,
            calls_succeeded: 0,
            calls_failed: 0,
            busy_responses: 0,
            created_at: Instant::now(),
            last_connected: None,
            last_failure: None,
            consecutive_failures: 0,
            current_reconnect_delay: Duration::ZERO,
        }
    }

    /// Record a connection attempt.
    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    /// Record a successful connection.
    pub fn record_connection_success(&mut self) {
        self.connections_established += 1;
        self.last_connected = Some(Instant::now());
        self.consecutive_failures = 0;
        self.current_reconnect_delay = Duration::ZERO;
    }

    /// Record a connection failure and the delay before the next attempt.
    pub fn record_connection_failure(&mut self, reconnect_delay: Duration) {
        self.connection_failures += 1;
        self.current_reconnect_delay = reconnect_delay;
        self.record_failure();
    }

    /// Record an attempt being sent.
    pub fn record_call_sent(&mut self) {
        self.calls_sent += 1;
    }

    /// Record how an attempt ended.
    ///
    /// Only failures that say something about the peer count against its
    /// health: connection errors, timeouts, `Busy` and `Unhealthy`.
    pub fn record_call_result(&mut self, result: Result<(), &CallError>) {
        let error = match result {
            Ok(()) => {
                self.calls_succeeded += 1;
                self.consecutive_failures = 0;
                return;
            }
            Err(error) => error,
        };
        self.calls_failed += 1;
        match error.error_type() {
            ErrorType::Busy => {
                self.busy_responses += 1;
                self.record_failure();
            }
            ErrorType::NetworkError | ErrorType::Timeout | ErrorType::Unhealthy => {
                self.record_failure();
            }
            _ => {}
        }
    }

    fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Calculate connection success rate as a percentage.
    pub fn connection_success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            100.0
        } else {
            (self.connections_established as f64 / self.connection_attempts as f64) * 100.0
        }
    }

    /// Get the total uptime duration since creation.
    pub fn total_uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Get time since last failure.
    pub fn time_since_last_failure(&self) -> Option<Duration> {
        self.last_failure.map(|t| t.elapsed())
    }
}
