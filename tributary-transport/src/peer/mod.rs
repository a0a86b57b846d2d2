//! Peers: candidate destinations and the connections to them.
//!
//! A [`Peer`] is one remote process, known by its advertised `host:port`. It
//! holds the connections to that process, dials a new one on demand with
//! exponential backoff between failed attempts, and keeps the health
//! signals used to rank it against other peers: its outstanding call count
//! and its [`PeerMetrics`].
//!
//! # Backoff Strategy
//!
//! - Initial delay: configurable (default 100ms)
//! - Maximum delay: configurable (default 30s)
//! - Exponential growth with jitter, reset on the first success

/// Configuration structures for peer behavior
pub mod config;

/// Peer registry and selection
pub mod manager;

/// Metrics collection and health tracking
pub mod metrics;

pub use config::PeerConfig;
pub use manager::{PeerList, PeerManager};
pub use metrics::PeerMetrics;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tributary_core::{HostPort, NetworkProvider};

use crate::connection::{Connection, ConnectionConfig, ConnectionState, OutboundCall};
use crate::error::{CallError, ConnectionError};
use crate::future::{Response, ResponseFuture};
use crate::handler::HandlerRegistry;
use crate::sync::{lock, read, write};

/// Local side of every connection a channel makes or accepts.
pub(crate) struct Endpoint {
    host_port: RwLock<String>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) config: ConnectionConfig,
    connections: Mutex<Vec<Arc<Connection>>>,
    closed: AtomicBool,
}

impl Endpoint {
    pub(crate) fn new(config: ConnectionConfig, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            host_port: RwLock::new(HostPort::EPHEMERAL.to_string()),
            handlers,
            config,
            connections: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// `host_port` advertised in handshakes.
    pub(crate) fn host_port(&self) -> String {
        read(&self.host_port).clone()
    }

    pub(crate) fn set_host_port(&self, host_port: String) {
        *write(&self.host_port) = host_port;
    }

    /// Remember `connection` for shutdown, forgetting closed ones.
    ///
    /// Once the endpoint is closed, the connection is closed instead.
    pub(crate) fn track(&self, connection: Arc<Connection>) {
        let mut connections = lock(&self.connections);
        if self.is_closed() {
            drop(connections);
            connection.close();
            return;
        }
        connections.retain(|c| c.state() != ConnectionState::Closed);
        connections.push(connection);
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.connections).clone()
    }

    /// Refuse new connections from now on.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct ReconnectState {
    current_delay: Duration,
    last_attempt: Option<Instant>,
    failure_count: u32,
}

impl ReconnectState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            current_delay: initial_delay,
            last_attempt: None,
            failure_count: 0,
        }
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.current_delay = initial_delay;
        self.failure_count = 0;
    }

    /// Time left before another attempt is allowed.
    fn backoff(&self) -> Duration {
        match self.last_attempt {
            Some(last_attempt) if self.failure_count > 0 => {
                self.current_delay.saturating_sub(last_attempt.elapsed())
            }
            _ => Duration::ZERO,
        }
    }
}

/// One candidate destination.
pub struct Peer<N: NetworkProvider> {
    address: HostPort,
    network: N,
    endpoint: Arc<Endpoint>,
    config: PeerConfig,
    connections: Mutex<Vec<Arc<Connection>>>,
    reconnect: tokio::sync::Mutex<ReconnectState>,
    outstanding: AtomicUsize,
    metrics: Mutex<PeerMetrics>,
}

impl<N: NetworkProvider> Peer<N> {
    pub(crate) fn new(
        address: HostPort,
        network: N,
        endpoint: Arc<Endpoint>,
        config: PeerConfig,
    ) -> Self {
        Self {
            address,
            network,
            endpoint,
            reconnect: tokio::sync::Mutex::new(ReconnectState::new(config.initial_reconnect_delay)),
            config,
            connections: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            metrics: Mutex::new(PeerMetrics::new()),
        }
    }

    /// Peer address.
    pub fn address(&self) -> HostPort {
        self.address
    }

    /// Calls currently in flight to this peer.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Snapshot of the peer's metrics.
    pub fn metrics(&self) -> PeerMetrics {
        lock(&self.metrics).clone()
    }

    /// Ranking score: lower is better.
    pub fn score(&self) -> u64 {
        let failures = u64::from(lock(&self.metrics).consecutive_failures);
        self.outstanding() as u64 + failures.saturating_mul(self.config.failure_penalty)
    }

    /// Whether an identified connection to this peer exists.
    pub fn is_connected(&self) -> bool {
        self.usable_connection().is_some()
    }

    /// Open connections to this peer, in either direction.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = lock(&self.connections);
        connections.retain(|c| c.state() != ConnectionState::Closed);
        connections.clone()
    }

    /// Add a connection, such as one the peer opened to us.
    pub fn add_connection(&self, connection: Arc<Connection>) {
        let mut connections = lock(&self.connections);
        connections.retain(|c| c.state() != ConnectionState::Closed);
        connections.push(connection);
    }

    fn usable_connection(&self) -> Option<Arc<Connection>> {
        let mut connections = lock(&self.connections);
        connections.retain(|c| c.state() != ConnectionState::Closed);
        connections.iter().find(|c| c.is_usable()).cloned()
    }

    /// A connection still dialing or handshaking.
    fn dialing_connection(&self) -> Option<Arc<Connection>> {
        lock(&self.connections)
            .iter()
            .find(|c| c.state() < ConnectionState::Identified)
            .cloned()
    }

    /// An identified connection to this peer, dialing one if needed.
    ///
    /// Concurrent callers share one dial. After a failed dial the next one
    /// waits out the backoff delay. A dial is tracked from the moment it
    /// starts, so a caller that gives up early leaves it to finish for the
    /// next caller, and shutdown still closes it.
    ///
    /// # Errors
    ///
    /// Fails if the dial or handshake fails, or the channel is shutting down.
    pub async fn connection(&self) -> Result<Arc<Connection>, ConnectionError> {
        if let Some(connection) = self.usable_connection() {
            return Ok(connection);
        }
        let mut reconnect = self.reconnect.lock().await;
        if let Some(connection) = self.usable_connection() {
            return Ok(connection);
        }
        if self.endpoint.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let connection = match self.dialing_connection() {
            Some(connection) => connection,
            None => {
                let backoff = reconnect.backoff();
                if !backoff.is_zero() {
                    tracing::debug!(peer = %self.address, ?backoff, "waiting before reconnect");
                    tokio::time::sleep(backoff).await;
                }
                reconnect.last_attempt = Some(Instant::now());
                lock(&self.metrics).record_connection_attempt();

                let connection = Connection::dial(
                    self.network.clone(),
                    self.address,
                    self.endpoint.config.clone(),
                    self.endpoint.host_port(),
                    self.endpoint.handlers.clone(),
                );
                self.endpoint.track(connection.clone());
                self.add_connection(connection.clone());
                connection
            }
        };

        match connection.wait_identified().await {
            Ok(()) => {
                if reconnect.failure_count > 0 {
                    tracing::debug!(
                        peer = %self.address,
                        failures = reconnect.failure_count,
                        "connected after previous failures"
                    );
                }
                reconnect.reset(self.config.initial_reconnect_delay);
                lock(&self.metrics).record_connection_success();
                Ok(connection)
            }
            Err(e) => {
                connection.close();
                reconnect.failure_count += 1;
                let jitter = rand::thread_rng().gen_range(0.8..1.2);
                let max_delay = self.config.max_reconnect_delay;
                let next_delay = reconnect
                    .current_delay
                    .saturating_mul(2)
                    .min(max_delay)
                    .mul_f64(jitter)
                    .min(max_delay);
                reconnect.current_delay = next_delay;
                lock(&self.metrics).record_connection_failure(next_delay);
                tracing::debug!(peer = %self.address, error = %e, ?next_delay, "connect failed");
                Err(e)
            }
        }
    }

    /// Count a call as outstanding until the guard drops.
    pub fn begin_call(self: &Arc<Self>) -> OutstandingCall<N> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        OutstandingCall { peer: self.clone() }
    }

    /// Send one attempt of `call` and wait for its outcome.
    ///
    /// Connecting counts against `ttl`. Dropping the returned future cancels
    /// the attempt on the wire.
    pub(crate) async fn attempt(
        self: &Arc<Self>,
        call: &OutboundCall,
        ttl: Duration,
    ) -> Result<Response, CallError> {
        let _outstanding = self.begin_call();
        lock(&self.metrics).record_call_sent();
        let result = self.send_attempt(call, ttl).await;
        lock(&self.metrics).record_call_result(result.as_ref().map(|_| ()));
        result
    }

    async fn send_attempt(
        &self,
        call: &OutboundCall,
        ttl: Duration,
    ) -> Result<Response, CallError> {
        let started = Instant::now();
        let connection = match tokio::time::timeout(ttl, self.connection()).await {
            Ok(connection) => connection?,
            Err(_) => {
                return Err(CallError::timeout(format!(
                    "no connection to {} within {ttl:?}",
                    self.address
                )))
            }
        };

        let attempt = ResponseFuture::new();
        let _cancel = CancelOnDrop(attempt.clone());
        let remaining = ttl.saturating_sub(started.elapsed());
        if let Err(error) = connection.send_call(call, remaining, &attempt).await {
            attempt.fail(error);
        }
        attempt.get().await
    }
}

impl<N: NetworkProvider> std::fmt::Debug for Peer<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Keeps a call counted against its peer while alive.
pub struct OutstandingCall<N: NetworkProvider> {
    peer: Arc<Peer<N>>,
}

impl<N: NetworkProvider> Drop for OutstandingCall<N> {
    fn drop(&mut self) {
        self.peer.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cancels an attempt whose waiter went away.
struct CancelOnDrop(ResponseFuture);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
