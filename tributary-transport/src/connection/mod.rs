//! One multiplexed connection to a remote process.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──► Identifying ──► Identified ──► Closing ──► Closed
//!     │               │               │                        ▲
//!     └───────────────┴───────────────┴────── failure ─────────┘
//! ```
//!
//! Outbound connections start in `Connecting` while the TCP connect runs.
//! Accepted connections start in `Identifying`. The init handshake moves
//! both to `Identified`, the only state in which new outbound calls are
//! registered and inbound calls are dispatched to handlers. `Closing` lets
//! in-flight calls finish. `Closed` fails every pending call with
//! `NetworkError`.
//!
//! # Tasks
//!
//! Each connection runs a reader task that decodes frames and routes them,
//! and a writer task that drains two queues: an unbounded control queue for
//! pings, cancels and errors, and a bounded data queue for call fragments.
//! Handlers run on their own tasks, off the reader.

/// Configuration structures for connection behavior
pub mod config;

mod task;

pub use config::ConnectionConfig;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tributary_core::{ErrorType, HostPort, NetworkProvider, TraceContext};

use crate::error::{CallError, ConnectionError};
use crate::fragment::{encode_call, CallArgs, CallHead, CallMessage};
use crate::frame::{Frame, FrameType};
use crate::future::{Response, ResponseFuture};
use crate::handler::{HandlerRegistry, OutgoingResponse};
use crate::headers::TransportHeaders;
use crate::message::{CallRequestHead, CallResponseHead, CancelMessage, ErrorMessage};
use crate::registry::CallRegistry;
use crate::sync::lock;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle state. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// TCP connect in progress.
    Connecting,
    /// Waiting for the init handshake.
    Identifying,
    /// Handshake done; calls flow in both directions.
    Identified,
    /// Draining: no new calls, in-flight calls may finish.
    Closing,
    /// Closed; every pending call has failed.
    Closed,
}

impl ConnectionState {
    /// Lower-case state name.
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Identifying => "identifying",
            ConnectionState::Identified => "identified",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the remote.
    Outbound,
    /// The remote dialed our listener.
    Inbound,
}

/// Identity the remote advertised in its init message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentity {
    /// Advertised `host_port`. `0.0.0.0:0` for clients without a listener.
    pub host_port: String,
    /// Advertised `process_name`.
    pub process_name: String,
}

/// Fields of an outbound call, independent of the connection it goes out on.
#[derive(Debug, Clone, Default)]
pub struct OutboundCall {
    /// Destination service.
    pub service: String,
    /// Transport headers.
    pub headers: TransportHeaders,
    /// Trace context.
    pub trace: TraceContext,
    /// Method, application headers and body.
    pub args: CallArgs,
}

pub(crate) struct Queues {
    data_rx: mpsc::Receiver<Frame>,
    control_rx: mpsc::UnboundedReceiver<Frame>,
}

/// A multiplexed connection.
pub struct Connection {
    id: u64,
    direction: Direction,
    peer_addr: String,
    local_host_port: String,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    remote: OnceLock<RemoteIdentity>,
    close_reason: Mutex<Option<String>>,
    registry: Arc<CallRegistry>,
    handlers: Arc<HandlerRegistry>,
    data_tx: mpsc::Sender<Frame>,
    control_tx: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
    pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    next_ping_id: AtomicU32,
    retained: Arc<AtomicUsize>,
    replying: AtomicUsize,
}

impl Connection {
    fn new(
        direction: Direction,
        peer_addr: String,
        initial: ConnectionState,
        config: ConnectionConfig,
        local_host_port: String,
        handlers: Arc<HandlerRegistry>,
    ) -> (Arc<Self>, Queues) {
        let (data_tx, data_rx) = mpsc::channel(config.write_queue_size.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(initial);
        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            peer_addr,
            local_host_port,
            config,
            state,
            remote: OnceLock::new(),
            close_reason: Mutex::new(None),
            registry: Arc::new(CallRegistry::new()),
            handlers,
            data_tx,
            control_tx,
            shutdown: CancellationToken::new(),
            pings: Mutex::new(HashMap::new()),
            next_ping_id: AtomicU32::new(1),
            retained: Arc::new(AtomicUsize::new(0)),
            replying: AtomicUsize::new(0),
        });
        (
            connection,
            Queues {
                data_rx,
                control_rx,
            },
        )
    }

    /// Start dialing `addr` in the background.
    ///
    /// The returned connection is `Connecting`; use
    /// [`wait_identified`](Self::wait_identified) to wait for the handshake.
    pub fn dial<N: NetworkProvider>(
        network: N,
        addr: HostPort,
        config: ConnectionConfig,
        local_host_port: String,
        handlers: Arc<HandlerRegistry>,
    ) -> Arc<Self> {
        let (connection, queues) = Self::new(
            Direction::Outbound,
            addr.to_string(),
            ConnectionState::Connecting,
            config,
            local_host_port,
            handlers,
        );
        let driver = connection.clone();
        tokio::spawn(async move {
            let connect = tokio::time::timeout(
                driver.config.connect_timeout,
                network.connect(&driver.peer_addr),
            );
            let result = tokio::select! {
                _ = driver.shutdown.cancelled() => return,
                result = connect => result,
            };
            let stream = match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(peer = %driver.peer_addr, error = %e, "connect failed");
                    driver.fail(format!("connect to {} failed: {e}", driver.peer_addr));
                    return;
                }
                Err(_) => {
                    let error = ConnectionError::ConnectTimeout {
                        addr: driver.peer_addr.clone(),
                    };
                    driver.fail(error.to_string());
                    return;
                }
            };
            driver.advance(ConnectionState::Identifying);
            task::run(driver, stream, queues).await;
        });
        connection
    }

    /// Dial `addr` and wait for the handshake to finish.
    ///
    /// # Errors
    ///
    /// Fails if the connect or the handshake fails or times out.
    pub async fn connect<N: NetworkProvider>(
        network: N,
        addr: HostPort,
        config: ConnectionConfig,
        local_host_port: String,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let connection = Self::dial(network, addr, config, local_host_port, handlers);
        connection.wait_identified().await?;
        Ok(connection)
    }

    /// Serve an accepted stream. The returned connection is `Identifying`
    /// until the remote's init request has been answered.
    pub fn accept<S>(
        stream: S,
        peer_addr: String,
        config: ConnectionConfig,
        local_host_port: String,
        handlers: Arc<HandlerRegistry>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (connection, queues) = Self::new(
            Direction::Inbound,
            peer_addr,
            ConnectionState::Identifying,
            config,
            local_host_port,
            handlers,
        );
        tokio::spawn(task::run(connection.clone(), stream, queues));
        connection
    }

    /// Process-unique connection number, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Which side opened the connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Socket address of the remote.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Identity from the handshake, once identified.
    pub fn remote(&self) -> Option<&RemoteIdentity> {
        self.remote.get()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether new calls can be sent.
    pub fn is_usable(&self) -> bool {
        self.state() == ConnectionState::Identified
    }

    /// Why the connection closed, once closed.
    pub fn close_reason(&self) -> Option<String> {
        lock(&self.close_reason).clone()
    }

    /// Number of outbound calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.registry.outbound_len()
    }

    /// Number of inbound calls whose handler is still running.
    pub fn active_handlers(&self) -> usize {
        self.registry.inbound_len()
    }

    /// Number of responses received on this connection that are still held
    /// by some consumer.
    pub fn retained_responses(&self) -> usize {
        self.retained.load(Ordering::Acquire)
    }

    /// Wait until the handshake completes.
    ///
    /// # Errors
    ///
    /// Fails with the close reason if the connection closes first.
    pub async fn wait_identified(&self) -> Result<(), ConnectionError> {
        let mut states = self.state.subscribe();
        let state = *states
            .wait_for(|state| *state >= ConnectionState::Identified)
            .await
            .map_err(|_| ConnectionError::Closed)?;
        match state {
            ConnectionState::Identified => Ok(()),
            ConnectionState::Closing => Err(ConnectionError::NotReady {
                state: state.as_str(),
            }),
            _ => Err(self.closed_error()),
        }
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut states = self.state.subscribe();
        let _ = states
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Register an outbound call and arm its timeout.
    ///
    /// # Errors
    ///
    /// Fails if the connection is not identified. A connection that failed to
    /// establish reports its failure, which callers see as `NetworkError`.
    pub fn register_outbound(
        &self,
        future: ResponseFuture,
        ttl: Duration,
    ) -> Result<u32, ConnectionError> {
        match self.state() {
            ConnectionState::Identified => self.registry.register(future, ttl),
            ConnectionState::Closed => Err(self.closed_error()),
            state => Err(ConnectionError::NotReady {
                state: state.as_str(),
            }),
        }
    }

    /// Register and send one attempt of `call`, completing `future` when the
    /// response, an error or the timeout arrives.
    ///
    /// Returns the call id.
    ///
    /// # Errors
    ///
    /// On error the call is not pending. `future` may already have been
    /// failed with the same error.
    pub async fn send_call(
        self: &Arc<Self>,
        call: &OutboundCall,
        ttl: Duration,
        future: &ResponseFuture,
    ) -> Result<u32, CallError> {
        let id = self.register_outbound(future.clone(), ttl)?;

        let connection = Arc::downgrade(self);
        let trace = call.trace;
        future.set_cancel_hook(move || {
            if let Some(connection) = connection.upgrade() {
                connection.cancel_outbound(id, ttl, trace);
            }
        });
        if future.is_done() {
            self.registry.remove(id);
            return Err(CallError::cancelled());
        }

        let message = CallMessage {
            head: CallHead::Request(CallRequestHead {
                ttl,
                trace,
                service: call.service.clone(),
                headers: call.headers.clone(),
            }),
            checksum_type: self.config.checksum_type,
            args: call.args.clone(),
        };
        let frames = match encode_call(id, &message, self.config.frame_payload_limit()) {
            Ok(frames) => frames,
            Err(e) => {
                let error = CallError::bad_request(format!("call could not be encoded: {e}"));
                self.registry.resolve(id, None, Err(error.clone()));
                return Err(error);
            }
        };

        let count = frames.len();
        for frame in frames {
            if self.data_tx.send(frame).await.is_err() {
                let error = CallError::network(format!(
                    "connection to {} closed while sending",
                    self.peer_addr
                ));
                self.registry.resolve(id, None, Err(error.clone()));
                return Err(error);
            }
        }
        tracing::debug!(
            connection = self.id,
            id,
            service = %call.service,
            frames = count,
            "call sent"
        );
        Ok(id)
    }

    /// Send `call` with a single attempt and return its future.
    ///
    /// Failures to send complete the future rather than being returned.
    pub async fn call(self: &Arc<Self>, call: &OutboundCall, ttl: Duration) -> ResponseFuture {
        let future = ResponseFuture::new();
        future.record_attempt();
        if let Err(error) = self.send_call(call, ttl, &future).await {
            future.fail(error);
        }
        future
    }

    /// Measure one round trip with a ping.
    ///
    /// # Errors
    ///
    /// Fails if the connection is not open or no pong arrives within the
    /// configured ping timeout.
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        match self.state() {
            ConnectionState::Identified | ConnectionState::Closing => {}
            ConnectionState::Closed => return Err(self.closed_error()),
            state => {
                return Err(ConnectionError::NotReady {
                    state: state.as_str(),
                })
            }
        }
        let id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pings).insert(id, tx);

        let started = Instant::now();
        self.send_control(Frame::empty(FrameType::PingRequest, id));
        match tokio::time::timeout(self.config.ping_timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                lock(&self.pings).remove(&id);
                Err(ConnectionError::Failed {
                    reason: format!("no ping response within {:?}", self.config.ping_timeout),
                })
            }
        }
    }

    /// Close immediately, failing every pending call with `NetworkError`.
    pub fn close(&self) {
        self.fail("closed locally");
    }

    /// Stop taking new calls, give in-flight calls up to `grace` to finish,
    /// then close.
    ///
    /// Returns the number of calls that were still pending at the deadline.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.advance(ConnectionState::Closing);
        let deadline = Instant::now() + grace;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline || self.shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
        let remaining = self.in_flight();
        if remaining > 0 {
            tracing::debug!(
                connection = self.id,
                remaining,
                "grace period over, failing remaining calls"
            );
        }
        self.fail("connection drained");
        remaining
    }

    fn in_flight(&self) -> usize {
        self.registry.outbound_len()
            + self.registry.inbound_len()
            + self.replying.load(Ordering::Acquire)
    }

    /// Count a handler reply as in flight until the guard drops.
    pub(crate) fn begin_reply(self: &Arc<Self>) -> ReplyGuard {
        self.replying.fetch_add(1, Ordering::AcqRel);
        ReplyGuard(self.clone())
    }

    /// Move forward to `next`. Returns whether the state changed.
    fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn identified(&self, remote: RemoteIdentity) {
        tracing::debug!(
            connection = self.id,
            peer = %self.peer_addr,
            remote_host_port = %remote.host_port,
            remote_process = %remote.process_name,
            "connection identified"
        );
        let _ = self.remote.set(remote);
        self.advance(ConnectionState::Identified);
    }

    /// Close with `reason`. Only the first call has any effect.
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut close_reason = lock(&self.close_reason);
            if close_reason.is_some() {
                return;
            }
            *close_reason = Some(reason.clone());
        }
        self.state.send_replace(ConnectionState::Closed);
        self.shutdown.cancel();

        let error = CallError::network(format!(
            "connection to {} closed: {reason}",
            self.peer_addr
        ));
        let failed = self.registry.close(&error);
        lock(&self.pings).clear();
        tracing::debug!(
            connection = self.id,
            peer = %self.peer_addr,
            %reason,
            failed,
            "connection closed"
        );
    }

    fn closed_error(&self) -> ConnectionError {
        match self.close_reason() {
            Some(reason) => ConnectionError::Failed { reason },
            None => ConnectionError::Closed,
        }
    }

    fn cancel_outbound(&self, id: u32, ttl: Duration, trace: TraceContext) {
        if !self.registry.remove(id) {
            return;
        }
        let cancel = CancelMessage {
            ttl,
            trace,
            why: "cancelled by caller".to_string(),
        };
        match cancel.encode() {
            Ok(payload) => self.send_control(Frame::new(FrameType::Cancel, id, payload)),
            Err(e) => tracing::warn!(id, error = %e, "could not encode cancel"),
        }
        tracing::debug!(connection = self.id, id, "call cancelled");
    }

    fn send_control(&self, frame: Frame) {
        if self.control_tx.send(frame).is_err() {
            tracing::debug!(connection = self.id, "control frame dropped, writer gone");
        }
    }

    fn error_frame(id: u32, trace: TraceContext, error: &CallError) -> Frame {
        let message = ErrorMessage {
            error_type: error.error_type(),
            trace,
            message: error.message().to_string(),
        };
        Frame::new(FrameType::Error, id, message.encode())
    }

    fn send_error(&self, id: u32, trace: TraceContext, error: &CallError) {
        self.send_control(Self::error_frame(id, trace, error));
    }

    fn complete_ping(&self, id: u32) {
        match lock(&self.pings).remove(&id) {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => tracing::debug!(connection = self.id, id, "unsolicited ping response"),
        }
    }

    /// Attach the release hook that keeps `retained_responses` current.
    fn track(&self, response: Response) -> Response {
        let retained = self.retained.clone();
        retained.fetch_add(1, Ordering::AcqRel);
        response.with_release_hook(move || {
            retained.fetch_sub(1, Ordering::AcqRel);
        })
    }

    fn remote_host_port(&self) -> String {
        self.remote
            .get()
            .map(|remote| remote.host_port.clone())
            .unwrap_or_default()
    }

    async fn send_reply(
        &self,
        id: u32,
        method: Bytes,
        trace: TraceContext,
        outcome: Result<OutgoingResponse, CallError>,
    ) {
        let frames = match outcome {
            Ok(response) => {
                let message = CallMessage {
                    head: CallHead::Response(CallResponseHead {
                        code: response.code,
                        trace,
                        headers: response.headers,
                    }),
                    checksum_type: self.config.checksum_type,
                    args: CallArgs {
                        arg1: method,
                        arg2: response.arg2,
                        arg3: response.arg3,
                    },
                };
                match encode_call(id, &message, self.config.frame_payload_limit()) {
                    Ok(frames) => frames,
                    Err(e) => {
                        tracing::warn!(id, error = %e, "response could not be encoded");
                        let error = CallError::new(
                            ErrorType::UnexpectedError,
                            format!("response could not be encoded: {e}"),
                        );
                        vec![Self::error_frame(id, trace, &error)]
                    }
                }
            }
            Err(error) => {
                tracing::debug!(id, error_type = %error.error_type(), "handler failed");
                vec![Self::error_frame(id, trace, &error)]
            }
        };
        for frame in frames {
            if self.data_tx.send(frame).await.is_err() {
                tracing::debug!(id, "connection closed before the reply was sent");
                return;
            }
        }
    }
}

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Keeps [`Connection::drain`] waiting while a reply is being queued.
pub(crate) struct ReplyGuard(Arc<Connection>);

impl Drop for ReplyGuard {
    fn drop(&mut self) {
        self.0.replying.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}
