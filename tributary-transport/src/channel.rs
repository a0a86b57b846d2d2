//! Channels and sub-channels.
//!
//! A [`Channel`] is one process's presence on the network: it owns the
//! listener, every connection made or accepted, the handler registry and the
//! peer manager. Outbound calls go through a [`SubChannel`], which binds a
//! destination service to a peer list and call defaults.
//!
//! # Shutdown
//!
//! [`Channel::shutdown`] stops new outbound calls and new connections, gives
//! in-flight calls on every connection the configured grace period, then
//! fails whatever is still pending with `NetworkError` and closes the
//! sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tributary_core::{
    ErrorType, HostPort, NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TraceContext,
};

use crate::connection::{Connection, ConnectionConfig, ConnectionState, OutboundCall};
use crate::error::{CallError, ConnectionError};
use crate::fragment::CallArgs;
use crate::future::{Response, ResponseFuture};
use crate::handler::{Handler, HandlerRegistry};
use crate::headers::keys;
use crate::peer::{Endpoint, PeerConfig, PeerList, PeerManager};
use crate::request::OutboundRequest;
use crate::retry::{run_with_retries, AttemptRunner, RetryOptions};

/// Configuration for a [`Channel`].
///
/// Loadable from JSON; durations are in milliseconds and missing fields take
/// their defaults.
///
/// ```rust
/// use std::time::Duration;
/// use tributary_transport::ChannelConfig;
///
/// let config: ChannelConfig =
///     serde_json::from_str(r#"{"service_name": "kv", "default_timeout": 250}"#).unwrap();
/// assert_eq!(config.service_name, "kv");
/// assert_eq!(config.default_timeout, Duration::from_millis(250));
/// assert_eq!(config.retry.limit, 4);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Name of this process's service, sent as the caller name (`cn`).
    pub service_name: String,

    /// Settings for every connection of the channel.
    pub connection: ConnectionConfig,

    /// Reconnect and scoring settings for every peer.
    pub peer: PeerConfig,

    /// Time in-flight calls get to finish during shutdown.
    #[serde(with = "crate::serde_ms")]
    pub shutdown_grace: Duration,

    /// TTL for requests that set none.
    #[serde(with = "crate::serde_ms")]
    pub default_timeout: Duration,

    /// Retry options for requests that set none.
    pub retry: RetryOptions,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            service_name: "tributary".to_string(),
            connection: ConnectionConfig::default(),
            peer: PeerConfig::default(),
            shutdown_grace: Duration::from_secs(5),
            default_timeout: Duration::from_secs(1),
            retry: RetryOptions::default(),
        }
    }
}

impl ChannelConfig {
    /// Default configuration for `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Use `connection` for every connection.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Use `peer` for every peer.
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peer = peer;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the default call TTL.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the default retry options.
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Tight timeouts and fast reconnects for loopback or LAN use.
    pub fn local_network(service_name: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::local_network(),
            peer: PeerConfig::local_network(),
            ..Self::new(service_name)
        }
    }
}

/// A process's endpoint on the network.
pub struct Channel<N: NetworkProvider = TokioNetworkProvider> {
    network: N,
    config: ChannelConfig,
    endpoint: Arc<Endpoint>,
    peers: Arc<PeerManager<N>>,
    shutting_down: Arc<AtomicBool>,
    stop_accepting: CancellationToken,
    local: OnceLock<HostPort>,
}

impl Channel<TokioNetworkProvider> {
    /// Channel over real Tokio sockets.
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_network(TokioNetworkProvider::new(), config)
    }
}

impl<N: NetworkProvider> Channel<N> {
    /// Channel over `network`.
    pub fn with_network(network: N, config: ChannelConfig) -> Self {
        let endpoint = Arc::new(Endpoint::new(
            config.connection.clone(),
            Arc::new(HandlerRegistry::new()),
        ));
        let peers = Arc::new(PeerManager::new(
            network.clone(),
            endpoint.clone(),
            config.peer.clone(),
        ));
        Self {
            network,
            config,
            endpoint,
            peers,
            shutting_down: Arc::new(AtomicBool::new(false)),
            stop_accepting: CancellationToken::new(),
            local: OnceLock::new(),
        }
    }

    /// Channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Handlers serving inbound calls on every connection.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.endpoint.handlers
    }

    /// Register `handler` for `method` of `service`.
    pub fn register(
        &self,
        service: impl Into<String>,
        method: impl Into<Bytes>,
        handler: Arc<dyn Handler>,
    ) {
        self.endpoint.handlers.register(service, method, handler);
    }

    /// Register a fallback handler for every method of `service`.
    pub fn register_service(&self, service: impl Into<String>, handler: Arc<dyn Handler>) {
        self.endpoint.handlers.register_service(service, handler);
    }

    /// Every peer this channel knows.
    pub fn peers(&self) -> &Arc<PeerManager<N>> {
        &self.peers
    }

    /// Address the listener is bound to, once listening.
    pub fn local_host_port(&self) -> Option<HostPort> {
        self.local.get().copied()
    }

    /// Connections that are not yet closed, in either direction.
    pub fn connection_count(&self) -> usize {
        self.endpoint
            .connections()
            .iter()
            .filter(|c| c.state() != ConnectionState::Closed)
            .count()
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Bind `addr` and serve inbound connections until shutdown.
    ///
    /// The bound address is advertised in every handshake from then on, so
    /// peers can reuse the connections this channel opens to them.
    ///
    /// # Errors
    ///
    /// Fails if the channel is already listening or shutting down, or the
    /// bind fails.
    pub async fn listen(&self, addr: &str) -> Result<HostPort, ConnectionError> {
        if self.is_shutting_down() {
            return Err(ConnectionError::Closed);
        }
        if self.local.get().is_some() {
            return Err(ConnectionError::Failed {
                reason: "channel is already listening".to_string(),
            });
        }

        let listener = self.network.bind(addr).await?;
        let bound = listener.local_addr()?;
        let local = bound.parse::<HostPort>().map_err(|e| ConnectionError::Failed {
            reason: format!("listener address {bound:?}: {e}"),
        })?;
        if self.local.set(local).is_err() {
            return Err(ConnectionError::Failed {
                reason: "channel is already listening".to_string(),
            });
        }
        self.endpoint.set_host_port(local.to_string());
        tracing::info!(service = %self.config.service_name, %local, "listening");

        tokio::spawn(accept_loop(
            listener,
            self.endpoint.clone(),
            self.peers.clone(),
            self.stop_accepting.clone(),
        ));
        Ok(local)
    }

    /// Handle for calling `service` on `peers`.
    pub fn sub_channel(
        &self,
        service: impl Into<String>,
        peers: impl IntoIterator<Item = HostPort>,
    ) -> SubChannel<N> {
        SubChannel {
            service: service.into(),
            caller_name: self.config.service_name.clone(),
            peers: Arc::new(PeerList::new(self.peers.clone(), peers.into_iter().collect())),
            handlers: self.endpoint.handlers.clone(),
            shutting_down: self.shutting_down.clone(),
            default_timeout: self.config.default_timeout,
            retry: self.config.retry.clone(),
        }
    }

    /// Stop accepting calls and connections, give in-flight calls the grace
    /// period, then close every connection.
    ///
    /// Returns the number of calls that were still pending when the grace
    /// period ended and were failed with `NetworkError`.
    pub async fn shutdown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.endpoint.close();
        self.stop_accepting.cancel();

        let grace = self.config.shutdown_grace;
        let connections = self.endpoint.connections();
        tracing::info!(
            service = %self.config.service_name,
            connections = connections.len(),
            ?grace,
            "shutting down"
        );

        let mut drains = JoinSet::new();
        for connection in connections {
            drains.spawn(async move { connection.drain(grace).await });
        }
        let mut abandoned = 0;
        while let Some(result) = drains.join_next().await {
            match result {
                Ok(remaining) => abandoned += remaining,
                Err(e) => tracing::warn!(error = %e, "connection drain task failed"),
            }
        }
        if abandoned > 0 {
            tracing::warn!(abandoned, "calls failed at the end of the grace period");
        }
        abandoned
    }
}

impl<N: NetworkProvider> Drop for Channel<N> {
    fn drop(&mut self) {
        self.stop_accepting.cancel();
    }
}

impl<N: NetworkProvider> std::fmt::Debug for Channel<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("service", &self.config.service_name)
            .field("local", &self.local.get())
            .field("connections", &self.connection_count())
            .finish()
    }
}

async fn accept_loop<N: NetworkProvider>(
    listener: N::TcpListener,
    endpoint: Arc<Endpoint>,
    peers: Arc<PeerManager<N>>,
    stop: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::debug!(error = %e, "accept failed");
                continue;
            }
        };
        if endpoint.is_closed() {
            break;
        }
        tracing::debug!(peer = %peer_addr, "accepted connection");

        let connection = Connection::accept(
            stream,
            peer_addr,
            endpoint.config.clone(),
            endpoint.host_port(),
            endpoint.handlers.clone(),
        );
        endpoint.track(connection.clone());

        let peers = peers.clone();
        tokio::spawn(async move {
            if connection.wait_identified().await.is_ok() {
                peers.add_inbound(connection);
            }
        });
    }
    tracing::debug!("accept loop stopped");
}

/// Client handle for one destination service.
///
/// Cheap to clone; clones share the peer list.
pub struct SubChannel<N: NetworkProvider = TokioNetworkProvider> {
    service: String,
    caller_name: String,
    peers: Arc<PeerList<N>>,
    handlers: Arc<HandlerRegistry>,
    shutting_down: Arc<AtomicBool>,
    default_timeout: Duration,
    retry: RetryOptions,
}

impl<N: NetworkProvider> Clone for SubChannel<N> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            caller_name: self.caller_name.clone(),
            peers: self.peers.clone(),
            handlers: self.handlers.clone(),
            shutting_down: self.shutting_down.clone(),
            default_timeout: self.default_timeout,
            retry: self.retry.clone(),
        }
    }
}

impl<N: NetworkProvider> SubChannel<N> {
    /// Destination service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Candidate peers.
    pub fn peers(&self) -> &Arc<PeerList<N>> {
        &self.peers
    }

    /// Register `handler` for `method` of this service on the owning channel.
    pub fn register(&self, method: impl Into<Bytes>, handler: Arc<dyn Handler>) {
        self.handlers.register(self.service.clone(), method, handler);
    }

    /// Send `request`, retrying on other peers as its retry options allow.
    ///
    /// The returned future resolves once: with the response, the terminal
    /// error, or `Cancelled` if it is cancelled first. Cancelling it stops
    /// further attempts and cancels the one in flight on the wire.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn send(&self, request: OutboundRequest) -> ResponseFuture {
        let future = ResponseFuture::new();
        if self.shutting_down.load(Ordering::Acquire) {
            future.fail(CallError::new(
                ErrorType::Declined,
                "channel is shutting down",
            ));
            return future;
        }

        let request = request.into_parts();
        let mut options = request.retry.unwrap_or_else(|| self.retry.clone());
        let mut headers = request.headers;
        if headers.contains(keys::RETRY_FLAGS) {
            match headers.retry_flags() {
                Ok(flags) => options.flags = flags,
                Err(e) => {
                    future.fail(CallError::bad_request(e.to_string()));
                    return future;
                }
            }
        } else {
            headers.set_retry_flags(options.flags);
        }
        if !headers.contains(keys::CALLER_NAME) {
            headers.insert(keys::CALLER_NAME, self.caller_name.clone());
        }

        let ttl = request.timeout.unwrap_or(self.default_timeout);
        let runner = PeerAttempts {
            peers: self.peers.clone(),
            call: OutboundCall {
                service: self.service.clone(),
                headers,
                trace: request.trace.unwrap_or_else(TraceContext::new_root),
                args: CallArgs::new(request.method, request.arg2, request.arg3),
            },
        };

        let completion = future.clone();
        let driver = tokio::spawn(async move {
            let result = run_with_retries(&runner, &options, ttl, &completion).await;
            match result {
                Ok(response) => {
                    completion.succeed(response);
                }
                Err(error) => {
                    completion.fail(error);
                }
            }
        });
        let abort = driver.abort_handle();
        future.set_cancel_hook(move || abort.abort());
        future
    }
}

impl<N: NetworkProvider> std::fmt::Debug for SubChannel<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubChannel")
            .field("service", &self.service)
            .field("peers", &self.peers)
            .finish()
    }
}

/// Sends attempts of one call to peers from a [`PeerList`].
struct PeerAttempts<N: NetworkProvider> {
    peers: Arc<PeerList<N>>,
    call: OutboundCall,
}

#[async_trait]
impl<N: NetworkProvider> AttemptRunner for PeerAttempts<N> {
    fn pick(&self, tried: &[HostPort]) -> Option<HostPort> {
        self.peers.choose(tried).map(|peer| peer.address())
    }

    async fn attempt(&self, peer: &HostPort, ttl: Duration) -> Result<Response, CallError> {
        let peer = self.peers.peer(*peer);
        peer.attempt(&self.call, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureState;
    use crate::retry::RetryFlags;

    #[test]
    fn test_config_json_defaults() {
        let config: ChannelConfig = serde_json::from_str(r#"{"service_name": "kv"}"#)
            .expect("parse");
        assert_eq!(config, ChannelConfig::new("kv"));

        let json = serde_json::to_value(ChannelConfig::new("kv")).expect("serialize");
        assert_eq!(json["shutdown_grace"], 5000);
        assert_eq!(json["retry"]["limit"], 4);
    }

    #[tokio::test]
    async fn test_send_without_peers_fails() {
        let channel = Channel::new(ChannelConfig::new("client"));
        let sub = channel.sub_channel("kv", Vec::new());
        let err = sub
            .send(OutboundRequest::new("get"))
            .get()
            .await
            .expect_err("no peers");
        assert_eq!(err.error_type(), ErrorType::NetworkError);
    }

    #[tokio::test]
    async fn test_invalid_retry_header_is_bad_request() {
        let channel = Channel::new(ChannelConfig::new("client"));
        let sub = channel.sub_channel("kv", Vec::new());
        let future = sub.send(OutboundRequest::new("get").with_header("re", "cx"));
        let err = future.get().await.expect_err("bad flags");
        assert_eq!(err.error_type(), ErrorType::BadRequest);
        assert_eq!(future.attempts(), 0);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_declined() {
        let channel = Channel::new(ChannelConfig::new("client"));
        let sub = channel.sub_channel("kv", Vec::new());
        assert_eq!(channel.shutdown().await, 0);
        assert!(channel.is_shutting_down());

        let future = sub.send(OutboundRequest::new("get").with_retry_flags(RetryFlags::NEVER));
        assert_eq!(future.state(), FutureState::Failed);
        let err = future.get().await.expect_err("declined");
        assert_eq!(err.error_type(), ErrorType::Declined);
        assert!(matches!(
            channel.listen("127.0.0.1:0").await,
            Err(ConnectionError::Closed)
        ));
    }
}
