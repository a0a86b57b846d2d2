//! # Tributary Transport
//!
//! Multiplexed request/response RPC over framed TCP connections.
//!
//! This crate provides:
//! - **Frames**: the 16-byte header codec and message bodies
//! - **Fragmentation**: splitting calls across frames with per-fragment
//!   checksums, and reassembling them
//! - **Connections**: handshake, call multiplexing by id, timeouts,
//!   cancellation and ping, driven by one reader and one writer task
//! - **Peers**: reconnecting connections with health scoring and peer
//!   selection
//! - **Retries**: flag-gated retry across peers under one shared TTL
//! - **Channels**: the listener, handler dispatch and [`SubChannel`] client
//!   handles
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tributary_transport::{
//!     handler_fn, Channel, ChannelConfig, OutboundRequest, OutgoingResponse,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Channel::new(ChannelConfig::new("kv"));
//! server.register(
//!     "kv",
//!     "get",
//!     handler_fn(|call| async move { Ok(OutgoingResponse::ok("", call.args.arg3)) }),
//! );
//! let addr = server.listen("127.0.0.1:0").await?;
//!
//! let client = Channel::new(ChannelConfig::new("frontend"));
//! let kv = client.sub_channel("kv", [addr]);
//! let response = kv
//!     .send(OutboundRequest::new("get").with_body("key").with_timeout(Duration::from_secs(1)))
//!     .get()
//!     .await?;
//! assert_eq!(&response.arg3()[..], b"key");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use tributary_core::{
    ArgScheme, CodecError, ErrorType, HostPort, HostPortParseError, JsonCodec, NetworkProvider,
    Payload, PayloadCodec, RawCodec, SchemeRegistry, TcpListenerTrait, TokioNetworkProvider,
    TraceContext, TypedCodec,
};

// =============================================================================
// Modules
// =============================================================================

/// Error types for every layer.
pub mod error;

/// Frame header codec.
pub mod frame;

/// Message bodies carried in frames.
pub mod message;

/// Splitting calls into frames and reassembling them.
pub mod fragment;

/// Transport headers.
pub mod headers;

/// Per-connection call bookkeeping.
pub mod registry;

/// Response futures.
pub mod future;

/// Inbound call handlers.
pub mod handler;

/// Multiplexed connections.
pub mod connection;

/// Peers and peer selection.
pub mod peer;

/// Retry flags and the retry loop.
pub mod retry;

/// Outbound requests.
pub mod request;

/// Channels and sub-channels.
pub mod channel;

mod serde_ms;
mod sync;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Error exports
pub use error::{CallError, ConnectionError, HandlerError, ProtocolError};

// Frame exports
pub use frame::{Frame, FrameError, FrameType, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};

// Message exports
pub use message::ResponseCode;

// Fragment exports
pub use fragment::{encode_call, reassemble, CallArgs, CallHead, CallMessage, ChecksumType};

// Header exports
pub use headers::TransportHeaders;

// Lifecycle exports
pub use future::{FutureState, GetError, Outcome, Response, ResponseFuture};
pub use registry::CallRegistry;

// Handler exports
pub use handler::{handler_fn, Handler, HandlerRegistry, InboundCall, OutgoingResponse};

// Connection exports
pub use connection::{Connection, ConnectionConfig, ConnectionState, Direction, OutboundCall};

// Peer exports
pub use peer::{Peer, PeerConfig, PeerList, PeerManager, PeerMetrics};

// Retry exports
pub use retry::{run_with_retries, AttemptRunner, RetryFlags, RetryFlagsError, RetryOptions};

// Channel exports
pub use channel::{Channel, ChannelConfig, SubChannel};
pub use request::OutboundRequest;
