//! # tributary-core
//!
//! Core abstractions for the tributary RPC transport.
//!
//! This crate provides the leaf types every other tributary crate builds on:
//!
//! - **Error codes**: [`ErrorType`], the wire-level failure taxonomy
//! - **Tracing**: [`TraceContext`], passed explicitly along the call path
//! - **Arg schemes**: [`ArgScheme`], [`Payload`] and the [`PayloadCodec`]
//!   capability resolved through a [`SchemeRegistry`]
//! - **Networking**: [`NetworkProvider`] so connections can be opened against
//!   real sockets or test doubles
//! - **Addressing**: [`HostPort`] for peer addresses
//!
//! ## Provider Traits
//!
//! The transport never calls `tokio::net` directly. It is generic over a
//! [`NetworkProvider`], with [`TokioNetworkProvider`] as the production
//! implementation.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod error_type;
mod network;
mod scheme;
mod trace;

// Address exports
pub use address::{HostPort, HostPortParseError};

// Error code exports
pub use error_type::ErrorType;

// Provider trait exports
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};

// Arg scheme exports
pub use scheme::{
    ArgScheme, CodecError, JsonCodec, Payload, PayloadCodec, RawCodec, SchemeRegistry, TypedCodec,
};

// Tracing exports
pub use trace::TraceContext;
