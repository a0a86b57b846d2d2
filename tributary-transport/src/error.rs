//! Error types for the tributary transport.

use std::io;

use tributary_core::{CodecError, ErrorType};

use crate::frame::{FrameError, FrameType};

/// Failure of a single call, as seen by its caller.
///
/// Every outbound call resolves to either a response or exactly one
/// `CallError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct CallError {
    error_type: ErrorType,
    message: String,
}

impl CallError {
    /// Create an error with the given code.
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    /// Call exceeded its TTL budget.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Timeout, message)
    }

    /// Connection failed before a response arrived.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NetworkError, message)
    }

    /// Call was cancelled by its caller.
    pub fn cancelled() -> Self {
        Self::new(ErrorType::Cancelled, "call cancelled")
    }

    /// Request was malformed.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorType::BadRequest, message)
    }

    /// The error code.
    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    /// Human-readable description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a retry policy may resend after this error.
    pub fn is_retryable(&self) -> bool {
        self.error_type.is_retryable()
    }
}

/// Message-level protocol violations found while decoding frame payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame header itself was invalid.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A body field ran past the end of the payload.
    #[error("truncated {field}")]
    Truncated {
        /// Field being read.
        field: &'static str,
    },

    /// A string field was not valid UTF-8.
    #[error("{field} is not valid utf-8")]
    InvalidUtf8 {
        /// Field being read.
        field: &'static str,
    },

    /// A field is too long for its length prefix.
    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        /// Field being written.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Largest encodable length.
        max: usize,
    },

    /// Computed checksum does not match the one carried by the frame.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// Checksum type is unknown or not implemented.
    #[error("unsupported checksum type {code:#04x}")]
    UnsupportedChecksum {
        /// Type byte read from the frame.
        code: u8,
    },

    /// A continuation frame switched checksum type mid-call.
    #[error("checksum type changed from {first:#04x} to {later:#04x} within one call")]
    ChecksumTypeChanged {
        /// Type of the first fragment.
        first: u8,
        /// Type of the offending fragment.
        later: u8,
    },

    /// Chunk layout across fragments is impossible.
    #[error("inconsistent argument framing: {0}")]
    Framing(&'static str),

    /// Frame headers leave no room for argument bytes.
    #[error("call headers leave {available} bytes for arguments")]
    NoRoomForArgs {
        /// Bytes remaining in the first frame.
        available: usize,
    },

    /// Error frame carried an unknown error code.
    #[error("unknown error code {0:#04x}")]
    UnknownErrorCode(u8),

    /// Call response carried an unknown response code.
    #[error("unknown response code {0:#04x}")]
    UnknownResponseCode(u8),

    /// Handshake used a protocol version other than ours.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    /// Handshake lacked a required header.
    #[error("init message missing required header {0:?}")]
    MissingInitHeader(&'static str),

    /// A frame arrived that is not valid in the connection's current state.
    #[error("unexpected {frame_type:?} frame for id {id}")]
    UnexpectedFrame {
        /// Type of the frame.
        frame_type: FrameType,
        /// Its id.
        id: u32,
    },
}

impl ProtocolError {
    /// Map to the error code reported to callers and peers.
    ///
    /// Integrity failures fail only the affected call. Everything else means
    /// the byte stream can no longer be trusted.
    pub fn classify(&self) -> ErrorType {
        match self {
            ProtocolError::ChecksumMismatch { .. }
            | ProtocolError::UnsupportedChecksum { .. }
            | ProtocolError::ChecksumTypeChanged { .. } => ErrorType::BadRequest,
            _ => ErrorType::FatalProtocolError,
        }
    }

    /// Whether this error must close the connection.
    pub fn is_fatal(&self) -> bool {
        self.classify().closes_connection()
    }
}

impl From<ProtocolError> for CallError {
    fn from(err: ProtocolError) -> Self {
        CallError::new(err.classify(), err.to_string())
    }
}

/// Errors establishing or using a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TCP connect did not finish in time.
    #[error("connect to {addr} timed out")]
    ConnectTimeout {
        /// Address being dialed.
        addr: String,
    },

    /// Init handshake did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Handshake or stream violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection failed or was closed, for the given reason.
    #[error("connection failed: {reason}")]
    Failed {
        /// What closed the connection.
        reason: String,
    },

    /// Operation requires an identified connection.
    #[error("connection is not ready: {state}")]
    NotReady {
        /// State name at the time of the call.
        state: &'static str,
    },

    /// Every call id is in use.
    #[error("no free call ids")]
    IdsExhausted,

    /// Connection has closed.
    #[error("connection closed")]
    Closed,
}

impl From<ConnectionError> for CallError {
    fn from(err: ConnectionError) -> Self {
        CallError::network(err.to_string())
    }
}

/// Error produced by an inbound call handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Handler chose to fail the call with a specific code.
    #[error(transparent)]
    Call(#[from] CallError),

    /// Payload could not be decoded or encoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        HandlerError::Codec(err.to_string())
    }
}

impl From<HandlerError> for CallError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Call(call_error) => call_error,
            HandlerError::Codec(message) => CallError::bad_request(message),
        }
    }
}
