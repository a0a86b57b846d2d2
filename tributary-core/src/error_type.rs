//! Wire error codes carried by Error frames.

use serde::{Deserialize, Serialize};

/// Failure classes a call can terminate with.
///
/// The discriminant is the one-byte code written in Error frames.
///
/// Only [`ErrorType::Timeout`] and [`ErrorType::NetworkError`] are ever
/// retried; every other code is terminal and reaches the caller on first
/// occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorType {
    /// Not a valid error; never sent intentionally.
    Invalid = 0x00,
    /// The call did not complete before its TTL expired.
    Timeout = 0x01,
    /// The call was cancelled by the caller.
    Cancelled = 0x02,
    /// The peer is overloaded and refused the call.
    Busy = 0x03,
    /// The peer declined the call for a reason other than load.
    Declined = 0x04,
    /// The handler failed in an unexpected way.
    UnexpectedError = 0x05,
    /// The request was malformed or failed an integrity check.
    BadRequest = 0x06,
    /// The connection failed before a response arrived.
    NetworkError = 0x07,
    /// The peer reports itself as unhealthy.
    Unhealthy = 0x08,
    /// The byte stream violated the protocol; the connection is closed.
    FatalProtocolError = 0xff,
}

impl ErrorType {
    /// Decode a wire code. Unknown codes yield `None`.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ErrorType::Invalid),
            0x01 => Some(ErrorType::Timeout),
            0x02 => Some(ErrorType::Cancelled),
            0x03 => Some(ErrorType::Busy),
            0x04 => Some(ErrorType::Declined),
            0x05 => Some(ErrorType::UnexpectedError),
            0x06 => Some(ErrorType::BadRequest),
            0x07 => Some(ErrorType::NetworkError),
            0x08 => Some(ErrorType::Unhealthy),
            0xff => Some(ErrorType::FatalProtocolError),
            _ => None,
        }
    }

    /// The one-byte wire code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether a retry policy may resend a call that failed with this code.
    pub const fn is_retryable(self) -> bool {
        matches!(self, ErrorType::Timeout | ErrorType::NetworkError)
    }

    /// Whether this error forces the owning connection closed.
    pub const fn closes_connection(self) -> bool {
        matches!(self, ErrorType::FatalProtocolError)
    }

    /// Short lowercase name, stable for logs and metrics labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorType::Invalid => "invalid",
            ErrorType::Timeout => "timeout",
            ErrorType::Cancelled => "cancelled",
            ErrorType::Busy => "busy",
            ErrorType::Declined => "declined",
            ErrorType::UnexpectedError => "unexpected-error",
            ErrorType::BadRequest => "bad-request",
            ErrorType::NetworkError => "network-error",
            ErrorType::Unhealthy => "unhealthy",
            ErrorType::FatalProtocolError => "fatal-protocol-error",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorType; 10] = [
        ErrorType::Invalid,
        ErrorType::Timeout,
        ErrorType::Cancelled,
        ErrorType::Busy,
        ErrorType::Declined,
        ErrorType::UnexpectedError,
        ErrorType::BadRequest,
        ErrorType::NetworkError,
        ErrorType::Unhealthy,
        ErrorType::FatalProtocolError,
    ];

    #[test]
    fn test_codes_match_wire_table() {
        assert_eq!(ErrorType::Timeout.code(), 0x01);
        assert_eq!(ErrorType::NetworkError.code(), 0x07);
        assert_eq!(ErrorType::FatalProtocolError.code(), 0xff);
        for error_type in ALL {
            assert_eq!(ErrorType::from_code(error_type.code()), Some(error_type));
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert_eq!(ErrorType::from_code(0x09), None);
        assert_eq!(ErrorType::from_code(0x80), None);
    }

    #[test]
    fn test_only_timeout_and_network_are_retryable() {
        let retryable: Vec<_> = ALL.iter().filter(|e| e.is_retryable()).collect();
        assert_eq!(
            retryable,
            vec![&ErrorType::Timeout, &ErrorType::NetworkError]
        );
    }

    #[test]
    fn test_only_fatal_closes_connection() {
        for error_type in ALL {
            assert_eq!(
                error_type.closes_connection(),
                error_type == ErrorType::FatalProtocolError
            );
        }
    }
}
