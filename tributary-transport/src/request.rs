//! Outbound request builder.

use std::time::Duration;

use bytes::Bytes;
use tributary_core::{CodecError, Payload, SchemeRegistry, TraceContext};

use crate::headers::{keys, TransportHeaders};
use crate::retry::{RetryFlags, RetryOptions};

/// A request to send through a [`SubChannel`](crate::SubChannel).
///
/// Unset fields fall back to the sub-channel's defaults.
///
/// ```rust
/// use std::time::Duration;
/// use tributary_transport::{OutboundRequest, RetryFlags};
///
/// let request = OutboundRequest::new("get")
///     .with_body("key-1")
///     .with_timeout(Duration::from_millis(250))
///     .with_retry_flags(RetryFlags::NEVER);
/// assert_eq!(request.headers().get("re"), Some("n"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct OutboundRequest {
    method: Bytes,
    arg2: Bytes,
    arg3: Bytes,
    headers: TransportHeaders,
    timeout: Option<Duration>,
    retry: Option<RetryOptions>,
    trace: Option<TraceContext>,
}

impl OutboundRequest {
    /// Request for `method` with empty arg2 and arg3.
    pub fn new(method: impl Into<Bytes>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    /// Set the application headers (arg2).
    pub fn with_arg2(mut self, arg2: impl Into<Bytes>) -> Self {
        self.arg2 = arg2.into();
        self
    }

    /// Set the body (arg3).
    pub fn with_body(mut self, arg3: impl Into<Bytes>) -> Self {
        self.arg3 = arg3.into();
        self
    }

    /// Encode `payload` into arg2 and arg3 and set the `as` header.
    ///
    /// # Errors
    ///
    /// Returns the codec's error if the payload cannot be encoded.
    pub fn with_payload(
        mut self,
        payload: &Payload,
        schemes: &SchemeRegistry,
    ) -> Result<Self, CodecError> {
        let (scheme, arg2, arg3) = schemes.encode(payload)?;
        self.arg2 = arg2;
        self.arg3 = arg3;
        self.headers.set_arg_scheme(scheme);
        Ok(self)
    }

    /// Add a transport header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Set the caller name (`cn`).
    pub fn with_caller_name(self, caller: impl Into<String>) -> Self {
        self.with_header(keys::CALLER_NAME, caller)
    }

    /// Set the shard key (`sk`).
    pub fn with_shard_key(self, shard_key: impl Into<String>) -> Self {
        self.with_header(keys::SHARD_KEY, shard_key)
    }

    /// Total time budget for the call, shared by every attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry options for this call.
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the `re` header.
    pub fn with_retry_flags(mut self, flags: RetryFlags) -> Self {
        self.headers.set_retry_flags(flags);
        self
    }

    /// Trace context to send. A new root context is used when unset.
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Method (arg1).
    pub fn method(&self) -> &Bytes {
        &self.method
    }

    /// Application headers (arg2).
    pub fn arg2(&self) -> &Bytes {
        &self.arg2
    }

    /// Body (arg3).
    pub fn body(&self) -> &Bytes {
        &self.arg3
    }

    /// Transport headers.
    pub fn headers(&self) -> &TransportHeaders {
        &self.headers
    }

    /// Explicit timeout, if set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Explicit retry options, if set.
    pub fn retry(&self) -> Option<&RetryOptions> {
        self.retry.as_ref()
    }

    /// Explicit trace context, if set.
    pub fn trace(&self) -> Option<TraceContext> {
        self.trace
    }

    pub(crate) fn into_parts(self) -> RequestParts {
        RequestParts {
            method: self.method,
            arg2: self.arg2,
            arg3: self.arg3,
            headers: self.headers,
            timeout: self.timeout,
            retry: self.retry,
            trace: self.trace,
        }
    }
}

pub(crate) struct RequestParts {
    pub(crate) method: Bytes,
    pub(crate) arg2: Bytes,
    pub(crate) arg3: Bytes,
    pub(crate) headers: TransportHeaders,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: Option<RetryOptions>,
    pub(crate) trace: Option<TraceContext>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tributary_core::ArgScheme;

    use super::*;

    #[test]
    fn test_json_payload_sets_scheme() {
        let payload = Payload::json_body(&json!({"key": "a"})).expect("payload");
        let request = OutboundRequest::new("get")
            .with_payload(&payload, &SchemeRegistry::default())
            .expect("encode");
        assert_eq!(request.headers().arg_scheme(), Some(ArgScheme::Json));
        assert_eq!(&request.body()[..], br#"{"key":"a"}"#);
    }

    #[test]
    fn test_standard_headers() {
        let request = OutboundRequest::new("get")
            .with_caller_name("frontend")
            .with_shard_key("user-7");
        assert_eq!(request.headers().caller_name(), Some("frontend"));
        assert_eq!(request.headers().shard_key(), Some("user-7"));
        assert!(request.timeout().is_none());
        assert!(request.retry().is_none());
    }
}
