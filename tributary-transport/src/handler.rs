//! Inbound call handlers and their routing table.
//!
//! Handlers are registered per `(service, method)`, where the method is the
//! call's arg1. A service may also register a fallback handler that receives
//! every method without a dedicated handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tributary_core::{ArgScheme, CodecError, Payload, SchemeRegistry, TraceContext};

use crate::error::{CallError, HandlerError};
use crate::fragment::CallArgs;
use crate::headers::TransportHeaders;
use crate::message::ResponseCode;
use crate::sync::{read, write};

/// A reassembled inbound call handed to a [`Handler`].
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Destination service.
    pub service: String,
    /// Transport headers.
    pub headers: TransportHeaders,
    /// Trace context written by the caller.
    pub trace: TraceContext,
    /// Remaining TTL when the call arrived.
    pub ttl: Duration,
    /// The three arguments.
    pub args: CallArgs,
    /// `host_port` the caller advertised in its handshake.
    pub remote_host_port: String,
}

impl InboundCall {
    /// Method name (arg1), lossily decoded.
    pub fn method(&self) -> String {
        String::from_utf8_lossy(&self.args.arg1).into_owned()
    }

    /// Arg scheme from the `as` header, defaulting to raw.
    pub fn arg_scheme(&self) -> ArgScheme {
        self.headers.arg_scheme().unwrap_or(ArgScheme::Raw)
    }

    /// Decode arg2/arg3 with the codec for the call's arg scheme.
    ///
    /// # Errors
    ///
    /// Returns the codec's error if the bytes are invalid for the scheme.
    pub fn payload(&self, schemes: &SchemeRegistry) -> Result<Payload, CodecError> {
        schemes.decode(self.arg_scheme(), &self.args.arg2, &self.args.arg3)
    }
}

/// Response produced by a [`Handler`]. arg1 is always the request's method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingResponse {
    /// Application status.
    pub code: ResponseCode,
    /// Transport headers.
    pub headers: TransportHeaders,
    /// Application headers.
    pub arg2: Bytes,
    /// Body.
    pub arg3: Bytes,
}

impl OutgoingResponse {
    /// Successful response with raw bytes.
    pub fn ok(arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) -> Self {
        Self {
            code: ResponseCode::Ok,
            headers: TransportHeaders::new(),
            arg2: arg2.into(),
            arg3: arg3.into(),
        }
    }

    /// Application error response with raw bytes.
    pub fn application_error(arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) -> Self {
        Self {
            code: ResponseCode::ApplicationError,
            ..Self::ok(arg2, arg3)
        }
    }

    /// Successful response encoded from `payload`, with the matching `as`
    /// header.
    ///
    /// # Errors
    ///
    /// Returns the codec's error if the payload cannot be encoded.
    pub fn from_payload(payload: &Payload, schemes: &SchemeRegistry) -> Result<Self, HandlerError> {
        let (scheme, arg2, arg3) = schemes.encode(payload)?;
        let mut response = Self::ok(arg2, arg3);
        response.headers.set_arg_scheme(scheme);
        Ok(response)
    }

    /// Add a transport header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }
}

/// Server-side call handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one call. Runs on its own task, off the connection's I/O path.
    async fn handle(&self, call: InboundCall) -> Result<OutgoingResponse, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutgoingResponse, HandlerError>> + Send + 'static,
{
    async fn handle(&self, call: InboundCall) -> Result<OutgoingResponse, HandlerError> {
        (self.0)(call).await
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutgoingResponse, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Default)]
struct ServiceHandlers {
    methods: HashMap<Bytes, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
}

/// Routes inbound calls by service and method.
#[derive(Default)]
pub struct HandlerRegistry {
    services: RwLock<HashMap<String, ServiceHandlers>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method` of `service`, replacing any previous
    /// one.
    pub fn register(
        &self,
        service: impl Into<String>,
        method: impl Into<Bytes>,
        handler: Arc<dyn Handler>,
    ) {
        write(&self.services)
            .entry(service.into())
            .or_default()
            .methods
            .insert(method.into(), handler);
    }

    /// Register a fallback for every method of `service` without a dedicated
    /// handler.
    pub fn register_service(&self, service: impl Into<String>, handler: Arc<dyn Handler>) {
        write(&self.services)
            .entry(service.into())
            .or_default()
            .fallback = Some(handler);
    }

    /// Remove every handler of `service`. Returns whether it was registered.
    pub fn unregister_service(&self, service: &str) -> bool {
        write(&self.services).remove(service).is_some()
    }

    /// Find the handler for a call.
    ///
    /// # Errors
    ///
    /// Returns a `BadRequest` error for an unknown service or method.
    pub fn find(&self, service: &str, method: &[u8]) -> Result<Arc<dyn Handler>, CallError> {
        let services = read(&self.services);
        let handlers = services
            .get(service)
            .ok_or_else(|| CallError::bad_request(format!("no handler for service {service:?}")))?;
        handlers
            .methods
            .get(method)
            .or(handlers.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                CallError::bad_request(format!(
                    "no handler for method {:?} of service {service:?}",
                    String::from_utf8_lossy(method)
                ))
            })
    }

    /// Number of services with at least one handler.
    pub fn service_count(&self) -> usize {
        read(&self.services).len()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services = read(&self.services);
        let mut names: Vec<_> = services.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("services", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tributary_core::ErrorType;

    use super::*;

    fn call(service: &str, method: &str) -> InboundCall {
        InboundCall {
            service: service.to_string(),
            headers: TransportHeaders::new(),
            trace: TraceContext::default(),
            ttl: Duration::from_secs(1),
            args: CallArgs::new(method.to_string(), "", "body"),
            remote_host_port: "127.0.0.1:1".to_string(),
        }
    }

    fn echo() -> Arc<dyn Handler> {
        handler_fn(|call: InboundCall| async move { Ok(OutgoingResponse::ok("", call.args.arg3)) })
    }

    fn constant(body: &'static str) -> Arc<dyn Handler> {
        handler_fn(move |_call: InboundCall| async move { Ok(OutgoingResponse::ok("", body)) })
    }

    #[tokio::test]
    async fn test_routing_by_method() {
        let registry = HandlerRegistry::new();
        registry.register("kv", "get", echo());
        registry.register_service("kv", constant("fallback"));

        let handler = registry.find("kv", b"get").expect("found");
        let response = handler.handle(call("kv", "get")).await.expect("handled");
        assert_eq!(&response.arg3[..], b"body");

        let handler = registry.find("kv", b"other").expect("fallback");
        let response = handler.handle(call("kv", "other")).await.expect("handled");
        assert_eq!(&response.arg3[..], b"fallback");
    }

    #[test]
    fn test_unknown_routes_are_bad_request() {
        let registry = HandlerRegistry::new();
        registry.register("kv", "get", echo());

        let err = registry.find("blob", b"get").err().expect("unknown service");
        assert_eq!(err.error_type(), ErrorType::BadRequest);
        let err = registry.find("kv", b"put").err().expect("unknown method");
        assert_eq!(err.error_type(), ErrorType::BadRequest);

        assert!(registry.unregister_service("kv"));
        assert_eq!(registry.service_count(), 0);
    }

    #[test]
    fn test_response_from_json_payload() {
        let payload = Payload::json_body(&json!({"value": 1})).expect("payload");
        let response =
            OutgoingResponse::from_payload(&payload, &SchemeRegistry::default()).expect("encode");
        assert_eq!(response.headers.arg_scheme(), Some(ArgScheme::Json));
        assert_eq!(&response.arg3[..], br#"{"value":1}"#);
    }

    #[test]
    fn test_inbound_payload() {
        let mut inbound = call("kv", "get");
        inbound.headers.set_arg_scheme(ArgScheme::Json);
        inbound.args.arg3 = Bytes::from_static(br#"{"key":"a"}"#);
        let payload = inbound.payload(&SchemeRegistry::default()).expect("decode");
        assert_eq!(payload.parse_json::<serde_json::Value>().expect("json"), json!({"key": "a"}));
    }
}
