use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tributary_core::{ArgScheme, CodecError, Payload, SchemeRegistry, TraceContext};

use crate::fragment::CallArgs;
use crate::headers::TransportHeaders;
use crate::message::ResponseCode;
use crate::sync::lock;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A completed call's response.
///
/// Cloning a `Response` shares the same argument buffers. The buffers, and
/// the release hook if one is set, are released when the last clone drops.
#[derive(Clone)]
pub struct Response {
    inner: Arc<ResponseInner>,
}

struct ResponseInner {
    code: ResponseCode,
    headers: TransportHeaders,
    args: CallArgs,
    trace: TraceContext,
    release: Mutex<Option<ReleaseHook>>,
}

impl Drop for ResponseInner {
    fn drop(&mut self) {
        let hook = self
            .release
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Response {
    /// Assemble a response.
    pub fn new(
        code: ResponseCode,
        headers: TransportHeaders,
        args: CallArgs,
        trace: TraceContext,
    ) -> Self {
        Self {
            inner: Arc::new(ResponseInner {
                code,
                headers,
                args,
                trace,
                release: Mutex::new(None),
            }),
        }
    }

    /// Attach a hook that runs exactly once, when the last clone drops.
    ///
    /// Replaces any previously attached hook without running it.
    pub fn with_release_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *lock(&self.inner.release) = Some(Box::new(hook));
        self
    }

    /// Application status.
    pub fn code(&self) -> ResponseCode {
        self.inner.code
    }

    /// Whether the handler reported an application-level error.
    pub fn is_application_error(&self) -> bool {
        self.inner.code == ResponseCode::ApplicationError
    }

    /// Transport headers.
    pub fn headers(&self) -> &TransportHeaders {
        &self.inner.headers
    }

    /// All three arguments.
    pub fn args(&self) -> &CallArgs {
        &self.inner.args
    }

    /// Method name echoed by the server.
    pub fn arg1(&self) -> &Bytes {
        &self.inner.args.arg1
    }

    /// Application headers.
    pub fn arg2(&self) -> &Bytes {
        &self.inner.args.arg2
    }

    /// Body.
    pub fn arg3(&self) -> &Bytes {
        &self.inner.args.arg3
    }

    /// Trace context of the call.
    pub fn trace(&self) -> TraceContext {
        self.inner.trace
    }

    /// Decode arg2/arg3 according to the `as` header, defaulting to raw.
    ///
    /// # Errors
    ///
    /// Returns the codec's error if the bytes are invalid for the scheme.
    pub fn payload(&self, schemes: &SchemeRegistry) -> Result<Payload, CodecError> {
        let scheme = self.headers().arg_scheme().unwrap_or(ArgScheme::Raw);
        schemes.decode(scheme, self.arg2(), self.arg3())
    }

    /// Number of live references to the buffers.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("code", &self.inner.code)
            .field("headers", &self.inner.headers)
            .field("arg1_len", &self.inner.args.arg1.len())
            .field("arg2_len", &self.inner.args.arg2.len())
            .field("arg3_len", &self.inner.args.arg3.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_release_hook_runs_on_last_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let response = Response::new(
            ResponseCode::Ok,
            TransportHeaders::new(),
            CallArgs::new("m", "", "body"),
            TraceContext::default(),
        )
        .with_release_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let clone = response.clone();
        assert_eq!(response.ref_count(), 2);
        drop(response);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_payload_uses_arg_scheme() {
        let response = Response::new(
            ResponseCode::Ok,
            TransportHeaders::new().with("as", "json"),
            CallArgs::new("m", "", r#"{"ok":true}"#),
            TraceContext::default(),
        );
        let payload = response.payload(&SchemeRegistry::default()).expect("decode");
        assert_eq!(payload.scheme(), ArgScheme::Json);
    }
}
