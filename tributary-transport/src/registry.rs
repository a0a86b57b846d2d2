//! Per-connection call registry.
//!
//! Maps call ids to in-flight calls in both directions. Outbound entries own
//! the caller's [`ResponseFuture`] and its deadline timer. Inbound entries own
//! the abort handle of the running handler task.
//!
//! Every outbound completion goes through [`CallRegistry::resolve`], which
//! removes the entry under the lock before touching the future. Whichever of
//! the response, the timer, a cancel or a connection close removes the entry
//! first is the only one that completes the call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};

use crate::error::{CallError, ConnectionError};
use crate::future::{Response, ResponseFuture};
use crate::message::CONNECTION_ERROR_ID;
use crate::sync::lock;

struct PendingCall {
    future: ResponseFuture,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    next_id: u32,
    next_generation: u64,
    outbound: HashMap<u32, PendingCall>,
    inbound: HashMap<u32, AbortHandle>,
    closed: bool,
}

impl Inner {
    fn allocate_id(&mut self) -> Result<u32, ConnectionError> {
        // 0 is used by the handshake and u32::MAX by connection errors.
        let usable = u32::MAX as usize - 1;
        if self.outbound.len() >= usable {
            return Err(ConnectionError::IdsExhausted);
        }
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 || self.next_id == CONNECTION_ERROR_ID {
                continue;
            }
            if !self.outbound.contains_key(&self.next_id) {
                return Ok(self.next_id);
            }
        }
    }
}

/// Thread-safe id → call mapping for one connection.
#[derive(Default)]
pub struct CallRegistry {
    inner: Mutex<Inner>,
}

impl CallRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outbound call and arm its deadline.
    ///
    /// Returns the allocated id. When `ttl` elapses before the call resolves,
    /// the call fails with `Timeout`.
    ///
    /// # Errors
    ///
    /// Fails if the registry was closed or every id is in use.
    pub fn register(
        self: &Arc<Self>,
        future: ResponseFuture,
        ttl: Duration,
    ) -> Result<u32, ConnectionError> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(ConnectionError::Closed);
        }
        let id = inner.allocate_id()?;
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let registry = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(registry) = registry.upgrade() {
                let error = CallError::timeout(format!("call timed out after {ttl:?}"));
                if registry.resolve(id, Some(generation), Err(error)) {
                    tracing::debug!(id, ?ttl, "call timed out");
                }
            }
        });

        inner.outbound.insert(
            id,
            PendingCall {
                future,
                generation,
                timer: Some(timer),
            },
        );
        Ok(id)
    }

    /// Complete the outbound call `id` with `result`.
    ///
    /// With `generation` set, only the registration with that generation is
    /// completed, so a stale timer cannot touch a reused id. Returns `false`
    /// if no matching call was pending, in which case `result` is dropped.
    pub fn resolve(
        &self,
        id: u32,
        generation: Option<u64>,
        result: Result<Response, CallError>,
    ) -> bool {
        let call = {
            let mut inner = lock(&self.inner);
            let matches = inner
                .outbound
                .get(&id)
                .is_some_and(|call| generation.map_or(true, |g| call.generation == g));
            if matches {
                inner.outbound.remove(&id)
            } else {
                None
            }
        };

        let Some(call) = call else {
            return false;
        };
        if let Some(timer) = call.timer {
            timer.abort();
        }
        match result {
            Ok(response) => call.future.succeed(response),
            Err(error) => call.future.fail(error),
        }
    }

    /// Forget the outbound call `id` without completing its future.
    ///
    /// Used when the caller cancels. Returns whether the id was pending.
    pub fn remove(&self, id: u32) -> bool {
        let call = lock(&self.inner).outbound.remove(&id);
        match call {
            Some(call) => {
                if let Some(timer) = call.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Whether the outbound call `id` is pending.
    pub fn contains(&self, id: u32) -> bool {
        lock(&self.inner).outbound.contains_key(&id)
    }

    /// Generation of the pending outbound call `id`, if any.
    ///
    /// Changes whenever `id` is freed and handed to a new call.
    pub fn generation(&self, id: u32) -> Option<u64> {
        lock(&self.inner).outbound.get(&id).map(|call| call.generation)
    }

    /// Number of pending outbound calls.
    pub fn outbound_len(&self) -> usize {
        lock(&self.inner).outbound.len()
    }

    /// Track a running inbound handler. Returns `false` if `id` is already
    /// being handled.
    pub fn register_inbound(&self, id: u32, handler: AbortHandle) -> bool {
        let mut inner = lock(&self.inner);
        if inner.closed || inner.inbound.contains_key(&id) {
            handler.abort();
            return false;
        }
        inner.inbound.insert(id, handler);
        true
    }

    /// Whether an inbound handler for `id` is running.
    pub fn has_inbound(&self, id: u32) -> bool {
        lock(&self.inner).inbound.contains_key(&id)
    }

    /// Stop tracking the inbound handler for `id`. Returns whether it was
    /// still tracked, meaning its reply should be sent.
    pub fn finish_inbound(&self, id: u32) -> bool {
        lock(&self.inner).inbound.remove(&id).is_some()
    }

    /// Abort the inbound handler for `id`. Returns whether one was running.
    pub fn cancel_inbound(&self, id: u32) -> bool {
        match lock(&self.inner).inbound.remove(&id) {
            Some(handler) => {
                handler.abort();
                true
            }
            None => false,
        }
    }

    /// Number of running inbound handlers.
    pub fn inbound_len(&self) -> usize {
        lock(&self.inner).inbound.len()
    }

    /// Close the registry: fail every pending outbound call with `error`,
    /// abort every inbound handler, and refuse further registrations.
    ///
    /// Returns the number of outbound calls failed.
    pub fn close(&self, error: &CallError) -> usize {
        let (outbound, inbound) = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            (
                std::mem::take(&mut inner.outbound),
                std::mem::take(&mut inner.inbound),
            )
        };
        for handler in inbound.into_values() {
            handler.abort();
        }
        let mut failed = 0;
        for (_, call) in outbound {
            if let Some(timer) = call.timer {
                timer.abort();
            }
            if call.future.fail(error.clone()) {
                failed += 1;
            }
        }
        failed
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("CallRegistry")
            .field("outbound", &inner.outbound.len())
            .field("inbound", &inner.inbound.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tributary_core::{ErrorType, TraceContext};

    use super::*;
    use crate::fragment::CallArgs;
    use crate::future::FutureState;
    use crate::headers::TransportHeaders;
    use crate::message::ResponseCode;

    fn response(released: &Arc<AtomicUsize>) -> Response {
        let counter = released.clone();
        Response::new(
            ResponseCode::Ok,
            TransportHeaders::new(),
            CallArgs::new("m", "", "body"),
            TraceContext::default(),
        )
        .with_release_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_ids_unique() {
        let registry = Arc::new(CallRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..100 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::with_capacity(100);
                for _ in 0..100 {
                    let id = registry
                        .register(ResponseFuture::new(), Duration::from_secs(60))
                        .expect("register");
                    ids.push(id);
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.expect("join") {
                assert!(seen.insert(id), "id {id} assigned twice");
            }
        }
        assert_eq!(seen.len(), 10_000);
        assert_eq!(registry.outbound_len(), 10_000);
        registry.close(&CallError::network("done"));
    }

    #[tokio::test]
    async fn test_ids_reused_only_after_completion() {
        let registry = Arc::new(CallRegistry::new());
        let first = registry
            .register(ResponseFuture::new(), Duration::from_secs(60))
            .expect("register");
        let second = registry
            .register(ResponseFuture::new(), Duration::from_secs(60))
            .expect("register");
        assert_ne!(first, second);
        assert!(registry.remove(first));
        assert!(!registry.contains(first));
        assert!(registry.contains(second));
    }

    #[tokio::test]
    async fn test_timeout_fires() {
        let registry = Arc::new(CallRegistry::new());
        let future = ResponseFuture::new();
        let id = registry
            .register(future.clone(), Duration::from_millis(20))
            .expect("register");

        let err = future.get().await.expect_err("timed out");
        assert_eq!(err.error_type(), ErrorType::Timeout);
        assert!(!registry.contains(id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_response_race_resolves_once() {
        for round in 0..200 {
            let registry = Arc::new(CallRegistry::new());
            let released = Arc::new(AtomicUsize::new(0));
            let future = ResponseFuture::new();
            let id = registry
                .register(future.clone(), Duration::from_millis(2))
                .expect("register");

            let responder = {
                let registry = registry.clone();
                let released = released.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    registry.resolve(id, None, Ok(response(&released)))
                })
            };

            let result = future.get().await;
            let delivered = responder.await.expect("join");
            match result {
                Ok(response) => {
                    assert!(delivered, "round {round}");
                    drop(response);
                }
                Err(err) => {
                    assert_eq!(err.error_type(), ErrorType::Timeout, "round {round}");
                    assert!(!delivered, "round {round}");
                    // The losing response was dropped on the spot.
                    assert_eq!(released.load(Ordering::SeqCst), 1, "round {round}");
                }
            }
            drop(future);
            assert_eq!(released.load(Ordering::SeqCst), 1, "round {round}");
        }
    }

    #[tokio::test]
    async fn test_stale_generation_ignored() {
        let registry = Arc::new(CallRegistry::new());
        let future = ResponseFuture::new();
        let id = registry
            .register(future.clone(), Duration::from_secs(60))
            .expect("register");

        assert!(!registry.resolve(id, Some(0), Err(CallError::timeout("stale"))));
        assert_eq!(future.state(), FutureState::Pending);
        assert!(registry.resolve(id, None, Err(CallError::network("reset"))));
    }

    #[tokio::test]
    async fn test_generation_follows_registration() {
        let registry = Arc::new(CallRegistry::new());
        let first = registry
            .register(ResponseFuture::new(), Duration::from_secs(60))
            .expect("register");
        let second = registry
            .register(ResponseFuture::new(), Duration::from_secs(60))
            .expect("register");

        let generation = registry.generation(first).expect("pending");
        assert_ne!(registry.generation(second), Some(generation));
        assert!(registry.remove(first));
        assert_eq!(registry.generation(first), None);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_refuses_new() {
        let registry = Arc::new(CallRegistry::new());
        let futures: Vec<_> = (0..5).map(|_| ResponseFuture::new()).collect();
        for future in &futures {
            registry
                .register(future.clone(), Duration::from_secs(60))
                .expect("register");
        }

        assert_eq!(registry.close(&CallError::network("closed")), 5);
        for future in &futures {
            let err = future.get().await.expect_err("failed");
            assert_eq!(err.error_type(), ErrorType::NetworkError);
        }
        assert!(matches!(
            registry.register(ResponseFuture::new(), Duration::from_secs(1)),
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_inbound_tracking() {
        let registry = CallRegistry::new();
        let task = tokio::spawn(std::future::pending::<()>());
        assert!(registry.register_inbound(7, task.abort_handle()));
        assert!(registry.has_inbound(7));

        let duplicate = tokio::spawn(std::future::pending::<()>());
        assert!(!registry.register_inbound(7, duplicate.abort_handle()));
        assert!(duplicate.await.expect_err("aborted").is_cancelled());

        assert!(registry.cancel_inbound(7));
        assert!(task.await.expect_err("aborted").is_cancelled());
        assert!(!registry.finish_inbound(7));
    }
}
