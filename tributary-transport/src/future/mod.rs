//! Response futures.
//!
//! A [`ResponseFuture`] is a single-assignment completion cell shared by the
//! connection that completes it and any number of waiters and listeners.
//! Exactly one of [`succeed`](ResponseFuture::succeed),
//! [`fail`](ResponseFuture::fail) or [`cancel`](ResponseFuture::cancel) takes
//! effect. A losing transition drops its payload on the spot, so a response
//! that lost a race against a timeout is released without ever being seen.
//!
//! The future's slot holds one reference to a successful [`Response`]. Every
//! waiter and listener receives its own reference and drops it when done. The
//! slot reference is dropped by [`release`](ResponseFuture::release) or when
//! the last handle to the future goes away. The response's buffers are
//! therefore released exactly once, after every consumer has finished.

mod response;

pub use response::Response;

use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tributary_core::ErrorType;

use crate::error::CallError;
use crate::sync::lock;

/// Observable state of a [`ResponseFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// No outcome yet.
    Pending,
    /// Completed with a response.
    Succeeded,
    /// Completed with an error.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

/// Terminal outcome handed to listeners.
#[derive(Debug)]
pub enum Outcome<'a> {
    /// The call produced a response.
    Succeeded(&'a Response),
    /// The call failed.
    Failed(&'a CallError),
    /// The call was cancelled.
    Cancelled,
}

/// Error from the interruptible and blocking waits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GetError {
    /// The call itself failed.
    #[error(transparent)]
    Call(#[from] CallError),
    /// The wait was interrupted before the call finished. The future is
    /// unaffected.
    #[error("wait interrupted")]
    Interrupted,
}

type Listener = Box<dyn FnOnce(Outcome<'_>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

enum Slot {
    Pending,
    Succeeded(Response),
    Failed(CallError),
    Cancelled,
    Released,
}

/// Owned snapshot of a terminal slot, one per consumer.
#[derive(Clone)]
enum Completion {
    Succeeded(Response),
    Failed(CallError),
    Cancelled,
}

impl Completion {
    fn outcome(&self) -> Outcome<'_> {
        match self {
            Completion::Succeeded(response) => Outcome::Succeeded(response),
            Completion::Failed(error) => Outcome::Failed(error),
            Completion::Cancelled => Outcome::Cancelled,
        }
    }

    fn into_result(self) -> Result<Response, CallError> {
        match self {
            Completion::Succeeded(response) => Ok(response),
            Completion::Failed(error) => Err(error),
            Completion::Cancelled => Err(CallError::cancelled()),
        }
    }
}

struct State {
    slot: Slot,
    listeners: Vec<(Listener, Option<Handle>)>,
    cancel_hook: Option<CancelHook>,
}

impl State {
    fn completion(&self) -> Option<Completion> {
        match &self.slot {
            Slot::Pending => None,
            Slot::Succeeded(response) => Some(Completion::Succeeded(response.clone())),
            Slot::Failed(error) => Some(Completion::Failed(error.clone())),
            Slot::Cancelled => Some(Completion::Cancelled),
            Slot::Released => Some(Completion::Failed(CallError::new(
                ErrorType::Invalid,
                "response already released",
            ))),
        }
    }
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
    done: watch::Sender<bool>,
    attempts: AtomicU32,
    handle: Option<Handle>,
}

/// Completion cell for one outbound call.
///
/// Clones are handles to the same cell.
#[derive(Clone)]
pub struct ResponseFuture {
    shared: Arc<Shared>,
}

impl Default for ResponseFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseFuture {
    /// Create a pending future.
    ///
    /// The current Tokio runtime, if any, becomes the default executor for
    /// [`on_complete`](Self::on_complete) listeners.
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slot: Slot::Pending,
                    listeners: Vec::new(),
                    cancel_hook: None,
                }),
                condvar: Condvar::new(),
                done,
                attempts: AtomicU32::new(0),
                handle: Handle::try_current().ok(),
            }),
        }
    }

    /// Complete with a response. Returns `false`, dropping `response`, if the
    /// future was already terminal.
    pub fn succeed(&self, response: Response) -> bool {
        self.transition(Slot::Succeeded(response)).is_some()
    }

    /// Complete with an error. Returns `false` if the future was already
    /// terminal.
    pub fn fail(&self, error: CallError) -> bool {
        self.transition(Slot::Failed(error)).is_some()
    }

    /// Cancel the call. Returns `false` if the future was already terminal.
    ///
    /// On success the cancel hook runs, freeing the call's id and notifying
    /// the peer.
    pub fn cancel(&self) -> bool {
        match self.transition(Slot::Cancelled) {
            Some(Some(hook)) => {
                hook();
                true
            }
            Some(None) => true,
            None => false,
        }
    }

    /// Install the action [`cancel`](Self::cancel) performs.
    pub(crate) fn set_cancel_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = lock(&self.shared.state);
        if matches!(state.slot, Slot::Pending) {
            state.cancel_hook = Some(Box::new(hook));
        }
    }

    /// Returns `None` if already terminal, else the cancel hook that was
    /// installed.
    fn transition(&self, next: Slot) -> Option<Option<CancelHook>> {
        let (listeners, completion, hook) = {
            let mut state = lock(&self.shared.state);
            if !matches!(state.slot, Slot::Pending) {
                return None;
            }
            state.slot = next;
            let completion = state.completion()?;
            (
                std::mem::take(&mut state.listeners),
                completion,
                state.cancel_hook.take(),
            )
        };

        self.shared.condvar.notify_all();
        self.shared.done.send_replace(true);
        for (listener, handle) in listeners {
            run_listener(listener, completion.clone(), handle);
        }
        Some(hook)
    }

    /// Current state.
    pub fn state(&self) -> FutureState {
        match lock(&self.shared.state).slot {
            Slot::Pending => FutureState::Pending,
            Slot::Succeeded(_) | Slot::Released => FutureState::Succeeded,
            Slot::Failed(_) => FutureState::Failed,
            Slot::Cancelled => FutureState::Cancelled,
        }
    }

    /// Whether the future has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state() != FutureState::Pending
    }

    fn completion(&self) -> Option<Completion> {
        lock(&self.shared.state).completion()
    }

    /// Wait for the outcome.
    ///
    /// Dropping the returned future abandons the wait only. The call and any
    /// response it receives are unaffected.
    pub async fn get(&self) -> Result<Response, CallError> {
        let mut done = self.shared.done.subscribe();
        loop {
            if let Some(completion) = self.completion() {
                return completion.into_result();
            }
            if done.wait_for(|finished| *finished).await.is_err() {
                return Err(CallError::network("response future dropped"));
            }
        }
    }

    /// Wait for the outcome unless `interrupt` finishes first.
    ///
    /// An interrupted wait leaves the future untouched. A response arriving
    /// concurrently is retained for later consumers.
    ///
    /// # Errors
    ///
    /// Returns [`GetError::Interrupted`] if `interrupt` won, or the call's
    /// error.
    pub async fn get_or_interrupt<F>(&self, interrupt: F) -> Result<Response, GetError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            result = self.get() => result.map_err(GetError::from),
            () = interrupt => Err(GetError::Interrupted),
        }
    }

    /// Block the current thread until the outcome is known or `timeout`
    /// elapses.
    ///
    /// Must not be called from an async task.
    ///
    /// # Errors
    ///
    /// Returns [`GetError::Interrupted`] on timeout, or the call's error.
    pub fn blocking_get(&self, timeout: Option<Duration>) -> Result<Response, GetError> {
        let state = lock(&self.shared.state);
        let pending = |s: &mut State| matches!(s.slot, Slot::Pending);
        let state = match timeout {
            Some(timeout) => {
                self.shared
                    .condvar
                    .wait_timeout_while(state, timeout, pending)
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .0
            }
            None => self
                .shared
                .condvar
                .wait_while(state, pending)
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        };
        match state.completion() {
            Some(completion) => completion.into_result().map_err(GetError::from),
            None => Err(GetError::Interrupted),
        }
    }

    /// Run `listener` on `handle`'s blocking pool once the future is terminal.
    ///
    /// Listeners never run on the thread that completes the future. A
    /// panicking listener is logged and does not affect other listeners or
    /// the release of the response.
    pub fn add_listener<F>(&self, listener: F, handle: &Handle)
    where
        F: FnOnce(Outcome<'_>) + Send + 'static,
    {
        self.push_listener(Box::new(listener), Some(handle.clone()));
    }

    /// Like [`add_listener`](Self::add_listener), on the runtime that
    /// created the future, or a dedicated thread if there was none.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(Outcome<'_>) + Send + 'static,
    {
        self.push_listener(Box::new(listener), self.shared.handle.clone());
    }

    fn push_listener(&self, listener: Listener, handle: Option<Handle>) {
        let completion = {
            let mut state = lock(&self.shared.state);
            match state.completion() {
                Some(completion) => completion,
                None => {
                    state.listeners.push((listener, handle));
                    return;
                }
            }
        };
        run_listener(listener, completion, handle);
    }

    /// Drop the future's own reference to a successful response.
    ///
    /// Returns `true` if a response was released. Later waits report an
    /// `Invalid` error.
    pub fn release(&self) -> bool {
        let released = {
            let mut state = lock(&self.shared.state);
            match std::mem::replace(&mut state.slot, Slot::Released) {
                Slot::Succeeded(response) => Some(response),
                other => {
                    state.slot = other;
                    None
                }
            }
        };
        released.is_some()
    }

    /// Number of attempts made on the wire for this call.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn record_attempt(&self) -> u32 {
        self.shared.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl IntoFuture for ResponseFuture {
    type Output = Result<Response, CallError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.get().await })
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

fn run_listener(listener: Listener, completion: Completion, handle: Option<Handle>) {
    let task = move || {
        let result = catch_unwind(AssertUnwindSafe(|| listener(completion.outcome())));
        if result.is_err() {
            tracing::error!("response listener panicked");
        }
        drop(completion);
    };
    match handle {
        Some(handle) => {
            handle.spawn_blocking(task);
        }
        None => {
            if let Err(e) = std::thread::Builder::new()
                .name("tributary-listener".to_string())
                .spawn(task)
            {
                tracing::error!(error = %e, "failed to spawn listener thread");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tributary_core::TraceContext;

    use super::*;
    use crate::fragment::CallArgs;
    use crate::headers::TransportHeaders;
    use crate::message::ResponseCode;

    fn tracked_response(released: &Arc<AtomicUsize>) -> Response {
        let counter = released.clone();
        Response::new(
            ResponseCode::Ok,
            TransportHeaders::new(),
            CallArgs::new("echo", "", vec![0u8; 1024]),
            TraceContext::default(),
        )
        .with_release_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_single_assignment() {
        let future = ResponseFuture::new();
        assert!(future.fail(CallError::timeout("deadline")));
        assert!(!future.fail(CallError::network("late")));
        assert!(!future.cancel());
        assert_eq!(future.state(), FutureState::Failed);

        let err = future.get().await.expect_err("failed");
        assert_eq!(err.error_type(), ErrorType::Timeout);
    }

    #[tokio::test]
    async fn test_losing_response_released_immediately() {
        let released = Arc::new(AtomicUsize::new(0));
        let future = ResponseFuture::new();
        assert!(future.fail(CallError::timeout("deadline")));
        assert!(!future.succeed(tracked_response(&released)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_exactly_once_with_listeners() {
        let released = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let future = ResponseFuture::new();
        let handle = Handle::current();

        for i in 0..8 {
            let ran = ran.clone();
            future.add_listener(
                move |outcome| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    assert!(matches!(outcome, Outcome::Succeeded(_)));
                    if i == 3 {
                        panic!("listener failure");
                    }
                },
                &handle,
            );
        }

        assert!(future.succeed(tracked_response(&released)));
        wait_for(&ran, 8).await;
        assert_eq!(ran.load(Ordering::SeqCst), 8);

        // The slot still holds its reference.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(released.load(Ordering::SeqCst), 0);

        assert!(future.release());
        wait_for(&released, 1).await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!future.release());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_slot_reference() {
        let released = Arc::new(AtomicUsize::new(0));
        let future = ResponseFuture::new();
        future.succeed(tracked_response(&released));

        let response = future.get().await.expect("response");
        assert_eq!(response.ref_count(), 2);
        drop(future);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(response);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupted_get_retains_response() {
        let released = Arc::new(AtomicUsize::new(0));
        let future = ResponseFuture::new();

        let result = future
            .get_or_interrupt(tokio::time::sleep(Duration::from_millis(10)))
            .await;
        assert_eq!(result.expect_err("interrupted"), GetError::Interrupted);
        assert_eq!(future.state(), FutureState::Pending);

        future.succeed(tracked_response(&released));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        future.add_listener(
            move |outcome| {
                if let Outcome::Succeeded(response) = outcome {
                    assert_eq!(response.arg3().len(), 1024);
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            &Handle::current(),
        );
        wait_for(&ran, 1).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        drop(future);
        wait_for(&released, 1).await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_runs_hook_once() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let future = ResponseFuture::new();
        let counter = hooks.clone();
        future.set_cancel_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(future.cancel());
        assert!(!future.cancel());
        assert_eq!(hooks.load(Ordering::SeqCst), 1);

        let err = future.get().await.expect_err("cancelled");
        assert_eq!(err.error_type(), ErrorType::Cancelled);
    }

    #[tokio::test]
    async fn test_completion_drops_cancel_hook() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let future = ResponseFuture::new();
        let counter = hooks.clone();
        future.set_cancel_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        future.fail(CallError::network("reset"));
        assert!(!future.cancel());
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_blocking_get() {
        let future = ResponseFuture::new();
        assert!(matches!(
            future.blocking_get(Some(Duration::from_millis(10))),
            Err(GetError::Interrupted)
        ));

        let completer = future.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.fail(CallError::new(ErrorType::Busy, "overloaded"));
        });
        let err = future.blocking_get(None).expect_err("failed");
        assert!(matches!(err, GetError::Call(e) if e.error_type() == ErrorType::Busy));
        thread.join().expect("join");
    }

    #[test]
    fn test_on_complete_without_runtime() {
        let future = ResponseFuture::new();
        let (tx, rx) = std::sync::mpsc::channel();
        future.on_complete(move |outcome| {
            let _ = tx.send(matches!(outcome, Outcome::Cancelled));
        });
        future.cancel();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(true));
    }

    #[tokio::test]
    async fn test_await_directly() {
        let future = ResponseFuture::new();
        let completer = future.clone();
        tokio::spawn(async move {
            completer.succeed(Response::new(
                ResponseCode::Ok,
                TransportHeaders::new(),
                CallArgs::new("m", "", "done"),
                TraceContext::default(),
            ));
        });
        let response = future.await.expect("response");
        assert_eq!(&response.arg3()[..], b"done");
    }
}
