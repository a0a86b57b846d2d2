//! Retry flags, retry options and the attempt loop that drives a logical call
//! across peers.
//!
//! A logical call has one TTL budget. Every attempt gets a deadline of
//! `min(per_attempt_timeout, remaining budget)` and is sent to a peer that
//! has not been tried yet for this call.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tributary_core::{ErrorType, HostPort};

use crate::error::CallError;
use crate::future::{Response, ResponseFuture};

/// Which failures a call may be retried on, from the `re` header.
///
/// The wire form is a string of flag characters: `n` disables retries, `c`
/// retries on connection errors and `t` on timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryFlags {
    /// Never retry. Overrides the other flags.
    pub no_retry: bool,
    /// Retry when the connection fails before a response arrives.
    pub on_connection_error: bool,
    /// Retry when an attempt times out.
    pub on_timeout: bool,
}

impl Default for RetryFlags {
    fn default() -> Self {
        Self {
            no_retry: false,
            on_connection_error: true,
            on_timeout: true,
        }
    }
}

/// The `re` header held an unknown flag character.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid retry flag {flag:?} in {value:?}")]
pub struct RetryFlagsError {
    /// Offending character.
    pub flag: char,
    /// Whole header value.
    pub value: String,
}

impl RetryFlags {
    /// Flags that disable every retry.
    pub const NEVER: RetryFlags = RetryFlags {
        no_retry: true,
        on_connection_error: false,
        on_timeout: false,
    };

    /// Parse the `re` header value.
    ///
    /// # Errors
    ///
    /// Returns an error for characters other than `n`, `c` and `t`.
    pub fn parse(value: &str) -> Result<Self, RetryFlagsError> {
        let mut flags = RetryFlags {
            no_retry: false,
            on_connection_error: false,
            on_timeout: false,
        };
        for flag in value.chars() {
            match flag {
                'n' => flags.no_retry = true,
                'c' => flags.on_connection_error = true,
                't' => flags.on_timeout = true,
                _ => {
                    return Err(RetryFlagsError {
                        flag,
                        value: value.to_string(),
                    })
                }
            }
        }
        Ok(flags)
    }

    /// Whether these flags allow retrying after `error`.
    pub fn allows(&self, error: &CallError) -> bool {
        if self.no_retry {
            return false;
        }
        match error.error_type() {
            ErrorType::NetworkError => self.on_connection_error,
            ErrorType::Timeout => self.on_timeout,
            _ => false,
        }
    }
}

impl fmt::Display for RetryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.no_retry {
            return f.write_str("n");
        }
        if self.on_connection_error {
            f.write_str("c")?;
        }
        if self.on_timeout {
            f.write_str("t")?;
        }
        Ok(())
    }
}

/// Retry behavior for a call or a sub-channel default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Failures that may be retried.
    pub flags: RetryFlags,

    /// Maximum number of attempts for one logical call, the first included.
    pub limit: u32,

    /// Upper bound on a single attempt. `None` lets each attempt use the whole
    /// remaining TTL.
    #[serde(with = "crate::serde_ms::option")]
    pub per_attempt_timeout: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            flags: RetryFlags::default(),
            limit: 4,
            per_attempt_timeout: None,
        }
    }
}

impl RetryOptions {
    /// Options that send exactly one attempt.
    pub fn never() -> Self {
        Self {
            flags: RetryFlags::NEVER,
            limit: 1,
            per_attempt_timeout: None,
        }
    }

    /// Use `flags`.
    pub fn with_flags(mut self, flags: RetryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Allow at most `limit` attempts.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Bound each attempt by `timeout`.
    pub fn with_per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = Some(timeout);
        self
    }

    fn attempt_deadline(&self, remaining: Duration) -> Duration {
        match self.per_attempt_timeout {
            Some(per_attempt) => per_attempt.min(remaining),
            None => remaining,
        }
    }
}

/// Sends single attempts of a logical call.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    /// Choose a peer that is not in `tried`, or `None` when every candidate
    /// has been tried.
    fn pick(&self, tried: &[HostPort]) -> Option<HostPort>;

    /// Send one attempt to `peer`, failing with `Timeout` after `ttl`.
    async fn attempt(&self, peer: &HostPort, ttl: Duration) -> Result<Response, CallError>;
}

/// Run a logical call until it succeeds, fails terminally, or runs out of
/// attempts, peers or budget.
///
/// Each attempt is counted on `future`. The result is returned rather than
/// pushed into `future`.
pub async fn run_with_retries<R: AttemptRunner + ?Sized>(
    runner: &R,
    options: &RetryOptions,
    ttl: Duration,
    future: &ResponseFuture,
) -> Result<Response, CallError> {
    let deadline = Instant::now() + ttl;
    let limit = options.limit.max(1);
    let mut tried: Vec<HostPort> = Vec::new();
    let mut last_error: Option<CallError> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(last_error.unwrap_or_else(|| {
                CallError::timeout(format!("call budget of {ttl:?} exhausted"))
            }));
        }

        let Some(peer) = runner.pick(&tried) else {
            return Err(last_error.unwrap_or_else(|| CallError::network("no peers available")));
        };

        let attempt = future.record_attempt();
        let attempt_ttl = options.attempt_deadline(remaining);
        tracing::debug!(%peer, attempt, ?attempt_ttl, "sending attempt");

        match runner.attempt(&peer, attempt_ttl).await {
            Ok(response) => return Ok(response),
            Err(error) => {
                tried.push(peer);
                if !options.flags.allows(&error) {
                    return Err(error);
                }
                if attempt >= limit {
                    tracing::debug!(
                        attempt,
                        error_type = %error.error_type(),
                        "retry limit reached"
                    );
                    return Err(error);
                }
                tracing::debug!(
                    attempt,
                    error_type = %error.error_type(),
                    "attempt failed, retrying on another peer"
                );
                last_error = Some(error);
            }
        }
    }
}
