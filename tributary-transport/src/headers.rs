//! Transport headers.
//!
//! Transport headers are ordered key/value string pairs carried in the first
//! frame of a call. Keys are unique within one call. The standard keys are
//! listed in [`keys`].

use tributary_core::ArgScheme;

use crate::retry::{RetryFlags, RetryFlagsError};

/// Standard transport header keys.
pub mod keys {
    /// Arg scheme of arg2/arg3.
    pub const ARG_SCHEME: &str = "as";
    /// Claim at start.
    pub const CLAIM_AT_START: &str = "cas";
    /// Claim at finish.
    pub const CLAIM_AT_FINISH: &str = "caf";
    /// Name of the calling service.
    pub const CALLER_NAME: &str = "cn";
    /// Retry flags string.
    pub const RETRY_FLAGS: &str = "re";
    /// Speculative execution fan-out.
    pub const SPECULATIVE_EXECUTION: &str = "se";
    /// Failure domain.
    pub const FAILURE_DOMAIN: &str = "fd";
    /// Shard key used for routing.
    pub const SHARD_KEY: &str = "sk";
}

/// Ordered transport headers with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHeaders {
    entries: Vec<(String, String)>,
}

impl TransportHeaders {
    /// Empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`. An existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Arg scheme named by the `as` header. Unknown values yield `None`.
    pub fn arg_scheme(&self) -> Option<ArgScheme> {
        self.get(keys::ARG_SCHEME).and_then(ArgScheme::from_header)
    }

    /// Set the `as` header.
    pub fn set_arg_scheme(&mut self, scheme: ArgScheme) {
        self.insert(keys::ARG_SCHEME, scheme.as_str());
    }

    /// Calling service name from the `cn` header.
    pub fn caller_name(&self) -> Option<&str> {
        self.get(keys::CALLER_NAME)
    }

    /// Retry flags from the `re` header, or the default flags when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the header holds an unknown flag.
    pub fn retry_flags(&self) -> Result<RetryFlags, RetryFlagsError> {
        match self.get(keys::RETRY_FLAGS) {
            Some(value) => RetryFlags::parse(value),
            None => Ok(RetryFlags::default()),
        }
    }

    /// Set the `re` header.
    pub fn set_retry_flags(&mut self, flags: RetryFlags) {
        self.insert(keys::RETRY_FLAGS, flags.to_string());
    }

    /// Shard key from the `sk` header.
    pub fn shard_key(&self) -> Option<&str> {
        self.get(keys::SHARD_KEY)
    }

    /// Failure domain from the `fd` header.
    pub fn failure_domain(&self) -> Option<&str> {
        self.get(keys::FAILURE_DOMAIN)
    }

    /// Speculative execution fan-out from the `se` header.
    pub fn speculative_execution(&self) -> Option<u32> {
        self.get(keys::SPECULATIVE_EXECUTION)
            .and_then(|v| v.parse().ok())
    }

    /// Claim-at-start host from the `cas` header.
    pub fn claim_at_start(&self) -> Option<&str> {
        self.get(keys::CLAIM_AT_START)
    }

    /// Claim-at-finish host from the `caf` header.
    pub fn claim_at_finish(&self) -> Option<&str> {
        self.get(keys::CLAIM_AT_FINISH)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TransportHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = TransportHeaders::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}
