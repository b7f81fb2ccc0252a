//! Mount configuration.
//!
//! Defaults favour a remote cluster reached over the network: mutations are
//! allowed a generous window to show up in the notification stream, and
//! attributes are handed to the kernel with a short TTL because other
//! clients may change the namespace at any time.

use std::time::Duration;

use crate::client::RetryPolicy;

/// Default time a create/delete waits for its notification.
pub const DEFAULT_MUTATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default kernel attribute/entry TTL.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Configuration options for a mounted namespace.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// How long create/delete block waiting for the mirror to catch up.
    ///
    /// Exceeding it fails the operation with a remote-I/O error even though
    /// the remote call may have been applied.
    pub mutation_timeout: Duration,

    /// TTL handed to the kernel for attributes and directory entries.
    pub attr_ttl: Duration,

    /// Backoff policy for connecting, remote calls and resubscribing.
    pub retry: RetryPolicy,

    /// Filter the directory sentinel out of `readdir` results.
    ///
    /// The sentinel still exists remotely and still counts as a child, so
    /// the directory keeps its classification either way.
    pub hide_sentinel: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mutation_timeout: DEFAULT_MUTATION_TIMEOUT,
            attr_ttl: DEFAULT_ATTR_TTL,
            retry: RetryPolicy::default(),
            hide_sentinel: false,
        }
    }
}

impl MountConfig {
    /// Sets the mutation wait deadline.
    #[must_use]
    pub fn mutation_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = timeout;
        self
    }

    /// Sets the kernel attribute TTL.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Hides or shows the directory sentinel in listings.
    #[must_use]
    pub fn hide_sentinel(mut self, hide: bool) -> Self {
        self.hide_sentinel = hide;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MountConfig::default();
        assert_eq!(config.mutation_timeout, Duration::from_secs(10));
        assert_eq!(config.attr_ttl, Duration::from_secs(1));
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.hide_sentinel);
    }

    #[test]
    fn test_builder_pattern() {
        let config = MountConfig::default()
            .mutation_timeout(Duration::from_millis(250))
            .attr_ttl(Duration::ZERO)
            .retry(RetryPolicy::new(Duration::from_millis(5), 2))
            .hide_sentinel(true);
        assert_eq!(config.mutation_timeout, Duration::from_millis(250));
        assert_eq!(config.attr_ttl, Duration::ZERO);
        assert_eq!(config.retry.base_delay, Duration::from_millis(5));
        assert_eq!(config.retry.max_retries, 2);
        assert!(config.hide_sentinel);
    }
}
