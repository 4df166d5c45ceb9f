//! Retry policies for service creation.

use std::time::Duration;

use mailwire_transport::{ConnectError, ProxyError};

use crate::{ConnectionPoolError, ServiceError};

/// Decides whether a failed creation attempt is retried.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Delay before attempt `attempt + 1`, or `None` to give up.
    ///
    /// `attempt` counts from 1 and names the attempt that just failed.
    fn retry_after(&self, attempt: u32, error: &ConnectionPoolError) -> Option<Duration>;
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn retry_after(&self, _attempt: u32, _error: &ConnectionPoolError) -> Option<Duration> {
        None
    }
}

/// Doubling backoff with a cap.
///
/// Rejected credentials are never retried: repeating them only risks an
/// account lockout. Neither is a proxy that refused the tunnel outright;
/// only proxy timeouts and short writes are tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff of at most `max_attempts` attempts in total.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Total attempts including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn retry_after(&self, attempt: u32, error: &ConnectionPoolError) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match error {
            ConnectionPoolError::ConnectionFailed(_) | ConnectionPoolError::InvalidConnection => {}
            _ => return None,
        }
        if proxy_failure(error).is_some_and(|proxy| !proxy.is_transient()) {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// The proxy handshake failure behind a failed creation, if any.
fn proxy_failure(error: &ConnectionPoolError) -> Option<&ProxyError> {
    let ConnectionPoolError::ConnectionFailed(cause) = error else {
        return None;
    };
    let connect = match cause.downcast_ref::<ServiceError>() {
        Some(ServiceError::Connect(connect)) => connect,
        Some(_) => return None,
        None => cause.downcast_ref::<ConnectError>()?,
    };
    match connect {
        ConnectError::Proxy(proxy) => Some(proxy),
        ConnectError::Transport(_) => None,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn refused() -> ConnectionPoolError {
        ConnectionPoolError::ConnectionFailed("refused".into())
    }

    #[test]
    fn test_backoff_doubles_until_exhausted() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.retry_after(1, &refused()), Some(Duration::from_secs(1)));
        assert_eq!(policy.retry_after(2, &refused()), Some(Duration::from_secs(2)));
        assert_eq!(policy.retry_after(3, &refused()), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ExponentialBackoff::new(10, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.retry_after(4, &refused()), Some(Duration::from_secs(5)));
        assert_eq!(policy.retry_after(9, &refused()), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_authentication_failure_is_final() {
        let policy = ExponentialBackoff::default();
        let err = ConnectionPoolError::AuthenticationFailed("denied".into());
        assert_eq!(policy.retry_after(1, &err), None);
        assert_eq!(policy.retry_after(1, &ConnectionPoolError::PoolClosed), None);
    }

    fn proxy(error: ProxyError) -> ConnectionPoolError {
        ConnectionPoolError::ConnectionFailed(Box::new(ServiceError::Connect(ConnectError::Proxy(
            error,
        ))))
    }

    #[test]
    fn test_proxy_rejection_is_final() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.retry_after(1, &proxy(ProxyError::AuthenticationFailed)), None);
        assert_eq!(policy.retry_after(1, &proxy(ProxyError::Socks5Rejected(0x02))), None);
        assert_eq!(
            policy.retry_after(
                1,
                &ConnectionPoolError::ConnectionFailed(Box::new(ConnectError::Proxy(
                    ProxyError::Socks4Rejected(0x5B)
                )))
            ),
            None
        );
    }

    #[test]
    fn test_proxy_timeout_is_retried() {
        let policy = ExponentialBackoff::default();
        assert_eq!(
            policy.retry_after(1, &proxy(ProxyError::Timeout)),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            policy.retry_after(2, &proxy(ProxyError::WriteFailed)),
            Some(Duration::from_secs(2))
        );
        let refused = ConnectionPoolError::ConnectionFailed(Box::new(ServiceError::Connect(
            ConnectError::Transport(mailwire_transport::TransportError::Closed),
        )));
        assert_eq!(policy.retry_after(1, &refused), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_no_retry() {
        assert_eq!(NoRetry.retry_after(1, &refused()), None);
    }
}
