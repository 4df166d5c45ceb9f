//! Error types for the connection pool and the mail services it manages.

use std::time::Duration;

use mailwire_transport::{ConnectError, TransportError};
use thiserror::Error;

/// Boxed error carried as the cause of pool failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Error)]
pub enum ConnectionPoolError {
    /// No capacity and the caller chose not to wait.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Creating a service failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] BoxError),

    /// The server rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[source] BoxError),

    /// A service was unusable when handed out.
    #[error("invalid connection")]
    InvalidConnection,

    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl ConnectionPoolError {
    /// Recovers a pool error from a factory or authenticator failure,
    /// otherwise wraps it with `wrap`.
    pub(crate) fn classify(error: BoxError, wrap: fn(BoxError) -> Self) -> Self {
        match error.downcast::<Self>() {
            Ok(pool_error) => *pool_error,
            Err(other) => wrap(other),
        }
    }
}

/// Errors raised by the IMAP, SMTP and POP3 services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Connecting (directly or through a proxy) failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The server answered with a negative reply.
    #[error("server rejected command: {0}")]
    Rejected(String),

    /// The server answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No reply within the I/O timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The connection ended.
    #[error("connection closed")]
    Closed,
}

/// Result type alias using [`ConnectionPoolError`].
pub type Result<T> = std::result::Result<T, ConnectionPoolError>;

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

    #[test]
    fn test_classify_keeps_pool_errors() {
        let boxed: BoxError = Box::new(ConnectionPoolError::AuthenticationFailed("bad".into()));
        let err = ConnectionPoolError::classify(boxed, ConnectionPoolError::ConnectionFailed);
        assert!(matches!(err, ConnectionPoolError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_classify_wraps_other_errors() {
        let boxed: BoxError = Box::new(ServiceError::Closed);
        let err = ConnectionPoolError::classify(boxed, ConnectionPoolError::ConnectionFailed);
        assert!(matches!(err, ConnectionPoolError::ConnectionFailed(_)));
        assert_eq!(err.to_string(), "connection failed: connection closed");
    }

    #[test]
    fn test_service_error_display() {
        assert_eq!(
            ServiceError::Rejected("a1 NO [AUTHENTICATIONFAILED] nope".into()).to_string(),
            "server rejected command: a1 NO [AUTHENTICATIONFAILED] nope"
        );
        assert_eq!(
            ServiceError::Timeout(Duration::from_secs(30)).to_string(),
            "no reply within 30s"
        );
    }
}
