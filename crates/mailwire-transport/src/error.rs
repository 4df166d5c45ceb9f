//! Error types for transports and proxy handshakes.

use std::io;

use thiserror::Error;

/// Errors raised by a transport itself.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel could not be established.
    #[error("failed to connect to {host}:{port}: {source}")]
    ConnectionFailed {
        /// Host that was dialled.
        host: String,
        /// Port that was dialled.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// I/O error on an established channel.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// The transport has not been opened or has been closed.
    #[error("transport is not open")]
    NotOpen,

    /// `start` was called on a transport that was already started.
    #[error("transport was already started")]
    AlreadyStarted,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// TLS was requested on a channel that is already encrypted.
    #[error("transport is already using TLS")]
    AlreadyTls,

    /// Compression was requested on a channel that is already compressed.
    #[error("compression is already active")]
    AlreadyCompressed,
}

/// Errors raised while tunnelling through a proxy.
///
/// The set is closed: every handshake failure maps onto one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// The proxy did not answer within the configured patience.
    #[error("proxy handshake timed out")]
    Timeout,

    /// The transport accepted fewer bytes than the request length.
    #[error("failed to write handshake to proxy")]
    WriteFailed,

    /// The proxy answered with something that does not parse.
    #[error("invalid proxy response: {0}")]
    InvalidResponse(String),

    /// The proxy refused the offered credentials or methods.
    #[error("proxy authentication failed")]
    AuthenticationFailed,

    /// The target address cannot be expressed in this protocol.
    #[error("unsupported address type for proxy")]
    UnsupportedAddressType,

    /// The HTTP proxy answered CONNECT with a non-200 status.
    #[error("HTTP CONNECT failed with {code}: {text}")]
    HttpConnectFailed {
        /// Status code.
        code: u16,
        /// Reason phrase.
        text: String,
    },

    /// The SOCKS4 proxy rejected the request.
    #[error("SOCKS4 request rejected (code {0:#04x})")]
    Socks4Rejected(u8),

    /// The SOCKS5 proxy rejected the request.
    #[error("SOCKS5 request rejected (code {0:#04x})")]
    Socks5Rejected(u8),
}

impl ProxyError {
    /// Returns true if retrying the handshake may succeed.
    ///
    /// Timeouts and failed writes are transient. Explicit rejections and
    /// malformed replies are not worth repeating.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::WriteFailed)
    }
}

/// Errors raised by the transport factory.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Opening the transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The proxy handshake failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Result type alias using [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;

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
    fn test_transient_classification() {
        assert!(ProxyError::Timeout.is_transient());
        assert!(ProxyError::WriteFailed.is_transient());
        assert!(!ProxyError::AuthenticationFailed.is_transient());
        assert!(!ProxyError::Socks5Rejected(0x05).is_transient());
    }

    #[test]
    fn test_display() {
        let err = ProxyError::HttpConnectFailed {
            code: 407,
            text: "Proxy Authentication Required".into(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP CONNECT failed with 407: Proxy Authentication Required"
        );
        assert_eq!(
            ProxyError::Socks4Rejected(0x5B).to_string(),
            "SOCKS4 request rejected (code 0x5b)"
        );
    }

    #[test]
    fn test_connect_error_is_transparent() {
        let err = ConnectError::from(ProxyError::Timeout);
        assert_eq!(err.to_string(), "proxy handshake timed out");
    }
}
