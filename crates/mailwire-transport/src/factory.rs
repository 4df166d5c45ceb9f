//! Direct or proxied transport construction.

use crate::proxy;
use crate::replay::{BlockingReplay, ReplayTransport};
use crate::stream::TokioTransport;
use crate::tcp::TcpTransport;
use crate::transport::{AsyncTransport, Transport};
use crate::{ConnectError, ProxySettings, TransportOptions};

/// Async transport returned by [`TransportFactory::connect`].
pub type Tunnel = ReplayTransport<TokioTransport>;

/// Blocking transport returned by [`TransportFactory::connect_blocking`].
pub type BlockingTunnel = BlockingReplay<TcpTransport>;

/// Builds transports to mail servers, tunnelling through a proxy when one
/// is configured.
///
/// # Example
///
/// ```ignore
/// use mailwire_transport::{ProxySettings, TransportFactory, TransportOptions};
///
/// let factory = TransportFactory::new(TransportOptions::default())
///     .with_proxy(ProxySettings::http("proxy.internal", 3128).build());
/// let transport = factory.connect("imap.example.com", 993).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    options: TransportOptions,
    proxy: Option<ProxySettings>,
}

impl TransportFactory {
    /// Creates a factory for direct connections.
    #[must_use]
    pub const fn new(options: TransportOptions) -> Self {
        Self {
            options,
            proxy: None,
        }
    }

    /// Routes every connection through `proxy`.
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Socket options applied to new transports.
    #[must_use]
    pub const fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// The configured proxy, if any.
    #[must_use]
    pub const fn proxy(&self) -> Option<&ProxySettings> {
        self.proxy.as_ref()
    }

    /// Host and port to dial: the proxy when configured, else the target.
    fn dial_target<'a>(&'a self, host: &'a str, port: u16) -> (&'a str, u16) {
        self.proxy
            .as_ref()
            .map_or((host, port), |proxy| (proxy.host(), proxy.port()))
    }

    /// Starts an async transport to `host:port`.
    ///
    /// The returned transport is already started; bytes that arrived with
    /// the end of the proxy handshake come first on its inbound sequence.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Transport`] if the socket cannot be established,
    /// [`ConnectError::Proxy`] if the proxy handshake fails.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Tunnel, ConnectError> {
        let (dial_host, dial_port) = self.dial_target(host, port);
        let transport = TokioTransport::new(dial_host, dial_port)
            .with_options(self.options)
            .with_tls_server_name(host);
        self.tunnel(transport, host, port).await
    }

    /// Starts `transport` and, when a proxy is configured, tunnels it to
    /// `host:port`. The transport is stopped if the handshake fails.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn tunnel<T>(
        &self,
        mut transport: T,
        host: &str,
        port: u16,
    ) -> Result<ReplayTransport<T>, ConnectError>
    where
        T: AsyncTransport,
    {
        transport.start().await?;

        let Some(settings) = &self.proxy else {
            return Ok(ReplayTransport::live(transport));
        };

        match proxy::tunnel(settings, &mut transport, host, port).await {
            Ok(leftover) => {
                tracing::debug!(
                    proxy = %settings.host(),
                    kind = ?settings.kind(),
                    target = %host,
                    port,
                    leftover = leftover.len(),
                    "proxy tunnel established"
                );
                Ok(ReplayTransport::new(transport, leftover))
            }
            Err(e) => {
                tracing::warn!(proxy = %settings.host(), target = %host, error = %e, "proxy handshake failed");
                transport.stop().await;
                Err(e.into())
            }
        }
    }

    /// Opens a blocking transport to `host:port`.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub fn connect_blocking(&self, host: &str, port: u16) -> Result<BlockingTunnel, ConnectError> {
        let (dial_host, dial_port) = self.dial_target(host, port);
        let transport = TcpTransport::new(dial_host, dial_port)
            .with_options(self.options)
            .with_tls_server_name(host);
        self.tunnel_blocking(transport, host, port)
    }

    /// Opens `transport` and, when a proxy is configured, tunnels it to
    /// `host:port`. The transport is closed if the handshake fails.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub fn tunnel_blocking<T>(
        &self,
        mut transport: T,
        host: &str,
        port: u16,
    ) -> Result<BlockingReplay<T>, ConnectError>
    where
        T: Transport,
    {
        transport.open()?;

        let Some(settings) = &self.proxy else {
            return Ok(BlockingReplay::new(transport, bytes::Bytes::new()));
        };

        match proxy::tunnel_blocking(settings, &mut transport, host, port) {
            Ok(leftover) => {
                tracing::debug!(
                    proxy = %settings.host(),
                    kind = ?settings.kind(),
                    target = %host,
                    port,
                    leftover = leftover.len(),
                    "proxy tunnel established"
                );
                Ok(BlockingReplay::new(transport, leftover))
            }
            Err(e) => {
                tracing::warn!(proxy = %settings.host(), target = %host, error = %e, "proxy handshake failed");
                transport.close();
                Err(e.into())
            }
        }
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
    use bytes::Bytes;

    use super::*;
    use crate::ProxyError;
    use crate::testing::{MockAsyncTransport, MockTransport};

    fn socks5() -> ProxySettings {
        ProxySettings::socks5("proxy", 1080).max_read_attempts(3).build()
    }

    #[test]
    fn test_dial_target() {
        let direct = TransportFactory::default();
        assert_eq!(direct.dial_target("mail", 993), ("mail", 993));

        let proxied = TransportFactory::default().with_proxy(socks5());
        assert_eq!(proxied.dial_target("mail", 993), ("proxy", 1080));
    }

    #[tokio::test]
    async fn test_direct_transport_is_started_and_live() {
        let factory = TransportFactory::default();
        let mut transport = factory
            .tunnel(MockAsyncTransport::new(), "mail", 993)
            .await
            .unwrap();

        assert!(transport.is_running());
        assert!(!transport.is_replaying());
        assert!(transport.inbound().is_some());
    }

    #[tokio::test]
    async fn test_proxied_leftover_is_replayed() {
        let factory = TransportFactory::default().with_proxy(socks5());
        let inner = MockAsyncTransport::new();
        inner.feed(&[0x05, 0x00]);
        inner.feed(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x03, 0xE1, b'*', b' ', b'O', b'K']);

        let mut transport = factory.tunnel(inner, "mail", 993).await.unwrap();
        assert!(transport.is_replaying());

        let chunk = transport.inbound().unwrap().next_chunk().await.unwrap();
        assert_eq!(chunk, Bytes::from_static(b"* OK"));
    }

    #[tokio::test]
    async fn test_proxy_failure_stops_transport() {
        let factory = TransportFactory::default().with_proxy(socks5());
        let mut inner = MockAsyncTransport::new();
        inner.feed(&[0x05, 0xFF]);
        inner.hang_up();

        let err = factory.tunnel(&mut inner, "mail", 993).await.unwrap_err();
        assert!(matches!(err, ConnectError::Proxy(ProxyError::AuthenticationFailed)));
        assert!(inner.is_stopped());
        assert_eq!(inner.written, [0x05, 0x01, 0x00]);
    }

    #[test]
    fn test_blocking_leftover_is_replayed() {
        let settings = ProxySettings::http("proxy", 8080).max_read_attempts(3).build();
        let factory = TransportFactory::default().with_proxy(settings);
        let inner = MockTransport::with_reads(&[b"HTTP/1.1 200 OK\r\n\r\n220 ready\r\n"]);

        let mut transport = factory.tunnel_blocking(inner, "smtp", 587).unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.read_available(64).unwrap(), b"220 ready\r\n");
        assert_eq!(transport.get_ref().open_calls, 1);
    }

    #[test]
    fn test_blocking_failure_closes_transport() {
        let settings = ProxySettings::socks4("proxy", 1080).max_read_attempts(3).build();
        let factory = TransportFactory::default().with_proxy(settings);

        let mut inner = MockTransport::with_reads(&[]);
        let err = factory.tunnel_blocking(&mut inner, "mail.example.com", 993).unwrap_err();

        assert!(matches!(err, ConnectError::Proxy(ProxyError::UnsupportedAddressType)));
        assert_eq!(inner.close_calls, 1);
        assert!(!inner.is_open());
        assert!(inner.written.is_empty());
    }
}
