//! Async TCP transport on tokio.
//!
//! The socket is split once started: a background pump task owns the read
//! half and forwards every chunk to the [`Inbound`] sequence, while `send`
//! writes to the write half directly. Upgrades (TLS, compression) suspend the
//! pump, take the read half back, re-wrap the socket and resume pumping into
//! the same sequence, so the holder of the sequence never notices.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use flate2::{Compress, Decompress};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::deflate;
use crate::tls;
use crate::transport::{
    AsyncCompressionUpgrade, AsyncTlsUpgrade, AsyncTransport, CompressionAlgorithm, Inbound,
};
use crate::{Result, TransportError, TransportOptions};

const READ_BUFFER: usize = 8192;

/// A socket that is either plaintext or TLS.
enum NetStream {
    Plain(TcpStream),
    /// Boxed to reduce enum size.
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// What the pump hands back when asked to stop.
struct PumpParts {
    reader: ReadHalf<NetStream>,
    inflate: Option<Decompress>,
    sender: mpsc::UnboundedSender<Bytes>,
}

struct Pump {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Option<PumpParts>>,
}

impl Pump {
    fn spawn(parts: PumpParts, peer_closed: Arc<AtomicBool>) -> Self {
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(pump(parts, stopped, peer_closed));
        Self { stop, handle }
    }

    /// Stops the task and recovers the read half, unless the connection
    /// ended first.
    async fn suspend(self) -> Option<PumpParts> {
        let _ = self.stop.send(());
        match self.handle.await {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(error = %e, "read pump panicked");
                None
            }
        }
    }
}

/// Forwards inbound chunks until stopped (returning the parts) or until
/// the connection ends (dropping the sender, which ends the sequence).
async fn pump(
    mut parts: PumpParts,
    mut stopped: oneshot::Receiver<()>,
    peer_closed: Arc<AtomicBool>,
) -> Option<PumpParts> {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => return Some(parts),
            read = parts.reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        tracing::debug!("peer closed connection");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(error = %e, "read failed");
                        break;
                    }
                };

                let chunk = match parts.inflate.as_mut() {
                    None => Bytes::copy_from_slice(&buf[..n]),
                    Some(codec) => match deflate::inflate(codec, &buf[..n]) {
                        Ok(plain) => Bytes::from(plain),
                        Err(e) => {
                            tracing::warn!(error = %e, "inflate failed");
                            break;
                        }
                    },
                };
                if !chunk.is_empty() && parts.sender.send(chunk).is_err() {
                    break;
                }
            }
        }
    }
    peer_closed.store(true, Ordering::Release);
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

/// Async transport over [`tokio::net::TcpStream`].
pub struct TokioTransport {
    host: String,
    port: u16,
    tls_server_name: String,
    options: TransportOptions,
    state: State,
    inbound: Option<Inbound>,
    writer: Option<WriteHalf<NetStream>>,
    pump: Option<Pump>,
    deflate: Option<Compress>,
    tls: bool,
    channel_binding: Option<Vec<u8>>,
    peer_closed: Arc<AtomicBool>,
}

impl TokioTransport {
    /// Creates an unstarted transport to `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            tls_server_name: host.clone(),
            host,
            port,
            options: TransportOptions::default(),
            state: State::Idle,
            inbound: None,
            writer: None,
            pump: None,
            deflate: None,
            tls: false,
            channel_binding: None,
            peer_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets socket options.
    #[must_use]
    pub const fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the name verified during the TLS handshake.
    ///
    /// Defaults to the dialled host; a proxied transport dials the proxy but
    /// must verify the target server.
    #[must_use]
    pub fn with_tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = name.into();
        self
    }

    /// The dialled host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The dialled port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns true once TLS is active.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls
    }

    fn connection_failed(&self, source: io::Error) -> TransportError {
        TransportError::ConnectionFailed {
            host: self.host.clone(),
            port: self.port,
            source,
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match timeout(self.options.connect_timeout, connect).await {
            Ok(Ok(tcp)) => Ok(tcp),
            Ok(Err(e)) => Err(self.connection_failed(e)),
            Err(_) => Err(self.connection_failed(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection timed out",
            ))),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            State::Running => Ok(()),
            State::Idle => Err(TransportError::NotOpen),
            State::Stopped => Err(TransportError::Closed),
        }
    }

    /// Takes the whole socket back from the pump and the writer.
    async fn suspend(&mut self) -> Result<(NetStream, Option<Decompress>, mpsc::UnboundedSender<Bytes>)> {
        let pump = self.pump.take().ok_or(TransportError::Closed)?;
        let Some(parts) = pump.suspend().await else {
            self.shutdown().await;
            return Err(TransportError::Closed);
        };
        let writer = self.writer.take().ok_or(TransportError::Closed)?;
        Ok((parts.reader.unsplit(writer), parts.inflate, parts.sender))
    }

    fn resume(
        &mut self,
        stream: NetStream,
        inflate: Option<Decompress>,
        sender: mpsc::UnboundedSender<Bytes>,
    ) {
        let (reader, writer) = tokio::io::split(stream);
        self.writer = Some(writer);
        self.pump = Some(Pump::spawn(
            PumpParts {
                reader,
                inflate,
                sender,
            },
            Arc::clone(&self.peer_closed),
        ));
    }

    async fn shutdown(&mut self) {
        self.state = State::Stopped;
        if let Some(pump) = self.pump.take() {
            pump.handle.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.deflate = None;
    }
}

impl std::fmt::Debug for TokioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("tls", &self.tls)
            .field("compressed", &self.deflate.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.handle.abort();
        }
    }
}

impl AsyncTransport for TokioTransport {
    async fn start(&mut self) -> Result<()> {
        if self.state != State::Idle {
            return Err(TransportError::AlreadyStarted);
        }

        let tcp = self.dial().await?;
        tcp.set_nodelay(true)?;
        tracing::debug!(host = %self.host, port = self.port, "connected");

        let (sender, inbound) = Inbound::channel();
        self.inbound = Some(inbound);
        self.resume(NetStream::Plain(tcp), None, sender);
        self.state = State::Running;
        Ok(())
    }

    fn inbound(&mut self) -> Option<&mut Inbound> {
        self.inbound.as_mut()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_running()?;
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;

        match self.deflate.as_mut() {
            Some(codec) => {
                let packed = deflate::deflate(codec, data)?;
                writer.write_all(&packed).await?;
            }
            None => writer.write_all(data).await?,
        }
        writer.flush().await?;
        Ok(())
    }

    async fn stop(&mut self) {
        if self.state == State::Stopped {
            return;
        }
        self.shutdown().await;
        tracing::debug!(host = %self.host, port = self.port, "stopped");
    }

    fn is_running(&self) -> bool {
        self.state == State::Running && !self.peer_closed.load(Ordering::Acquire)
    }
}

impl AsyncTlsUpgrade for TokioTransport {
    async fn start_tls(&mut self, validate_certificate: bool) -> Result<()> {
        self.ensure_running()?;
        if self.tls {
            return Err(TransportError::AlreadyTls);
        }
        if self.deflate.is_some() {
            return Err(TransportError::AlreadyCompressed);
        }

        let connector = TlsConnector::from(tls::client_config(validate_certificate)?);
        let server_name = tls::server_name(&self.tls_server_name)?;

        let (stream, inflate, sender) = self.suspend().await?;
        let tcp = match stream {
            NetStream::Plain(tcp) => tcp,
            encrypted @ NetStream::Tls(_) => {
                self.resume(encrypted, inflate, sender);
                return Err(TransportError::AlreadyTls);
            }
        };

        let handshake = timeout(self.options.connect_timeout, connector.connect(server_name, tcp)).await;
        let tls = match handshake {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, server = %self.tls_server_name, "TLS handshake failed");
                self.shutdown().await;
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(server = %self.tls_server_name, "TLS handshake timed out");
                self.shutdown().await;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out").into());
            }
        };

        self.channel_binding = tls::exporter_token(tls.get_ref().1);
        self.tls = true;
        tracing::debug!(server = %self.tls_server_name, "TLS established");
        self.resume(NetStream::Tls(Box::new(tls)), inflate, sender);
        Ok(())
    }

    fn channel_binding(&self) -> Option<Vec<u8>> {
        self.channel_binding.clone()
    }
}

impl AsyncCompressionUpgrade for TokioTransport {
    async fn start_compression(&mut self, algorithm: CompressionAlgorithm) -> Result<()> {
        self.ensure_running()?;
        if self.deflate.is_some() {
            return Err(TransportError::AlreadyCompressed);
        }

        let (stream, _, sender) = self.suspend().await?;
        match algorithm {
            CompressionAlgorithm::Deflate => {
                self.deflate = Some(deflate::compressor());
                self.resume(stream, Some(deflate::decompressor()), sender);
            }
        }
        tracing::debug!(?algorithm, host = %self.host, "compression enabled");
        Ok(())
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
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    fn options() -> TransportOptions {
        TransportOptions::default().connect_timeout(Duration::from_secs(5))
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn collect(inbound: &mut Inbound, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            let chunk = timeout(Duration::from_secs(5), inbound.next_chunk())
                .await
                .unwrap()
                .unwrap();
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_send_receive_and_peer_close() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"* OK ready\r\n").await.unwrap();
            let mut buf = [0u8; 10];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"a1 LOGOUT\n");
        });

        let mut transport = TokioTransport::new("127.0.0.1", port).with_options(options());
        assert!(transport.inbound().is_none());
        transport.start().await.unwrap();
        assert!(transport.is_running());

        let inbound = transport.inbound().unwrap();
        assert_eq!(collect(inbound, 12).await, b"* OK ready\r\n");

        transport.send(b"a1 LOGOUT\n").await.unwrap();
        server.await.unwrap();

        let end = timeout(Duration::from_secs(5), transport.inbound().unwrap().next_chunk()).await;
        assert!(end.unwrap().is_none());
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_start_is_one_shot() {
        let (listener, port) = listener().await;
        let _server = tokio::spawn(async move { listener.accept().await });

        let mut transport = TokioTransport::new("127.0.0.1", port).with_options(options());
        transport.start().await.unwrap();
        assert!(matches!(
            transport.start().await,
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (listener, port) = listener().await;
        let _server = tokio::spawn(async move { listener.accept().await });

        let mut transport = TokioTransport::new("127.0.0.1", port).with_options(options());
        transport.start().await.unwrap();
        transport.stop().await;
        transport.stop().await;

        assert!(!transport.is_running());
        assert!(matches!(transport.send(b"x").await, Err(TransportError::Closed)));
        assert!(matches!(transport.start().await, Err(TransportError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_unstarted_transport() {
        let mut transport = TokioTransport::new("127.0.0.1", 1);
        assert!(matches!(transport.send(b"x").await, Err(TransportError::NotOpen)));
        assert!(matches!(transport.start_tls(true).await, Err(TransportError::NotOpen)));
        assert!(transport.channel_binding().is_none());
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let port = {
            let (listener, port) = listener().await;
            drop(listener);
            port
        };

        let mut transport = TokioTransport::new("127.0.0.1", port).with_options(options());
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_compression_upgrade_keeps_sequence() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"* OK ready\r\n").await.unwrap();

            let mut compress = deflate::compressor();
            let mut decompress = deflate::decompressor();
            let mut received = Vec::new();
            let mut buf = [0u8; 256];
            while received.len() < 9 {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend(deflate::inflate(&mut decompress, &buf[..n]).unwrap());
            }
            assert_eq!(received, b"a2 NOOP\r\n");

            let reply = deflate::deflate(&mut compress, b"a2 OK NOOP\r\n").unwrap();
            socket.write_all(&reply).await.unwrap();
        });

        let mut transport = TokioTransport::new("127.0.0.1", port).with_options(options());
        transport.start().await.unwrap();
        assert_eq!(collect(transport.inbound().unwrap(), 12).await, b"* OK ready\r\n");

        transport
            .start_compression(CompressionAlgorithm::Deflate)
            .await
            .unwrap();
        assert!(matches!(
            transport.start_compression(CompressionAlgorithm::Deflate).await,
            Err(TransportError::AlreadyCompressed)
        ));

        transport.send(b"a2 NOOP\r\n").await.unwrap();
        assert_eq!(collect(transport.inbound().unwrap(), 12).await, b"a2 OK NOOP\r\n");
        server.await.unwrap();
    }
}
