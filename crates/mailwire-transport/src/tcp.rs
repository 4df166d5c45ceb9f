//! Blocking TCP transport with in-place TLS and deflate upgrades.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use flate2::{Compress, Decompress};
use rustls::{ClientConnection, StreamOwned};

use crate::deflate;
use crate::tls;
use crate::transport::{CompressionAlgorithm, CompressionUpgrade, TlsUpgrade, Transport};
use crate::{Result, TransportError, TransportOptions};

/// A socket that is either plaintext or TLS.
enum BlockingStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for BlockingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(tcp) => tcp.read(buf),
            Self::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for BlockingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(tcp) => tcp.write(buf),
            Self::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(tcp) => tcp.flush(),
            Self::Tls(tls) => tls.flush(),
        }
    }
}

struct Deflate {
    compress: Compress,
    decompress: Decompress,
}

/// Blocking transport over [`std::net::TcpStream`].
///
/// Reads wait at most [`TransportOptions::poll_interval`] before reporting
/// that nothing is available.
pub struct TcpTransport {
    host: String,
    port: u16,
    tls_server_name: String,
    options: TransportOptions,
    stream: Option<BlockingStream>,
    compression: Option<Deflate>,
    /// Inflated bytes that did not fit the caller's last read.
    pending: Vec<u8>,
    channel_binding: Option<Vec<u8>>,
}

impl TcpTransport {
    /// Creates an unopened transport to `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            tls_server_name: host.clone(),
            host,
            port,
            options: TransportOptions::default(),
            stream: None,
            compression: None,
            pending: Vec::new(),
            channel_binding: None,
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
        matches!(self.stream, Some(BlockingStream::Tls(_)))
    }

    fn connection_failed(&self, source: io::Error) -> TransportError {
        TransportError::ConnectionFailed {
            host: self.host.clone(),
            port: self.port,
            source,
        }
    }

    fn dial(&self) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| self.connection_failed(e))?
            .collect();

        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.options.connect_timeout) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_error = e;
                }
            }
        }
        Err(self.connection_failed(last_error))
    }

    fn write_raw(&mut self, data: &[u8]) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };

        let mut written = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(error = %e, written, "write failed");
                    break;
                }
            }
        }
        if let Err(e) = stream.flush() {
            tracing::warn!(error = %e, "flush failed");
        }
        written
    }

    fn take_pending(&mut self, max_len: usize) -> Vec<u8> {
        let rest = self.pending.split_off(max_len.min(self.pending.len()));
        std::mem::replace(&mut self.pending, rest)
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("open", &self.stream.is_some())
            .field("tls", &self.is_tls())
            .field("compressed", &self.compression.is_some())
            .finish_non_exhaustive()
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let tcp = self.dial()?;
        tcp.set_read_timeout(Some(self.options.poll_interval))?;
        tcp.set_nodelay(true)?;
        tracing::debug!(host = %self.host, port = self.port, "connected");

        self.stream = Some(BlockingStream::Plain(tcp));
        Ok(())
    }

    fn close(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        match stream {
            BlockingStream::Tls(mut tls) => {
                tls.conn.send_close_notify();
                let _ = tls.flush();
                let _ = tls.sock.shutdown(Shutdown::Both);
            }
            BlockingStream::Plain(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
            }
        }
        self.compression = None;
        self.pending.clear();
        self.channel_binding = None;
        tracing::debug!(host = %self.host, port = self.port, "closed");
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let Some(codec) = self.compression.as_mut() else {
            return self.write_raw(data);
        };

        let packed = match deflate::deflate(&mut codec.compress, data) {
            Ok(packed) => packed,
            Err(e) => {
                tracing::warn!(error = %e, "compression failed");
                return 0;
            }
        };
        // A partially sent deflate block cannot be attributed to input bytes
        if self.write_raw(&packed) == packed.len() {
            data.len()
        } else {
            0
        }
    }

    fn read_available(&mut self, max_len: usize) -> Result<Vec<u8>> {
        if !self.pending.is_empty() {
            return Ok(self.take_pending(max_len));
        }
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        if max_len == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; max_len];
        let n = match stream.read(&mut buf) {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(Vec::new());
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(TransportError::Closed),
            Err(e) => return Err(e.into()),
        };
        buf.truncate(n);

        let Some(codec) = self.compression.as_mut() else {
            return Ok(buf);
        };
        self.pending = deflate::inflate(&mut codec.decompress, &buf)?;
        Ok(self.take_pending(max_len))
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl TlsUpgrade for TcpTransport {
    fn start_tls(&mut self, validate_certificate: bool) -> Result<()> {
        match &self.stream {
            None => return Err(TransportError::NotOpen),
            Some(BlockingStream::Tls(_)) => return Err(TransportError::AlreadyTls),
            Some(BlockingStream::Plain(_)) if self.compression.is_some() => {
                return Err(TransportError::AlreadyCompressed);
            }
            Some(BlockingStream::Plain(_)) => {}
        }

        let config = tls::client_config(validate_certificate)?;
        let connection = ClientConnection::new(config, tls::server_name(&self.tls_server_name)?)?;
        let Some(BlockingStream::Plain(tcp)) = self.stream.take() else {
            return Err(TransportError::NotOpen);
        };

        let mut tls = StreamOwned::new(connection, tcp);
        tls.sock.set_read_timeout(Some(self.options.connect_timeout))?;
        while tls.conn.is_handshaking() {
            if let Err(e) = tls.conn.complete_io(&mut tls.sock) {
                tracing::warn!(error = %e, server = %self.tls_server_name, "TLS handshake failed");
                let _ = tls.sock.shutdown(Shutdown::Both);
                return Err(e.into());
            }
        }
        tls.sock.set_read_timeout(Some(self.options.poll_interval))?;

        self.channel_binding = tls::exporter_token(&tls.conn);
        tracing::debug!(server = %self.tls_server_name, "TLS established");
        self.stream = Some(BlockingStream::Tls(Box::new(tls)));
        Ok(())
    }

    fn channel_binding(&self) -> Option<Vec<u8>> {
        self.channel_binding.clone()
    }
}

impl CompressionUpgrade for TcpTransport {
    fn start_compression(&mut self, algorithm: CompressionAlgorithm) -> Result<()> {
        if self.stream.is_none() {
            return Err(TransportError::NotOpen);
        }
        if self.compression.is_some() {
            return Err(TransportError::AlreadyCompressed);
        }

        match algorithm {
            CompressionAlgorithm::Deflate => {
                self.compression = Some(Deflate {
                    compress: deflate::compressor(),
                    decompress: deflate::decompressor(),
                });
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
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn options() -> TransportOptions {
        TransportOptions::default()
            .connect_timeout(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(20))
    }

    /// Polls until `len` bytes arrived.
    fn read_exactly(transport: &mut TcpTransport, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in 0..250 {
            out.extend(transport.read_available(len - out.len()).unwrap());
            if out.len() == len {
                return out;
            }
        }
        panic!("only {} of {len} bytes arrived", out.len());
    }

    #[test]
    fn test_write_then_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 6];
            socket.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello\n");
            socket.write_all(b"world\n").unwrap();
        });

        let mut transport = TcpTransport::new("127.0.0.1", port).with_options(options());
        transport.open().unwrap();
        transport.open().unwrap();
        assert!(transport.is_open());

        assert_eq!(transport.write(b"hello\n"), 6);
        assert_eq!(read_exactly(&mut transport, 6), b"world\n");

        server.join().unwrap();
        let closed = (0..250).find_map(|_| transport.read_available(16).err());
        assert!(matches!(closed, Some(TransportError::Closed)));

        transport.close();
        transport.close();
        assert!(!transport.is_open());
    }

    #[test]
    fn test_empty_read_is_not_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = TcpTransport::new("127.0.0.1", port).with_options(options());
        transport.open().unwrap();
        let (_socket, _) = listener.accept().unwrap();

        assert!(transport.read_available(64).unwrap().is_empty());
    }

    #[test]
    fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut transport = TcpTransport::new("127.0.0.1", port).with_options(options());
        let err = transport.open().unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectionFailed { port: p, .. } if p == port
        ));
    }

    #[test]
    fn test_unopened_transport() {
        let mut transport = TcpTransport::new("127.0.0.1", 1);
        assert_eq!(transport.write(b"x"), 0);
        assert!(matches!(transport.read_available(8), Err(TransportError::NotOpen)));
        assert!(matches!(transport.start_tls(true), Err(TransportError::NotOpen)));
        assert!(matches!(
            transport.start_compression(CompressionAlgorithm::Deflate),
            Err(TransportError::NotOpen)
        ));
        assert!(transport.channel_binding().is_none());
    }

    #[test]
    fn test_compression_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut compress = deflate::compressor();
            let mut decompress = deflate::decompressor();

            let mut received = Vec::new();
            let mut buf = [0u8; 256];
            while received.len() < 11 {
                let n = socket.read(&mut buf).unwrap();
                received.extend(deflate::inflate(&mut decompress, &buf[..n]).unwrap());
            }
            assert_eq!(received, b"a1 NOOP\r\n\r\n");

            let reply = deflate::deflate(&mut compress, b"a1 OK NOOP completed\r\n").unwrap();
            socket.write_all(&reply).unwrap();
        });

        let mut transport = TcpTransport::new("127.0.0.1", port).with_options(options());
        transport.open().unwrap();
        transport
            .start_compression(CompressionAlgorithm::Deflate)
            .unwrap();
        assert!(matches!(
            transport.start_compression(CompressionAlgorithm::Deflate),
            Err(TransportError::AlreadyCompressed)
        ));

        assert_eq!(transport.write(b"a1 NOOP\r\n"), 9);
        assert_eq!(transport.write(b"\r\n"), 2);
        assert_eq!(read_exactly(&mut transport, 22), b"a1 OK NOOP completed\r\n");

        server.join().unwrap();
    }
}
