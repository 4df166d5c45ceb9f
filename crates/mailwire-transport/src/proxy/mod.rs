//! Proxy tunnel clients.
//!
//! Each protocol is a sans-I/O [`Handshake`]: it says what to write and how
//! much to read next, and parses what comes back. Two drivers run any
//! handshake, one over a blocking [`Transport`] and one over an
//! [`AsyncTransport`], so the protocols behave the same on both.
//!
//! Every `connect` returns the bytes read past the end of the handshake;
//! the caller must deliver them before live traffic.

mod http;
mod socks4;
mod socks5;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

pub use self::http::HttpConnectClient;
pub use self::socks4::Socks4Client;
pub use self::socks5::Socks5Client;
use crate::reader::{ByteReader, LineReader};
use crate::transport::{AsyncTransport, Transport};
use crate::{ProxyError, ProxyKind, ProxySettings};

/// What a handshake needs next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// Write these bytes, then resume with [`Input::Written`].
    Write(Vec<u8>),
    /// Read exactly this many bytes.
    ReadExact(usize),
    /// Read one line.
    ReadLine,
    /// The tunnel is established.
    Done,
}

/// What the driver hands back to a handshake.
#[derive(Debug)]
pub(crate) enum Input {
    Written,
    Bytes(Bytes),
    Line(String),
}

/// A proxy handshake state machine.
pub(crate) trait Handshake {
    /// First step. Failing here means nothing has been written yet.
    fn start(&mut self) -> Result<Step, ProxyError>;

    /// Advances with the outcome of the previous step.
    fn resume(&mut self, input: Input) -> Result<Step, ProxyError>;
}

/// Runs `handshake` over a blocking transport.
pub(crate) fn drive_blocking<H, T>(
    mut handshake: H,
    transport: &mut T,
    max_read_attempts: u32,
) -> Result<Bytes, ProxyError>
where
    H: Handshake,
    T: Transport + ?Sized,
{
    let mut lines = LineReader::new();
    let mut bytes = ByteReader::new();
    let mut step = handshake.start()?;

    loop {
        step = match step {
            Step::Write(request) => {
                let written = transport.write(&request);
                if written != request.len() {
                    tracing::debug!(written, expected = request.len(), "short proxy write");
                    return Err(ProxyError::WriteFailed);
                }
                handshake.resume(Input::Written)?
            }
            Step::ReadExact(count) => {
                let reply = bytes.read_exact_blocking(transport, count, max_read_attempts)?;
                handshake.resume(Input::Bytes(reply))?
            }
            Step::ReadLine => {
                let line = lines.read_line_blocking(transport, max_read_attempts)?;
                handshake.resume(Input::Line(line))?
            }
            Step::Done => return Ok(leftover(lines, bytes)),
        };
    }
}

/// Runs `handshake` over an async transport, giving up at `deadline`.
pub(crate) async fn drive<H, T>(
    mut handshake: H,
    transport: &mut T,
    deadline: Instant,
) -> Result<Bytes, ProxyError>
where
    H: Handshake + Send,
    T: AsyncTransport + ?Sized,
{
    let mut lines = LineReader::new();
    let mut bytes = ByteReader::new();
    let mut step = handshake.start()?;

    loop {
        step = match step {
            Step::Write(request) => {
                if let Err(e) = transport.send(&request).await {
                    tracing::debug!(error = %e, "proxy write failed");
                    return Err(ProxyError::WriteFailed);
                }
                handshake.resume(Input::Written)?
            }
            Step::ReadExact(count) => {
                let inbound = transport.inbound().ok_or_else(not_started)?;
                let reply = bytes.read_exact(inbound, count, deadline).await?;
                handshake.resume(Input::Bytes(reply))?
            }
            Step::ReadLine => {
                let inbound = transport.inbound().ok_or_else(not_started)?;
                let line = lines.read_line(inbound, deadline).await?;
                handshake.resume(Input::Line(line))?
            }
            Step::Done => return Ok(leftover(lines, bytes)),
        };
    }
}

fn leftover(lines: LineReader, bytes: ByteReader) -> Bytes {
    let lines = lines.into_remaining();
    let bytes = bytes.into_remaining();
    if lines.is_empty() {
        return bytes;
    }
    if bytes.is_empty() {
        return lines;
    }
    let mut joined = BytesMut::with_capacity(lines.len() + bytes.len());
    joined.extend_from_slice(&lines);
    joined.extend_from_slice(&bytes);
    joined.freeze()
}

fn not_started() -> ProxyError {
    ProxyError::InvalidResponse("transport has not been started".to_string())
}

/// Tunnels to `host:port` through the proxy described by `settings`,
/// over a blocking transport already open to the proxy.
///
/// # Errors
///
/// Returns the [`ProxyError`] of the failing handshake step.
pub fn tunnel_blocking<T>(
    settings: &ProxySettings,
    transport: &mut T,
    host: &str,
    port: u16,
) -> Result<Bytes, ProxyError>
where
    T: Transport + ?Sized,
{
    match settings.kind() {
        ProxyKind::HttpConnect => HttpConnectClient::new(settings).connect_blocking(transport, host, port),
        ProxyKind::Socks4 => Socks4Client::new(settings).connect_blocking(transport, host, port),
        ProxyKind::Socks5 => Socks5Client::new(settings).connect_blocking(transport, host, port),
    }
}

/// Tunnels to `host:port` through the proxy described by `settings`,
/// over an async transport already started towards the proxy.
///
/// # Errors
///
/// Returns the [`ProxyError`] of the failing handshake step.
pub async fn tunnel<T>(
    settings: &ProxySettings,
    transport: &mut T,
    host: &str,
    port: u16,
) -> Result<Bytes, ProxyError>
where
    T: AsyncTransport + ?Sized,
{
    match settings.kind() {
        ProxyKind::HttpConnect => HttpConnectClient::new(settings).connect(transport, host, port).await,
        ProxyKind::Socks4 => Socks4Client::new(settings).connect(transport, host, port).await,
        ProxyKind::Socks5 => Socks5Client::new(settings).connect(transport, host, port).await,
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

    use super::*;
    use crate::testing::{MockAsyncTransport, MockTransport};

    /// Writes a greeting and expects a two-byte reply.
    struct Echo {
        stage: u8,
    }

    impl Handshake for Echo {
        fn start(&mut self) -> Result<Step, ProxyError> {
            Ok(Step::Write(b"hi".to_vec()))
        }

        fn resume(&mut self, input: Input) -> Result<Step, ProxyError> {
            self.stage += 1;
            match (self.stage, input) {
                (1, Input::Written) => Ok(Step::ReadExact(2)),
                (2, Input::Bytes(b)) if b.as_ref() == b"ok" => Ok(Step::Done),
                _ => Err(ProxyError::InvalidResponse("unexpected".into())),
            }
        }
    }

    #[test]
    fn test_drive_blocking() {
        let mut transport = MockTransport::with_reads(&[b"ok"]);
        let leftover = drive_blocking(Echo { stage: 0 }, &mut transport, 3).unwrap();
        assert!(leftover.is_empty());
        assert_eq!(transport.written, b"hi");
    }

    #[test]
    fn test_drive_blocking_short_write() {
        let mut transport = MockTransport::with_reads(&[b"ok"]).write_limit(1);
        let err = drive_blocking(Echo { stage: 0 }, &mut transport, 3).unwrap_err();
        assert_eq!(err, ProxyError::WriteFailed);
    }

    #[tokio::test]
    async fn test_drive_async_returns_leftover() {
        let mut transport = MockAsyncTransport::new();
        transport.start().await.unwrap();
        transport.feed(b"ok* OK ready\r\n");

        let deadline = Instant::now() + Duration::from_secs(5);
        let leftover = drive(Echo { stage: 0 }, &mut transport, deadline).await.unwrap();
        assert_eq!(leftover, Bytes::from_static(b"* OK ready\r\n"));
    }

    #[tokio::test]
    async fn test_drive_async_send_failure() {
        let mut transport = MockAsyncTransport::new().failing_sends();
        transport.start().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = drive(Echo { stage: 0 }, &mut transport, deadline).await.unwrap_err();
        assert_eq!(err, ProxyError::WriteFailed);
    }

    #[tokio::test]
    async fn test_drive_async_requires_started_transport() {
        let mut transport = MockAsyncTransport::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = drive(Echo { stage: 0 }, &mut transport, deadline).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidResponse(_)));
    }

    #[test]
    fn test_leftover_joins_both_readers() {
        let mut transport = MockTransport::with_reads(&[b"line\r\nrest"]);
        let mut lines = LineReader::new();
        lines.read_line_blocking(&mut transport, 1).unwrap();
        let bytes = ByteReader::new();
        assert_eq!(leftover(lines, bytes), Bytes::from_static(b"rest"));
    }
}
