//! Decorators that hand back bytes read past the end of a proxy handshake.
//!
//! A proxy reply and the mail server's greeting often arrive in the same
//! segment. The handshake keeps whatever it read beyond its own reply, and
//! these wrappers deliver those bytes before anything read live.

use bytes::Bytes;

use crate::Result;
use crate::transport::{
    AsyncCompressionUpgrade, AsyncTlsUpgrade, AsyncTransport, CompressionAlgorithm,
    CompressionUpgrade, Inbound, TlsUpgrade, Transport,
};

#[derive(Debug)]
enum Mode {
    Replaying(Bytes),
    Live,
}

/// Async transport that replays leftover bytes as the first inbound chunk.
///
/// Upgrade capabilities are available exactly when the wrapped transport
/// has them.
#[derive(Debug)]
pub struct ReplayTransport<T> {
    inner: T,
    mode: Mode,
}

impl<T: AsyncTransport> ReplayTransport<T> {
    /// Wraps `inner`, replaying `leftover` first. An empty leftover starts in
    /// live mode.
    #[must_use]
    pub fn new(inner: T, leftover: Bytes) -> Self {
        let mode = if leftover.is_empty() {
            Mode::Live
        } else {
            Mode::Replaying(leftover)
        };
        Self { inner, mode }
    }

    /// Wraps `inner` with nothing to replay.
    #[must_use]
    pub const fn live(inner: T) -> Self {
        Self {
            inner,
            mode: Mode::Live,
        }
    }

    /// Returns true while leftover bytes have not been queued yet.
    #[must_use]
    pub const fn is_replaying(&self) -> bool {
        matches!(self.mode, Mode::Replaying(_))
    }

    /// The wrapped transport.
    #[must_use]
    pub const fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Unwraps the transport, queueing any leftover on its inbound sequence
    /// first if it has one.
    pub fn into_inner(mut self) -> T {
        self.queue_leftover();
        self.inner
    }

    /// Moves the leftover in front of the wrapped inbound sequence, once one
    /// exists.
    fn queue_leftover(&mut self) {
        let Mode::Replaying(leftover) = std::mem::replace(&mut self.mode, Mode::Live) else {
            return;
        };
        match self.inner.inbound() {
            Some(inbound) => inbound.push_front(leftover),
            None => self.mode = Mode::Replaying(leftover),
        }
    }
}

impl<T: AsyncTransport> AsyncTransport for ReplayTransport<T> {
    async fn start(&mut self) -> Result<()> {
        self.inner.start().await?;
        self.queue_leftover();
        Ok(())
    }

    fn inbound(&mut self) -> Option<&mut Inbound> {
        self.queue_leftover();
        self.inner.inbound()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.inner.send(data).await
    }

    async fn stop(&mut self) {
        self.inner.stop().await;
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}

impl<T: AsyncTlsUpgrade> AsyncTlsUpgrade for ReplayTransport<T> {
    async fn start_tls(&mut self, validate_certificate: bool) -> Result<()> {
        self.queue_leftover();
        self.inner.start_tls(validate_certificate).await
    }

    fn channel_binding(&self) -> Option<Vec<u8>> {
        self.inner.channel_binding()
    }
}

impl<T: AsyncCompressionUpgrade> AsyncCompressionUpgrade for ReplayTransport<T> {
    async fn start_compression(&mut self, algorithm: CompressionAlgorithm) -> Result<()> {
        self.queue_leftover();
        self.inner.start_compression(algorithm).await
    }
}

/// Blocking transport that serves leftover bytes before live reads.
#[derive(Debug)]
pub struct BlockingReplay<T> {
    inner: T,
    pending: Bytes,
}

impl<T: Transport> BlockingReplay<T> {
    /// Wraps `inner`, serving `leftover` first.
    #[must_use]
    pub const fn new(inner: T, leftover: Bytes) -> Self {
        Self {
            inner,
            pending: leftover,
        }
    }

    /// Returns true while leftover bytes remain.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The wrapped transport.
    #[must_use]
    pub const fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Unwraps the transport together with any leftover not yet read.
    pub fn into_parts(self) -> (T, Bytes) {
        (self.inner, self.pending)
    }
}

impl<T: Transport> Transport for BlockingReplay<T> {
    fn open(&mut self) -> Result<()> {
        self.inner.open()
    }

    fn close(&mut self) {
        self.pending.clear();
        self.inner.close();
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.inner.write(data)
    }

    fn read_available(&mut self, max_len: usize) -> Result<Vec<u8>> {
        if self.pending.is_empty() {
            return self.inner.read_available(max_len);
        }
        let take = max_len.min(self.pending.len());
        Ok(self.pending.split_to(take).to_vec())
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

impl<T: TlsUpgrade> TlsUpgrade for BlockingReplay<T> {
    fn start_tls(&mut self, validate_certificate: bool) -> Result<()> {
        self.inner.start_tls(validate_certificate)
    }

    fn channel_binding(&self) -> Option<Vec<u8>> {
        self.inner.channel_binding()
    }
}

impl<T: CompressionUpgrade> CompressionUpgrade for BlockingReplay<T> {
    fn start_compression(&mut self, algorithm: CompressionAlgorithm) -> Result<()> {
        self.inner.start_compression(algorithm)
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
    use crate::testing::{MockAsyncTransport, MockTransport};

    #[tokio::test]
    async fn test_leftover_precedes_live_chunks() {
        let mut inner = MockAsyncTransport::new();
        inner.start().await.unwrap();
        inner.feed(b"live\r\n");

        let mut transport = ReplayTransport::new(inner, Bytes::from_static(b"* OK "));
        assert!(transport.is_replaying());

        let inbound = transport.inbound().unwrap();
        assert_eq!(inbound.next_chunk().await.unwrap(), "* OK ");
        assert_eq!(inbound.next_chunk().await.unwrap(), "live\r\n");
        assert!(!transport.is_replaying());
    }

    #[tokio::test]
    async fn test_leftover_waits_for_start() {
        let inner = MockAsyncTransport::new();
        let mut transport = ReplayTransport::new(inner, Bytes::from_static(b"+OK"));

        assert!(transport.inbound().is_none());
        assert!(transport.is_replaying());

        transport.start().await.unwrap();
        assert!(!transport.is_replaying());
        let chunk = transport.inbound().unwrap().next_chunk().await.unwrap();
        assert_eq!(chunk, "+OK");
    }

    #[tokio::test]
    async fn test_empty_leftover_is_live() {
        let transport = ReplayTransport::new(MockAsyncTransport::new(), Bytes::new());
        assert!(!transport.is_replaying());
    }

    #[tokio::test]
    async fn test_forwards_send_stop_and_tls() {
        let mut inner = MockAsyncTransport::new();
        inner.start().await.unwrap();
        let mut transport = ReplayTransport::live(inner);

        transport.send(b"a1 STARTTLS\r\n").await.unwrap();
        assert!(transport.channel_binding().is_none());
        transport.start_tls(true).await.unwrap();
        assert_eq!(transport.channel_binding(), Some(vec![1; 32]));
        transport.start_tls(true).await.unwrap();
        assert_eq!(transport.channel_binding(), Some(vec![2; 32]));

        assert!(transport.is_running());
        transport.stop().await;
        assert!(!transport.is_running());

        let inner = transport.into_inner();
        assert!(inner.is_stopped());
        assert_eq!(inner.written, b"a1 STARTTLS\r\n");
    }

    #[test]
    fn test_blocking_replay_serves_leftover_first() {
        let inner = MockTransport::with_reads(&[b"live"]);
        let mut transport = BlockingReplay::new(inner, Bytes::from_static(b"220 ready\r\n"));

        assert_eq!(transport.read_available(4).unwrap(), b"220 ");
        assert_eq!(transport.read_available(64).unwrap(), b"ready\r\n");
        assert!(!transport.is_replaying());
        assert_eq!(transport.read_available(64).unwrap(), b"live");
    }

    #[test]
    fn test_blocking_replay_forwards() {
        let inner = MockTransport::with_reads(&[]);
        let mut transport = BlockingReplay::new(inner, Bytes::from_static(b"x"));

        transport.open().unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.write(b"EHLO me\r\n"), 9);
        transport.start_tls(false).unwrap();
        assert!(transport.channel_binding().is_some());

        transport.close();
        let (inner, pending) = transport.into_parts();
        assert!(pending.is_empty());
        assert_eq!(inner.close_calls, 1);
        assert_eq!(inner.tls_handshakes, 1);
        assert_eq!(inner.written, b"EHLO me\r\n");
    }
}
