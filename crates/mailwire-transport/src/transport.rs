//! Transport contracts.
//!
//! A transport is an opaque duplex byte channel owned by exactly one holder.
//! Two flavours exist:
//!
//! - [`Transport`]: blocking, pull-based. `read_available` returns whatever
//!   is ready right now.
//! - [`AsyncTransport`]: non-blocking. Inbound data arrives as an
//!   [`Inbound`] sequence of chunks that ends when the transport stops.
//!
//! TLS and compression upgrades are separate capability traits so that a
//! wrapper only forwards what the wrapped transport actually supports.

use std::collections::VecDeque;
use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Blocking duplex byte channel.
pub trait Transport {
    /// Establishes the channel. Calling it on an open transport is a no-op.
    fn open(&mut self) -> Result<()>;

    /// Tears the channel down. Idempotent.
    fn close(&mut self);

    /// Writes `data`, looping until all of it is sent.
    ///
    /// Returns the number of bytes actually written; a short count means an
    /// error or a zero-progress write stopped the loop. Whether a partial
    /// write is fatal is the caller's decision.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Returns up to `max_len` bytes that are ready now.
    ///
    /// An empty result means "nothing right now", not end of stream; a peer
    /// that closed the connection yields [`TransportError::Closed`].
    ///
    /// [`TransportError::Closed`]: crate::TransportError::Closed
    fn read_available(&mut self, max_len: usize) -> Result<Vec<u8>>;

    /// Returns true while the channel is open.
    fn is_open(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn write(&mut self, data: &[u8]) -> usize {
        (**self).write(data)
    }

    fn read_available(&mut self, max_len: usize) -> Result<Vec<u8>> {
        (**self).read_available(max_len)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Blocking transport that can be upgraded to TLS in place.
pub trait TlsUpgrade: Transport {
    /// Runs the TLS handshake, blocking until it completes or fails.
    fn start_tls(&mut self, validate_certificate: bool) -> Result<()>;

    /// RFC 9266 `tls-exporter` channel-binding token of the current session.
    fn channel_binding(&self) -> Option<Vec<u8>>;
}

/// Blocking transport that can switch on stream compression.
pub trait CompressionUpgrade: Transport {
    /// Compresses everything sent and received from now on.
    fn start_compression(&mut self, algorithm: CompressionAlgorithm) -> Result<()>;
}

/// Non-blocking duplex byte channel.
pub trait AsyncTransport: Send {
    /// Establishes the channel. One-shot: a second call fails with
    /// [`TransportError::AlreadyStarted`](crate::TransportError::AlreadyStarted).
    fn start(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// The inbound chunk sequence, available once the transport started.
    fn inbound(&mut self) -> Option<&mut Inbound>;

    /// Sends all of `data` or fails.
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Stops the transport. Idempotent.
    fn stop(&mut self) -> impl Future<Output = ()> + Send;

    /// Returns true while the channel is up and the peer has not closed it.
    fn is_running(&self) -> bool;
}

impl<T: AsyncTransport + ?Sized> AsyncTransport for &mut T {
    fn start(&mut self) -> impl Future<Output = Result<()>> + Send {
        (**self).start()
    }

    fn inbound(&mut self) -> Option<&mut Inbound> {
        (**self).inbound()
    }

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send {
        (**self).send(data)
    }

    fn stop(&mut self) -> impl Future<Output = ()> + Send {
        (**self).stop()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}

/// Async transport that can be upgraded to TLS in place.
pub trait AsyncTlsUpgrade: AsyncTransport {
    /// Runs the TLS handshake, resolving once it completes or fails.
    fn start_tls(&mut self, validate_certificate: bool) -> impl Future<Output = Result<()>> + Send;

    /// RFC 9266 `tls-exporter` channel-binding token of the current session.
    fn channel_binding(&self) -> Option<Vec<u8>>;
}

/// Async transport that can switch on stream compression.
pub trait AsyncCompressionUpgrade: AsyncTransport {
    /// Compresses everything sent and received from now on.
    fn start_compression(
        &mut self,
        algorithm: CompressionAlgorithm,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Stream compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompressionAlgorithm {
    /// Raw deflate with sync flushes (RFC 4978 `COMPRESS=DEFLATE`).
    #[default]
    Deflate,
}

/// Sequence of inbound byte chunks.
///
/// Unbounded; ends (yields `None`) once the producing transport stops or
/// the peer closes the connection. Chunks queued with [`push_front`] are
/// returned before any live data.
///
/// [`push_front`]: Inbound::push_front
#[derive(Debug)]
pub struct Inbound {
    replay: VecDeque<Bytes>,
    receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl Inbound {
    /// Creates a connected sender/sequence pair.
    #[must_use]
    pub fn channel() -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            sender,
            Self {
                replay: VecDeque::new(),
                receiver,
            },
        )
    }

    /// Waits for the next chunk. `None` means the sequence has ended.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        if let Some(chunk) = self.replay.pop_front() {
            return Some(chunk);
        }
        self.receiver.recv().await
    }

    /// Queues `chunk` ahead of everything not yet consumed.
    pub fn push_front(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.replay.push_front(chunk);
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
    use super::*;

    #[tokio::test]
    async fn test_inbound_replays_before_live_chunks() {
        let (sender, mut inbound) = Inbound::channel();
        sender.send(Bytes::from_static(b"live")).unwrap();
        inbound.push_front(Bytes::from_static(b"early"));

        assert_eq!(inbound.next_chunk().await.unwrap(), "early");
        assert_eq!(inbound.next_chunk().await.unwrap(), "live");

        drop(sender);
        assert!(inbound.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_inbound_ignores_empty_replay() {
        let (sender, mut inbound) = Inbound::channel();
        inbound.push_front(Bytes::new());
        drop(sender);
        assert!(inbound.next_chunk().await.is_none());
    }
}
