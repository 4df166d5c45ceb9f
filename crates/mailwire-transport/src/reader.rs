//! Incremental readers.
//!
//! [`LineBuffer`] rebuilds CRLF (or bare LF) terminated lines from chunks of
//! any size; [`ByteAccumulator`] hands out exact byte counts. Both keep
//! whatever they have not handed out, so nothing read ahead is lost.
//!
//! [`LineReader`] and [`ByteReader`] bind those buffers to a byte source and
//! bound their patience: a maximum number of empty reads on a blocking
//! [`Transport`], a deadline on an async [`Inbound`].

use bytes::{Bytes, BytesMut};
use tokio::time::{Instant, timeout_at};

use crate::transport::{Inbound, Transport};
use crate::{ProxyError, TransportError};

/// Maximum line length to prevent memory exhaustion.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1 MB

/// Read size used when pulling lines from a blocking transport.
const READ_CHUNK: usize = 4096;

/// Reassembles text lines from arbitrary chunks.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    buffer: BytesMut,
    /// Bytes already known not to contain `\n`.
    scanned: usize,
}

impl LineBuffer {
    /// Creates an empty line buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them.
    ///
    /// Line terminators (`\n`, with an optional preceding `\r`) are
    /// stripped. A trailing partial line is kept for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.extend(bytes);
        std::iter::from_fn(|| self.next_line()).collect()
    }

    /// Appends `bytes` without extracting lines.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Removes and returns the next complete line, if any.
    pub fn next_line(&mut self) -> Option<String> {
        let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buffer.len();
            return None;
        };

        let end = self.scanned + offset;
        let mut line = self.buffer.split_to(end + 1);
        self.scanned = 0;

        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(end - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Number of buffered bytes not yet returned as a line.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Takes every buffered byte not yet returned as a line.
    pub fn take_remaining(&mut self) -> Bytes {
        self.scanned = 0;
        self.buffer.split().freeze()
    }
}

/// Accumulates bytes and hands them out in exact counts.
#[derive(Debug, Default, Clone)]
pub struct ByteAccumulator {
    buffer: BytesMut,
}

impl ByteAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes`.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Removes exactly `count` bytes, or returns `None` if fewer are buffered.
    pub fn take(&mut self, count: usize) -> Option<Bytes> {
        (self.buffer.len() >= count).then(|| self.buffer.split_to(count).freeze())
    }

    /// Takes every buffered byte.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }
}

/// Line reader over either transport flavour.
#[derive(Debug, Default)]
pub struct LineReader {
    buffer: LineBuffer,
}

impl LineReader {
    /// Creates a reader with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads one line from a blocking transport.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Timeout`] after `max_read_attempts` empty reads,
    /// [`ProxyError::InvalidResponse`] if the peer closes the connection or
    /// the line grows past [`MAX_LINE_LENGTH`].
    pub fn read_line_blocking<T>(
        &mut self,
        transport: &mut T,
        max_read_attempts: u32,
    ) -> Result<String, ProxyError>
    where
        T: Transport + ?Sized,
    {
        let mut attempts = 0;
        loop {
            if let Some(line) = self.buffer.next_line() {
                return Ok(line);
            }
            self.check_length()?;
            let chunk = pull_blocking(transport, READ_CHUNK, &mut attempts, max_read_attempts)?;
            self.buffer.extend(&chunk);
        }
    }

    /// Reads one line from an inbound chunk sequence.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Timeout`] once `deadline` passes,
    /// [`ProxyError::InvalidResponse`] if the sequence ends or the line grows
    /// past [`MAX_LINE_LENGTH`].
    pub async fn read_line(
        &mut self,
        inbound: &mut Inbound,
        deadline: Instant,
    ) -> Result<String, ProxyError> {
        loop {
            if let Some(line) = self.buffer.next_line() {
                return Ok(line);
            }
            self.check_length()?;
            let chunk = pull(inbound, deadline).await?;
            self.buffer.extend(&chunk);
        }
    }

    /// Consumes the reader, returning bytes read past the last line.
    pub fn into_remaining(mut self) -> Bytes {
        self.buffer.take_remaining()
    }

    fn check_length(&self) -> Result<(), ProxyError> {
        if self.buffer.pending_len() > MAX_LINE_LENGTH {
            return Err(ProxyError::InvalidResponse("line too long".to_string()));
        }
        Ok(())
    }
}

/// Fixed-length reader over either transport flavour.
#[derive(Debug, Default)]
pub struct ByteReader {
    buffer: ByteAccumulator,
}

impl ByteReader {
    /// Creates a reader with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads exactly `count` bytes from a blocking transport.
    ///
    /// Only the missing byte count is requested from the transport, so a
    /// blocking read never pulls bytes past what the caller asked for.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Timeout`] after `max_read_attempts` empty reads,
    /// [`ProxyError::InvalidResponse`] if the peer closes the connection.
    pub fn read_exact_blocking<T>(
        &mut self,
        transport: &mut T,
        count: usize,
        max_read_attempts: u32,
    ) -> Result<Bytes, ProxyError>
    where
        T: Transport + ?Sized,
    {
        let mut attempts = 0;
        loop {
            if let Some(bytes) = self.buffer.take(count) {
                return Ok(bytes);
            }
            let missing = count - self.buffer.len();
            let chunk = pull_blocking(transport, missing, &mut attempts, max_read_attempts)?;
            self.buffer.push(&chunk);
        }
    }

    /// Reads exactly `count` bytes from an inbound chunk sequence.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Timeout`] once `deadline` passes,
    /// [`ProxyError::InvalidResponse`] if the sequence ends first.
    pub async fn read_exact(
        &mut self,
        inbound: &mut Inbound,
        count: usize,
        deadline: Instant,
    ) -> Result<Bytes, ProxyError> {
        loop {
            if let Some(bytes) = self.buffer.take(count) {
                return Ok(bytes);
            }
            let chunk = pull(inbound, deadline).await?;
            self.buffer.push(&chunk);
        }
    }

    /// Consumes the reader, returning bytes read past the last request.
    pub fn into_remaining(mut self) -> Bytes {
        self.buffer.take_remaining()
    }
}

/// Pulls the next non-empty chunk from a blocking transport.
fn pull_blocking<T>(
    transport: &mut T,
    max_len: usize,
    attempts: &mut u32,
    max_attempts: u32,
) -> Result<Vec<u8>, ProxyError>
where
    T: Transport + ?Sized,
{
    loop {
        let chunk = transport.read_available(max_len).map_err(read_failure)?;
        if !chunk.is_empty() {
            return Ok(chunk);
        }
        *attempts += 1;
        if *attempts >= max_attempts {
            return Err(ProxyError::Timeout);
        }
    }
}

/// Pulls the next non-empty chunk from an inbound sequence.
async fn pull(inbound: &mut Inbound, deadline: Instant) -> Result<Bytes, ProxyError> {
    loop {
        match timeout_at(deadline, inbound.next_chunk()).await {
            Err(_) => return Err(ProxyError::Timeout),
            Ok(None) => return Err(closed_during_handshake()),
            Ok(Some(chunk)) if chunk.is_empty() => {}
            Ok(Some(chunk)) => return Ok(chunk),
        }
    }
}

fn read_failure(error: TransportError) -> ProxyError {
    match error {
        TransportError::Closed => closed_during_handshake(),
        other => ProxyError::InvalidResponse(format!("read failed: {other}")),
    }
}

fn closed_during_handshake() -> ProxyError {
    ProxyError::InvalidResponse("connection closed during handshake".to_string())
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

    use proptest::prelude::*;

    use super::*;
    use crate::testing::MockTransport;

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn test_line_buffer_single_chunk() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"first\r\nsecond\nthird");
        assert_eq!(lines, ["first", "second"]);
        assert_eq!(buffer.pending_len(), 5);
        assert_eq!(buffer.push(b"\r\n"), ["third"]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_line_buffer_split_crlf() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"HTTP/1.1 200 OK\r").is_empty());
        assert_eq!(buffer.push(b"\n"), ["HTTP/1.1 200 OK"]);
    }

    #[test]
    fn test_line_buffer_empty_lines() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(b"\r\n\n"), ["", ""]);
    }

    #[test]
    fn test_line_buffer_never_reemits() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(b"a\r\n"), ["a"]);
        assert!(buffer.push(b"").is_empty());
        assert_eq!(buffer.push(b"b\n"), ["b"]);
    }

    #[test]
    fn test_line_buffer_take_remaining() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"done\r\n* OK ready");
        assert_eq!(buffer.next_line().unwrap(), "done");
        assert_eq!(buffer.take_remaining(), Bytes::from_static(b"* OK ready"));
        assert!(buffer.next_line().is_none());
    }

    #[test]
    fn test_byte_accumulator() {
        let mut acc = ByteAccumulator::new();
        acc.push(&[5, 0]);
        assert!(acc.take(4).is_none());
        acc.push(&[0, 1, 9]);
        assert_eq!(acc.take(4).unwrap().as_ref(), &[5, 0, 0, 1]);
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.take_remaining().as_ref(), &[9]);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_blocking_line_reader() {
        let mut transport = MockTransport::with_reads(&[b"HTTP/1.1 200", b" OK\r\n\r\nextra"]);
        let mut reader = LineReader::new();

        assert_eq!(
            reader.read_line_blocking(&mut transport, 3).unwrap(),
            "HTTP/1.1 200 OK"
        );
        assert_eq!(reader.read_line_blocking(&mut transport, 3).unwrap(), "");
        assert_eq!(reader.into_remaining(), Bytes::from_static(b"extra"));
    }

    #[test]
    fn test_blocking_reader_times_out() {
        let mut transport = MockTransport::with_reads(&[b"partial"]);
        let mut reader = LineReader::new();

        let err = reader.read_line_blocking(&mut transport, 3).unwrap_err();
        assert_eq!(err, ProxyError::Timeout);
        assert_eq!(transport.empty_reads(), 3);
    }

    #[test]
    fn test_blocking_reader_reports_close() {
        let mut transport = MockTransport::with_reads(&[b"\x00"]).closing_when_drained();
        let mut reader = ByteReader::new();

        let err = reader.read_exact_blocking(&mut transport, 8, 10).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidResponse(_)));
    }

    #[test]
    fn test_blocking_byte_reader_never_overreads() {
        let mut transport = MockTransport::with_reads(&[&[5, 0, 1, 2, 3, 4]]);
        let mut reader = ByteReader::new();

        let bytes = reader.read_exact_blocking(&mut transport, 2, 3).unwrap();
        assert_eq!(bytes.as_ref(), &[5, 0]);
        assert!(reader.into_remaining().is_empty());
        assert_eq!(transport.read_available(16).unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_async_line_reader_keeps_leftover() {
        let (sender, mut inbound) = Inbound::channel();
        sender.send(Bytes::from_static(b"HTTP/1.1 200 Connection")).unwrap();
        sender
            .send(Bytes::from_static(b" established\r\n\r\n* OK"))
            .unwrap();

        let mut reader = LineReader::new();
        let deadline = in_secs(5);
        assert_eq!(
            reader.read_line(&mut inbound, deadline).await.unwrap(),
            "HTTP/1.1 200 Connection established"
        );
        assert_eq!(reader.read_line(&mut inbound, deadline).await.unwrap(), "");
        assert_eq!(reader.into_remaining(), Bytes::from_static(b"* OK"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_reader_deadline() {
        let (_sender, mut inbound) = Inbound::channel();
        let mut reader = ByteReader::new();

        let deadline = Instant::now() + Duration::from_millis(250);
        let err = reader.read_exact(&mut inbound, 2, deadline).await.unwrap_err();
        assert_eq!(err, ProxyError::Timeout);
    }

    #[tokio::test]
    async fn test_async_reader_sequence_end() {
        let (sender, mut inbound) = Inbound::channel();
        sender.send(Bytes::from_static(&[0x00, 0x5A])).unwrap();
        drop(sender);

        let mut reader = ByteReader::new();
        let err = reader
            .read_exact(&mut inbound, 8, in_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_line_length_limit() {
        let (sender, mut inbound) = Inbound::channel();
        sender
            .send(Bytes::from(vec![b'A'; MAX_LINE_LENGTH + 100]))
            .unwrap();

        let mut reader = LineReader::new();
        let err = reader.read_line(&mut inbound, in_secs(5)).await.unwrap_err();
        assert_eq!(err, ProxyError::InvalidResponse("line too long".into()));
    }

    fn reference_lines(data: &[u8]) -> (Vec<String>, Vec<u8>) {
        let mut lines = Vec::new();
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let mut line = &rest[..pos];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            rest = &rest[pos + 1..];
        }
        (lines, rest.to_vec())
    }

    proptest! {
        #[test]
        fn prop_chunking_preserves_lines(
            data in proptest::collection::vec(
                prop_oneof![Just(b'\r'), Just(b'\n'), b'a'..=b'e'],
                0..256,
            ),
            cuts in proptest::collection::vec(0usize..256, 0..16),
        ) {
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(data.len())).collect();
            cuts.sort_unstable();

            let mut buffer = LineBuffer::new();
            let mut lines = Vec::new();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(data.len())) {
                lines.extend(buffer.push(&data[start..cut]));
                start = cut;
            }

            let (expected, rest) = reference_lines(&data);
            prop_assert_eq!(lines, expected);
            prop_assert_eq!(buffer.take_remaining().to_vec(), rest);
        }

        #[test]
        fn prop_accumulator_preserves_order(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..8),
            take in 0usize..64,
        ) {
            let all: Vec<u8> = chunks.concat();
            let mut acc = ByteAccumulator::new();
            for chunk in &chunks {
                acc.push(chunk);
            }
            match acc.take(take) {
                Some(head) => {
                    prop_assert_eq!(head.to_vec(), all[..take].to_vec());
                    prop_assert_eq!(acc.take_remaining().to_vec(), all[take..].to_vec());
                }
                None => prop_assert!(all.len() < take),
            }
        }
    }
}
