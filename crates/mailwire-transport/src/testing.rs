//! In-memory transports for unit tests.

#![allow(clippy::unwrap_used, clippy::missing_const_for_fn)]

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::transport::{AsyncTlsUpgrade, AsyncTransport, Inbound, TlsUpgrade, Transport};
use crate::{Result, TransportError};

/// Blocking transport that replays scripted reads and records writes.
#[derive(Debug, Default)]
pub struct MockTransport {
    reads: VecDeque<Vec<u8>>,
    pub written: Vec<u8>,
    open: bool,
    close_when_drained: bool,
    write_limit: Option<usize>,
    empty_reads: u32,
    pub open_calls: u32,
    pub close_calls: u32,
    pub tls_handshakes: u32,
}

impl MockTransport {
    pub fn with_reads(chunks: &[&[u8]]) -> Self {
        Self {
            reads: chunks.iter().map(|c| c.to_vec()).collect(),
            ..Self::default()
        }
    }

    /// Reports [`TransportError::Closed`] once the script is exhausted.
    pub fn closing_when_drained(mut self) -> Self {
        self.close_when_drained = true;
        self
    }

    /// Accepts at most `limit` bytes in total.
    pub fn write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    pub fn empty_reads(&self) -> u32 {
        self.empty_reads
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<()> {
        self.open_calls += 1;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.close_calls += 1;
        self.open = false;
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let accepted = match self.write_limit {
            Some(limit) => data.len().min(limit.saturating_sub(self.written.len())),
            None => data.len(),
        };
        self.written.extend_from_slice(&data[..accepted]);
        accepted
    }

    fn read_available(&mut self, max_len: usize) -> Result<Vec<u8>> {
        match self.reads.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > max_len {
                    let rest = chunk.split_off(max_len);
                    self.reads.push_front(rest);
                }
                Ok(chunk)
            }
            None if self.close_when_drained => Err(TransportError::Closed),
            None => {
                self.empty_reads += 1;
                Ok(Vec::new())
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl TlsUpgrade for MockTransport {
    fn start_tls(&mut self, _validate_certificate: bool) -> Result<()> {
        self.tls_handshakes += 1;
        Ok(())
    }

    fn channel_binding(&self) -> Option<Vec<u8>> {
        (self.tls_handshakes > 0).then(|| vec![0xCB; 32])
    }
}

/// Async transport fed by the test through [`MockAsyncTransport::feed`].
#[derive(Debug)]
pub struct MockAsyncTransport {
    sender: Option<mpsc::UnboundedSender<Bytes>>,
    inbound: Inbound,
    started: bool,
    stopped: bool,
    fail_sends: bool,
    pub written: Vec<u8>,
    pub tls_handshakes: u32,
}

impl MockAsyncTransport {
    pub fn new() -> Self {
        let (sender, inbound) = Inbound::channel();
        Self {
            sender: Some(sender),
            inbound,
            started: false,
            stopped: false,
            fail_sends: false,
            written: Vec::new(),
            tls_handshakes: 0,
        }
    }

    /// Queues bytes as if the peer had sent them.
    pub fn feed(&self, bytes: &[u8]) {
        if let Some(sender) = &self.sender {
            sender.send(Bytes::copy_from_slice(bytes)).unwrap();
        }
    }

    /// Ends the inbound sequence as if the peer had closed.
    pub fn hang_up(&mut self) {
        self.sender = None;
    }

    pub fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl AsyncTransport for MockAsyncTransport {
    async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(TransportError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    fn inbound(&mut self) -> Option<&mut Inbound> {
        self.started.then_some(&mut self.inbound)
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.fail_sends {
            return Err(TransportError::Closed);
        }
        self.written.extend_from_slice(data);
        Ok(())
    }

    async fn stop(&mut self) {
        self.stopped = true;
        self.sender = None;
    }

    fn is_running(&self) -> bool {
        self.started && !self.stopped
    }
}

impl AsyncTlsUpgrade for MockAsyncTransport {
    async fn start_tls(&mut self, _validate_certificate: bool) -> Result<()> {
        self.tls_handshakes += 1;
        Ok(())
    }

    fn channel_binding(&self) -> Option<Vec<u8>> {
        let marker = u8::try_from(self.tls_handshakes).unwrap();
        (marker > 0).then(|| vec![marker; 32])
    }
}
