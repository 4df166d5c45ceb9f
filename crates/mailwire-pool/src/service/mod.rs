//! Mail services the pool can manage.
//!
//! A service is an authenticated session over an [`AsyncTransport`]. The
//! pool only needs two things from it: a cheap liveness probe and a way to
//! hang up. The IMAP, SMTP and POP3 services here share a [`LineChannel`]
//! that frames the transport's chunks into lines and bounds every wait.

pub mod imap;
pub mod pop3;
pub mod smtp;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use mailwire_transport::{
    AsyncTlsUpgrade, AsyncTransport, LineBuffer, TransportError, TransportFactory, Tunnel,
};
use tokio::time::{Instant, timeout_at};

use crate::config::MailServerConfiguration;
use crate::error::{BoxError, ConnectionPoolError, ServiceError};

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A session that can live in a [`ConnectionPool`](crate::ConnectionPool).
pub trait MailService: Send + 'static {
    /// Probes the session, typically with a protocol no-op.
    fn is_alive(&mut self) -> impl Future<Output = bool> + Send;

    /// Ends the session and releases the connection. Must not fail.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// Line-oriented view of an async transport.
#[derive(Debug)]
pub struct LineChannel<T> {
    transport: T,
    lines: LineBuffer,
    io_timeout: Duration,
}

impl<T: AsyncTransport> LineChannel<T> {
    /// Wraps a started transport.
    #[must_use]
    pub fn new(transport: T, io_timeout: Duration) -> Self {
        Self {
            transport,
            lines: LineBuffer::new(),
            io_timeout,
        }
    }

    /// Bound on each reply wait.
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Sends `line` followed by CRLF.
    ///
    /// A line carrying its own CR, LF or NUL is refused before anything is
    /// written, so interpolated values cannot start a second command.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Protocol`] for such a line, [`ServiceError::Transport`]
    /// if the write fails.
    pub async fn send_line(&mut self, line: &str) -> Result<(), ServiceError> {
        if line.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0)) {
            return Err(ServiceError::Protocol(
                "command contains CR, LF or NUL".to_string(),
            ));
        }
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.transport.send(&data).await?;
        Ok(())
    }

    /// Reads the next line, without its terminator.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Timeout`] when nothing completes a line in time,
    /// [`ServiceError::Closed`] when the inbound sequence ends.
    pub async fn read_line(&mut self) -> Result<String, ServiceError> {
        let deadline = Instant::now() + self.io_timeout;
        loop {
            if let Some(line) = self.lines.next_line() {
                tracing::trace!(len = line.len(), "received line");
                return Ok(line);
            }
            let inbound = self
                .transport
                .inbound()
                .ok_or(ServiceError::Transport(TransportError::NotOpen))?;
            match timeout_at(deadline, inbound.next_chunk()).await {
                Err(_) => return Err(ServiceError::Timeout(self.io_timeout)),
                Ok(None) => return Err(ServiceError::Closed),
                Ok(Some(chunk)) => self.lines.extend(&chunk),
            }
        }
    }

    /// Returns true while the transport is up.
    pub fn is_running(&self) -> bool {
        self.transport.is_running()
    }

    /// Stops the transport.
    pub async fn close(&mut self) {
        self.transport.stop().await;
    }

    /// The underlying transport.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

/// Connects to `server` through `factory`, negotiating TLS first when the
/// server uses implicit TLS.
///
/// # Errors
///
/// [`ServiceError::Connect`] if the connection or proxy tunnel fails,
/// [`ServiceError::Transport`] if the TLS handshake fails.
pub async fn open_transport(
    factory: &TransportFactory,
    server: &MailServerConfiguration,
) -> Result<Tunnel, ServiceError> {
    let mut transport = factory.connect(&server.host, server.port).await?;
    if server.implicit_tls {
        if let Err(e) = transport.start_tls(server.validate_certificate).await {
            tracing::warn!(host = %server.host, error = %e, "TLS handshake failed");
            transport.stop().await;
            return Err(e.into());
        }
    }
    tracing::debug!(host = %server.host, port = server.port, tls = server.implicit_tls, "mail server connected");
    Ok(transport)
}

/// Classifies a failed login for the pool: only a server refusal counts
/// as an authentication failure, anything else is a connection failure
/// and may be retried.
pub(crate) fn login_failure(error: ServiceError) -> BoxError {
    match error {
        ServiceError::Rejected(_) => Box::new(ConnectionPoolError::AuthenticationFailed(Box::new(error))),
        other => Box::new(ConnectionPoolError::ConnectionFailed(Box::new(other))),
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
pub(crate) mod testing {
    //! In-memory transport for service tests.

    use bytes::Bytes;
    use mailwire_transport::{Inbound, Result};
    use tokio::sync::mpsc;

    /// Scripted async transport: every line sent is recorded, and each
    /// queued reply is released after the next send.
    #[derive(Debug)]
    pub struct ScriptedTransport {
        inbound: Option<Inbound>,
        sender: Option<mpsc::UnboundedSender<Bytes>>,
        replies: std::collections::VecDeque<&'static str>,
        pub sent: Vec<String>,
        running: bool,
    }

    impl ScriptedTransport {
        /// `greeting` is delivered immediately; `replies` one per send.
        pub fn new(greeting: &'static str, replies: &[&'static str]) -> Self {
            let (sender, inbound) = Inbound::channel();
            if !greeting.is_empty() {
                sender.send(Bytes::from_static(greeting.as_bytes())).unwrap();
            }
            Self {
                inbound: Some(inbound),
                sender: Some(sender),
                replies: replies.iter().copied().collect(),
                sent: Vec::new(),
                running: true,
            }
        }
    }

    impl mailwire_transport::AsyncTransport for ScriptedTransport {
        async fn start(&mut self) -> Result<()> {
            Err(mailwire_transport::TransportError::AlreadyStarted)
        }

        fn inbound(&mut self) -> Option<&mut Inbound> {
            self.inbound.as_mut()
        }

        async fn send(&mut self, data: &[u8]) -> Result<()> {
            if !self.running {
                return Err(mailwire_transport::TransportError::Closed);
            }
            self.sent.push(String::from_utf8_lossy(data).into_owned());
            if let (Some(reply), Some(sender)) = (self.replies.pop_front(), &self.sender) {
                let _ = sender.send(Bytes::from_static(reply.as_bytes()));
            }
            Ok(())
        }

        async fn stop(&mut self) {
            self.running = false;
            self.sender = None;
        }

        fn is_running(&self) -> bool {
            self.running
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
    use super::testing::ScriptedTransport;
    use super::*;

    #[tokio::test]
    async fn test_line_channel_frames_and_sends() {
        let transport = ScriptedTransport::new("* OK hello\r\n* partial", &["line\r\n"]);
        let mut channel = LineChannel::new(transport, Duration::from_secs(1));

        assert_eq!(channel.read_line().await.unwrap(), "* OK hello");
        channel.send_line("a0001 NOOP").await.unwrap();
        assert_eq!(channel.read_line().await.unwrap(), "* partialline");
        assert_eq!(channel.transport().sent, ["a0001 NOOP\r\n"]);
    }

    #[tokio::test]
    async fn test_line_channel_refuses_embedded_line_breaks() {
        let transport = ScriptedTransport::new("", &["unused\r\n"]);
        let mut channel = LineChannel::new(transport, Duration::from_secs(1));

        for line in ["pw\r\na2 DELETE INBOX", "a\nb", "nul\0"] {
            let err = channel.send_line(line).await.unwrap_err();
            assert!(matches!(err, ServiceError::Protocol(_)));
        }
        assert!(channel.transport().sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_channel_times_out() {
        let transport = ScriptedTransport::new("", &[]);
        let mut channel = LineChannel::new(transport, Duration::from_secs(30));

        let err = channel.read_line().await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(d) if d == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_line_channel_reports_close() {
        let transport = ScriptedTransport::new("", &[]);
        let mut channel = LineChannel::new(transport, Duration::from_secs(1));
        channel.close().await;

        assert!(!channel.is_running());
        assert!(matches!(channel.read_line().await, Err(ServiceError::Closed)));
    }

    #[test]
    fn test_login_failure_classification() {
        let rejected = login_failure(ServiceError::Rejected("535 5.7.8 bad".into()));
        assert!(matches!(
            rejected.downcast_ref::<ConnectionPoolError>(),
            Some(ConnectionPoolError::AuthenticationFailed(_))
        ));

        let timeout = login_failure(ServiceError::Timeout(Duration::from_secs(30)));
        assert!(matches!(
            timeout.downcast_ref::<ConnectionPoolError>(),
            Some(ConnectionPoolError::ConnectionFailed(_))
        ));
    }
}
