//! Minimal POP3 session: greeting, `USER`/`PASS`, `NOOP` and `QUIT`.

use std::sync::Arc;
use std::time::Duration;

use mailwire_transport::{AsyncTransport, TransportFactory, Tunnel};

use super::{LineChannel, MailService, login_failure, open_transport};
use crate::config::{MailCredentials, MailServerConfiguration, PoolConfig};
use crate::error::{BoxError, ServiceError};
use crate::pool::ConnectionPool;

/// POP3 session over a proxied or direct tunnel.
pub type Pop3Connection = Pop3Service<Tunnel>;

/// POP3 session.
#[derive(Debug)]
pub struct Pop3Service<T> {
    channel: LineChannel<T>,
    greeting: String,
    authenticated: bool,
}

impl<T: AsyncTransport> Pop3Service<T> {
    /// Reads the `+OK` greeting from a started transport.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] on `-ERR`, plus read errors.
    pub async fn connect(transport: T, io_timeout: Duration) -> Result<Self, ServiceError> {
        let mut channel = LineChannel::new(transport, io_timeout);
        let greeting = match status(channel.read_line().await?) {
            Ok(text) => text,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };
        tracing::debug!(%greeting, "POP3 server greeted");
        Ok(Self {
            channel,
            greeting,
            authenticated: false,
        })
    }

    /// Text of the greeting after `+OK`.
    #[must_use]
    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// Whether `PASS` was accepted.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Sends `command` and returns the text after `+OK`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] on `-ERR`, plus I/O errors.
    pub async fn command(&mut self, command: &str) -> Result<String, ServiceError> {
        self.channel.send_line(command).await?;
        status(self.channel.read_line().await?)
    }

    /// Authenticates with `USER` and `PASS`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] if either command is refused.
    pub async fn login(&mut self, credentials: &MailCredentials) -> Result<(), ServiceError> {
        self.command(&format!("USER {}", credentials.username)).await?;
        self.command(&format!("PASS {}", credentials.password)).await?;
        self.authenticated = true;
        tracing::info!(user = %credentials.username, "POP3 login succeeded");
        Ok(())
    }

    /// Sends `NOOP`.
    ///
    /// # Errors
    ///
    /// Any error of [`command`](Self::command).
    pub async fn noop(&mut self) -> Result<(), ServiceError> {
        self.command("NOOP").await.map(|_| ())
    }

    /// Sends `QUIT` and closes the transport.
    ///
    /// # Errors
    ///
    /// Any error of [`command`](Self::command); the transport is closed
    /// either way.
    pub async fn quit(&mut self) -> Result<(), ServiceError> {
        let result = self.command("QUIT").await.map(|_| ());
        self.channel.close().await;
        result
    }
}

/// Splits a status line into its `+OK` text or a rejection.
fn status(line: String) -> Result<String, ServiceError> {
    if let Some(text) = line.strip_prefix("+OK") {
        return Ok(text.trim_start().to_string());
    }
    if line.starts_with("-ERR") {
        return Err(ServiceError::Rejected(line));
    }
    Err(ServiceError::Protocol(format!("unexpected status line: {line}")))
}

impl<T: AsyncTransport + 'static> MailService for Pop3Service<T> {
    async fn is_alive(&mut self) -> bool {
        self.channel.is_running() && self.noop().await.is_ok()
    }

    async fn disconnect(&mut self) {
        if self.channel.is_running() {
            let _ = self.channel.send_line("QUIT").await;
        }
        self.channel.close().await;
    }
}

impl ConnectionPool<Pop3Connection> {
    /// Pool of POP3 sessions logged in with `USER`/`PASS`.
    #[must_use]
    pub fn pop3(
        server: MailServerConfiguration,
        credentials: MailCredentials,
        config: PoolConfig,
        factory: TransportFactory,
    ) -> Self {
        let server = Arc::new(server);
        let factory = Arc::new(factory);
        Self::new(
            config,
            credentials,
            move || {
                let server = Arc::clone(&server);
                let factory = Arc::clone(&factory);
                async move {
                    let transport = open_transport(&factory, &server).await?;
                    let service = Pop3Service::connect(transport, server.io_timeout).await?;
                    Ok::<_, BoxError>(service)
                }
            },
            |mut service: Pop3Connection, credentials: MailCredentials| async move {
                match service.login(&credentials).await {
                    Ok(()) => Ok(service),
                    Err(e) => {
                        service.disconnect().await;
                        Err(login_failure(e))
                    }
                }
            },
        )
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
    use super::super::testing::ScriptedTransport;
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_status_line() {
        assert_eq!(status("+OK 2 messages".into()).unwrap(), "2 messages");
        assert_eq!(status("+OK".into()).unwrap(), "");
        assert!(matches!(status("-ERR nope".into()), Err(ServiceError::Rejected(_))));
        assert!(matches!(status("* OK".into()), Err(ServiceError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_user_pass_login() {
        let transport = ScriptedTransport::new(
            "+OK POP3 ready\r\n",
            &["+OK send PASS\r\n", "+OK maildrop locked\r\n"],
        );
        let mut pop3 = Pop3Service::connect(transport, TIMEOUT).await.unwrap();
        assert_eq!(pop3.greeting(), "POP3 ready");

        pop3.login(&MailCredentials::new("bob", "s3cret")).await.unwrap();
        assert!(pop3.is_authenticated());
        assert_eq!(
            pop3.channel.transport().sent,
            ["USER bob\r\n", "PASS s3cret\r\n"]
        );
    }

    #[tokio::test]
    async fn test_pass_rejected() {
        let transport = ScriptedTransport::new(
            "+OK ready\r\n",
            &["+OK\r\n", "-ERR [AUTH] invalid password\r\n"],
        );
        let mut pop3 = Pop3Service::connect(transport, TIMEOUT).await.unwrap();
        let err = pop3.login(&MailCredentials::new("bob", "x")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(ref line) if line.contains("[AUTH]")));
        assert!(!pop3.is_authenticated());
    }

    #[tokio::test]
    async fn test_user_with_line_break_is_refused() {
        let transport = ScriptedTransport::new("+OK ready\r\n", &["+OK\r\n"]);
        let mut pop3 = Pop3Service::connect(transport, TIMEOUT).await.unwrap();

        let err = pop3
            .login(&MailCredentials::new("bob\r\nDELE 1", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert!(pop3.channel.transport().sent.is_empty());
    }

    #[tokio::test]
    async fn test_err_greeting() {
        let transport = ScriptedTransport::new("-ERR server busy\r\n", &[]);
        let err = Pop3Service::connect(transport, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_disconnect_sends_quit() {
        let transport = ScriptedTransport::new("+OK ready\r\n", &[]);
        let mut pop3 = Pop3Service::connect(transport, TIMEOUT).await.unwrap();
        pop3.disconnect().await;
        assert!(!pop3.is_alive().await);
        assert_eq!(pop3.channel.transport().sent, ["QUIT\r\n"]);
    }
}
