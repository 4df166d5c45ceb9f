//! Minimal SMTP submission session: greeting, `EHLO`, `AUTH PLAIN`,
//! `NOOP` and `QUIT`.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mailwire_transport::{AsyncTransport, TransportFactory, Tunnel};

use super::{LineChannel, MailService, login_failure, open_transport};
use crate::config::{MailCredentials, MailServerConfiguration, PoolConfig};
use crate::error::{BoxError, ServiceError};
use crate::pool::ConnectionPool;

/// SMTP session over a proxied or direct tunnel.
pub type SmtpConnection = SmtpService<Tunnel>;

/// Name announced in `EHLO` by the pooled constructor.
const CLIENT_NAME: &str = "localhost";

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    /// Three-digit reply code.
    pub code: u16,
    /// Text of each line, without code and separator.
    pub lines: Vec<String>,
}

impl SmtpReply {
    /// Parses reply lines such as `250-First` / `250 Last`.
    fn parse(raw: &[String]) -> Result<Self, ServiceError> {
        let first = raw
            .first()
            .ok_or_else(|| ServiceError::Protocol("empty reply".into()))?;
        let code = first
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| ServiceError::Protocol(format!("invalid reply code: {first}")))?;
        let lines = raw
            .iter()
            .map(|line| line.get(4..).unwrap_or_default().to_string())
            .collect();
        Ok(Self { code, lines })
    }

    /// 2xx or 3xx.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    /// All lines joined with spaces.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }
}

impl std::fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}

/// Whether `line` ends a multi-line reply.
fn is_last_line(line: &str) -> bool {
    line.len() == 3 || (line.len() >= 4 && line.as_bytes()[3] == b' ')
}

/// SMTP session.
#[derive(Debug)]
pub struct SmtpService<T> {
    channel: LineChannel<T>,
    greeting: SmtpReply,
    extensions: Vec<String>,
    authenticated: bool,
}

impl<T: AsyncTransport> SmtpService<T> {
    /// Reads the `220` greeting from a started transport.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] if the server refuses service (`554`),
    /// [`ServiceError::Protocol`] on any other unexpected code.
    pub async fn connect(transport: T, io_timeout: Duration) -> Result<Self, ServiceError> {
        let mut channel = LineChannel::new(transport, io_timeout);
        let greeting = Self::read_reply(&mut channel).await?;
        match greeting.code {
            220 => {}
            554 => {
                channel.close().await;
                return Err(ServiceError::Rejected(greeting.to_string()));
            }
            _ => {
                channel.close().await;
                return Err(ServiceError::Protocol(format!("unexpected greeting: {greeting}")));
            }
        }
        tracing::debug!(%greeting, "SMTP server greeted");
        Ok(Self {
            channel,
            greeting,
            extensions: Vec::new(),
            authenticated: false,
        })
    }

    async fn read_reply(channel: &mut LineChannel<T>) -> Result<SmtpReply, ServiceError> {
        let mut lines = Vec::new();
        loop {
            let line = channel.read_line().await?;
            if line.is_empty() {
                continue;
            }
            let last = is_last_line(&line);
            lines.push(line);
            if last {
                return SmtpReply::parse(&lines);
            }
        }
    }

    /// Sends `command` and reads the reply, whatever its code.
    ///
    /// # Errors
    ///
    /// I/O and framing errors only.
    pub async fn command(&mut self, command: &str) -> Result<SmtpReply, ServiceError> {
        self.channel.send_line(command).await?;
        Self::read_reply(&mut self.channel).await
    }

    async fn expect(&mut self, command: &str, code: u16) -> Result<SmtpReply, ServiceError> {
        let reply = self.command(command).await?;
        if reply.code == code {
            Ok(reply)
        } else {
            Err(ServiceError::Rejected(reply.to_string()))
        }
    }

    /// The greeting reply.
    #[must_use]
    pub const fn greeting(&self) -> &SmtpReply {
        &self.greeting
    }

    /// Extension keywords advertised in the last `EHLO` reply.
    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Whether `AUTH` succeeded.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Sends `EHLO` and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] unless the server answers `250`.
    pub async fn ehlo(&mut self, client_name: &str) -> Result<(), ServiceError> {
        let reply = self.expect(&format!("EHLO {client_name}"), 250).await?;
        self.extensions = reply.lines.into_iter().skip(1).collect();
        Ok(())
    }

    /// Authenticates with `AUTH PLAIN`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] unless the server answers `235`.
    pub async fn authenticate(&mut self, credentials: &MailCredentials) -> Result<(), ServiceError> {
        let token = STANDARD.encode(format!(
            "\0{}\0{}",
            credentials.username, credentials.password
        ));
        self.expect(&format!("AUTH PLAIN {token}"), 235).await?;
        self.authenticated = true;
        tracing::info!(user = %credentials.username, "SMTP authentication succeeded");
        Ok(())
    }

    /// Sends `NOOP`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] unless the server answers `250`.
    pub async fn noop(&mut self) -> Result<(), ServiceError> {
        self.expect("NOOP", 250).await.map(|_| ())
    }

    /// Sends `QUIT` and closes the transport.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] unless the server answers `221`; the
    /// transport is closed either way.
    pub async fn quit(&mut self) -> Result<(), ServiceError> {
        let result = self.expect("QUIT", 221).await.map(|_| ());
        self.channel.close().await;
        result
    }
}

impl<T: AsyncTransport + 'static> MailService for SmtpService<T> {
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

impl ConnectionPool<SmtpConnection> {
    /// Pool of SMTP sessions authenticated with `AUTH PLAIN`.
    #[must_use]
    pub fn smtp(
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
                    let mut service = SmtpService::connect(transport, server.io_timeout).await?;
                    if let Err(e) = service.ehlo(CLIENT_NAME).await {
                        service.disconnect().await;
                        return Err(BoxError::from(e));
                    }
                    Ok::<_, BoxError>(service)
                }
            },
            |mut service: SmtpConnection, credentials: MailCredentials| async move {
                match service.authenticate(&credentials).await {
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
    fn test_parse_multi_line_reply() {
        let raw = vec![
            "250-smtp.example.com".to_string(),
            "250-PIPELINING".to_string(),
            "250 AUTH PLAIN LOGIN".to_string(),
        ];
        let reply = SmtpReply::parse(&raw).unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines, ["smtp.example.com", "PIPELINING", "AUTH PLAIN LOGIN"]);
        assert!(reply.is_positive());
    }

    #[test]
    fn test_last_line_detection() {
        assert!(is_last_line("250 OK"));
        assert!(is_last_line("250"));
        assert!(!is_last_line("250-Continuing"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let raw = vec!["hello".to_string()];
        assert!(matches!(SmtpReply::parse(&raw), Err(ServiceError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_ehlo_and_auth_plain() {
        let transport = ScriptedTransport::new(
            "220 smtp.example.com ESMTP\r\n",
            &[
                "250-smtp.example.com\r\n250-SIZE 35882577\r\n250 AUTH PLAIN\r\n",
                "235 2.7.0 Authentication successful\r\n",
            ],
        );
        let mut smtp = SmtpService::connect(transport, TIMEOUT).await.unwrap();
        assert_eq!(smtp.greeting().code, 220);

        smtp.ehlo("client.local").await.unwrap();
        assert_eq!(smtp.extensions(), ["SIZE 35882577", "AUTH PLAIN"]);

        smtp.authenticate(&MailCredentials::new("user", "pass"))
            .await
            .unwrap();
        assert!(smtp.is_authenticated());
        assert_eq!(
            smtp.channel.transport().sent,
            ["EHLO client.local\r\n", "AUTH PLAIN AHVzZXIAcGFzcw==\r\n"]
        );
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let transport = ScriptedTransport::new(
            "220 ready\r\n",
            &["535 5.7.8 Authentication credentials invalid\r\n"],
        );
        let mut smtp = SmtpService::connect(transport, TIMEOUT).await.unwrap();
        let err = smtp
            .authenticate(&MailCredentials::new("user", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(ref text) if text.starts_with("535")));
    }

    #[tokio::test]
    async fn test_service_unavailable_greeting() {
        let transport = ScriptedTransport::new("554 no service for you\r\n", &[]);
        let err = SmtpService::connect(transport, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_noop_and_quit() {
        let transport = ScriptedTransport::new(
            "220 ready\r\n",
            &["250 2.0.0 OK\r\n", "221 2.0.0 Bye\r\n"],
        );
        let mut smtp = SmtpService::connect(transport, TIMEOUT).await.unwrap();
        assert!(smtp.is_alive().await);
        smtp.quit().await.unwrap();
        assert!(!smtp.is_alive().await);
    }
}
