//! Minimal IMAP session: greeting, `LOGIN`, `NOOP` and `LOGOUT`.

use std::sync::Arc;
use std::time::Duration;

use mailwire_transport::{AsyncTransport, TransportFactory, Tunnel};

use super::{LineChannel, MailService, login_failure, open_transport};
use crate::config::{MailCredentials, MailServerConfiguration, PoolConfig};
use crate::error::{BoxError, ServiceError};
use crate::pool::ConnectionPool;

/// IMAP session over a proxied or direct tunnel.
pub type ImapConnection = ImapService<Tunnel>;

/// Outcome of a tagged command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapResponse {
    /// Untagged lines received before the completion.
    pub untagged: Vec<String>,
    /// The tagged completion line.
    pub completion: String,
}

/// IMAP session.
#[derive(Debug)]
pub struct ImapService<T> {
    channel: LineChannel<T>,
    next_tag: u32,
    greeting: String,
    authenticated: bool,
}

impl<T: AsyncTransport> ImapService<T> {
    /// Reads the server greeting from a started transport.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] on `* BYE`, [`ServiceError::Protocol`] on
    /// anything other than `* OK` or `* PREAUTH`, plus read errors.
    pub async fn connect(transport: T, io_timeout: Duration) -> Result<Self, ServiceError> {
        let mut channel = LineChannel::new(transport, io_timeout);
        let greeting = channel.read_line().await?;

        let authenticated = if greeting.starts_with("* PREAUTH") {
            true
        } else if greeting.starts_with("* OK") {
            false
        } else if greeting.starts_with("* BYE") {
            channel.close().await;
            return Err(ServiceError::Rejected(greeting));
        } else {
            channel.close().await;
            return Err(ServiceError::Protocol(format!("unexpected greeting: {greeting}")));
        };

        tracing::debug!(%greeting, "IMAP server greeted");
        Ok(Self {
            channel,
            next_tag: 1,
            greeting,
            authenticated,
        })
    }

    /// The greeting line.
    #[must_use]
    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// Whether the session is authenticated.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn tag(&mut self) -> String {
        let tag = format!("a{:04}", self.next_tag);
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    /// Sends `command` under a fresh tag and collects the response.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] on `NO` or `BAD`, plus I/O errors.
    pub async fn command(&mut self, command: &str) -> Result<ImapResponse, ServiceError> {
        let tag = self.tag();
        self.channel.send_line(&format!("{tag} {command}")).await?;

        let mut untagged = Vec::new();
        loop {
            let line = self.channel.read_line().await?;
            let Some(status) = line.strip_prefix(tag.as_str()).and_then(|rest| rest.strip_prefix(' ')) else {
                untagged.push(line);
                continue;
            };
            if status.starts_with("OK") {
                return Ok(ImapResponse {
                    untagged,
                    completion: line,
                });
            }
            if status.starts_with("NO") || status.starts_with("BAD") {
                return Err(ServiceError::Rejected(line));
            }
            return Err(ServiceError::Protocol(format!("malformed completion: {line}")));
        }
    }

    /// Authenticates with `LOGIN`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Rejected`] if the server refuses the credentials.
    pub async fn login(&mut self, credentials: &MailCredentials) -> Result<(), ServiceError> {
        if self.authenticated {
            return Ok(());
        }
        let command = format!(
            "LOGIN {} {}",
            quote(&credentials.username),
            quote(&credentials.password)
        );
        match self.command(&command).await {
            Ok(_) => {
                self.authenticated = true;
                tracing::info!(user = %credentials.username, "IMAP login succeeded");
                Ok(())
            }
            Err(ServiceError::Rejected(line)) => {
                let reason = line.split_once(' ').map_or(line.as_str(), |(_, rest)| rest);
                Err(ServiceError::Rejected(reason.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Sends `NOOP`.
    ///
    /// # Errors
    ///
    /// Any error of [`command`](Self::command).
    pub async fn noop(&mut self) -> Result<(), ServiceError> {
        self.command("NOOP").await.map(|_| ())
    }

    /// Sends `LOGOUT` and closes the transport.
    ///
    /// # Errors
    ///
    /// Any error of [`command`](Self::command); the transport is closed
    /// either way.
    pub async fn logout(&mut self) -> Result<(), ServiceError> {
        let result = self.command("LOGOUT").await.map(|_| ());
        self.channel.close().await;
        result
    }

    /// The line channel.
    pub const fn channel_mut(&mut self) -> &mut LineChannel<T> {
        &mut self.channel
    }
}

impl<T: AsyncTransport + 'static> MailService for ImapService<T> {
    async fn is_alive(&mut self) -> bool {
        self.channel.is_running() && self.noop().await.is_ok()
    }

    async fn disconnect(&mut self) {
        if self.channel.is_running() {
            let tag = self.tag();
            let _ = self.channel.send_line(&format!("{tag} LOGOUT")).await;
        }
        self.channel.close().await;
    }
}

/// Renders `value` as an IMAP quoted string.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

impl ConnectionPool<ImapConnection> {
    /// Pool of IMAP sessions logged in with `LOGIN`.
    #[must_use]
    pub fn imap(
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
                    let service = ImapService::connect(transport, server.io_timeout).await?;
                    Ok::<_, BoxError>(service)
                }
            },
            |mut service: ImapConnection, credentials: MailCredentials| async move {
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
    fn test_quote_escapes() {
        assert_eq!(quote("alice"), r#""alice""#);
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
        assert_eq!(quote(""), r#""""#);
    }

    #[tokio::test]
    async fn test_login_sends_quoted_credentials() {
        let transport = ScriptedTransport::new(
            "* OK [CAPABILITY IMAP4rev1] ready\r\n",
            &["* CAPABILITY IMAP4rev1 IDLE\r\na0001 OK LOGIN completed\r\n"],
        );
        let mut imap = ImapService::connect(transport, TIMEOUT).await.unwrap();
        assert!(!imap.is_authenticated());

        imap.login(&MailCredentials::new("alice", "p\"w")).await.unwrap();
        assert!(imap.is_authenticated());
        assert_eq!(
            imap.channel_mut().transport().sent,
            ["a0001 LOGIN \"alice\" \"p\\\"w\"\r\n"]
        );
    }

    #[tokio::test]
    async fn test_login_rejected_hides_tag() {
        let transport = ScriptedTransport::new(
            "* OK ready\r\n",
            &["a0001 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n"],
        );
        let mut imap = ImapService::connect(transport, TIMEOUT).await.unwrap();

        let err = imap.login(&MailCredentials::new("alice", "bad")).await.unwrap_err();
        let ServiceError::Rejected(reason) = err else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(reason, "NO [AUTHENTICATIONFAILED] Invalid credentials");
    }

    #[tokio::test]
    async fn test_login_refuses_line_break_in_password() {
        let transport = ScriptedTransport::new("* OK ready\r\n", &["a0001 OK\r\n"]);
        let mut imap = ImapService::connect(transport, TIMEOUT).await.unwrap();

        let err = imap
            .login(&MailCredentials::new("alice", "pw\r\na2 DELETE INBOX"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert!(!imap.is_authenticated());
        assert!(imap.channel_mut().transport().sent.is_empty());
    }

    #[tokio::test]
    async fn test_preauth_skips_login() {
        let transport = ScriptedTransport::new("* PREAUTH welcome back\r\n", &[]);
        let mut imap = ImapService::connect(transport, TIMEOUT).await.unwrap();
        imap.login(&MailCredentials::new("alice", "x")).await.unwrap();
        assert!(imap.channel_mut().transport().sent.is_empty());
    }

    #[tokio::test]
    async fn test_bye_greeting_is_rejected() {
        let transport = ScriptedTransport::new("* BYE too many connections\r\n", &[]);
        let err = ImapService::connect(transport, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_liveness_and_disconnect() {
        let transport = ScriptedTransport::new("* OK ready\r\n", &["a0001 OK NOOP done\r\n"]);
        let mut imap = ImapService::connect(transport, TIMEOUT).await.unwrap();

        assert!(imap.is_alive().await);
        imap.disconnect().await;
        assert!(!imap.is_alive().await);
        assert_eq!(
            imap.channel_mut().transport().sent,
            ["a0001 NOOP\r\n", "a0002 LOGOUT\r\n"]
        );
    }
}
