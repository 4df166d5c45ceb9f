//! Server, credential and pool configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::retry::{ExponentialBackoff, RetryPolicy};

/// Mail protocols the pool knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MailProtocol {
    /// IMAP4rev1 / IMAP4rev2.
    Imap,
    /// SMTP submission.
    Smtp,
    /// POP3.
    Pop3,
}

impl MailProtocol {
    /// Well-known port for the protocol and TLS mode.
    #[must_use]
    pub const fn default_port(self, implicit_tls: bool) -> u16 {
        match (self, implicit_tls) {
            (Self::Imap, true) => 993,
            (Self::Imap, false) => 143,
            (Self::Smtp, true) => 465,
            (Self::Smtp, false) => 587,
            (Self::Pop3, true) => 995,
            (Self::Pop3, false) => 110,
        }
    }

    /// Display name of the protocol.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Imap => "IMAP",
            Self::Smtp => "SMTP",
            Self::Pop3 => "POP3",
        }
    }
}

impl std::fmt::Display for MailProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const fn default_io_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_true() -> bool {
    true
}

/// Where a mail server lives and how to reach it.
///
/// # Example
///
/// ```
/// use mailwire_pool::{MailProtocol, MailServerConfiguration};
///
/// let server = MailServerConfiguration::for_protocol(MailProtocol::Smtp, "smtp.example.com", false);
/// assert_eq!(server.port, 587);
/// assert!(!server.implicit_tls);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MailServerConfiguration {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Negotiate TLS as soon as the connection is up.
    pub implicit_tls: bool,
    /// Verify the server certificate chain and name.
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub validate_certificate: bool,
    /// Bound on every wait for a server reply.
    #[cfg_attr(feature = "serde", serde(default = "default_io_timeout"))]
    pub io_timeout: Duration,
}

impl MailServerConfiguration {
    /// Creates a configuration with implicit TLS and certificate validation.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            implicit_tls: true,
            validate_certificate: default_true(),
            io_timeout: default_io_timeout(),
        }
    }

    /// Creates a configuration on the protocol's well-known port.
    #[must_use]
    pub fn for_protocol(protocol: MailProtocol, host: impl Into<String>, implicit_tls: bool) -> Self {
        Self::new(host, protocol.default_port(implicit_tls)).with_implicit_tls(implicit_tls)
    }

    /// Sets the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enables or disables implicit TLS.
    #[must_use]
    pub const fn with_implicit_tls(mut self, implicit_tls: bool) -> Self {
        self.implicit_tls = implicit_tls;
        self
    }

    /// Enables or disables certificate validation.
    #[must_use]
    pub const fn with_validate_certificate(mut self, validate: bool) -> Self {
        self.validate_certificate = validate;
        self
    }

    /// Sets the reply timeout.
    #[must_use]
    pub const fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}

/// Username and password for a mail account.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MailCredentials {
    /// Login name.
    pub username: String,
    /// Password or app password.
    pub password: String,
}

impl MailCredentials {
    /// Creates credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for MailCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Pool sizing and retry behaviour.
#[derive(Clone)]
pub struct PoolConfig {
    max_connections: usize,
    retry_policy: Arc<dyn RetryPolicy>,
}

impl PoolConfig {
    /// Creates a configuration with the default retry policy.
    ///
    /// A `max_connections` of zero is raised to one.
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections: max_connections.max(1),
            retry_policy: Arc::new(ExponentialBackoff::default()),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    /// Upper bound on live services (available plus in use).
    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Policy consulted after a failed creation attempt.
    #[must_use]
    pub fn retry_policy(&self) -> &dyn RetryPolicy {
        self.retry_policy.as_ref()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(4)
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_connections", &self.max_connections)
            .field("retry_policy", &self.retry_policy)
            .finish()
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
    use crate::retry::NoRetry;

    #[test]
    fn test_default_ports() {
        assert_eq!(MailProtocol::Imap.default_port(true), 993);
        assert_eq!(MailProtocol::Imap.default_port(false), 143);
        assert_eq!(MailProtocol::Smtp.default_port(true), 465);
        assert_eq!(MailProtocol::Smtp.default_port(false), 587);
        assert_eq!(MailProtocol::Pop3.default_port(true), 995);
        assert_eq!(MailProtocol::Pop3.default_port(false), 110);
    }

    #[test]
    fn test_server_builder() {
        let server = MailServerConfiguration::for_protocol(MailProtocol::Pop3, "pop.example.com", true)
            .with_validate_certificate(false)
            .with_io_timeout(Duration::from_secs(5));

        assert_eq!(server.host, "pop.example.com");
        assert_eq!(server.port, 995);
        assert!(server.implicit_tls);
        assert!(!server.validate_certificate);
        assert_eq!(server.io_timeout, Duration::from_secs(5));

        let plain = MailServerConfiguration::new("localhost", 1143).with_implicit_tls(false);
        assert!(!plain.implicit_tls);
        assert!(plain.validate_certificate);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = MailCredentials::new("alice", "hunter2");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_pool_config() {
        assert_eq!(PoolConfig::default().max_connections(), 4);
        assert_eq!(PoolConfig::new(0).max_connections(), 1);

        let config = PoolConfig::new(2).with_retry_policy(NoRetry);
        let err = crate::ConnectionPoolError::PoolExhausted;
        assert!(config.retry_policy().retry_after(1, &err).is_none());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_server_configuration_serde_defaults() {
        let server: MailServerConfiguration =
            serde_json::from_str(r#"{"host":"imap.example.com","port":993,"implicit_tls":true}"#)
                .unwrap();
        assert!(server.validate_certificate);
        assert_eq!(server.io_timeout, Duration::from_secs(30));

        let json = serde_json::to_string(&MailProtocol::Smtp).unwrap();
        assert_eq!(json, r#""Smtp""#);
    }
}
