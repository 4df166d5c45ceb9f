//! Transport and proxy configuration types.

use std::time::Duration;

/// Proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProxyKind {
    /// HTTP `CONNECT` tunnel (RFC 7231 section 4.3.6).
    HttpConnect,
    /// SOCKS4, or SOCKS4a when name resolution is delegated to the proxy.
    Socks4,
    /// SOCKS5 (RFC 1928).
    #[default]
    Socks5,
}

impl ProxyKind {
    /// Returns the port this kind of proxy conventionally listens on.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::HttpConnect => 8080,
            Self::Socks4 | Self::Socks5 => 1080,
        }
    }
}

/// Proxy configuration. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProxySettings {
    host: String,
    port: u16,
    kind: ProxyKind,
    username: Option<String>,
    password: Option<String>,
    socks4_user_id: Option<String>,
    use_socks4a: bool,
    max_read_attempts: u32,
    timeout: Duration,
    headers: Vec<(String, String)>,
}

impl ProxySettings {
    /// Creates a builder for a proxy of the given kind.
    #[must_use]
    pub fn builder(host: impl Into<String>, kind: ProxyKind) -> ProxySettingsBuilder {
        ProxySettingsBuilder::new(host, kind)
    }

    /// Creates a builder for an HTTP CONNECT proxy.
    #[must_use]
    pub fn http(host: impl Into<String>, port: u16) -> ProxySettingsBuilder {
        ProxySettingsBuilder::new(host, ProxyKind::HttpConnect).port(port)
    }

    /// Creates a builder for a SOCKS4 proxy.
    #[must_use]
    pub fn socks4(host: impl Into<String>, port: u16) -> ProxySettingsBuilder {
        ProxySettingsBuilder::new(host, ProxyKind::Socks4).port(port)
    }

    /// Creates a builder for a SOCKS5 proxy.
    #[must_use]
    pub fn socks5(host: impl Into<String>, port: u16) -> ProxySettingsBuilder {
        ProxySettingsBuilder::new(host, ProxyKind::Socks5).port(port)
    }

    /// Proxy hostname.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Proxy port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Proxy protocol.
    #[must_use]
    pub const fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// Username and password, when both are configured.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }

    /// SOCKS4 user-id field.
    #[must_use]
    pub fn socks4_user_id(&self) -> Option<&str> {
        self.socks4_user_id.as_deref()
    }

    /// Whether SOCKS4 lets the proxy resolve host names (SOCKS4a).
    #[must_use]
    pub const fn use_socks4a(&self) -> bool {
        self.use_socks4a
    }

    /// Consecutive empty reads tolerated by the blocking handshake.
    #[must_use]
    pub const fn max_read_attempts(&self) -> u32 {
        self.max_read_attempts
    }

    /// Deadline for the async handshake.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Extra headers sent with HTTP CONNECT.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

// Manual Debug implementation so the password never reaches logs
impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("socks4_user_id", &self.socks4_user_id)
            .field("use_socks4a", &self.use_socks4a)
            .field("max_read_attempts", &self.max_read_attempts)
            .field("timeout", &self.timeout)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Builder for [`ProxySettings`].
#[derive(Debug, Clone)]
pub struct ProxySettingsBuilder {
    host: String,
    port: Option<u16>,
    kind: ProxyKind,
    username: Option<String>,
    password: Option<String>,
    socks4_user_id: Option<String>,
    use_socks4a: bool,
    max_read_attempts: u32,
    timeout: Duration,
    headers: Vec<(String, String)>,
}

impl ProxySettingsBuilder {
    /// Creates a new builder with the given proxy host and kind.
    #[must_use]
    pub fn new(host: impl Into<String>, kind: ProxyKind) -> Self {
        Self {
            host: host.into(),
            port: None,
            kind,
            username: None,
            password: None,
            socks4_user_id: None,
            use_socks4a: false,
            max_read_attempts: 50,
            timeout: Duration::from_secs(30),
            headers: Vec::new(),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets proxy credentials (Basic auth for HTTP, RFC 1929 for SOCKS5).
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the SOCKS4 user-id field.
    #[must_use]
    pub fn socks4_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.socks4_user_id = Some(user_id.into());
        self
    }

    /// Lets a SOCKS4 proxy resolve target host names (SOCKS4a).
    #[must_use]
    pub const fn use_socks4a(mut self, enabled: bool) -> Self {
        self.use_socks4a = enabled;
        self
    }

    /// Sets how many consecutive empty reads the blocking handshake tolerates.
    #[must_use]
    pub const fn max_read_attempts(mut self, attempts: u32) -> Self {
        self.max_read_attempts = attempts;
        self
    }

    /// Sets the async handshake deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds a header to the HTTP CONNECT request.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Builds the settings.
    #[must_use]
    pub fn build(self) -> ProxySettings {
        ProxySettings {
            host: self.host,
            port: self.port.unwrap_or_else(|| self.kind.default_port()),
            kind: self.kind,
            username: self.username,
            password: self.password,
            socks4_user_id: self.socks4_user_id,
            use_socks4a: self.use_socks4a,
            max_read_attempts: self.max_read_attempts,
            timeout: self.timeout,
            headers: self.headers,
        }
    }
}

/// Socket-level options shared by both transport flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportOptions {
    /// Deadline for TCP connect and TLS handshakes.
    pub connect_timeout: Duration,
    /// How long a blocking `read_available` waits before reporting nothing.
    pub poll_interval: Duration,
}

impl TransportOptions {
    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the blocking poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
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

    #[test]
    fn test_default_ports() {
        assert_eq!(ProxyKind::HttpConnect.default_port(), 8080);
        assert_eq!(ProxyKind::Socks4.default_port(), 1080);
        assert_eq!(ProxyKind::Socks5.default_port(), 1080);
    }

    #[test]
    fn test_builder_defaults() {
        let settings = ProxySettings::builder("proxy.example.com", ProxyKind::HttpConnect).build();

        assert_eq!(settings.host(), "proxy.example.com");
        assert_eq!(settings.port(), 8080);
        assert_eq!(settings.kind(), ProxyKind::HttpConnect);
        assert!(settings.credentials().is_none());
        assert!(!settings.use_socks4a());
        assert_eq!(settings.max_read_attempts(), 50);
        assert_eq!(settings.timeout(), Duration::from_secs(30));
        assert!(settings.headers().is_empty());
    }

    #[test]
    fn test_builder_overrides() {
        let settings = ProxySettings::socks4("10.0.0.1", 9050)
            .socks4_user_id("alice")
            .use_socks4a(true)
            .max_read_attempts(5)
            .timeout(Duration::from_secs(2))
            .build();

        assert_eq!(settings.port(), 9050);
        assert_eq!(settings.socks4_user_id(), Some("alice"));
        assert!(settings.use_socks4a());
        assert_eq!(settings.max_read_attempts(), 5);
        assert_eq!(settings.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_headers_keep_order() {
        let settings = ProxySettings::http("proxy", 3128)
            .header("X-First", "1")
            .header("X-Second", "2")
            .build();

        let names: Vec<_> = settings.headers().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["X-First", "X-Second"]);
    }

    #[test]
    fn test_debug_redacts_password() {
        let settings = ProxySettings::socks5("proxy", 1080)
            .credentials("user", "hunter2")
            .build();

        let debug = format!("{settings:?}");
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(settings.credentials(), Some(("user", "hunter2")));
    }

    #[test]
    fn test_transport_options() {
        let options = TransportOptions::default()
            .connect_timeout(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(10));

        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.poll_interval, Duration::from_millis(10));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_roundtrip() {
        let settings = ProxySettings::http("proxy", 3128)
            .header("X-Trace", "on")
            .build();
        let json = serde_json::to_string(&settings).unwrap();
        let back: ProxySettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }
}
