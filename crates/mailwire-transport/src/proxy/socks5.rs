//! SOCKS5 tunnelling (RFC 1928) with username/password authentication
//! (RFC 1929).

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use tokio::time::Instant;

use super::{Handshake, Input, Step, drive, drive_blocking};
use crate::transport::{AsyncTransport, Transport};
use crate::{ProxyError, ProxySettings};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 client.
#[derive(Debug, Clone, Copy)]
pub struct Socks5Client<'a> {
    settings: &'a ProxySettings,
}

impl<'a> Socks5Client<'a> {
    /// Creates a client using `settings`.
    #[must_use]
    pub const fn new(settings: &'a ProxySettings) -> Self {
        Self { settings }
    }

    /// Tunnels to `host:port` over a blocking transport open to the proxy.
    ///
    /// # Errors
    ///
    /// [`ProxyError::AuthenticationFailed`] if method negotiation or the
    /// username/password exchange fails, [`ProxyError::Socks5Rejected`] if
    /// the proxy refuses the connection, and
    /// [`ProxyError::UnsupportedAddressType`] for host names over 255 bytes.
    pub fn connect_blocking<T>(&self, transport: &mut T, host: &str, port: u16) -> Result<Bytes, ProxyError>
    where
        T: Transport + ?Sized,
    {
        drive_blocking(
            Socks5Handshake::new(self.settings, host, port),
            transport,
            self.settings.max_read_attempts(),
        )
    }

    /// Tunnels to `host:port` over a started async transport.
    ///
    /// # Errors
    ///
    /// Same as [`connect_blocking`](Self::connect_blocking), with
    /// [`ProxyError::Timeout`] once the configured timeout elapses.
    pub async fn connect<T>(&self, transport: &mut T, host: &str, port: u16) -> Result<Bytes, ProxyError>
    where
        T: AsyncTransport + ?Sized,
    {
        let deadline = Instant::now() + self.settings.timeout();
        drive(Socks5Handshake::new(self.settings, host, port), transport, deadline).await
    }
}

/// Encodes `host` as `ATYP` followed by the address bytes.
fn encode_address(host: &str) -> Result<Vec<u8>, ProxyError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        let mut out = vec![ATYP_IPV4];
        out.extend_from_slice(&ip.octets());
        return Ok(out);
    }
    if let Ok(ip) = host.parse::<Ipv6Addr>() {
        let mut out = vec![ATYP_IPV6];
        out.extend_from_slice(&ip.octets());
        return Ok(out);
    }
    let len = u8::try_from(host.len()).map_err(|_| ProxyError::UnsupportedAddressType)?;
    let mut out = Vec::with_capacity(2 + host.len());
    out.push(ATYP_DOMAIN);
    out.push(len);
    out.extend_from_slice(host.as_bytes());
    Ok(out)
}

/// Encodes the RFC 1929 username/password request.
fn auth_request(username: &str, password: &str) -> Result<Vec<u8>, ProxyError> {
    let ulen = u8::try_from(username.len()).map_err(|_| ProxyError::AuthenticationFailed)?;
    let plen = u8::try_from(password.len()).map_err(|_| ProxyError::AuthenticationFailed)?;

    let mut out = Vec::with_capacity(3 + username.len() + password.len());
    out.push(AUTH_VERSION);
    out.push(ulen);
    out.extend_from_slice(username.as_bytes());
    out.push(plen);
    out.extend_from_slice(password.as_bytes());
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    GreetingSent,
    MethodReply,
    AuthSent,
    AuthReply,
    ConnectSent,
    ReplyHeader,
    DomainLength,
    BoundAddress,
}

struct Socks5Handshake {
    state: State,
    credentials: Option<(String, String)>,
    host: String,
    port: u16,
}

impl Socks5Handshake {
    fn new(settings: &ProxySettings, host: &str, port: u16) -> Self {
        Self {
            state: State::Start,
            credentials: settings
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            host: host.to_string(),
            port,
        }
    }

    fn greeting(&self) -> Vec<u8> {
        if self.credentials.is_some() {
            vec![VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
        } else {
            vec![VERSION, 1, METHOD_NO_AUTH]
        }
    }

    fn connect_request(&self) -> Result<Vec<u8>, ProxyError> {
        let address = encode_address(&self.host)?;
        let mut out = Vec::with_capacity(3 + address.len() + 2);
        out.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00]);
        out.extend_from_slice(&address);
        out.extend_from_slice(&self.port.to_be_bytes());
        Ok(out)
    }

    fn send_connect(&mut self) -> Result<Step, ProxyError> {
        let request = self.connect_request()?;
        self.state = State::ConnectSent;
        Ok(Step::Write(request))
    }

    fn on_method(&mut self, reply: &[u8]) -> Result<Step, ProxyError> {
        if reply[0] != VERSION {
            return Err(ProxyError::InvalidResponse(format!(
                "SOCKS version {:#04x} in method reply",
                reply[0]
            )));
        }
        let auth = match &self.credentials {
            Some((user, pass)) if reply[1] == METHOD_USER_PASS => Some(auth_request(user, pass)?),
            _ => None,
        };
        match (reply[1], auth) {
            (METHOD_NO_AUTH, _) => self.send_connect(),
            (METHOD_USER_PASS, Some(request)) => {
                self.state = State::AuthSent;
                Ok(Step::Write(request))
            }
            (method, _) => {
                tracing::debug!(method, "proxy selected no acceptable method");
                Err(ProxyError::AuthenticationFailed)
            }
        }
    }

    fn on_reply_header(&mut self, header: &[u8]) -> Result<Step, ProxyError> {
        if header[0] != VERSION {
            return Err(ProxyError::InvalidResponse(format!(
                "SOCKS version {:#04x} in connect reply",
                header[0]
            )));
        }
        if header[1] != 0x00 {
            return Err(ProxyError::Socks5Rejected(header[1]));
        }
        match header[3] {
            ATYP_IPV4 => {
                self.state = State::BoundAddress;
                Ok(Step::ReadExact(4 + 2))
            }
            ATYP_IPV6 => {
                self.state = State::BoundAddress;
                Ok(Step::ReadExact(16 + 2))
            }
            ATYP_DOMAIN => {
                self.state = State::DomainLength;
                Ok(Step::ReadExact(1))
            }
            other => Err(ProxyError::InvalidResponse(format!(
                "unknown bound address type {other:#04x}"
            ))),
        }
    }
}

fn expect_len(bytes: &[u8], len: usize) -> Result<(), ProxyError> {
    if bytes.len() == len {
        Ok(())
    } else {
        Err(ProxyError::InvalidResponse(format!(
            "expected {len} bytes from SOCKS5 proxy, got {}",
            bytes.len()
        )))
    }
}

impl Handshake for Socks5Handshake {
    fn start(&mut self) -> Result<Step, ProxyError> {
        if self.state != State::Start {
            return Err(ProxyError::InvalidResponse("handshake already started".to_string()));
        }
        self.state = State::GreetingSent;
        Ok(Step::Write(self.greeting()))
    }

    fn resume(&mut self, input: Input) -> Result<Step, ProxyError> {
        match (self.state, input) {
            (State::GreetingSent, Input::Written) => {
                self.state = State::MethodReply;
                Ok(Step::ReadExact(2))
            }
            (State::MethodReply, Input::Bytes(reply)) => {
                expect_len(&reply, 2)?;
                self.on_method(&reply)
            }
            (State::AuthSent, Input::Written) => {
                self.state = State::AuthReply;
                Ok(Step::ReadExact(2))
            }
            (State::AuthReply, Input::Bytes(reply)) => {
                expect_len(&reply, 2)?;
                if reply[..] != [AUTH_VERSION, 0x00] {
                    return Err(ProxyError::AuthenticationFailed);
                }
                self.send_connect()
            }
            (State::ConnectSent, Input::Written) => {
                self.state = State::ReplyHeader;
                Ok(Step::ReadExact(4))
            }
            (State::ReplyHeader, Input::Bytes(header)) => {
                expect_len(&header, 4)?;
                self.on_reply_header(&header)
            }
            (State::DomainLength, Input::Bytes(len)) => {
                expect_len(&len, 1)?;
                self.state = State::BoundAddress;
                Ok(Step::ReadExact(usize::from(len[0]) + 2))
            }
            (State::BoundAddress, Input::Bytes(_)) => Ok(Step::Done),
            (state, _) => Err(ProxyError::InvalidResponse(format!(
                "unexpected input in SOCKS5 state {state:?}"
            ))),
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
    use proptest::prelude::*;

    use super::*;
    use crate::testing::{MockAsyncTransport, MockTransport};

    const NO_AUTH: &[u8] = &[0x05, 0x00];
    const SUCCEEDED_V4: &[u8] = &[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90];

    #[test]
    fn test_encode_address() {
        assert_eq!(encode_address("127.0.0.1").unwrap(), [0x01, 127, 0, 0, 1]);

        let v6 = encode_address("::1").unwrap();
        assert_eq!(v6.len(), 17);
        assert_eq!(v6[0], 0x04);
        assert_eq!(v6[16], 1);

        assert_eq!(
            encode_address("mx.io").unwrap(),
            [0x03, 5, b'm', b'x', b'.', b'i', b'o']
        );
        assert_eq!(
            encode_address(&"a".repeat(256)).unwrap_err(),
            ProxyError::UnsupportedAddressType
        );
    }

    #[test]
    fn test_blocking_no_auth() {
        let settings = ProxySettings::socks5("proxy", 1080).build();
        let mut transport = MockTransport::with_reads(&[NO_AUTH, SUCCEEDED_V4]);

        let leftover = Socks5Client::new(&settings)
            .connect_blocking(&mut transport, "mail.example.com", 993)
            .unwrap();

        assert!(leftover.is_empty());
        let mut expected = vec![0x05, 0x01, 0x00];
        expected.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 16]);
        expected.extend_from_slice(b"mail.example.com");
        expected.extend_from_slice(&[0x03, 0xE1]);
        assert_eq!(transport.written, expected);
    }

    #[test]
    fn test_blocking_user_pass() {
        let settings = ProxySettings::socks5("proxy", 1080)
            .credentials("joe", "s3cret")
            .build();
        let mut transport = MockTransport::with_reads(&[&[0x05, 0x02], &[0x01, 0x00], SUCCEEDED_V4]);

        Socks5Client::new(&settings)
            .connect_blocking(&mut transport, "10.0.0.5", 25)
            .unwrap();

        let written = &transport.written;
        assert_eq!(&written[..4], &[0x05, 0x02, 0x00, 0x02]);
        assert_eq!(&written[4..16], b"\x01\x03joe\x06s3cret");
        assert_eq!(&written[16..], &[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 5, 0x00, 0x19]);
    }

    #[test]
    fn test_auth_rejected() {
        let settings = ProxySettings::socks5("proxy", 1080)
            .credentials("joe", "wrong")
            .build();
        let mut transport = MockTransport::with_reads(&[&[0x05, 0x02], &[0x01, 0x01]]);

        let err = Socks5Client::new(&settings)
            .connect_blocking(&mut transport, "10.0.0.5", 25)
            .unwrap_err();
        assert_eq!(err, ProxyError::AuthenticationFailed);
    }

    #[test]
    fn test_no_acceptable_method() {
        let settings = ProxySettings::socks5("proxy", 1080).build();
        let mut transport = MockTransport::with_reads(&[&[0x05, 0xFF]]);

        let err = Socks5Client::new(&settings)
            .connect_blocking(&mut transport, "10.0.0.5", 25)
            .unwrap_err();
        assert_eq!(err, ProxyError::AuthenticationFailed);
    }

    #[test]
    fn test_password_too_long() {
        let settings = ProxySettings::socks5("proxy", 1080)
            .credentials("joe", "p".repeat(300))
            .build();
        let mut transport = MockTransport::with_reads(&[&[0x05, 0x02]]);

        let err = Socks5Client::new(&settings)
            .connect_blocking(&mut transport, "10.0.0.5", 25)
            .unwrap_err();
        assert_eq!(err, ProxyError::AuthenticationFailed);
    }

    #[test]
    fn test_wrong_version() {
        let settings = ProxySettings::socks5("proxy", 1080).build();
        let mut transport = MockTransport::with_reads(&[&[0x04, 0x00]]);

        let err = Socks5Client::new(&settings)
            .connect_blocking(&mut transport, "10.0.0.5", 25)
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidResponse(_)));
    }

    #[test]
    fn test_connect_rejected() {
        let settings = ProxySettings::socks5("proxy", 1080).build();
        let mut transport =
            MockTransport::with_reads(&[NO_AUTH, &[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]]);

        let err = Socks5Client::new(&settings)
            .connect_blocking(&mut transport, "10.0.0.5", 25)
            .unwrap_err();
        assert_eq!(err, ProxyError::Socks5Rejected(0x05));
    }

    #[tokio::test]
    async fn test_async_drains_domain_bound_address() {
        let settings = ProxySettings::socks5("proxy", 1080).build();
        let mut transport = MockAsyncTransport::new();
        transport.start().await.unwrap();
        transport.feed(NO_AUTH);

        let mut reply = vec![0x05, 0x00, 0x00, 0x03, 4];
        reply.extend_from_slice(b"rela");
        reply.extend_from_slice(&[0x00, 0x19]);
        reply.extend_from_slice(b"* OK ready\r\n");
        transport.feed(&reply);

        let leftover = Socks5Client::new(&settings)
            .connect(&mut transport, "imap.example.com", 143)
            .await
            .unwrap();
        assert_eq!(leftover, Bytes::from_static(b"* OK ready\r\n"));
    }

    #[tokio::test]
    async fn test_async_drains_ipv6_bound_address() {
        let settings = ProxySettings::socks5("proxy", 1080).build();
        let mut transport = MockAsyncTransport::new();
        transport.start().await.unwrap();

        let mut bytes = NO_AUTH.to_vec();
        bytes.extend_from_slice(&[0x05, 0x00, 0x00, 0x04]);
        bytes.extend_from_slice(&[0u8; 18]);
        bytes.extend_from_slice(b"+OK");
        transport.feed(&bytes);

        let leftover = Socks5Client::new(&settings)
            .connect(&mut transport, "::1", 110)
            .await
            .unwrap();
        assert_eq!(leftover, Bytes::from_static(b"+OK"));
    }

    #[tokio::test]
    async fn test_async_unknown_bound_address_type() {
        let settings = ProxySettings::socks5("proxy", 1080).build();
        let mut transport = MockAsyncTransport::new();
        transport.start().await.unwrap();
        transport.feed(&[0x05, 0x00, 0x05, 0x00, 0x00, 0x09]);

        let err = Socks5Client::new(&settings)
            .connect(&mut transport, "10.0.0.5", 25)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidResponse(_)));
    }

    proptest! {
        #[test]
        fn prop_domain_encoding_is_length_prefixed(host in "[a-z]{1,20}(\\.[a-z]{2,6}){1,3}") {
            let encoded = encode_address(&host).unwrap();
            prop_assert_eq!(encoded[0], ATYP_DOMAIN);
            prop_assert_eq!(usize::from(encoded[1]), host.len());
            prop_assert_eq!(&encoded[2..], host.as_bytes());
        }

        #[test]
        fn prop_ipv4_encoding(octets in any::<[u8; 4]>()) {
            let ip = Ipv4Addr::from(octets);
            let encoded = encode_address(&ip.to_string()).unwrap();
            prop_assert_eq!(encoded[0], ATYP_IPV4);
            prop_assert_eq!(&encoded[1..], &octets[..]);
        }

        #[test]
        fn prop_ipv6_encoding(octets in any::<[u8; 16]>()) {
            let ip = Ipv6Addr::from(octets);
            let encoded = encode_address(&ip.to_string()).unwrap();
            prop_assert_eq!(encoded.len(), 17);
            prop_assert_eq!(encoded[0], ATYP_IPV6);
            prop_assert_eq!(&encoded[1..], &octets[..]);
        }
    }
}
