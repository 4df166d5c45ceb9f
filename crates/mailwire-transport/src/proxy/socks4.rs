//! SOCKS4 and SOCKS4a tunnelling.

use std::net::Ipv4Addr;

use bytes::Bytes;
use tokio::time::Instant;

use super::{Handshake, Input, Step, drive, drive_blocking};
use crate::transport::{AsyncTransport, Transport};
use crate::{ProxyError, ProxySettings};

const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
const REPLY_LEN: usize = 8;
const REQUEST_GRANTED: u8 = 0x5A;

/// SOCKS4/4a client.
#[derive(Debug, Clone, Copy)]
pub struct Socks4Client<'a> {
    settings: &'a ProxySettings,
}

impl<'a> Socks4Client<'a> {
    /// Creates a client using `settings`.
    #[must_use]
    pub const fn new(settings: &'a ProxySettings) -> Self {
        Self { settings }
    }

    /// Tunnels to `host:port` over a blocking transport open to the proxy.
    ///
    /// # Errors
    ///
    /// [`ProxyError::UnsupportedAddressType`] before anything is written
    /// when `host` is not an IPv4 address and SOCKS4a is off;
    /// [`ProxyError::Socks4Rejected`] when the proxy refuses.
    pub fn connect_blocking<T>(&self, transport: &mut T, host: &str, port: u16) -> Result<Bytes, ProxyError>
    where
        T: Transport + ?Sized,
    {
        drive_blocking(
            Socks4Handshake::new(self.settings, host, port),
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
        drive(Socks4Handshake::new(self.settings, host, port), transport, deadline).await
    }
}

/// Encodes the CONNECT request.
///
/// SOCKS4a signals a proxy-resolved name with the address `0.0.0.0` and
/// appends the host name after the user id.
fn connect_request(settings: &ProxySettings, host: &str, port: u16) -> Result<Vec<u8>, ProxyError> {
    let user_id = settings.socks4_user_id().unwrap_or_default();
    let mut request = Vec::with_capacity(9 + user_id.len() + host.len() + 1);
    request.extend_from_slice(&[VERSION, CMD_CONNECT]);
    request.extend_from_slice(&port.to_be_bytes());

    let hostname = match host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            request.extend_from_slice(&ip.octets());
            None
        }
        Err(_) if settings.use_socks4a() => {
            request.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
            Some(host)
        }
        Err(_) => return Err(ProxyError::UnsupportedAddressType),
    };

    request.extend_from_slice(user_id.as_bytes());
    request.push(0);
    if let Some(name) = hostname {
        request.extend_from_slice(name.as_bytes());
        request.push(0);
    }
    Ok(request)
}

enum State {
    Pending(Result<Vec<u8>, ProxyError>),
    Sent,
    Reply,
}

struct Socks4Handshake {
    state: State,
}

impl Socks4Handshake {
    fn new(settings: &ProxySettings, host: &str, port: u16) -> Self {
        Self {
            state: State::Pending(connect_request(settings, host, port)),
        }
    }
}

impl Handshake for Socks4Handshake {
    fn start(&mut self) -> Result<Step, ProxyError> {
        match std::mem::replace(&mut self.state, State::Sent) {
            State::Pending(request) => Ok(Step::Write(request?)),
            _ => Err(ProxyError::InvalidResponse("handshake already started".to_string())),
        }
    }

    fn resume(&mut self, input: Input) -> Result<Step, ProxyError> {
        match (&self.state, input) {
            (State::Sent, Input::Written) => {
                self.state = State::Reply;
                Ok(Step::ReadExact(REPLY_LEN))
            }
            (State::Reply, Input::Bytes(reply)) => {
                if reply.len() != REPLY_LEN {
                    return Err(ProxyError::InvalidResponse(format!(
                        "SOCKS4 reply of {} bytes",
                        reply.len()
                    )));
                }
                match reply[1] {
                    REQUEST_GRANTED => Ok(Step::Done),
                    code => Err(ProxyError::Socks4Rejected(code)),
                }
            }
            _ => Err(ProxyError::InvalidResponse("unexpected SOCKS4 handshake input".to_string())),
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
    use crate::testing::{MockAsyncTransport, MockTransport};

    const GRANTED: &[u8] = &[0x00, 0x5A, 0, 0, 0, 0, 0, 0];

    #[test]
    fn test_ipv4_request() {
        let settings = ProxySettings::socks4("proxy", 1080).socks4_user_id("bob").build();
        let request = connect_request(&settings, "192.168.1.20", 993).unwrap();
        assert_eq!(
            request,
            [0x04, 0x01, 0x03, 0xE1, 192, 168, 1, 20, b'b', b'o', b'b', 0x00]
        );
    }

    #[test]
    fn test_socks4a_request() {
        let settings = ProxySettings::socks4("proxy", 1080).use_socks4a(true).build();
        let request = connect_request(&settings, "mx.io", 25).unwrap();
        assert_eq!(
            request,
            [0x04, 0x01, 0x00, 0x19, 0, 0, 0, 0, 0x00, b'm', b'x', b'.', b'i', b'o', 0x00]
        );
    }

    #[test]
    fn test_hostname_without_socks4a_writes_nothing() {
        let settings = ProxySettings::socks4("proxy", 1080).build();
        let mut transport = MockTransport::with_reads(&[GRANTED]);

        let err = Socks4Client::new(&settings)
            .connect_blocking(&mut transport, "mail.example.com", 993)
            .unwrap_err();

        assert_eq!(err, ProxyError::UnsupportedAddressType);
        assert!(transport.written.is_empty());
    }

    #[test]
    fn test_blocking_granted() {
        let settings = ProxySettings::socks4("proxy", 1080).build();
        let mut transport = MockTransport::with_reads(&[&GRANTED[..3], &GRANTED[3..]]);

        let leftover = Socks4Client::new(&settings)
            .connect_blocking(&mut transport, "10.1.2.3", 143)
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_blocking_rejected() {
        let settings = ProxySettings::socks4("proxy", 1080).build();
        let mut transport = MockTransport::with_reads(&[&[0x00, 0x5B, 0, 0, 0, 0, 0, 0]]);

        let err = Socks4Client::new(&settings)
            .connect_blocking(&mut transport, "10.1.2.3", 143)
            .unwrap_err();
        assert_eq!(err, ProxyError::Socks4Rejected(0x5B));
    }

    #[test]
    fn test_blocking_short_reply() {
        let settings = ProxySettings::socks4("proxy", 1080).build();
        let mut transport = MockTransport::with_reads(&[&[0x00, 0x5A, 0]]).closing_when_drained();

        let err = Socks4Client::new(&settings)
            .connect_blocking(&mut transport, "10.1.2.3", 143)
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_async_keeps_bytes_after_reply() {
        let settings = ProxySettings::socks4("proxy", 1080).use_socks4a(true).build();
        let mut transport = MockAsyncTransport::new();
        transport.start().await.unwrap();
        transport.feed(&[GRANTED, &b"+OK POP3 ready\r\n"[..]].concat());

        let leftover = Socks4Client::new(&settings)
            .connect(&mut transport, "pop.example.com", 110)
            .await
            .unwrap();

        assert_eq!(leftover, Bytes::from_static(b"+OK POP3 ready\r\n"));
        assert!(transport.written.ends_with(b"\0pop.example.com\0"));
    }
}
