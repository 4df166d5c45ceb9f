//! End-to-end tunnel tests against loopback fake proxies.
//!
//! Each fake proxy answers the handshake and the mail server greeting in a
//! single write, so the client always over-reads into live traffic.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use mailwire_transport::{
    AsyncTransport, ConnectError, LineBuffer, ProxyError, ProxySettings, Transport,
    TransportFactory, TransportOptions,
};

async fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn factory(proxy: ProxySettings) -> TransportFactory {
    let options = TransportOptions::default()
        .connect_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(20));
    TransportFactory::new(options).with_proxy(proxy)
}

/// Reads from `socket` until `marker` has been seen.
async fn read_until(socket: &mut TcpStream, marker: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 512];
    while !data.windows(marker.len()).any(|w| w == marker) {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed early");
        data.extend_from_slice(&buf[..n]);
    }
    data
}

async fn read_n(socket: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    socket.read_exact(&mut buf).await.unwrap();
    buf
}

/// Pulls the next line from an async transport.
async fn next_line<T: AsyncTransport>(transport: &mut T, lines: &mut LineBuffer) -> String {
    loop {
        if let Some(line) = lines.next_line() {
            return line;
        }
        let inbound = transport.inbound().unwrap();
        let chunk = timeout(Duration::from_secs(5), inbound.next_chunk())
            .await
            .unwrap()
            .unwrap();
        lines.extend(&chunk);
    }
}

#[tokio::test]
async fn test_http_connect_replays_greeting() {
    let (listener, port) = listen().await;
    let proxy = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_until(&mut socket, b"\r\n\r\n").await;
        let request = String::from_utf8(request).unwrap();
        assert!(request.starts_with("CONNECT mail.example.com:993 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));

        socket
            .write_all(b"HTTP/1.1 200 Connection established\r\nVia: fake\r\n\r\n* OK IMAP4rev1 ready\r\n")
            .await
            .unwrap();

        let command = read_until(&mut socket, b"\r\n").await;
        assert_eq!(command, b"a1 NOOP\r\n");
        socket.write_all(b"a1 OK NOOP completed\r\n").await.unwrap();
    });

    let settings = ProxySettings::http("127.0.0.1", port)
        .credentials("user", "pass")
        .build();
    let mut transport = factory(settings)
        .connect("mail.example.com", 993)
        .await
        .unwrap();
    assert!(transport.is_replaying());

    let mut lines = LineBuffer::new();
    assert_eq!(next_line(&mut transport, &mut lines).await, "* OK IMAP4rev1 ready");

    transport.send(b"a1 NOOP\r\n").await.unwrap();
    assert_eq!(next_line(&mut transport, &mut lines).await, "a1 OK NOOP completed");

    proxy.await.unwrap();
    transport.stop().await;
    assert!(!transport.is_running());
}

#[tokio::test]
async fn test_socks5_with_credentials() {
    let (listener, port) = listen().await;
    let proxy = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        assert_eq!(read_n(&mut socket, 4).await, [0x05, 0x02, 0x00, 0x02]);
        socket.write_all(&[0x05, 0x02]).await.unwrap();

        assert_eq!(read_n(&mut socket, 14).await, b"\x01\x05alice\x06secret");
        socket.write_all(&[0x01, 0x00]).await.unwrap();

        let mut request = read_n(&mut socket, 5).await;
        assert_eq!(&request[..5], &[0x05, 0x01, 0x00, 0x03, 16]);
        request = read_n(&mut socket, 18).await;
        assert_eq!(&request[..16], b"smtp.example.com");
        assert_eq!(&request[16..], &[0x02, 0x4B]);

        let mut reply = vec![0x05, 0x00, 0x00, 0x03, 7];
        reply.extend_from_slice(b"relay.x");
        reply.extend_from_slice(&[0x9C, 0x40]);
        reply.extend_from_slice(b"220 smtp.example.com ESMTP\r\n");
        socket.write_all(&reply).await.unwrap();
    });

    let settings = ProxySettings::socks5("127.0.0.1", port)
        .credentials("alice", "secret")
        .build();
    let mut transport = factory(settings)
        .connect("smtp.example.com", 587)
        .await
        .unwrap();

    let mut lines = LineBuffer::new();
    assert_eq!(
        next_line(&mut transport, &mut lines).await,
        "220 smtp.example.com ESMTP"
    );
    proxy.await.unwrap();
}

#[tokio::test]
async fn test_socks5_rejection_is_reported() {
    let (listener, port) = listen().await;
    let proxy = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_n(&mut socket, 3).await;
        socket.write_all(&[0x05, 0x00]).await.unwrap();
        read_n(&mut socket, 10).await;
        socket
            .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    });

    let settings = ProxySettings::socks5("127.0.0.1", port).build();
    let err = factory(settings).connect("10.9.8.7", 143).await.unwrap_err();
    assert!(matches!(err, ConnectError::Proxy(ProxyError::Socks5Rejected(0x02))));
    proxy.await.unwrap();
}

#[tokio::test]
async fn test_proxy_timeout() {
    let (listener, port) = listen().await;
    let _proxy = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let settings = ProxySettings::socks5("127.0.0.1", port)
        .timeout(Duration::from_millis(200))
        .build();
    let err = factory(settings).connect("10.9.8.7", 143).await.unwrap_err();
    assert!(matches!(err, ConnectError::Proxy(ProxyError::Timeout)));
}

#[test]
fn test_blocking_socks4a_replays_greeting() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let proxy = std::thread::spawn(move || {
        use std::io::{Read, Write};

        let (mut socket, _) = listener.accept().unwrap();
        let mut request = [0u8; 26];
        socket.read_exact(&mut request).unwrap();
        assert_eq!(&request[..8], &[0x04, 0x01, 0x00, 0x6E, 0, 0, 0, 0]);
        assert_eq!(&request[8..], b"\0pop3.example.com\0".as_slice());

        socket
            .write_all(b"\x00\x5A\x00\x00\x00\x00\x00\x00+OK POP3 ready\r\n")
            .unwrap();
    });

    let settings = ProxySettings::socks4("127.0.0.1", port)
        .use_socks4a(true)
        .build();
    let mut transport = factory(settings)
        .connect_blocking("pop3.example.com", 110)
        .unwrap();

    let mut lines = LineBuffer::new();
    let mut received = Vec::new();
    for _ in 0..250 {
        received.extend(lines.push(&transport.read_available(64).unwrap()));
        if !received.is_empty() {
            break;
        }
    }
    assert_eq!(received, ["+OK POP3 ready"]);

    proxy.join().unwrap();
    transport.close();
    assert!(!transport.is_open());
}

#[tokio::test]
async fn test_direct_connection() {
    let (listener, port) = listen().await;
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"* OK direct\r\n").await.unwrap();
    });

    let options = TransportOptions::default().connect_timeout(Duration::from_secs(5));
    let mut transport = TransportFactory::new(options)
        .connect("127.0.0.1", port)
        .await
        .unwrap();
    assert!(!transport.is_replaying());

    let mut lines = LineBuffer::new();
    assert_eq!(next_line(&mut transport, &mut lines).await, "* OK direct");
    server.await.unwrap();
}
