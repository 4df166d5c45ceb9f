//! Pooled IMAP, SMTP and POP3 sessions against loopback fake servers.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mailwire_pool::{
    ConnectionPool, ConnectionPoolError, MailCredentials, MailServerConfiguration, PoolConfig,
};
use mailwire_transport::{ProxySettings, TransportFactory, TransportOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

type Log = Arc<Mutex<Vec<String>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn factory() -> TransportFactory {
    TransportFactory::new(TransportOptions::default().connect_timeout(Duration::from_secs(5)))
}

fn server(port: u16) -> MailServerConfiguration {
    MailServerConfiguration::new("127.0.0.1", port)
        .with_implicit_tls(false)
        .with_io_timeout(Duration::from_secs(5))
}

/// Writes `greeting`, then answers each received line with `respond`.
async fn serve_lines(socket: TcpStream, greeting: &str, log: Log, respond: fn(&str) -> String) {
    let (read, mut write) = socket.into_split();
    if !greeting.is_empty() && write.write_all(greeting.as_bytes()).await.is_err() {
        return;
    }
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let reply = respond(&line);
        log.lock().unwrap().push(line);
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Accepts connections forever, serving each with `respond`.
async fn spawn_server(
    greeting: &'static str,
    respond: fn(&str) -> String,
) -> (u16, Log, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = Log::default();
    let accepted = Arc::new(AtomicUsize::new(0));

    tokio::spawn({
        let log = Arc::clone(&log);
        let accepted = Arc::clone(&accepted);
        async move {
            while let Ok((socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_lines(socket, greeting, Arc::clone(&log), respond));
            }
        }
    });
    (port, log, accepted)
}

async fn wait_for(log: &Log, entry: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !log.lock().unwrap().iter().any(|line| line == entry) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn imap_reply(line: &str) -> String {
    let (tag, command) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "NOOP" => format!("{tag} OK NOOP completed\r\n"),
        "LOGOUT" => format!("* BYE logging out\r\n{tag} OK LOGOUT completed\r\n"),
        r#"LOGIN "alice" "secret""# => format!("{tag} OK LOGIN completed\r\n"),
        _ if command.starts_with("LOGIN ") => {
            format!("{tag} NO [AUTHENTICATIONFAILED] Invalid credentials\r\n")
        }
        _ => format!("{tag} BAD unknown command\r\n"),
    }
}

fn smtp_reply(line: &str) -> String {
    match line {
        "EHLO localhost" => "250-smtp.example.com\r\n250-PIPELINING\r\n250 AUTH PLAIN\r\n".into(),
        "AUTH PLAIN AHVzZXIAcGFzcw==" => "235 2.7.0 Authentication successful\r\n".into(),
        "NOOP" => "250 2.0.0 OK\r\n".into(),
        "QUIT" => "221 2.0.0 Bye\r\n".into(),
        _ => "500 5.5.1 unrecognized\r\n".into(),
    }
}

fn pop3_reply(line: &str) -> String {
    match line.split_once(' ').map_or(line, |(command, _)| command) {
        "USER" | "PASS" | "NOOP" => "+OK\r\n".into(),
        "QUIT" => "+OK bye\r\n".into(),
        _ => "-ERR unknown command\r\n".into(),
    }
}

#[tokio::test]
async fn test_imap_pool_logs_in_and_reuses() -> anyhow::Result<()> {
    init_tracing();
    let (port, log, accepted) = spawn_server("* OK IMAP4rev1 ready\r\n", imap_reply).await;

    let pool = ConnectionPool::imap(
        server(port),
        MailCredentials::new("alice", "secret"),
        PoolConfig::new(2),
        factory(),
    );

    let mut imap = pool.acquire().await?;
    assert!(imap.is_authenticated());
    assert_eq!(imap.greeting(), "* OK IMAP4rev1 ready");
    imap.noop().await?;
    imap.release().await;
    assert_eq!(pool.stats().available, 1);

    let again = pool.acquire().await?;
    assert!(again.is_authenticated());
    again.release().await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    pool.close().await;
    wait_for(&log, "a0006 LOGOUT").await;

    let seen = log.lock().unwrap().clone();
    assert_eq!(
        seen,
        [
            r#"a0001 LOGIN "alice" "secret""#,
            "a0002 NOOP",
            "a0003 NOOP",
            "a0004 NOOP",
            "a0005 NOOP",
            "a0006 LOGOUT",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_imap_bad_credentials_are_not_retried() {
    init_tracing();
    let (port, _log, accepted) = spawn_server("* OK ready\r\n", imap_reply).await;

    let pool = ConnectionPool::imap(
        server(port),
        MailCredentials::new("alice", "wrong"),
        PoolConfig::new(1),
        factory(),
    );

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, ConnectionPoolError::AuthenticationFailed(_)));
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn test_smtp_through_socks5() -> anyhow::Result<()> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_port = listener.local_addr()?.port();
    let log = Log::default();

    let proxy = tokio::spawn({
        let log = Arc::clone(&log);
        async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            socket.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 5];
            socket.read_exact(&mut header).await.unwrap();
            assert_eq!(header, [0x05, 0x01, 0x00, 0x03, 16]);
            let mut target = [0u8; 18];
            socket.read_exact(&mut target).await.unwrap();
            assert_eq!(&target[..16], b"smtp.example.com");
            assert_eq!(&target[16..], &587u16.to_be_bytes());

            let mut reply = vec![0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x02, 0x4B];
            reply.extend_from_slice(b"220 smtp.example.com ESMTP\r\n");
            socket.write_all(&reply).await.unwrap();

            serve_lines(socket, "", log, smtp_reply).await;
        }
    });

    let server = MailServerConfiguration::new("smtp.example.com", 587)
        .with_implicit_tls(false)
        .with_io_timeout(Duration::from_secs(5));
    let factory = factory().with_proxy(ProxySettings::socks5("127.0.0.1", proxy_port).build());
    let pool = ConnectionPool::smtp(
        server,
        MailCredentials::new("user", "pass"),
        PoolConfig::new(1),
        factory,
    );

    let extensions = pool
        .with_connection(|smtp| {
            Box::pin(async move {
                smtp.noop().await?;
                Ok::<_, anyhow::Error>(smtp.extensions().to_vec())
            })
        })
        .await?;
    assert_eq!(extensions, ["PIPELINING", "AUTH PLAIN"]);

    pool.close().await;
    wait_for(&log, "QUIT").await;
    proxy.await?;
    Ok(())
}

#[tokio::test]
async fn test_pop3_pool_of_one_serialises_callers() -> anyhow::Result<()> {
    init_tracing();
    let (port, log, accepted) = spawn_server("+OK POP3 ready\r\n", pop3_reply).await;

    let pool = ConnectionPool::pop3(
        server(port),
        MailCredentials::new("bob", "hunter2"),
        PoolConfig::new(1),
        factory(),
    );

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut pop3 = pool.acquire().await?;
            pop3.noop().await?;
            pop3.release().await;
            Ok::<_, anyhow::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    let seen = log.lock().unwrap().clone();
    assert_eq!(&seen[..2], ["USER bob", "PASS hunter2"]);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_server_is_connection_failure() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let pool = ConnectionPool::imap(
        server(port),
        MailCredentials::new("alice", "secret"),
        PoolConfig::new(1).with_retry_policy(mailwire_pool::NoRetry),
        factory(),
    );

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, ConnectionPoolError::ConnectionFailed(_)));
}
