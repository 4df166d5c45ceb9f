//! Checks an IMAP mailbox through a pool, optionally via a SOCKS5 proxy.
//!
//! ```text
//! IMAP_HOST=imap.example.com IMAP_USER=alice IMAP_PASSWORD=secret \
//! SOCKS5_PROXY=127.0.0.1:1080 RUST_LOG=mailwire=debug \
//!     cargo run --example pooled_imap
//! ```

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use mailwire_pool::{
    ConnectionPool, ExponentialBackoff, MailCredentials, MailProtocol, MailServerConfiguration,
    PoolConfig,
};
use mailwire_transport::{ProxySettings, TransportFactory, TransportOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let host = env::var("IMAP_HOST").context("IMAP_HOST is not set")?;
    let user = env::var("IMAP_USER").context("IMAP_USER is not set")?;
    let password = env::var("IMAP_PASSWORD").context("IMAP_PASSWORD is not set")?;

    let mut factory = TransportFactory::new(
        TransportOptions::default().connect_timeout(Duration::from_secs(10)),
    );
    if let Ok(proxy) = env::var("SOCKS5_PROXY") {
        let (proxy_host, proxy_port) = proxy
            .rsplit_once(':')
            .context("SOCKS5_PROXY must be host:port")?;
        let proxy_port = proxy_port.parse().context("invalid SOCKS5 proxy port")?;
        factory = factory.with_proxy(ProxySettings::socks5(proxy_host, proxy_port).build());
    }

    let pool = ConnectionPool::imap(
        MailServerConfiguration::for_protocol(MailProtocol::Imap, host, true),
        MailCredentials::new(user, password),
        PoolConfig::new(2).with_retry_policy(ExponentialBackoff::new(
            4,
            Duration::from_millis(500),
            Duration::from_secs(5),
        )),
        factory,
    );

    let mut workers = Vec::new();
    for mailbox in ["INBOX", "Sent", "Drafts"] {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            let mut imap = pool.acquire().await?;
            let response = imap.command(&format!("EXAMINE \"{mailbox}\"")).await;
            imap.release().await;
            let response = response?;
            let exists = response
                .untagged
                .iter()
                .find(|line| line.ends_with(" EXISTS"))
                .cloned()
                .unwrap_or_default();
            Ok::<_, anyhow::Error>((mailbox, exists))
        }));
    }

    for worker in workers {
        match worker.await? {
            Ok((mailbox, exists)) => println!("{mailbox}: {exists}"),
            Err(e) => eprintln!("error: {e:#}"),
        }
    }

    println!("{:?}", pool.stats());
    pool.close().await;
    Ok(())
}
