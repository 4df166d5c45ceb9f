//! # mailwire-pool
//!
//! Bounded, async pool of authenticated IMAP, SMTP and POP3 sessions built
//! on [`mailwire_transport`].
//!
//! ## Features
//!
//! - **Hard bound**: never more than `max_connections` sessions, idle and
//!   lent out together, even while new ones are being established
//! - **Fair waiting**: callers beyond the bound queue up and are served in
//!   arrival order; dropping a waiting `acquire` leaves the queue
//! - **Staleness detection**: sessions are probed before reuse and on
//!   return; dead ones are disconnected and replaced
//! - **Retry policies**: creation failures are retried with exponential
//!   backoff by default, but rejected credentials never are
//! - **Proxy support**: sessions reach their server through whatever proxy
//!   the [`TransportFactory`](mailwire_transport::TransportFactory) carries
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailwire_pool::{ConnectionPool, MailCredentials, MailProtocol, MailServerConfiguration, PoolConfig};
//! use mailwire_transport::{ProxySettings, TransportFactory, TransportOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = TransportFactory::new(TransportOptions::default())
//!         .with_proxy(ProxySettings::socks5("127.0.0.1", 1080).build());
//!
//!     let pool = ConnectionPool::imap(
//!         MailServerConfiguration::for_protocol(MailProtocol::Imap, "imap.example.com", true),
//!         MailCredentials::new("alice@example.com", "app-password"),
//!         PoolConfig::new(4),
//!         factory,
//!     );
//!
//!     let mut imap = pool.acquire().await?;
//!     let response = imap.command("SELECT INBOX").await?;
//!     println!("{:?}", response.untagged);
//!     imap.release().await;
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`pool`]: the pool, borrowed connections and statistics
//! - [`service`]: the service contract and the IMAP, SMTP and POP3 sessions
//! - [`retry`]: retry policies for session creation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;
mod error;
pub mod pool;
pub mod retry;
pub mod service;

pub use config::{MailCredentials, MailProtocol, MailServerConfiguration, PoolConfig};
pub use error::{BoxError, ConnectionPoolError, Result, ServiceError};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use retry::{ExponentialBackoff, NoRetry, RetryPolicy};
pub use service::imap::{ImapConnection, ImapResponse, ImapService};
pub use service::pop3::{Pop3Connection, Pop3Service};
pub use service::smtp::{SmtpConnection, SmtpReply, SmtpService};
pub use service::{BoxFuture, LineChannel, MailService, open_transport};
