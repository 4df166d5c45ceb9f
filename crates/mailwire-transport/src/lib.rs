//! # mailwire-transport
//!
//! Byte-level duplex transports for mail protocol clients, with tunnelling
//! through HTTP CONNECT, SOCKS4/4a and SOCKS5 proxies.
//!
//! ## Features
//!
//! - **Blocking and async transports**: [`TcpTransport`] pulls bytes on
//!   demand, [`TokioTransport`] pushes inbound data as a sequence of chunks
//! - **Capability upgrades**: STARTTLS-style TLS upgrades (with an RFC 9266
//!   channel-binding token) and RFC 4978 deflate compression, each behind its
//!   own trait
//! - **Proxy tunnels**: sans-I/O handshakes for HTTP CONNECT, SOCKS4/4a and
//!   SOCKS5 driven over either transport flavour
//! - **Replay of over-read bytes**: bytes the proxy handshake read past its
//!   end are handed to the caller before live traffic
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailwire_transport::{AsyncTlsUpgrade, AsyncTransport, ProxySettings, TransportFactory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = ProxySettings::socks5("127.0.0.1", 1080).build();
//!     let factory = TransportFactory::default().with_proxy(proxy);
//!
//!     let mut transport = factory.connect("imap.example.com", 993).await?;
//!     transport.start_tls(true).await?;
//!
//!     if let Some(inbound) = transport.inbound() {
//!         while let Some(chunk) = inbound.next_chunk().await {
//!             println!("{}", String::from_utf8_lossy(&chunk));
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: transport traits and the inbound chunk sequence
//! - [`reader`]: incremental line and byte readers
//! - [`proxy`]: proxy settings and tunnel clients
//! - [`factory`]: direct or proxied transport construction
//! - [`replay`]: decorators that replay over-read handshake bytes

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;
mod deflate;
mod error;
pub mod factory;
pub mod proxy;
pub mod reader;
pub mod replay;
mod stream;
mod tcp;
#[cfg(test)]
mod testing;
mod tls;
pub mod transport;

pub use config::{ProxyKind, ProxySettings, ProxySettingsBuilder, TransportOptions};
pub use error::{ConnectError, ProxyError, Result, TransportError};
pub use factory::{BlockingTunnel, Tunnel, TransportFactory};
pub use proxy::{HttpConnectClient, Socks4Client, Socks5Client};
pub use reader::{ByteAccumulator, LineBuffer};
pub use replay::{BlockingReplay, ReplayTransport};
pub use stream::TokioTransport;
pub use tcp::TcpTransport;
pub use transport::{
    AsyncCompressionUpgrade, AsyncTlsUpgrade, AsyncTransport, CompressionAlgorithm,
    CompressionUpgrade, Inbound, TlsUpgrade, Transport,
};
