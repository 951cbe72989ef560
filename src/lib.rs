//! Juicity: QUIC-based proxy protocol
//!
//! A client multiplexes TCP tunnels and UDP sessions over one QUIC connection to the
//! server. The connection authenticates on a unidirectional stream with a token derived
//! from TLS keying material; every bidirectional stream carries one proxy request.
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use juicity::transports::quic::{ClientTlsOptions, QuicDialer};
//! use juicity::{Address, Client, ClientOptions, CongestionControl};
//! use tokio::io::AsyncWriteExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dialer = QuicDialer::new(
//!         "example.com:443",
//!         ClientTlsOptions {
//!             server_name: "example.com".into(),
//!             alpn: vec!["h3".into()],
//!             allow_insecure: false,
//!         },
//!     )?;
//!     let client = Client::new(
//!         dialer,
//!         ClientOptions {
//!             uuid: "00000000-0000-0000-0000-000000000001".parse()?,
//!             password: "secret".into(),
//!             congestion_control: CongestionControl::Bbr,
//!         },
//!     );
//!
//!     let mut stream = client.dial_tcp("example.org:80".parse()?).await?;
//!     stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
//!     Ok(())
//! }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Run the server
//! juicity server --config server.toml
//!
//! # Run a local SOCKS5 proxy forwarding through the server
//! juicity client --config client.toml
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ SOCKS5 ┌──────────────┐  QUIC  ┌──────────────┐  TCP/UDP  ┌─────────┐
//! │ Application │───────▶│    Client    │───────▶│   Service    │─────────▶│ Target  │
//! └─────────────┘        └──────────────┘        └──────────────┘          └─────────┘
//!                         uni: authenticate       ServerSession
//!                         bi:  one request each   ServiceHandler
//! ```

pub mod address;
pub mod auth;
pub mod client;
pub mod config;
pub mod congestion;
pub mod error;
pub mod outbound;
pub mod packet;
pub mod protocol;
pub mod server;
pub mod socks5;
pub mod socks_udp;
pub mod stream;
pub mod transport;
pub mod transports;

pub use address::Address;
pub use auth::UserDirectory;
pub use client::{Client, ClientOptions};
pub use config::{ClientConfig, ServerConfig};
pub use congestion::CongestionControl;
pub use error::{Error, Result};
pub use outbound::DirectHandler;
pub use packet::PacketStream;
pub use protocol::Network;
pub use server::{ServerSession, Service, ServiceHandler, ServiceOptions};
pub use stream::{ClientStream, ServerStream};
pub use transport::{Connection, Dialer, Listener};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
