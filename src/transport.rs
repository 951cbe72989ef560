//! Transport Abstraction Layer
//!
//! The minimal capability set the client and server sessions need from a QUIC
//! implementation: dial and listen, open and accept uni- and bidirectional streams,
//! per-connection keying material export, liveness and close-with-error.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::congestion::CongestionControl;
use crate::error::Result;

/// Sending half of a QUIC stream. Shutting it down finishes the stream.
pub trait SendStream: AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncWrite + Unpin + Send + 'static> SendStream for T {}

/// Receiving half of a QUIC stream.
pub trait RecvStream: AsyncRead + Unpin + Send + 'static {
    /// Stops reading, asking the peer to cease sending with `code`.
    fn stop(&mut self, code: u32);
}

impl RecvStream for Box<dyn RecvStream> {
    fn stop(&mut self, code: u32) {
        (**self).stop(code)
    }
}

/// One established QUIC connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type SendHalf: SendStream;
    type RecvHalf: RecvStream;

    async fn open_uni(&self) -> Result<Self::SendHalf>;

    async fn open_bi(&self) -> Result<(Self::SendHalf, Self::RecvHalf)>;

    async fn accept_uni(&self) -> Result<Self::RecvHalf>;

    async fn accept_bi(&self) -> Result<(Self::SendHalf, Self::RecvHalf)>;

    /// Fills `output` with keying material exported from the completed TLS handshake.
    fn export_keying_material(&self, output: &mut [u8], label: &[u8], context: &[u8]) -> Result<()>;

    fn remote_address(&self) -> SocketAddr;

    /// Whether the transport considers the connection gone.
    fn is_closed(&self) -> bool;

    /// Closes the connection immediately with an application error code.
    fn close(&self, code: u32, reason: &[u8]);
}

/// Client side factory of connections to one server.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Connection;

    /// Establishes a new connection with `congestion` installed before any
    /// application data is sent.
    async fn dial(&self, congestion: CongestionControl) -> Result<Self::Connection>;
}

/// Server side source of accepted connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Connection: Connection;

    async fn accept(&self) -> Result<Self::Connection>;

    fn local_addr(&self) -> Result<SocketAddr>;

    fn close(&self);
}
