//! Client session
//!
//! Holds at most one live connection to the server and replaces it transparently once
//! it dies. Every new connection authenticates on a unidirectional stream while callers
//! already open data streams on it.

use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::address::Address;
use crate::auth::derive_token;
use crate::congestion::CongestionControl;
use crate::error::{Error, Result};
use crate::packet::PacketStream;
use crate::protocol::{Authenticate, Network};
use crate::stream::ClientStream;
use crate::transport::{Connection, Dialer};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub uuid: Uuid,
    pub password: String,
    pub congestion_control: CongestionControl,
}

/// One dialed connection plus its teardown state.
pub struct ClientConnection<C> {
    conn: C,
    done: CancellationToken,
    error: Mutex<Option<Arc<Error>>>,
}

impl<C: Connection> ClientConnection<C> {
    pub(crate) fn new(conn: C) -> Self {
        Self {
            conn,
            done: CancellationToken::new(),
            error: Mutex::new(None),
        }
    }

    /// Live while neither the transport nor this session has closed it.
    pub fn active(&self) -> bool {
        !self.conn.is_closed() && !self.done.is_cancelled()
    }

    /// Closes the connection once, recording `err` as the reason.
    pub fn close_with_error(&self, err: Error) {
        let mut recorded = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if recorded.is_some() {
            return;
        }
        if err.is_closed_or_canceled() {
            debug!("Connection to {} closed: {}", self.conn.remote_address(), err);
        } else {
            error!("Connection to {} failed: {}", self.conn.remote_address(), err);
        }
        *recorded = Some(Arc::new(err));
        self.done.cancel();
        self.conn.close(0, b"");
    }

    /// Reason recorded by the first close, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }
}

/// Juicity client
pub struct Client<D: Dialer> {
    dialer: D,
    options: ClientOptions,
    conn: tokio::sync::Mutex<Option<Arc<ClientConnection<D::Connection>>>>,
}

impl<D: Dialer> Client<D> {
    pub fn new(dialer: D, options: ClientOptions) -> Self {
        Self {
            dialer,
            options,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Returns the current connection if it is still live, otherwise dials a new one.
    async fn offer(&self) -> Result<Arc<ClientConnection<D::Connection>>> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.active() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = self.offer_new().await?;
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn offer_new(&self) -> Result<Arc<ClientConnection<D::Connection>>> {
        let quic = self.dialer.dial(self.options.congestion_control).await?;
        let token = match derive_token(&quic, &self.options.uuid, &self.options.password) {
            Ok(token) => token,
            Err(e) => {
                quic.close(0, b"");
                return Err(e);
            }
        };
        info!(
            "Connected to {} (congestion {})",
            quic.remote_address(),
            self.options.congestion_control
        );

        let conn = Arc::new(ClientConnection::new(quic));
        let record = Authenticate::new(self.options.uuid, token).encode();
        let handshake = Arc::clone(&conn);
        tokio::spawn(async move {
            let result = async {
                let mut stream = handshake.conn.open_uni().await?;
                stream.write_all(&record).await?;
                stream.shutdown().await?;
                Ok::<_, Error>(())
            }
            .await;
            if let Err(e) = result {
                handshake.close_with_error(e);
            }
        });
        Ok(conn)
    }

    async fn open(&self, destination: Address, network: Network) -> Result<ClientStream<D::Connection>> {
        let conn = self.offer().await?;
        let (send, recv) = conn.conn.open_bi().await?;
        debug!("Opened {} stream to {}", network, destination);
        Ok(ClientStream::new(send, recv, conn, destination, network))
    }

    /// Opens a TCP tunnel to `destination`. Nothing is sent before the first write.
    pub async fn dial_tcp(&self, destination: Address) -> Result<ClientStream<D::Connection>> {
        self.open(destination, Network::Tcp).await
    }

    /// Opens a UDP session whose stream header names `destination`.
    pub async fn listen_packet(&self, destination: Address) -> Result<PacketStream<ClientStream<D::Connection>>> {
        Ok(PacketStream::new(self.open(destination, Network::Udp).await?))
    }

    /// Tears down the current connection, if any. The next request dials again.
    pub async fn close_with_error(&self, err: Error) {
        if let Some(conn) = self.conn.lock().await.as_ref() {
            conn.close_with_error(err);
        }
    }
}
