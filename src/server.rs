//! Server session and service
//!
//! Every accepted connection gets a [`ServerSession`] running four tasks: a cancellation
//! watcher, the unidirectional stream loop (authentication), the bidirectional stream
//! loop (proxy requests) and the authentication timeout. All fatal errors go through
//! [`ServerSession::close_with_error`], which runs at most once.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::address::{Address, MAX_ADDRESS_LEN};
use crate::auth::{derive_token, verify_token, UserDirectory};
use crate::error::{Error, Result};
use crate::packet::PacketStream;
use crate::protocol::{Authenticate, Network, AUTHENTICATE_LEN, COMMAND_AUTHENTICATE, VERSION};
use crate::stream::{PrefixedStream, ServerStream};
use crate::transport::{Connection, Listener, RecvStream, SendStream};

/// Authentication window used when none is configured.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives authenticated proxy requests.
#[async_trait]
pub trait ServiceHandler<U>: Send + Sync + 'static {
    /// A TCP request from `user`, arriving over the connection from `source`.
    async fn new_connection(
        &self,
        user: U,
        source: SocketAddr,
        destination: Address,
        stream: ServerStream,
    ) -> anyhow::Result<()>;

    /// A UDP session from `user`. `destination` is the session address of the stream
    /// header; every packet names its own target.
    async fn new_packet_connection(
        &self,
        user: U,
        source: SocketAddr,
        destination: Address,
        stream: PacketStream<ServerStream>,
    ) -> anyhow::Result<()>;
}

pub struct ServiceOptions<U> {
    /// Zero selects [`DEFAULT_AUTH_TIMEOUT`].
    pub auth_timeout: Duration,
    pub handler: Arc<dyn ServiceHandler<U>>,
    /// Cancelling closes the accept loop and every session.
    pub cancel: CancellationToken,
}

struct ServiceInner<U> {
    users: UserDirectory<U>,
    auth_timeout: Duration,
    handler: Arc<dyn ServiceHandler<U>>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

/// Juicity server
pub struct Service<U> {
    inner: Arc<ServiceInner<U>>,
}

impl<U> Clone for Service<U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<U> Service<U>
where
    U: Clone + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(options: ServiceOptions<U>) -> Self {
        let auth_timeout = if options.auth_timeout.is_zero() {
            DEFAULT_AUTH_TIMEOUT
        } else {
            options.auth_timeout
        };
        Self {
            inner: Arc::new(ServiceInner {
                users: UserDirectory::new(),
                auth_timeout,
                handler: options.handler,
                shutdown: options.cancel.child_token(),
                cancel: options.cancel,
            }),
        }
    }

    pub fn auth_timeout(&self) -> Duration {
        self.inner.auth_timeout
    }

    /// Replaces all users. The three lists are matched by index.
    pub fn update_users(&self, users: Vec<U>, uuids: Vec<Uuid>, passwords: Vec<String>) -> Result<()> {
        if users.len() != uuids.len() || users.len() != passwords.len() {
            return Err(Error::Config(format!(
                "user list lengths differ: {} users, {} uuids, {} passwords",
                users.len(),
                uuids.len(),
                passwords.len()
            )));
        }
        let entries = uuids
            .into_iter()
            .zip(users)
            .zip(passwords)
            .map(|((uuid, user), password)| (uuid, user, password));
        self.inner.users.replace(entries);
        info!("Loaded {} users", self.inner.users.len());
        Ok(())
    }

    /// Spawns the accept loop. It runs until [`close`](Self::close), cancellation, or a
    /// listener failure.
    pub fn start<L>(&self, listener: L) -> Result<SocketAddr>
    where
        L: Listener,
    {
        let local = listener.local_addr()?;
        info!("Juicity service listening on {}", local);
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    _ = service.inner.shutdown.cancelled() => {
                        debug!("Listener closed");
                        break;
                    }
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok(conn) => {
                        service.handle_connection(conn);
                    }
                    Err(e) => {
                        if e.is_closed_or_canceled() {
                            debug!("Listener closed: {}", e);
                        } else {
                            error!("Listener closed: {}", e);
                        }
                        break;
                    }
                }
            }
            listener.close();
        });
        Ok(local)
    }

    /// Stops accepting connections.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Starts a session on an accepted connection.
    pub fn handle_connection<C: Connection>(&self, conn: C) -> Arc<ServerSession<C, U>> {
        let session = Arc::new(ServerSession {
            conn,
            service: Arc::clone(&self.inner),
            auth_done: CancellationToken::new(),
            conn_done: CancellationToken::new(),
            user: OnceLock::new(),
            error: Mutex::new(None),
        });
        debug!("New connection from {}", session.conn.remote_address());

        tokio::spawn(Arc::clone(&session).watch_cancel());
        tokio::spawn(Arc::clone(&session).loop_uni_streams());
        tokio::spawn(Arc::clone(&session).loop_streams());
        tokio::spawn(Arc::clone(&session).handle_auth_timeout());
        session
    }
}

/// State of one accepted connection.
pub struct ServerSession<C, U> {
    conn: C,
    service: Arc<ServiceInner<U>>,
    auth_done: CancellationToken,
    conn_done: CancellationToken,
    user: OnceLock<U>,
    error: Mutex<Option<Arc<Error>>>,
}

impl<C, U> ServerSession<C, U>
where
    C: Connection,
    U: Clone + fmt::Debug + Send + Sync + 'static,
{
    /// The authenticated user, once there is one.
    pub fn user(&self) -> Option<&U> {
        self.user.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_done.is_cancelled()
    }

    /// The error the session was closed with.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.conn_done.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.conn_done.cancelled().await
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Closes the session. Only the first call has any effect.
    pub fn close_with_error(&self, err: Error) {
        let mut recorded = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if self.conn_done.is_cancelled() {
            return;
        }
        if err.is_closed_or_canceled() {
            debug!("Connection from {} failed: {}", self.conn.remote_address(), err);
        } else {
            error!("Connection from {} failed: {}", self.conn.remote_address(), err);
        }
        *recorded = Some(Arc::new(err));
        self.conn_done.cancel();
        self.conn.close(0, b"");
    }

    async fn watch_cancel(self: Arc<Self>) {
        tokio::select! {
            _ = self.service.cancel.cancelled() => self.close_with_error(Error::Canceled),
            _ = self.conn_done.cancelled() => {}
        }
    }

    async fn handle_auth_timeout(self: Arc<Self>) {
        tokio::select! {
            _ = self.conn_done.cancelled() => {}
            _ = self.auth_done.cancelled() => {}
            _ = tokio::time::sleep(self.service.auth_timeout) => self.close_with_error(Error::AuthTimeout),
        }
    }

    async fn loop_uni_streams(self: Arc<Self>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.conn_done.cancelled() => return,
                accepted = self.conn.accept_uni() => accepted,
            };
            match accepted {
                Ok(stream) => {
                    let session = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = session.handle_uni_stream(stream).await {
                            session.close_with_error(e);
                        }
                    });
                }
                Err(e) => {
                    self.close_with_error(e);
                    return;
                }
            }
        }
    }

    async fn handle_uni_stream(&self, mut stream: C::RecvHalf) -> Result<()> {
        let result = self.read_authentication(&mut stream).await;
        stream.stop(0);
        result
    }

    async fn read_authentication(&self, stream: &mut C::RecvHalf) -> Result<()> {
        let version = stream.read_u8().await?;
        if version != VERSION {
            return Err(Error::UnknownVersion(version));
        }
        let command = stream.read_u8().await?;
        if command != COMMAND_AUTHENTICATE {
            return Err(Error::UnknownCommand(command));
        }
        if self.auth_done.is_cancelled() {
            return Err(Error::DuplicateAuthentication);
        }

        let mut body = [0u8; AUTHENTICATE_LEN - 2];
        stream.read_exact(&mut body).await?;
        let request = Authenticate::decode_body(&body);

        let entry = self
            .service
            .users
            .lookup(&request.uuid)
            .ok_or(Error::UnknownUser(request.uuid))?;
        let expected = derive_token(&self.conn, &request.uuid, &entry.password)?;
        verify_token(&expected, &request.token)?;

        if self.user.set(entry.user).is_err() {
            return Err(Error::DuplicateAuthentication);
        }
        info!(
            "Connection from {} authenticated as {:?}",
            self.conn.remote_address(),
            self.user.get()
        );
        self.auth_done.cancel();
        Ok(())
    }

    async fn loop_streams(self: Arc<Self>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.conn_done.cancelled() => return,
                accepted = self.conn.accept_bi() => accepted,
            };
            match accepted {
                Ok((send, recv)) => {
                    tokio::spawn(Arc::clone(&self).handle_stream(send, recv));
                }
                Err(e) => {
                    self.close_with_error(e);
                    return;
                }
            }
        }
    }

    async fn handle_stream(self: Arc<Self>, send: C::SendHalf, recv: C::RecvHalf) {
        let mut send: Box<dyn SendStream> = Box::new(send);
        let mut recv: Box<dyn RecvStream> = Box::new(recv);

        let (network, destination, leftover) = match self.read_request(&mut recv).await {
            Ok(request) => request,
            Err(e) => {
                recv.stop(0);
                let _ = send.shutdown().await;
                if e.is_closed_or_canceled() {
                    debug!("handle stream request: {}", e);
                } else {
                    error!("handle stream request: {}", e);
                }
                return;
            }
        };
        let Some(user) = self.user.get().cloned() else {
            return;
        };

        let source = self.conn.remote_address();
        debug!("{} request from {:?} ({}) to {}", network, user, source, destination);
        let stream = ServerStream::new(send, PrefixedStream::new(recv, leftover), destination.clone());
        let handler = &self.service.handler;
        let result = match network {
            Network::Tcp => handler.new_connection(user, source, destination, stream).await,
            Network::Udp => {
                handler
                    .new_packet_connection(user, source, destination, PacketStream::new(stream))
                    .await
            }
        };
        if let Err(e) = result {
            debug!("{} stream from {} ended: {:#}", network, source, e);
        }
    }

    /// Parses the request header and waits for authentication.
    ///
    /// Returns the bytes read past the header along with it.
    async fn read_request(&self, recv: &mut Box<dyn RecvStream>) -> Result<(Network, Address, BytesMut)> {
        let mut buf = BytesMut::with_capacity(1 + MAX_ADDRESS_LEN);
        if recv.read_buf(&mut buf).await? == 0 {
            return Err(Error::Framing("empty request"));
        }
        let network = Network::from_u8(buf.get_u8())?;

        let mut reader = PrefixedStream::new(&mut *recv, buf);
        let destination = Address::read(&mut reader).await?;
        let (_, leftover) = reader.into_parts();

        tokio::select! {
            biased;
            _ = self.conn_done.cancelled() => {
                return Err(match self.error() {
                    Some(recorded) => Error::Closed(recorded),
                    None => Error::Canceled,
                });
            }
            _ = self.auth_done.cancelled() => {}
        }
        Ok((network, destination, leftover))
    }
}
