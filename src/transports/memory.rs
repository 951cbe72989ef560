//! In-process transport
//!
//! Connection pairs wired together with [`tokio::io::duplex`] pipes. Keying material is
//! HKDF-SHA256 over a random secret shared by both ends of a pair, so client and server
//! derive the same bytes just like after a real TLS handshake.
//!
//! Used by the test suite and handy for embedding both sides in one process.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use log::trace;
use ring::hkdf;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::congestion::CongestionControl;
use crate::error::{Error, Result};
use crate::transport::{Connection, Dialer, Listener, RecvStream};

/// Per-direction pipe capacity of one stream.
const STREAM_BUFFER: usize = 256 * 1024;

struct PairState {
    secret: [u8; 32],
    closed: CancellationToken,
    close_calls: AtomicUsize,
    close_code: Mutex<Option<u32>>,
}

fn connection_lost() -> Error {
    Error::ConnectionLost("memory connection closed".into())
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "memory connection closed")
}

pub struct MemorySendStream {
    inner: WriteHalf<DuplexStream>,
    token: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl MemorySendStream {
    fn new(inner: WriteHalf<DuplexStream>, token: &CancellationToken) -> Self {
        Self {
            inner,
            token: token.clone(),
            closed: Box::pin(token.clone().cancelled_owned()),
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.closed.as_mut().poll(cx).is_ready()
    }
}

impl AsyncWrite for MemorySendStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(aborted()));
        }
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Pending if self.poll_closed(cx) => Poll::Ready(Err(aborted())),
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub struct MemoryRecvStream {
    inner: ReadHalf<DuplexStream>,
    token: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    stopped: Option<u32>,
}

impl MemoryRecvStream {
    fn new(inner: ReadHalf<DuplexStream>, token: &CancellationToken) -> Self {
        Self {
            inner,
            token: token.clone(),
            closed: Box::pin(token.clone().cancelled_owned()),
            stopped: None,
        }
    }

    /// Error code passed to [`RecvStream::stop`], if the stream was stopped.
    pub fn stopped(&self) -> Option<u32> {
        self.stopped
    }
}

impl AsyncRead for MemoryRecvStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.stopped.is_some() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "stream stopped")));
        }
        if self.token.is_cancelled() {
            return Poll::Ready(Err(aborted()));
        }
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Pending if self.closed.as_mut().poll(cx).is_ready() => Poll::Ready(Err(aborted())),
            other => other,
        }
    }
}

impl RecvStream for MemoryRecvStream {
    fn stop(&mut self, code: u32) {
        self.stopped.get_or_insert(code);
    }
}

type BiStream = (MemorySendStream, MemoryRecvStream);

/// One end of an in-process connection.
pub struct MemoryConnection {
    state: Arc<PairState>,
    remote: SocketAddr,
    peer_bi: mpsc::UnboundedSender<BiStream>,
    peer_uni: mpsc::UnboundedSender<MemoryRecvStream>,
    incoming_bi: tokio::sync::Mutex<mpsc::UnboundedReceiver<BiStream>>,
    incoming_uni: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryRecvStream>>,
}

/// Creates both ends of a connection. The first element is the client end.
pub fn connection_pair(client_addr: SocketAddr, server_addr: SocketAddr) -> (MemoryConnection, MemoryConnection) {
    let state = Arc::new(PairState {
        secret: rand::random(),
        closed: CancellationToken::new(),
        close_calls: AtomicUsize::new(0),
        close_code: Mutex::new(None),
    });
    let (client_bi_tx, client_bi_rx) = mpsc::unbounded_channel();
    let (client_uni_tx, client_uni_rx) = mpsc::unbounded_channel();
    let (server_bi_tx, server_bi_rx) = mpsc::unbounded_channel();
    let (server_uni_tx, server_uni_rx) = mpsc::unbounded_channel();

    let client = MemoryConnection {
        state: Arc::clone(&state),
        remote: server_addr,
        peer_bi: server_bi_tx,
        peer_uni: server_uni_tx,
        incoming_bi: tokio::sync::Mutex::new(client_bi_rx),
        incoming_uni: tokio::sync::Mutex::new(client_uni_rx),
    };
    let server = MemoryConnection {
        state,
        remote: client_addr,
        peer_bi: client_bi_tx,
        peer_uni: client_uni_tx,
        incoming_bi: tokio::sync::Mutex::new(server_bi_rx),
        incoming_uni: tokio::sync::Mutex::new(server_uni_rx),
    };
    (client, server)
}

impl MemoryConnection {
    /// How many times `close` has been called on either end.
    pub fn close_count(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Error code of the first close.
    pub fn close_code(&self) -> Option<u32> {
        *self.state.close_code.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves once either end closed the connection.
    pub async fn closed(&self) {
        self.state.closed.cancelled().await
    }

    fn check_open(&self) -> Result<()> {
        if self.state.closed.is_cancelled() {
            Err(connection_lost())
        } else {
            Ok(())
        }
    }
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type SendHalf = MemorySendStream;
    type RecvHalf = MemoryRecvStream;

    async fn open_uni(&self) -> Result<MemorySendStream> {
        self.check_open()?;
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        let (_, local_write) = tokio::io::split(local);
        let (remote_read, _) = tokio::io::split(remote);
        let token = &self.state.closed;
        self.peer_uni
            .send(MemoryRecvStream::new(remote_read, token))
            .map_err(|_| connection_lost())?;
        Ok(MemorySendStream::new(local_write, token))
    }

    async fn open_bi(&self) -> Result<BiStream> {
        self.check_open()?;
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);
        let token = &self.state.closed;
        self.peer_bi
            .send((
                MemorySendStream::new(remote_write, token),
                MemoryRecvStream::new(remote_read, token),
            ))
            .map_err(|_| connection_lost())?;
        Ok((
            MemorySendStream::new(local_write, token),
            MemoryRecvStream::new(local_read, token),
        ))
    }

    async fn accept_uni(&self) -> Result<MemoryRecvStream> {
        let mut incoming = self.incoming_uni.lock().await;
        tokio::select! {
            biased;
            _ = self.state.closed.cancelled() => Err(connection_lost()),
            stream = incoming.recv() => stream.ok_or_else(connection_lost),
        }
    }

    async fn accept_bi(&self) -> Result<BiStream> {
        let mut incoming = self.incoming_bi.lock().await;
        tokio::select! {
            biased;
            _ = self.state.closed.cancelled() => Err(connection_lost()),
            stream = incoming.recv() => stream.ok_or_else(connection_lost),
        }
    }

    fn export_keying_material(&self, output: &mut [u8], label: &[u8], context: &[u8]) -> Result<()> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, label).extract(&self.state.secret);
        let info = [context];
        let okm = prk
            .expand(&info, OkmLen(output.len()))
            .map_err(|_| Error::KeyingMaterial)?;
        okm.fill(output).map_err(|_| Error::KeyingMaterial)
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    fn close(&self, code: u32, reason: &[u8]) {
        let calls = self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        trace!("memory connection close #{} code={} reason={:?}", calls + 1, code, reason);
        self.state
            .close_code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert(code);
        self.state.closed.cancel();
    }
}

/// Client end of an in-process endpoint.
pub struct MemoryDialer {
    server_addr: SocketAddr,
    incoming: mpsc::UnboundedSender<MemoryConnection>,
    listener_closed: CancellationToken,
    dials: AtomicUsize,
    congestion: Mutex<Vec<CongestionControl>>,
}

impl MemoryDialer {
    /// Number of connections dialed so far.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Congestion policy installed on every dialed connection, in dial order.
    pub fn congestion_history(&self) -> Vec<CongestionControl> {
        self.congestion.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Connection = MemoryConnection;

    async fn dial(&self, congestion: CongestionControl) -> Result<MemoryConnection> {
        if self.listener_closed.is_cancelled() {
            return Err(Error::Transport("connection refused".into()));
        }
        let n = self.dials.fetch_add(1, Ordering::SeqCst);
        let client_addr = SocketAddr::from(([127, 0, 0, 1], 40000u16.wrapping_add(n as u16)));
        let (client, server) = connection_pair(client_addr, self.server_addr);
        self.congestion
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(congestion);
        self.incoming
            .send(server)
            .map_err(|_| Error::Transport("connection refused".into()))?;
        Ok(client)
    }
}

/// Server end of an in-process endpoint.
pub struct MemoryListener {
    local: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for MemoryListener {
    type Connection = MemoryConnection;

    async fn accept(&self) -> Result<MemoryConnection> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Canceled),
            conn = incoming.recv() => conn.ok_or(Error::Canceled),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Creates a dialer and the listener it connects to.
pub fn endpoint(server_addr: SocketAddr) -> (MemoryDialer, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let dialer = MemoryDialer {
        server_addr,
        incoming: tx,
        listener_closed: closed.clone(),
        dials: AtomicUsize::new(0),
        congestion: Mutex::new(Vec::new()),
    };
    let listener = MemoryListener {
        local: server_addr,
        incoming: tokio::sync::Mutex::new(rx),
        closed,
    };
    (dialer, listener)
}
