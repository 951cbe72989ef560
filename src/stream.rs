//! Data stream adapters
//!
//! [`ClientStream`] writes the request header lazily, merged into the first payload
//! write. [`ServerStream`] is what the traffic handler sees once the header has been
//! parsed; bytes read past the header are replayed through a [`PrefixedStream`].

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::address::Address;
use crate::client::ClientConnection;
use crate::error::Error;
use crate::protocol::Network;
use crate::transport::{Connection, RecvStream, SendStream};

/// Reader that yields already-buffered bytes before reading from the inner stream.
pub struct PrefixedStream<R> {
    stream: R,
    prefix: Option<BytesMut>,
}

impl<R> PrefixedStream<R> {
    pub fn new(stream: R, prefix: BytesMut) -> Self {
        Self {
            stream,
            prefix: if prefix.is_empty() { None } else { Some(prefix) },
        }
    }

    /// Bytes still waiting to be replayed.
    pub fn buffered(&self) -> &[u8] {
        self.prefix.as_deref().unwrap_or_default()
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.stream
    }

    /// Returns the inner stream and whatever prefix has not been read yet.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.stream, self.prefix.unwrap_or_default())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedStream<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if let Some(prefix) = &mut self.prefix {
            let to_copy = std::cmp::min(buf.remaining(), prefix.len());
            buf.put_slice(&prefix[..to_copy]);
            prefix.advance(to_copy);

            if prefix.is_empty() {
                self.prefix = None;
            }

            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<R: RecvStream> RecvStream for PrefixedStream<R> {
    fn stop(&mut self, code: u32) {
        self.prefix = None;
        self.stream.stop(code);
    }
}

enum RequestState {
    Pending,
    Writing { request: BytesMut, payload_len: usize },
    Written,
}

/// Client side of one proxied TCP connection or UDP session.
///
/// Nothing is sent until the first write, which carries
/// `network | address | payload` in one piece. One writer at a time.
pub struct ClientStream<C: Connection> {
    send: C::SendHalf,
    recv: C::RecvHalf,
    parent: Arc<ClientConnection<C>>,
    destination: Address,
    network: Network,
    state: RequestState,
}

impl<C: Connection> ClientStream<C> {
    pub(crate) fn new(
        send: C::SendHalf,
        recv: C::RecvHalf,
        parent: Arc<ClientConnection<C>>,
        destination: Address,
        network: Network,
    ) -> Self {
        Self {
            send,
            recv,
            parent,
            destination,
            network,
            state: RequestState::Pending,
        }
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Whether the request header has been fully written.
    pub fn request_written(&self) -> bool {
        matches!(self.state, RequestState::Written)
    }

    /// Sends the request header with no payload if it has not been sent yet.
    ///
    /// For protocols where the remote side speaks first.
    pub async fn send_request(&mut self) -> io::Result<()> {
        if !self.request_written() {
            poll_fn(|cx| self.poll_write_request(cx, &[])).await?;
        }
        self.send.flush().await.map_err(|e| self.wrap_error(e))
    }

    /// Stops reading and finishes the sending side.
    pub async fn close(&mut self) -> io::Result<()> {
        self.recv.stop(0);
        self.send.shutdown().await
    }

    fn wrap_error(&self, err: io::Error) -> io::Error {
        match self.parent.error() {
            Some(recorded) => Error::Closed(recorded).into(),
            None => err,
        }
    }

    fn poll_write_request(&mut self, cx: &mut Context<'_>, payload: &[u8]) -> Poll<io::Result<usize>> {
        if let RequestState::Pending = self.state {
            let mut request = BytesMut::with_capacity(1 + self.destination.encoded_len() + payload.len());
            request.put_u8(self.network.into_u8());
            if let Err(e) = self.destination.encode(&mut request) {
                return Poll::Ready(Err(e.into()));
            }
            request.put_slice(payload);
            self.state = RequestState::Writing {
                request,
                payload_len: payload.len(),
            };
        }

        loop {
            let RequestState::Writing { request, payload_len } = &mut self.state else {
                return Poll::Ready(Ok(0));
            };
            if request.is_empty() {
                let n = *payload_len;
                self.state = RequestState::Written;
                return Poll::Ready(Ok(n));
            }
            match Pin::new(&mut self.send).poll_write(cx, &request[..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => request.advance(n),
                Poll::Ready(Err(e)) => {
                    self.parent.close_with_error(Error::Io(io::Error::new(
                        e.kind(),
                        format!("write request: {}", e),
                    )));
                    return Poll::Ready(Err(self.wrap_error(e)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<C: Connection> AsyncRead for ClientStream<C> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.recv).poll_read(cx, buf) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.wrap_error(e))),
            other => other,
        }
    }
}

impl<C: Connection> AsyncWrite for ClientStream<C> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.request_written() {
            return this.poll_write_request(cx, buf);
        }
        match Pin::new(&mut this.send).poll_write(cx, buf) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.wrap_error(e))),
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let RequestState::Writing { .. } = this.state {
            ready!(this.poll_write_request(cx, &[]))?;
        }
        Pin::new(&mut this.send).poll_flush(cx)
    }

    /// Finishes the sending side, writing the header first if nothing was written yet.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.request_written() {
            ready!(this.poll_write_request(cx, &[]))?;
        }
        Pin::new(&mut this.send).poll_shutdown(cx)
    }
}

/// Server side of one accepted data stream, positioned right after the request header.
pub struct ServerStream {
    send: Box<dyn SendStream>,
    recv: PrefixedStream<Box<dyn RecvStream>>,
    destination: Address,
}

impl ServerStream {
    pub fn new(send: Box<dyn SendStream>, recv: PrefixedStream<Box<dyn RecvStream>>, destination: Address) -> Self {
        Self {
            send,
            recv,
            destination,
        }
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// Stops reading and finishes the sending side.
    pub async fn close(&mut self) -> io::Result<()> {
        self.recv.stop(0);
        self.send.shutdown().await
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}
