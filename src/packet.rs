//! UDP packet framing over a byte stream
//!
//! ```text
//! +---------+--------+---------+
//! | ADDRESS | LENGTH | PAYLOAD |
//! +---------+--------+---------+
//! |   var   |   2    |   var   |
//! +---------+--------+---------+
//! ```
//!
//! Repeated for every packet of a UDP session. The header of the data stream itself
//! (network kind plus session destination) is sent once before the first frame.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::address::Address;
use crate::error::{Error, Result};

/// Largest payload one frame can carry.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Datagram view of a data stream.
///
/// Reads need `S: AsyncRead`, writes need `S: AsyncWrite`; a [`split`](Self::split)
/// stream keeps only the half it needs.
#[derive(Debug)]
pub struct PacketStream<S> {
    inner: S,
}

impl<S> PacketStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + AsyncWrite> PacketStream<S> {
    /// Splits into independent reading and writing halves.
    pub fn split(self) -> (PacketStream<ReadHalf<S>>, PacketStream<WriteHalf<S>>) {
        let (r, w) = tokio::io::split(self.inner);
        (PacketStream::new(r), PacketStream::new(w))
    }
}

impl<S: AsyncRead + Unpin> PacketStream<S> {
    async fn read_header(&mut self) -> Result<(Address, usize)> {
        let addr = Address::read(&mut self.inner).await?;
        let len = self.inner.read_u16().await? as usize;
        Ok((addr, len))
    }

    /// Reads one packet into `buf`, replacing its contents.
    pub async fn read_packet(&mut self, buf: &mut BytesMut) -> Result<Address> {
        let (addr, len) = self.read_header().await?;
        buf.clear();
        buf.resize(len, 0);
        self.inner.read_exact(&mut buf[..]).await?;
        Ok(addr)
    }

    /// Reads one packet into `buf`.
    ///
    /// A packet longer than `buf` is consumed and dropped, and reported as
    /// [`Error::ShortBuffer`]; the stream stays usable.
    pub async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let (addr, len) = self.read_header().await?;
        if len > buf.len() {
            let skipped = tokio::io::copy(&mut (&mut self.inner).take(len as u64), &mut tokio::io::sink()).await?;
            if (skipped as usize) < len {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            return Err(Error::ShortBuffer {
                needed: len,
                available: buf.len(),
            });
        }
        self.inner.read_exact(&mut buf[..len]).await?;
        Ok((len, addr))
    }
}

impl<S: AsyncWrite + Unpin> PacketStream<S> {
    /// Writes one packet addressed to `destination` as a single frame.
    pub async fn write_packet(&mut self, payload: &[u8], destination: &Address) -> Result<()> {
        if payload.len() > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(payload.len()));
        }
        let mut frame = BytesMut::with_capacity(destination.encoded_len() + 2 + payload.len());
        destination.encode(&mut frame)?;
        frame.put_u16(payload.len() as u16);
        frame.put_slice(payload);
        self.inner.write_all(&frame).await?;
        Ok(())
    }

    /// Same as [`write_packet`](Self::write_packet), returning the payload length.
    pub async fn send_to(&mut self, payload: &[u8], destination: &Address) -> Result<usize> {
        self.write_packet(payload, destination).await?;
        Ok(payload.len())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
