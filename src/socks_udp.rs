//! UDP SOCKS5 Implementation (RFC 1928 Section 7)
//!
//! Relays the datagrams of one UDP ASSOCIATE through a single tunnel UDP session.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

use crate::address::Address;
use crate::client::Client;
use crate::packet::{PacketStream, MAX_PACKET_SIZE};
use crate::transport::Dialer;

/// SOCKS5 UDP request/reply header
///
/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct UdpSocksHeader {
    /// Fragment number (0x00 = standalone, we don't support fragmentation)
    pub frag: u8,
    pub dst_addr: Address,
}

impl UdpSocksHeader {
    /// Parse SOCKS5 UDP header from packet, returning it with the payload offset
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(anyhow!("UDP SOCKS5 packet too short"));
        }
        if data[0] != 0 || data[1] != 0 {
            return Err(anyhow!("Invalid RSV field"));
        }
        let frag = data[2];

        let mut rest = &data[3..];
        let dst_addr = Address::decode(&mut rest)?;
        let offset = data.len() - rest.remaining();

        Ok((Self { frag, dst_addr }, offset))
    }

    /// Serialize SOCKS5 UDP header followed by `payload`
    pub fn serialize(&self, payload: &[u8]) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(3 + self.dst_addr.encoded_len() + payload.len());
        buf.put_u16(0); // RSV
        buf.put_u8(self.frag);
        self.dst_addr.encode(&mut buf)?;
        buf.put_slice(payload);
        Ok(buf)
    }
}

/// UDP SOCKS5 server
pub struct UdpSocksServer {
    /// UDP socket for SOCKS5 UDP ASSOCIATE
    socket: UdpSocket,
    /// Client address announced in the TCP handshake; only its IP is trusted
    client_addr: SocketAddr,
}

impl UdpSocksServer {
    pub async fn new(bind_addr: SocketAddr, client_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("UDP SOCKS5 server listening on {}", socket.local_addr()?);

        Ok(Self { socket, client_addr })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive datagram from client (removes SOCKS5 header)
    async fn recv_from_client(&self, buf: &mut [u8]) -> Result<(usize, usize, Address, SocketAddr)> {
        loop {
            let (n, src) = self.socket.recv_from(buf).await?;
            if src.ip() != self.client_addr.ip() {
                warn!("UDP packet from unexpected source: {}", src);
                continue;
            }
            let (header, offset) = match UdpSocksHeader::parse(&buf[..n]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("UDP SOCKS5: dropping packet from {}: {}", src, e);
                    continue;
                }
            };
            if header.frag != 0 {
                debug!("UDP SOCKS5: dropping fragment from {}", src);
                continue;
            }
            return Ok((offset, n, header.dst_addr, src));
        }
    }

    /// Relays datagrams through `client` until the socket or the tunnel fails.
    ///
    /// The tunnel session is opened on the first datagram, named after its destination.
    pub async fn run<D: Dialer>(&self, client: Arc<Client<D>>) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 512];
        let (offset, n, destination, local) = self.recv_from_client(&mut buf).await?;

        let session = client.listen_packet(destination.clone()).await?;
        let (mut reader, mut writer) = session.split();
        writer.write_packet(&buf[offset..n], &destination).await?;
        debug!("UDP SOCKS5: session for {} opened via {}", local, destination);

        tokio::select! {
            result = self.uplink(&mut buf, &mut writer) => result,
            result = self.downlink(&mut reader, local) => result,
        }
    }

    async fn uplink<W>(&self, buf: &mut [u8], writer: &mut PacketStream<W>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let (offset, n, destination, _) = self.recv_from_client(buf).await?;
            writer.write_packet(&buf[offset..n], &destination).await?;
        }
    }

    async fn downlink<R>(&self, reader: &mut PacketStream<R>, local: SocketAddr) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut packet = BytesMut::new();
        loop {
            let from = reader.read_packet(&mut packet).await?;
            let datagram = UdpSocksHeader { frag: 0, dst_addr: from }.serialize(&packet)?;
            self.socket.send_to(&datagram, local).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_socks_header_parse_ipv4() {
        let data = vec![
            0x00, 0x00, // RSV
            0x00, // FRAG
            0x01, // ATYP (IPv4)
            192, 168, 1, 1, // IP
            0x00, 0x50, // Port 80
            b'H', b'e', b'l', b'l', b'o', // Data
        ];

        let (header, offset) = UdpSocksHeader::parse(&data).unwrap();
        assert_eq!(header.frag, 0);
        assert_eq!(offset, 10);
        assert_eq!(header.dst_addr, Address::Socket("192.168.1.1:80".parse().unwrap()));
        assert_eq!(&data[offset..], b"Hello");
    }

    #[test]
    fn test_udp_socks_header_parse_domain() {
        let mut data = vec![0x00, 0x00, 0x00, 0x03, 7];
        data.extend_from_slice(b"dns.lan");
        data.extend_from_slice(&[0x00, 0x35, 0xaa]);

        let (header, offset) = UdpSocksHeader::parse(&data).unwrap();
        assert_eq!(header.dst_addr, Address::Domain("dns.lan".into(), 53));
        assert_eq!(&data[offset..], &[0xaa]);
    }

    #[test]
    fn test_udp_socks_header_serialize() {
        let header = UdpSocksHeader {
            frag: 0,
            dst_addr: Address::Socket("192.168.1.1:80".parse().unwrap()),
        };

        let serialized = header.serialize(b"hi").unwrap();
        assert_eq!(&serialized[..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(serialized.len(), 12);
        assert_eq!(&serialized[10..], b"hi");
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(UdpSocksHeader::parse(&[0x00, 0x00, 0x00, 0x01, 10, 0]).is_err());
        assert!(UdpSocksHeader::parse(&[0x00, 0x01, 0x00, 0x01]).is_err());
    }
}
