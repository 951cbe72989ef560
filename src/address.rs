//! Destination address codec
//!
//! ```text
//! +------+----------------------+------+
//! | ATYP |       DST.ADDR       | PORT |
//! +------+----------------------+------+
//! |  1   | 4 / 16 / 1 + domain  |  2   |
//! +------+----------------------+------+
//! ```
//!
//! The family tags are the SOCKS5 ones (0x01 IPv4, 0x03 domain, 0x04 IPv6). The protocol
//! document lists 0x02 for IPv6, which no deployed peer uses.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const FAMILY_IPV4: u8 = 0x01;
pub const FAMILY_DOMAIN: u8 = 0x03;
pub const FAMILY_IPV6: u8 = 0x04;

/// Longest domain name the one-byte length prefix can carry.
pub const MAX_DOMAIN_LEN: usize = u8::MAX as usize;

/// Upper bound of an encoded address: tag, length byte, domain, port.
pub const MAX_ADDRESS_LEN: usize = 1 + 1 + MAX_DOMAIN_LEN + 2;

/// Proxy destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Self::Socket(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(..))
    }

    /// Exact number of bytes [`Address::encode`] produces.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
            Self::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
            Self::Domain(name, _) => 1 + 1 + name.len() + 2,
        }
    }

    /// Serializes the address into `buf`.
    ///
    /// Fails only for domain names longer than 255 bytes; nothing is written in that case.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Self::Socket(SocketAddr::V4(addr)) => {
                buf.put_u8(FAMILY_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::Socket(SocketAddr::V6(addr)) => {
                buf.put_u8(FAMILY_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::Domain(name, port) => {
                if name.len() > MAX_DOMAIN_LEN {
                    return Err(Error::DomainTooLong {
                        len: name.len(),
                        max: MAX_DOMAIN_LEN,
                    });
                }
                buf.put_u8(FAMILY_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Reads one address from a stream with the default domain bound.
    pub async fn read<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        Self::read_bounded(reader, MAX_DOMAIN_LEN).await
    }

    /// Reads one address, rejecting domain names longer than `max_domain_len` before
    /// reading them.
    pub async fn read_bounded<R>(reader: &mut R, max_domain_len: usize) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let family = reader.read_u8().await?;
        match family {
            FAMILY_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await.map_err(truncated)?;
                let port = reader.read_u16().await.map_err(truncated)?;
                Ok(Self::Socket(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(octets),
                    port,
                ))))
            }
            FAMILY_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await.map_err(truncated)?;
                let port = reader.read_u16().await.map_err(truncated)?;
                Ok(Self::Socket(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                ))))
            }
            FAMILY_DOMAIN => {
                let max = max_domain_len.min(MAX_DOMAIN_LEN);
                let len = reader.read_u8().await.map_err(truncated)? as usize;
                if len > max {
                    return Err(Error::DomainTooLong { len, max });
                }
                let mut name = [0u8; MAX_DOMAIN_LEN];
                reader.read_exact(&mut name[..len]).await.map_err(truncated)?;
                let port = reader.read_u16().await.map_err(truncated)?;
                Ok(Self::Domain(domain_from_bytes(&name[..len])?, port))
            }
            other => Err(Error::UnknownAddressFamily(other)),
        }
    }

    /// Decodes one address from an in-memory buffer, advancing it past the address.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(Error::Framing("missing address family"));
        }
        match buf.get_u8() {
            FAMILY_IPV4 => {
                if buf.remaining() < 4 + 2 {
                    return Err(Error::Framing("truncated IPv4 address"));
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16();
                Ok(Self::Socket(SocketAddr::from((octets, port))))
            }
            FAMILY_IPV6 => {
                if buf.remaining() < 16 + 2 {
                    return Err(Error::Framing("truncated IPv6 address"));
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16();
                Ok(Self::Socket(SocketAddr::from((octets, port))))
            }
            FAMILY_DOMAIN => {
                if !buf.has_remaining() {
                    return Err(Error::Framing("missing domain length"));
                }
                let len = buf.get_u8() as usize;
                if buf.remaining() < len + 2 {
                    return Err(Error::Framing("truncated domain name"));
                }
                let mut name = [0u8; MAX_DOMAIN_LEN];
                buf.copy_to_slice(&mut name[..len]);
                let port = buf.get_u16();
                Ok(Self::Domain(domain_from_bytes(&name[..len])?, port))
            }
            other => Err(Error::UnknownAddressFamily(other)),
        }
    }
}

/// EOF inside an address is malformed input, not an ordinary close.
fn truncated(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::Framing("truncated address")
    } else {
        Error::Io(err)
    }
}

fn domain_from_bytes(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| Error::Framing("domain name is not valid UTF-8"))
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{}", addr),
            Self::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

impl std::str::FromStr for Address {
    type Err = Error;

    /// Parses `ip:port`, `[ipv6]:port` or `domain:port`.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Socket(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("address {} has no port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port in {}", s)))?;
        if host.is_empty() || host.len() > MAX_DOMAIN_LEN {
            return Err(Error::Config(format!("invalid host in {}", s)));
        }
        Ok(Self::Domain(host.to_string(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    async fn round_trip(addr: &Address) -> Address {
        let mut buf = BytesMut::with_capacity(addr.encoded_len());
        addr.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), addr.encoded_len());
        let mut reader = &buf[..];
        let decoded = Address::read(&mut reader).await.unwrap();
        assert!(reader.is_empty());
        decoded
    }

    #[tokio::test]
    async fn test_round_trip_boundaries() {
        let cases = [
            Address::Socket("1.2.3.4:0".parse().unwrap()),
            Address::Socket("255.255.255.255:65535".parse().unwrap()),
            Address::Socket("[2001:db8::1]:443".parse().unwrap()),
            Address::Domain("a".into(), 65535),
            Address::Domain("x".repeat(MAX_DOMAIN_LEN), 0),
        ];
        for addr in &cases {
            assert_eq!(&round_trip(addr).await, addr);
        }
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = BytesMut::new();
        Address::Socket("10.0.0.1:80".parse().unwrap()).encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x01, 10, 0, 0, 1, 0, 80]);

        let mut buf = BytesMut::new();
        Address::Socket("[::1]:53".parse().unwrap()).encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x04);
        assert_eq!(buf.len(), 19);
        assert_eq!(&buf[17..], &[0, 53]);

        let mut buf = BytesMut::new();
        Address::Domain("example.com".into(), 443).encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x03);
        assert_eq!(buf[1], 11);
        assert_eq!(&buf[2..13], b"example.com");
        assert_eq!(&buf[13..], &[0x01, 0xbb]);
    }

    #[test]
    fn test_encode_rejects_long_domain() {
        let mut buf = BytesMut::new();
        let addr = Address::Domain("x".repeat(MAX_DOMAIN_LEN + 1), 80);
        assert!(matches!(
            addr.encode(&mut buf),
            Err(Error::DomainTooLong { len: 256, .. })
        ));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_bounded_read_rejects_before_reading_name() {
        let wire = [FAMILY_DOMAIN, 200, b'a', b'b'];
        let mut reader = &wire[..];
        let err = Address::read_bounded(&mut reader, 64).await.unwrap_err();
        assert!(matches!(err, Error::DomainTooLong { len: 200, max: 64 }));
        // The name bytes were never consumed.
        assert_eq!(reader, &[b'a', b'b']);
    }

    #[tokio::test]
    async fn test_bound_clamped_to_wire_maximum() {
        // A caller bound above 255 still accepts every length the wire can carry.
        let mut wire = vec![FAMILY_DOMAIN, 255];
        wire.extend_from_slice(&[b'a'; 255]);
        wire.extend_from_slice(&[0x00, 0x35]);
        let mut reader = &wire[..];
        let addr = Address::read_bounded(&mut reader, 1024).await.unwrap();
        assert_eq!(addr, Address::Domain("a".repeat(255), 53));

        let wire = [FAMILY_DOMAIN, 65];
        let mut reader = &wire[..];
        let err = Address::read_bounded(&mut reader, 64).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit 64"));
    }

    #[tokio::test]
    async fn test_truncated_address_is_framing_error() {
        for wire in [
            &[FAMILY_DOMAIN, 10, b'a', b'b', b'c'][..],
            &[FAMILY_DOMAIN][..],
            &[FAMILY_IPV4, 127, 0][..],
            &[FAMILY_IPV6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0][..],
        ] {
            let mut reader = wire;
            let err = Address::read(&mut reader).await.unwrap_err();
            assert!(matches!(err, Error::Framing(_)), "{:?}", wire);
            assert!(!err.is_closed_or_canceled());
        }

        // Nothing at all is still an ordinary end of stream.
        let mut empty: &[u8] = &[];
        let err = Address::read(&mut empty).await.unwrap_err();
        assert!(err.is_closed_or_canceled());
    }

    #[tokio::test]
    async fn test_unknown_family() {
        // 0x02 is what the written protocol document claims for IPv6.
        let wire = [0x02, 0, 0, 0, 0];
        let mut reader = &wire[..];
        assert!(matches!(
            Address::read(&mut reader).await,
            Err(Error::UnknownAddressFamily(0x02))
        ));
    }

    #[test]
    fn test_decode_from_buf() {
        let mut buf = BytesMut::new();
        let addr = Address::Domain("dns.google".into(), 53);
        addr.encode(&mut buf).unwrap();
        buf.put_slice(b"payload");

        let mut cursor = &buf[..];
        assert_eq!(Address::decode(&mut cursor).unwrap(), addr);
        assert_eq!(cursor, b"payload");

        let mut short = &buf[..5];
        assert!(matches!(Address::decode(&mut short), Err(Error::Framing(_))));
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "1.1.1.1:53".parse::<Address>().unwrap(),
            Address::Socket("1.1.1.1:53".parse().unwrap())
        );
        assert_eq!(
            "example.com:443".parse::<Address>().unwrap(),
            Address::Domain("example.com".into(), 443)
        );
        assert!("example.com".parse::<Address>().is_err());
        assert_eq!(Address::Domain("example.com".into(), 8080).to_string(), "example.com:8080");
    }
}
