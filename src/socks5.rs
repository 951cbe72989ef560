//! SOCKS5 inbound of the client (RFC 1928)
//!
//! No authentication, CONNECT and UDP ASSOCIATE. Every accepted request is forwarded
//! through the [`Client`].

use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::client::Client;
use crate::socks_udp::UdpSocksServer;
use crate::transport::Dialer;

/// SOCKS5 protocol constants
const SOCKS5_VERSION: u8 = 0x05;

/// How long to wait for the first bytes from the local client before sending the
/// request header on its own.
const FIRST_PAYLOAD_WAIT: Duration = Duration::from_millis(50);

/// Authentication methods
#[derive(Debug, Clone, Copy)]
pub enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

fn unspecified() -> Address {
    Address::Socket(SocketAddr::from(([0, 0, 0, 0], 0)))
}

/// Perform SOCKS5 handshake and return the requested command and target
pub async fn socks5_handshake<S>(stream: &mut S) -> Result<(Command, Address), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let nmethods = buf[1];
    log::trace!("[SOCKS5] Client greeting: version={}, nmethods={}", version, nmethods);

    if version != SOCKS5_VERSION {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Unsupported SOCKS version: {}", version),
        ));
    }

    let mut methods = [0u8; 255];
    let methods = &mut methods[..nmethods as usize];
    stream.read_exact(methods).await?;

    if !methods.contains(&(AuthMethod::NoAuth as u8)) {
        stream.write_all(&[SOCKS5_VERSION, AuthMethod::NoAcceptable as u8]).await?;
        return Err(Error::new(
            ErrorKind::PermissionDenied,
            "No supported authentication method",
        ));
    }
    stream.write_all(&[SOCKS5_VERSION, AuthMethod::NoAuth as u8]).await?;

    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut request = [0u8; 3];
    stream.read_exact(&mut request).await?;

    if request[0] != SOCKS5_VERSION {
        return Err(Error::new(ErrorKind::InvalidData, "Invalid SOCKS version"));
    }

    let command = match request[1] {
        0x01 => Command::Connect,
        0x02 => Command::Bind,
        0x03 => Command::UdpAssociate,
        cmd => {
            log::warn!("[SOCKS5] Unsupported command: {}", cmd);
            send_reply(stream, ReplyCode::CommandNotSupported, &unspecified()).await?;
            return Err(Error::new(ErrorKind::Unsupported, "Unsupported command"));
        }
    };

    // SOCKS5 addresses share the family tags of the tunnel address codec.
    let target = match Address::read(stream).await {
        Ok(target) => target,
        Err(crate::Error::UnknownAddressFamily(atyp)) => {
            send_reply(stream, ReplyCode::AddressTypeNotSupported, &unspecified()).await?;
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("Unsupported address type {}", atyp),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    log::debug!("[SOCKS5] Handshake complete: command={:?}, target={}", command, target);
    Ok((command, target))
}

/// Send SOCKS5 reply to client
pub async fn send_reply<S>(stream: &mut S, reply: ReplyCode, bind_addr: &Address) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    log::trace!("[SOCKS5] Sending reply: code={:?}, bind_addr={}", reply, bind_addr);

    let mut response = BytesMut::with_capacity(3 + bind_addr.encoded_len());
    response.extend_from_slice(&[SOCKS5_VERSION, reply as u8, 0x00]);
    bind_addr.encode(&mut response)?;
    stream.write_all(&response).await
}

/// Bidirectional copy between two streams
///
/// EOF in one direction shuts down the opposite writer; returns once both directions
/// are done or either fails.
pub async fn copy_bidirectional<C, T>(client: C, target: T) -> Result<(), Error>
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let uplink = async {
        let n = tokio::io::copy(&mut client_read, &mut target_write).await?;
        target_write.shutdown().await?;
        Ok::<_, Error>(n)
    };
    let downlink = async {
        let n = tokio::io::copy(&mut target_read, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<_, Error>(n)
    };

    match tokio::try_join!(uplink, downlink) {
        Ok((up, down)) => {
            log::debug!("Client -> Target: {} bytes, Target -> Client: {} bytes", up, down);
            Ok(())
        }
        Err(e) => {
            log::debug!("Relay error: {}", e);
            Err(e)
        }
    }
}

/// Local SOCKS5 server forwarding through a [`Client`]
pub struct Socks5Inbound<D: Dialer> {
    client: Arc<Client<D>>,
    cancel: CancellationToken,
}

impl<D: Dialer> Socks5Inbound<D> {
    pub fn new(client: Arc<Client<D>>, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }

    /// Accepts SOCKS5 connections until cancelled.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        log::info!("SOCKS5 inbound listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let client = Arc::clone(&self.client);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_socks5(stream, peer, client, cancel).await {
                    log::debug!("[SOCKS5] {} failed: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_socks5<D: Dialer>(
    mut stream: TcpStream,
    peer: SocketAddr,
    client: Arc<Client<D>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (command, target) = socks5_handshake(&mut stream).await?;
    match command {
        Command::Connect => {
            let mut remote = match client.dial_tcp(target.clone()).await {
                Ok(remote) => remote,
                Err(e) => {
                    send_reply(&mut stream, ReplyCode::GeneralFailure, &unspecified()).await?;
                    return Err(e.into());
                }
            };
            send_reply(&mut stream, ReplyCode::Succeeded, &unspecified()).await?;
            log::info!("[SOCKS5] {} -> {} (tcp)", peer, target);

            // Merge the first payload into the request header when the local side
            // speaks first; otherwise send the header alone.
            let mut first = [0u8; 4096];
            match tokio::time::timeout(FIRST_PAYLOAD_WAIT, stream.read(&mut first)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => remote.write_all(&first[..n]).await?,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => remote.send_request().await?,
            }
            copy_bidirectional(stream, remote).await?;
        }
        Command::UdpAssociate => {
            let bind = SocketAddr::new(stream.local_addr()?.ip(), 0);
            let relay = UdpSocksServer::new(bind, peer).await?;
            send_reply(&mut stream, ReplyCode::Succeeded, &Address::from(relay.local_addr()?)).await?;
            log::info!("[SOCKS5] {} UDP associate via {}", peer, relay.local_addr()?);

            // The association lives as long as the control connection.
            let mut control = [0u8; 64];
            tokio::select! {
                result = relay.run(client) => result?,
                _ = async { while matches!(stream.read(&mut control).await, Ok(n) if n > 0) {} } => {}
                _ = cancel.cancelled() => {}
            }
        }
        Command::Bind => {
            send_reply(&mut stream, ReplyCode::CommandNotSupported, &unspecified()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_connect_domain() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x01, 0x00, 0x03, 11])
            .read(b"example.com")
            .read(&[0x01, 0xbb])
            .build();
        let (command, target) = socks5_handshake(&mut mock).await.unwrap();
        assert_eq!(command, Command::Connect);
        assert_eq!(target, Address::Domain("example.com".into(), 443));
    }

    #[tokio::test]
    async fn test_handshake_rejects_auth_only_clients() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x02])
            .write(&[0x05, 0xff])
            .build();
        let err = socks5_handshake(&mut mock).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_copy_keeps_reading_after_half_close() {
        let (client, mut local) = tokio::io::duplex(1024);
        let (target, mut remote) = tokio::io::duplex(1024);
        let relay = tokio::spawn(copy_bidirectional(client, target));

        local.write_all(b"request").await.unwrap();
        local.shutdown().await.unwrap();
        let mut request = Vec::new();
        remote.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        remote.write_all(b"response").await.unwrap();
        remote.shutdown().await.unwrap();
        let mut response = Vec::new();
        local.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_requests_get_reply_codes() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x09, 0x00])
            .write(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .build();
        let err = socks5_handshake(&mut mock).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        let mut mock = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x01, 0x00])
            .read(&[0x02])
            .write(&[0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .build();
        let err = socks5_handshake(&mut mock).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_reply_layout() {
        let mut mock = tokio_test::io::Builder::new()
            .write(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38])
            .build();
        let bind = Address::Socket("127.0.0.1:1080".parse().unwrap());
        send_reply(&mut mock, ReplyCode::Succeeded, &bind).await.unwrap();
    }
}
