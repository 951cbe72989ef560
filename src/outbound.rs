//! Direct outbound of the server
//!
//! Connects every TCP request straight to its destination and relays UDP sessions
//! through one local socket each.

use std::collections::HashMap;
use std::fmt;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;

use crate::address::Address;
use crate::packet::{PacketStream, MAX_PACKET_SIZE};
use crate::server::ServiceHandler;
use crate::socks5::copy_bidirectional;
use crate::stream::ServerStream;

/// Idle time after which a UDP session is dropped when none is configured.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);

/// Connect to target, resolving domain names first
pub async fn connect_target(target: &Address) -> Result<TcpStream, Error> {
    match target {
        Address::Socket(addr) => TcpStream::connect(addr).await,
        Address::Domain(host, port) => {
            let mut last_err = Error::new(ErrorKind::NotFound, format!("No addresses found for {}", host));
            for addr in tokio::net::lookup_host((host.as_str(), *port)).await? {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        debug!("Connect to {} ({}) failed: {}", target, addr, e);
                        last_err = e;
                    }
                }
            }
            Err(last_err)
        }
    }
}

async fn resolve_udp(target: &Address, prefer_ipv4: bool) -> Result<SocketAddr, Error> {
    match target {
        Address::Socket(addr) => Ok(*addr),
        Address::Domain(host, port) => {
            let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), *port)).await?.collect();
            addrs
                .iter()
                .find(|a| a.is_ipv4() == prefer_ipv4)
                .or_else(|| addrs.first())
                .copied()
                .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("No addresses found for {}", host)))
        }
    }
}

/// Traffic handler that talks to destinations directly
#[derive(Debug, Clone)]
pub struct DirectHandler {
    udp_timeout: Duration,
}

impl DirectHandler {
    pub fn new(udp_timeout: Duration) -> Self {
        let udp_timeout = if udp_timeout.is_zero() {
            DEFAULT_UDP_TIMEOUT
        } else {
            udp_timeout
        };
        Self { udp_timeout }
    }

    /// Relays one UDP session until either side fails or it stays idle too long.
    pub async fn relay_packets<S>(&self, stream: PacketStream<S>) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let socket = match UdpSocket::bind(SocketAddr::from(([0u16; 8], 0))).await {
            Ok(socket) => socket,
            Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?,
        };
        let (mut reader, mut writer) = stream.split();
        let last_active = Mutex::new(Instant::now());

        tokio::select! {
            result = uplink(&socket, &mut reader, &last_active) => result,
            result = downlink(&socket, &mut writer, &last_active) => result,
            _ = idle(&last_active, self.udp_timeout) => {
                debug!("UDP session idle for {:?}, closing", self.udp_timeout);
                Ok(())
            }
        }
    }
}

fn touch(last_active: &Mutex<Instant>) {
    *last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
}

/// Resolved domain destinations of one UDP session.
///
/// Holds at most [`MAX_RESOLVED_DOMAINS`] entries; a full cache starts over.
struct ResolveCache {
    entries: HashMap<Address, SocketAddr>,
}

/// Distinct domain destinations remembered per UDP session.
const MAX_RESOLVED_DOMAINS: usize = 256;

impl ResolveCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    async fn resolve(&mut self, destination: &Address, prefer_ipv4: bool) -> Result<SocketAddr, Error> {
        if let Address::Socket(addr) = destination {
            return Ok(*addr);
        }
        if let Some(target) = self.entries.get(destination) {
            return Ok(*target);
        }
        let target = resolve_udp(destination, prefer_ipv4).await?;
        if self.entries.len() >= MAX_RESOLVED_DOMAINS {
            self.entries.clear();
        }
        self.entries.insert(destination.clone(), target);
        Ok(target)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Forwards session packets to their destinations. Only stream failures end it; a
/// packet that cannot be resolved or sent is dropped.
async fn uplink<R>(socket: &UdpSocket, reader: &mut PacketStream<R>, last_active: &Mutex<Instant>) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let dual_stack = socket.local_addr()?.is_ipv6();
    let mut resolved = ResolveCache::new();
    let mut packet = BytesMut::with_capacity(MAX_PACKET_SIZE);
    loop {
        let destination = reader.read_packet(&mut packet).await?;
        let target = match resolved.resolve(&destination, !dual_stack).await {
            Ok(target) => target,
            Err(e) => {
                debug!("UDP: dropping packet to {}: {}", destination, e);
                continue;
            }
        };
        let target = if dual_stack { to_mapped(target) } else { target };
        if let Err(e) = socket.send_to(&packet, target).await {
            debug!("UDP: dropping packet to {}: {}", destination, e);
            continue;
        }
        touch(last_active);
    }
}

async fn downlink<W>(socket: &UdpSocket, writer: &mut PacketStream<W>, last_active: &Mutex<Instant>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        writer.write_packet(&buf[..n], &Address::from(to_canonical(from))).await?;
        touch(last_active);
    }
}

async fn idle(last_active: &Mutex<Instant>, timeout: Duration) {
    loop {
        let deadline = *last_active.lock().unwrap_or_else(|e| e.into_inner()) + timeout;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

fn to_mapped(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) => SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port()),
        v6 => v6,
    }
}

fn to_canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

#[async_trait]
impl<U> ServiceHandler<U> for DirectHandler
where
    U: fmt::Debug + Send + Sync + 'static,
{
    async fn new_connection(
        &self,
        user: U,
        source: SocketAddr,
        destination: Address,
        stream: ServerStream,
    ) -> anyhow::Result<()> {
        let target = connect_target(&destination)
            .await
            .with_context(|| format!("connect to {}", destination))?;
        info!("[{:?}] {} -> {} (tcp)", user, source, destination);
        copy_bidirectional(stream, target).await?;
        Ok(())
    }

    async fn new_packet_connection(
        &self,
        user: U,
        source: SocketAddr,
        destination: Address,
        stream: PacketStream<ServerStream>,
    ) -> anyhow::Result<()> {
        info!("[{:?}] {} -> {} (udp)", user, source, destination);
        self.relay_packets(stream).await
    }
}
