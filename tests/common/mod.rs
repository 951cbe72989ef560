//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use juicity::transports::memory::{self, MemoryDialer};
use juicity::{
    Address, Client, ClientOptions, CongestionControl, Network, PacketStream, ServerStream, Service,
    ServiceHandler, ServiceOptions,
};

pub const PASSWORD: &str = "correct horse battery staple";

pub fn alice() -> Uuid {
    Uuid::from_u128(0xa11ce)
}

pub fn server_addr() -> SocketAddr {
    "127.0.0.1:443".parse().unwrap()
}

/// One delivered request as seen by the traffic handler
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub user: String,
    pub network: Network,
    pub source: SocketAddr,
    pub destination: Address,
}

/// Echoes TCP bytes and UDP packets back, reporting every request it gets
pub struct EchoHandler {
    events: mpsc::UnboundedSender<Delivered>,
}

impl EchoHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivered>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events: tx }), rx)
    }
}

#[async_trait]
impl ServiceHandler<String> for EchoHandler {
    async fn new_connection(
        &self,
        user: String,
        source: SocketAddr,
        destination: Address,
        stream: ServerStream,
    ) -> anyhow::Result<()> {
        let _ = self.events.send(Delivered {
            user,
            network: Network::Tcp,
            source,
            destination,
        });
        let (mut reader, mut writer) = tokio::io::split(stream);
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await?;
        Ok(())
    }

    async fn new_packet_connection(
        &self,
        user: String,
        source: SocketAddr,
        destination: Address,
        mut stream: PacketStream<ServerStream>,
    ) -> anyhow::Result<()> {
        let _ = self.events.send(Delivered {
            user,
            network: Network::Udp,
            source,
            destination,
        });
        let mut packet = BytesMut::new();
        loop {
            let from = stream.read_packet(&mut packet).await?;
            stream.write_packet(&packet, &from).await?;
        }
    }
}

pub struct Harness {
    pub service: Service<String>,
    pub events: mpsc::UnboundedReceiver<Delivered>,
    pub cancel: CancellationToken,
}

pub fn service(auth_timeout: Duration) -> Harness {
    let (handler, events) = EchoHandler::new();
    let cancel = CancellationToken::new();
    let service = Service::new(ServiceOptions {
        auth_timeout,
        handler,
        cancel: cancel.clone(),
    });
    service
        .update_users(vec!["alice".to_string()], vec![alice()], vec![PASSWORD.to_string()])
        .unwrap();
    Harness {
        service,
        events,
        cancel,
    }
}

/// A running service on the in-memory transport plus a client pointed at it
pub fn client_and_service(password: &str) -> (Client<MemoryDialer>, Harness) {
    let harness = service(Duration::ZERO);
    let (dialer, listener) = memory::endpoint(server_addr());
    harness.service.start(listener).unwrap();
    let client = Client::new(
        dialer,
        ClientOptions {
            uuid: alice(),
            password: password.to_string(),
            congestion_control: CongestionControl::Cubic,
        },
    );
    (client, harness)
}
