//! Server session behavior driven from a raw in-memory client connection

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use juicity::auth::derive_token;
use juicity::protocol::Authenticate;
use juicity::transport::Connection;
use juicity::transports::memory::{connection_pair, MemoryConnection};
use juicity::{Address, Error, Network};

use common::{alice, server_addr, service, PASSWORD};

const WAIT: Duration = Duration::from_secs(5);

fn client_addr() -> SocketAddr {
    "10.0.0.7:51000".parse().unwrap()
}

async fn authenticate(conn: &MemoryConnection, uuid: Uuid, password: &str) {
    let token = derive_token(conn, &uuid, password).unwrap();
    let mut stream = conn.open_uni().await.unwrap();
    stream.write_all(&Authenticate::new(uuid, token).encode()).await.unwrap();
    stream.shutdown().await.unwrap();
}

fn request(network: Network, destination: &Address, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(network.into_u8());
    destination.encode(&mut buf).unwrap();
    buf.extend_from_slice(payload);
    buf
}

async fn until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_authenticates_user() {
    let harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    assert!(!session.is_authenticated());
    authenticate(&client, alice(), PASSWORD).await;
    until(|| session.is_authenticated()).await;

    assert_eq!(session.user().map(String::as_str), Some("alice"));
    assert!(!session.is_closed());
    assert!(session.error().is_none());
}

#[tokio::test]
async fn test_unknown_user_closes_connection() {
    let harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    let stranger = Uuid::from_u128(7);
    authenticate(&client, stranger, PASSWORD).await;
    timeout(WAIT, session.closed()).await.unwrap();

    assert!(matches!(session.error().as_deref(), Some(Error::UnknownUser(u)) if *u == stranger));
    assert!(session.user().is_none());
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_token_mismatch_closes_connection() {
    let harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    authenticate(&client, alice(), "guess").await;
    timeout(WAIT, session.closed()).await.unwrap();

    let err = session.error().unwrap();
    assert!(matches!(*err, Error::TokenMismatch));
    assert!(err.is_authentication_failure());
}

#[tokio::test]
async fn test_token_from_another_connection_is_rejected() {
    let harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let (other, _) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    let token = derive_token(&other, &alice(), PASSWORD).unwrap();
    let mut stream = client.open_uni().await.unwrap();
    stream.write_all(&Authenticate::new(alice(), token).encode()).await.unwrap();
    timeout(WAIT, session.closed()).await.unwrap();

    assert!(matches!(session.error().as_deref(), Some(Error::TokenMismatch)));
}

#[tokio::test]
async fn test_unknown_version_closes_connection() {
    let harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    let mut stream = client.open_uni().await.unwrap();
    stream.write_all(&[1, 0]).await.unwrap();
    timeout(WAIT, session.closed()).await.unwrap();

    assert!(matches!(session.error().as_deref(), Some(Error::UnknownVersion(1))));
}

#[tokio::test]
async fn test_duplicate_authentication_keeps_first_user() {
    let harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    authenticate(&client, alice(), PASSWORD).await;
    until(|| session.is_authenticated()).await;
    authenticate(&client, alice(), PASSWORD).await;
    timeout(WAIT, session.closed()).await.unwrap();

    assert!(matches!(session.error().as_deref(), Some(Error::DuplicateAuthentication)));
    assert_eq!(session.user().map(String::as_str), Some("alice"));
}

#[tokio::test(start_paused = true)]
async fn test_auth_timeout() {
    let harness = service(Duration::from_secs(3));
    assert_eq!(harness.service.auth_timeout(), Duration::from_secs(3));
    let (_client, server) = connection_pair(client_addr(), server_addr());
    let started = Instant::now();
    let session = harness.service.handle_connection(server);

    session.closed().await;

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(matches!(session.error().as_deref(), Some(Error::AuthTimeout)));
    assert_eq!(session.connection().close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_timeout_disarmed_by_authentication() {
    let harness = service(Duration::from_secs(3));
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    authenticate(&client, alice(), PASSWORD).await;
    until(|| session.is_authenticated()).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(!session.is_closed());
}

#[test]
fn test_zero_auth_timeout_uses_default() {
    let harness = service(Duration::ZERO);
    assert_eq!(harness.service.auth_timeout(), juicity::server::DEFAULT_AUTH_TIMEOUT);
}

#[tokio::test]
async fn test_stream_waits_for_authentication() {
    let mut harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    let destination = Address::Domain("example.com".to_string(), 443);
    let (mut send, mut recv) = client.open_bi().await.unwrap();
    send.write_all(&request(Network::Tcp, &destination, b"early bytes"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.events.try_recv().is_err());

    authenticate(&client, alice(), PASSWORD).await;
    let delivered = timeout(WAIT, harness.events.recv()).await.unwrap().unwrap();
    assert_eq!(delivered.user, "alice");
    assert_eq!(delivered.destination, destination);
    assert_eq!(delivered.source, client_addr());

    // Bytes that arrived with the header reach the handler first.
    let mut buf = [0u8; 11];
    timeout(WAIT, recv.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"early bytes");
    assert!(session.is_authenticated());
}

#[tokio::test]
async fn test_pending_stream_dropped_when_authentication_fails() {
    let mut harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    let (mut send, _recv) = client.open_bi().await.unwrap();
    send.write_all(&request(Network::Tcp, &"192.0.2.1:80".parse().unwrap(), b""))
        .await
        .unwrap();
    authenticate(&client, alice(), "guess").await;
    timeout(WAIT, session.closed()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.events.try_recv().is_err());
}

#[tokio::test]
async fn test_bad_stream_header_only_drops_that_stream() {
    let mut harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);
    authenticate(&client, alice(), PASSWORD).await;

    let (mut send, mut recv) = client.open_bi().await.unwrap();
    send.write_all(&[2, 0x01, 127, 0, 0, 1, 0, 80]).await.unwrap();
    let mut rest = Vec::new();
    timeout(WAIT, recv.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());

    let (mut send, _bad_family) = client.open_bi().await.unwrap();
    send.write_all(&[1, 0x02, 0, 0]).await.unwrap();

    let destination: Address = "192.0.2.1:80".parse().unwrap();
    let (mut send, mut recv) = client.open_bi().await.unwrap();
    send.write_all(&request(Network::Tcp, &destination, b"ok")).await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, recv.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ok");

    let delivered = harness.events.recv().await.unwrap();
    assert_eq!(delivered.destination, destination);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_udp_stream_reaches_packet_handler() {
    let mut harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let _session = harness.service.handle_connection(server);
    authenticate(&client, alice(), PASSWORD).await;

    let dns: Address = "1.1.1.1:53".parse().unwrap();
    let mut first = BytesMut::new();
    first.put_u8(Network::Udp.into_u8());
    dns.encode(&mut first).unwrap();
    dns.encode(&mut first).unwrap();
    first.put_u16(3);
    first.extend_from_slice(b"abc");

    let (mut send, mut recv) = client.open_bi().await.unwrap();
    send.write_all(&first).await.unwrap();

    let delivered = timeout(WAIT, harness.events.recv()).await.unwrap().unwrap();
    assert_eq!(delivered.network, Network::Udp);
    assert_eq!(delivered.destination, dns);

    let mut echoed = vec![0u8; dns.encoded_len() + 2 + 3];
    timeout(WAIT, recv.read_exact(&mut echoed)).await.unwrap().unwrap();
    let mut expected = BytesMut::new();
    dns.encode(&mut expected).unwrap();
    expected.put_u16(3);
    expected.extend_from_slice(b"abc");
    assert_eq!(&echoed[..], &expected[..]);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let harness = service(Duration::ZERO);
    let (_client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);

    session.close_with_error(Error::TokenMismatch);
    session.close_with_error(Error::Canceled);
    timeout(WAIT, session.closed()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(session.error().as_deref(), Some(Error::TokenMismatch)));
    assert_eq!(session.connection().close_count(), 1);
    assert_eq!(session.connection().close_code(), Some(0));
}

#[tokio::test]
async fn test_cancellation_closes_sessions() {
    let harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);
    authenticate(&client, alice(), PASSWORD).await;
    until(|| session.is_authenticated()).await;

    harness.cancel.cancel();
    timeout(WAIT, session.closed()).await.unwrap();

    assert!(matches!(session.error().as_deref(), Some(Error::Canceled)));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_peer_close_is_recorded_once() {
    let harness = service(Duration::ZERO);
    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);
    authenticate(&client, alice(), PASSWORD).await;
    until(|| session.is_authenticated()).await;

    client.close(0, b"");
    timeout(WAIT, session.closed()).await.unwrap();

    let err = session.error().unwrap();
    assert!(err.is_closed_or_canceled());
    assert_eq!(session.connection().close_count(), 2);
}

#[test]
fn test_update_users_length_mismatch() {
    let harness = service(Duration::ZERO);
    let result = harness
        .service
        .update_users(vec!["bob".to_string()], vec![], vec!["pw".to_string()]);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_update_users_replaces_directory() {
    let harness = service(Duration::ZERO);
    let bob = Uuid::from_u128(0xb0b);
    harness
        .service
        .update_users(vec!["bob".to_string()], vec![bob], vec!["hunter2".to_string()])
        .unwrap();

    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);
    authenticate(&client, bob, "hunter2").await;
    until(|| session.is_authenticated()).await;
    assert_eq!(session.user().map(String::as_str), Some("bob"));

    let (client, server) = connection_pair(client_addr(), server_addr());
    let session = harness.service.handle_connection(server);
    authenticate(&client, alice(), PASSWORD).await;
    timeout(WAIT, session.closed()).await.unwrap();
    assert!(matches!(session.error().as_deref(), Some(Error::UnknownUser(_))));
}
