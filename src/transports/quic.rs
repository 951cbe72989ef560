//! QUIC Transport Implementation
//!
//! quinn-backed [`Dialer`], [`Listener`] and [`Connection`]. ALPN defaults to `h3` so the
//! handshake looks like ordinary HTTP/3.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ConnectionError, Endpoint, TransportConfig, VarInt};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tokio::sync::{mpsc, Mutex};

use crate::congestion::CongestionControl;
use crate::error::{Error, Result};
use crate::transport::{Connection, Dialer, Listener, RecvStream};

/// Default ALPN of both ends.
pub const DEFAULT_ALPN: &str = "h3";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

fn connection_error(err: ConnectionError) -> Error {
    match err {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::Reset
        | ConnectionError::TimedOut
        | ConnectionError::LocallyClosed => Error::ConnectionLost(err.to_string()),
        other => Error::Transport(other.to_string()),
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config(congestion: CongestionControl, max_streams: u32) -> TransportConfig {
    let mut transport = TransportConfig::default();
    transport.max_concurrent_bidi_streams(max_streams.into());
    transport.max_concurrent_uni_streams(max_streams.into());
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    if let Ok(timeout) = MAX_IDLE_TIMEOUT.try_into() {
        transport.max_idle_timeout(Some(timeout));
    }
    congestion.apply(&mut transport);
    transport
}

impl RecvStream for quinn::RecvStream {
    fn stop(&mut self, code: u32) {
        // Already stopped or finished streams have nothing left to cancel.
        let _ = quinn::RecvStream::stop(self, VarInt::from_u32(code));
    }
}

/// An established quinn connection.
pub struct QuicConnection {
    conn: quinn::Connection,
    // Client connections own their endpoint; dropping it early would kill the socket.
    endpoint: Option<Endpoint>,
}

impl QuicConnection {
    pub fn new(conn: quinn::Connection) -> Self {
        Self { conn, endpoint: None }
    }

    pub fn inner(&self) -> &quinn::Connection {
        &self.conn
    }
}

impl Drop for QuicConnection {
    fn drop(&mut self) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.close(VarInt::from_u32(0), b"");
        }
    }
}

#[async_trait]
impl Connection for QuicConnection {
    type SendHalf = quinn::SendStream;
    type RecvHalf = quinn::RecvStream;

    async fn open_uni(&self) -> Result<quinn::SendStream> {
        self.conn.open_uni().await.map_err(connection_error)
    }

    async fn open_bi(&self) -> Result<(quinn::SendStream, quinn::RecvStream)> {
        self.conn.open_bi().await.map_err(connection_error)
    }

    async fn accept_uni(&self) -> Result<quinn::RecvStream> {
        self.conn.accept_uni().await.map_err(connection_error)
    }

    async fn accept_bi(&self) -> Result<(quinn::SendStream, quinn::RecvStream)> {
        self.conn.accept_bi().await.map_err(connection_error)
    }

    fn export_keying_material(&self, output: &mut [u8], label: &[u8], context: &[u8]) -> Result<()> {
        self.conn
            .export_keying_material(output, label, context)
            .map_err(|_| Error::KeyingMaterial)
    }

    fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn close(&self, code: u32, reason: &[u8]) {
        self.conn.close(VarInt::from_u32(code), reason);
    }
}

/// Client TLS options.
#[derive(Debug, Clone)]
pub struct ClientTlsOptions {
    pub server_name: String,
    pub alpn: Vec<String>,
    /// Skip server certificate verification.
    pub allow_insecure: bool,
}

/// Dials the server, one UDP endpoint per connection.
pub struct QuicDialer {
    server: String,
    server_name: String,
    crypto: Arc<QuicClientConfig>,
}

impl QuicDialer {
    /// `server` is a `host:port` pair, resolved on every dial.
    pub fn new(server: impl Into<String>, tls: ClientTlsOptions) -> Result<Self> {
        let mut crypto = if tls.allow_insecure {
            warn!("Server certificate verification is disabled");
            rustls::ClientConfig::builder_with_provider(crypto_provider())
                .with_protocol_versions(&[&rustls::version::TLS13])
                .map_err(|e| Error::Config(format!("TLS: {}", e)))?
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_native_certs::load_native_certs().certs {
                roots.add(cert).ok();
            }
            rustls::ClientConfig::builder_with_provider(crypto_provider())
                .with_protocol_versions(&[&rustls::version::TLS13])
                .map_err(|e| Error::Config(format!("TLS: {}", e)))?
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        crypto.alpn_protocols = tls.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

        let crypto = QuicClientConfig::try_from(crypto).map_err(|e| Error::Config(format!("TLS: {}", e)))?;
        Ok(Self {
            server: server.into(),
            server_name: tls.server_name,
            crypto: Arc::new(crypto),
        })
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host(&self.server)
            .await?
            .next()
            .ok_or_else(|| Error::Transport(format!("no address for {}", self.server)))
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    type Connection = QuicConnection;

    async fn dial(&self, congestion: CongestionControl) -> Result<QuicConnection> {
        let server_addr = self.resolve().await?;
        let bind: SocketAddr = if server_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let endpoint = Endpoint::client(bind)?;

        let mut client_config = quinn::ClientConfig::new(self.crypto.clone());
        client_config.transport_config(Arc::new(transport_config(congestion, u32::MAX >> 2)));

        let connecting = endpoint
            .connect_with(client_config, server_addr, &self.server_name)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let conn = connecting.await.map_err(connection_error)?;

        debug!("QUIC connection established to {} ({})", server_addr, congestion);
        Ok(QuicConnection {
            conn,
            endpoint: Some(endpoint),
        })
    }
}

/// Server certificate source.
#[derive(Debug, Clone)]
pub struct ServerTlsOptions {
    pub certificate: Option<std::path::PathBuf>,
    pub private_key: Option<std::path::PathBuf>,
    pub alpn: Vec<String>,
}

/// Accepts QUIC connections on one endpoint.
///
/// Handshakes run in their own tasks so a slow peer never holds up the others.
pub struct QuicListener {
    endpoint: Endpoint,
    incoming: Mutex<mpsc::Receiver<QuicConnection>>,
}

impl QuicListener {
    pub fn bind(
        listen: SocketAddr,
        tls: &ServerTlsOptions,
        congestion: CongestionControl,
        max_concurrent_streams: u32,
    ) -> Result<Self> {
        let (cert_chain, key) = load_certificate(tls)?;
        let mut crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| Error::Config(format!("TLS: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| Error::Config(format!("TLS: {}", e)))?;
        crypto.alpn_protocols = tls.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

        let effective = CongestionControl::for_server(congestion);
        if effective != congestion {
            info!(
                "Congestion control {} requested, server connections use {}",
                congestion, effective
            );
        }

        let crypto = QuicServerConfig::try_from(crypto).map_err(|e| Error::Config(format!("TLS: {}", e)))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport_config(effective, max_concurrent_streams)));

        let endpoint = Endpoint::server(server_config, listen)?;
        info!("QUIC server listening on {}", endpoint.local_addr()?);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(accept_loop(endpoint.clone(), tx));

        Ok(Self {
            endpoint,
            incoming: Mutex::new(rx),
        })
    }
}

async fn accept_loop(endpoint: Endpoint, tx: mpsc::Sender<QuicConnection>) {
    while let Some(incoming) = endpoint.accept().await {
        let tx = tx.clone();
        tokio::spawn(async move {
            let remote = incoming.remote_address();
            match incoming.await {
                Ok(conn) => {
                    debug!("QUIC: Accepted connection from {}", remote);
                    let _ = tx.send(QuicConnection::new(conn)).await;
                }
                Err(e) => debug!("QUIC handshake with {} failed: {}", remote, e),
            }
        });
    }
}

#[async_trait]
impl Listener for QuicListener {
    type Connection = QuicConnection;

    async fn accept(&self) -> Result<QuicConnection> {
        self.incoming.lock().await.recv().await.ok_or(Error::Canceled)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"");
    }
}

fn load_certificate(tls: &ServerTlsOptions) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    match (&tls.certificate, &tls.private_key) {
        (Some(cert), Some(key)) => load_pem(cert, key),
        (None, None) => {
            warn!("No certificate configured, generating a self-signed one");
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .map_err(|e| Error::Config(format!("self-signed certificate: {}", e)))?;
            let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
            Ok((vec![cert.cert.der().clone()], key.into()))
        }
        _ => Err(Error::Config(
            "certificate and private_key must be configured together".into(),
        )),
    }
}

fn load_pem(cert: &Path, key: &Path) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain = CertificateDer::pem_file_iter(cert)
        .map_err(|e| Error::Config(format!("{}: {}", cert.display(), e)))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("{}: {}", cert.display(), e)))?;
    if chain.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: no certificates", cert.display()),
        )));
    }
    let key = PrivateKeyDer::from_pem_file(key).map_err(|e| Error::Config(format!("{}: {}", key.display(), e)))?;
    Ok((chain, key))
}

/// Skip certificate verification for self-signed certs
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(crypto_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server_tls() -> ServerTlsOptions {
        ServerTlsOptions {
            certificate: None,
            private_key: None,
            alpn: vec![DEFAULT_ALPN.into()],
        }
    }

    #[test]
    fn test_mismatched_certificate_options() {
        let tls = ServerTlsOptions {
            certificate: Some("cert.pem".into()),
            private_key: None,
            alpn: vec![],
        };
        assert!(matches!(load_certificate(&tls), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_loopback_keying_material_and_streams() {
        let listener = QuicListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            &server_tls(),
            CongestionControl::Cubic,
            16,
        )
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = QuicDialer::new(
            addr.to_string(),
            ClientTlsOptions {
                server_name: "localhost".into(),
                alpn: vec![DEFAULT_ALPN.into()],
                allow_insecure: true,
            },
        )
        .unwrap();

        let (client, server) = tokio::join!(dialer.dial(CongestionControl::NewReno), listener.accept());
        let client = client.unwrap();
        let server = server.unwrap();

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        client.export_keying_material(&mut a, b"label", b"password").unwrap();
        server.export_keying_material(&mut b, b"label", b"password").unwrap();
        assert_eq!(a, b);

        let (mut send, _recv) = client.open_bi().await.unwrap();
        send.write_all(b"hello").await.unwrap();
        let (_peer_send, mut peer_recv) = server.accept_bi().await.unwrap();
        let mut buf = [0u8; 5];
        peer_recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        client.close(0, b"");
        assert!(client.is_closed());
    }
}
