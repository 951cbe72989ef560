//! Juicity - QUIC proxy client and server

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use juicity::socks5::Socks5Inbound;
use juicity::transports::quic::{ClientTlsOptions, QuicDialer, QuicListener, ServerTlsOptions};
use juicity::{
    Client, ClientConfig, ClientOptions, DirectHandler, ServerConfig, Service, ServiceOptions,
};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "juicity")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "QUIC-based proxy client and server", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local SOCKS5 proxy forwarding through a server
    Client {
        /// Client configuration file
        #[arg(short, long, value_name = "FILE", env = "JUICITY_CLIENT_CONFIG")]
        config: PathBuf,
    },

    /// Run the server
    Server {
        /// Server configuration file
        #[arg(short, long, value_name = "FILE", env = "JUICITY_SERVER_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        shutdown.cancel();
    });

    match cli.command {
        Commands::Client { config } => run_client(config, cancel).await,
        Commands::Server { config } => run_server(config, cancel).await,
    }
}

async fn run_client(path: PathBuf, cancel: CancellationToken) -> Result<()> {
    let config = ClientConfig::from_file(&path).with_context(|| format!("load {}", path.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;

    let dialer = QuicDialer::new(
        config.server.clone(),
        ClientTlsOptions {
            server_name: config.server_name(),
            alpn: config.alpn.clone(),
            allow_insecure: config.allow_insecure,
        },
    )?;
    let client = Arc::new(Client::new(
        dialer,
        ClientOptions {
            uuid: config.uuid,
            password: config.password.clone(),
            congestion_control: config.congestion_control,
        },
    ));
    info!(
        "Juicity client {} forwarding to {} ({})",
        juicity::VERSION,
        config.server,
        config.congestion_control
    );

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    Socks5Inbound::new(Arc::clone(&client), cancel).serve(listener).await?;
    client.close_with_error(juicity::Error::Canceled).await;
    Ok(())
}

async fn run_server(path: PathBuf, cancel: CancellationToken) -> Result<()> {
    let config = ServerConfig::from_file(&path).with_context(|| format!("load {}", path.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;

    let listener = QuicListener::bind(
        config.listen,
        &ServerTlsOptions {
            certificate: config.certificate.clone(),
            private_key: config.private_key.clone(),
            alpn: config.alpn.clone(),
        },
        config.congestion_control,
        config.max_concurrent_streams,
    )?;
    if config.alpn.is_empty() {
        warn!("No ALPN configured, standard clients expect h3");
    }

    let service = Service::new(ServiceOptions {
        auth_timeout: config.auth_timeout,
        handler: Arc::new(DirectHandler::new(config.udp_timeout)),
        cancel: cancel.clone(),
    });
    let (names, (uuids, passwords)): (Vec<_>, (Vec<_>, Vec<_>)) = config
        .users
        .iter()
        .map(|u| (u.name.clone(), (u.uuid, u.password.clone())))
        .unzip();
    service.update_users(names, uuids, passwords)?;

    let local = service.start(listener)?;
    info!("Juicity server {} running on {}", juicity::VERSION, local);

    cancel.cancelled().await;
    service.close();
    Ok(())
}
