//! Juicity configuration files

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::congestion::CongestionControl;
use crate::outbound::DEFAULT_UDP_TIMEOUT;
use crate::server::DEFAULT_AUTH_TIMEOUT;
use crate::transports::quic::DEFAULT_ALPN;

fn default_alpn() -> Vec<String> {
    vec![DEFAULT_ALPN.to_string()]
}

fn default_auth_timeout() -> Duration {
    DEFAULT_AUTH_TIMEOUT
}

fn default_udp_timeout() -> Duration {
    DEFAULT_UDP_TIMEOUT
}

fn default_max_concurrent_streams() -> u32 {
    1024
}

fn default_socks_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1080))
}

/// One account allowed to use the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Name reported in logs
    pub name: String,
    pub uuid: Uuid,
    pub password: String,
}

/// Server configuration (`juicity server`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP address the QUIC endpoint binds to
    pub listen: SocketAddr,

    /// PEM certificate chain; a self-signed certificate is generated when absent
    #[serde(default)]
    pub certificate: Option<PathBuf>,

    #[serde(default)]
    pub private_key: Option<PathBuf>,

    /// Accepted for compatibility, server connections always use bbr
    #[serde(default)]
    pub congestion_control: CongestionControl,

    #[serde(default = "default_auth_timeout", with = "humantime_serde")]
    pub auth_timeout: Duration,

    /// Idle timeout of relayed UDP sessions
    #[serde(default = "default_udp_timeout", with = "humantime_serde")]
    pub udp_timeout: Duration,

    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,

    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,

    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// Client configuration (`juicity client`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local SOCKS5 listen address
    #[serde(default = "default_socks_listen")]
    pub listen: SocketAddr,

    /// Server as `host:port`
    pub server: String,

    /// TLS server name, the host part of `server` by default
    #[serde(default)]
    pub server_name: Option<String>,

    pub uuid: Uuid,

    pub password: String,

    #[serde(default)]
    pub congestion_control: CongestionControl,

    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,

    /// Skip server certificate verification
    #[serde(default)]
    pub allow_insecure: bool,
}

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)?;
    let config: T = toml::from_str(&contents)?;
    Ok(config)
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
fn split_host_port(server: &str) -> Option<(&str, u16)> {
    let (host, port) = server.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        load(path)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.users.is_empty() {
            return Err("At least one user must be configured".to_string());
        }
        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.uuid) {
                return Err(format!("Duplicate user uuid {}", user.uuid));
            }
            if user.password.is_empty() {
                return Err(format!("User {} has an empty password", user.name));
            }
        }
        if self.certificate.is_some() != self.private_key.is_some() {
            return Err("certificate and private_key must be set together".to_string());
        }
        if self.max_concurrent_streams == 0 {
            return Err("max_concurrent_streams must be positive".to_string());
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        load(path)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if split_host_port(&self.server).is_none() {
            return Err(format!("Server address {} must be host:port", self.server));
        }
        if self.password.is_empty() {
            return Err("Password must be set".to_string());
        }
        Ok(())
    }

    /// TLS server name to present
    pub fn server_name(&self) -> String {
        match &self.server_name {
            Some(name) => name.clone(),
            None => split_host_port(&self.server)
                .map(|(host, _)| host.to_string())
                .unwrap_or_default(),
        }
    }
}
