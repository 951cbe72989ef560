//! Error type shared by the client and server sessions.

use std::io;
use std::sync::Arc;

use uuid::Uuid;

/// Juicity protocol error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Dial, accept or stream-open failure reported by the QUIC layer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The QUIC connection went away through an ordinary close, reset or idle timeout.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("operation canceled")]
    Canceled,

    #[error("unknown version {0}")]
    UnknownVersion(u8),

    #[error("unknown command {0}")]
    UnknownCommand(u8),

    #[error("unsupported stream network {0}")]
    UnsupportedNetwork(u8),

    #[error("unknown address family {0:#04x}")]
    UnknownAddressFamily(u8),

    #[error("domain name length {len} exceeds limit {max}")]
    DomainTooLong { len: usize, max: usize },

    #[error("malformed request: {0}")]
    Framing(&'static str),

    #[error("packet of {0} bytes exceeds the 16-bit length field")]
    PacketTooLarge(usize),

    #[error("short buffer: packet needs {needed} bytes, buffer holds {available}")]
    ShortBuffer { needed: usize, available: usize },

    #[error("authentication: unknown user {0}")]
    UnknownUser(Uuid),

    #[error("authentication: token mismatch")]
    TokenMismatch,

    #[error("authentication: multiple authentication requests")]
    DuplicateAuthentication,

    #[error("authentication timeout")]
    AuthTimeout,

    #[error("export keying material failed")]
    KeyingMaterial,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Recorded error of a connection that has already been torn down.
    #[error("connection closed: {0}")]
    Closed(Arc<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error is an ordinary close or cancellation rather than a fault.
    ///
    /// Used to pick the log severity when a connection is torn down.
    pub fn is_closed_or_canceled(&self) -> bool {
        match self {
            Self::ConnectionLost(_) | Self::Canceled => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
            Self::Closed(inner) => inner.is_closed_or_canceled(),
            _ => false,
        }
    }

    /// Authentication failures are always fatal to the whole connection.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::UnknownUser(_)
                | Self::TokenMismatch
                | Self::DuplicateAuthentication
                | Self::AuthTimeout
                | Self::KeyingMaterial
        )
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Io(err) => err.kind(),
            Self::ConnectionLost(_) => io::ErrorKind::ConnectionAborted,
            Self::Canceled => io::ErrorKind::Interrupted,
            Self::Transport(_) => io::ErrorKind::NotConnected,
            Self::ShortBuffer { .. } | Self::PacketTooLarge(_) => io::ErrorKind::InvalidInput,
            Self::AuthTimeout => io::ErrorKind::TimedOut,
            Self::UnknownUser(_) | Self::TokenMismatch | Self::DuplicateAuthentication | Self::KeyingMaterial => {
                io::ErrorKind::PermissionDenied
            }
            Self::Closed(inner) => inner.io_kind(),
            _ => io::ErrorKind::InvalidData,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}
