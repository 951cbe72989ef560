//! Protocol constants and the authentication record
//!
//! Authentication is carried on a fresh unidirectional stream:
//!
//! ```text
//! +-----+-----+------+-------+
//! | VER | CMD | UUID | TOKEN |
//! +-----+-----+------+-------+
//! |  1  |  1  |  16  |  32   |
//! +-----+-----+------+-------+
//! ```
//!
//! Every bidirectional stream starts with a one byte network kind followed by the
//! destination [`Address`](crate::Address).

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

pub const VERSION: u8 = 0;

pub const COMMAND_AUTHENTICATE: u8 = 0;

pub const TOKEN_LEN: usize = 32;

/// Total length of the authentication record, header included.
pub const AUTHENTICATE_LEN: usize = 2 + 16 + TOKEN_LEN;

/// Network kind of a data stream
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp = 1,
    Udp = 3,
}

impl Network {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Tcp),
            3 => Ok(Self::Udp),
            other => Err(Error::UnsupportedNetwork(other)),
        }
    }

    pub fn into_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// The `authenticate` command body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    pub uuid: Uuid,
    pub token: [u8; TOKEN_LEN],
}

impl Authenticate {
    pub fn new(uuid: Uuid, token: [u8; TOKEN_LEN]) -> Self {
        Self { uuid, token }
    }

    /// Full record including version and command bytes.
    pub fn encode(&self) -> [u8; AUTHENTICATE_LEN] {
        let mut record = [0u8; AUTHENTICATE_LEN];
        record[0] = VERSION;
        record[1] = COMMAND_AUTHENTICATE;
        record[2..18].copy_from_slice(self.uuid.as_bytes());
        record[18..].copy_from_slice(&self.token);
        record
    }

    /// Decodes the part of the record following version and command.
    pub fn decode_body(body: &[u8; AUTHENTICATE_LEN - 2]) -> Self {
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&body[..16]);
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&body[16..]);
        Self {
            uuid: Uuid::from_bytes(uuid),
            token,
        }
    }
}
