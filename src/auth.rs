//! User directory and authentication tokens
//!
//! A token is 32 bytes of TLS keying material exported with the user's UUID bytes as
//! label and the password as context. Both ends compute it from the same handshake, so
//! the secret itself never crosses the wire.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ring::constant_time;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::TOKEN_LEN;
use crate::transport::Connection;

#[derive(Debug, Clone)]
pub struct UserEntry<U> {
    pub user: U,
    pub password: String,
}

/// Registered users keyed by UUID.
///
/// Updates swap in a whole new table; a lookup always sees one consistent snapshot.
#[derive(Debug)]
pub struct UserDirectory<U> {
    users: RwLock<Arc<HashMap<Uuid, UserEntry<U>>>>,
}

impl<U> Default for UserDirectory<U> {
    fn default() -> Self {
        Self {
            users: RwLock::new(Arc::new(HashMap::new())),
        }
    }
}

impl<U: Clone> UserDirectory<U> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the full user table. Later duplicates of a UUID win.
    pub fn replace<I>(&self, users: I)
    where
        I: IntoIterator<Item = (Uuid, U, String)>,
    {
        let table: HashMap<_, _> = users
            .into_iter()
            .map(|(uuid, user, password)| (uuid, UserEntry { user, password }))
            .collect();
        *self.users.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
    }

    pub fn lookup(&self, uuid: &Uuid) -> Option<UserEntry<U>> {
        self.snapshot().get(uuid).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<HashMap<Uuid, UserEntry<U>>> {
        self.users.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Derives the authentication token for `uuid`/`password` on `conn`.
pub fn derive_token<C: Connection + ?Sized>(conn: &C, uuid: &Uuid, password: &str) -> Result<[u8; TOKEN_LEN]> {
    let mut token = [0u8; TOKEN_LEN];
    conn.export_keying_material(&mut token, uuid.as_bytes(), password.as_bytes())?;
    Ok(token)
}

/// Checks a received token against the expected one in constant time.
pub fn verify_token(expected: &[u8; TOKEN_LEN], received: &[u8; TOKEN_LEN]) -> Result<()> {
    constant_time::verify_slices_are_equal(expected, received).map_err(|_| Error::TokenMismatch)
}
