//! Keyring - sub-keys derived from the pre-shared secret
//!
//! Every sub-key is `SHA256(name || "_" || secret)`. Both ends derive the
//! keyring independently, so the derivation must stay byte-for-byte stable.

use std::fmt;

use super::{sha256_concat, NONCE_SIZE};

/// Size of every derived key (SHA-256 output)
pub const KEY_SIZE: usize = 32;

/// Direction of travel on a session's physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Initiator to acceptor
    ClientToServer,
    /// Acceptor to initiator
    ServerToClient,
}

/// Masked header fields, each with its own key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskField {
    Timestamp,
    Version,
    Cmd,
    StreamId,
    Length,
    Checksum,
}

/// Immutable set of keys shared by both session endpoints
#[derive(Clone, PartialEq, Eq)]
pub struct Keyring {
    cipher: [u8; KEY_SIZE],
    nonce_seed: [u8; KEY_SIZE],
    client: [u8; KEY_SIZE],
    server: [u8; KEY_SIZE],
    timestamp: [u8; KEY_SIZE],
    version: [u8; KEY_SIZE],
    cmd: [u8; KEY_SIZE],
    sid: [u8; KEY_SIZE],
    length: [u8; KEY_SIZE],
    chksum: [u8; KEY_SIZE],
}

impl Keyring {
    /// Derive the full keyring from a shared secret
    pub fn derive(secret: &[u8]) -> Self {
        Self {
            cipher: sub_key("cipher", secret),
            nonce_seed: sub_key("nonce", secret),
            client: sub_key("client", secret),
            server: sub_key("server", secret),
            timestamp: sub_key("timestamp", secret),
            version: sub_key("version", secret),
            cmd: sub_key("cmd", secret),
            sid: sub_key("sid", secret),
            length: sub_key("len", secret),
            chksum: sub_key("chksum", secret),
        }
    }

    /// Payload encryption key
    pub fn cipher_key(&self) -> &[u8; KEY_SIZE] {
        &self.cipher
    }

    pub fn nonce_seed(&self) -> &[u8; KEY_SIZE] {
        &self.nonce_seed
    }

    pub fn client_key(&self) -> &[u8; KEY_SIZE] {
        &self.client
    }

    pub fn server_key(&self) -> &[u8; KEY_SIZE] {
        &self.server
    }

    /// Key used to mask (and, for the checksum, to key) a header field
    pub fn field_key(&self, field: MaskField) -> &[u8; KEY_SIZE] {
        match field {
            MaskField::Timestamp => &self.timestamp,
            MaskField::Version => &self.version,
            MaskField::Cmd => &self.cmd,
            MaskField::StreamId => &self.sid,
            MaskField::Length => &self.length,
            MaskField::Checksum => &self.chksum,
        }
    }

    /// Mask stream for one header field: `SHA256(iv || field_key)`
    pub fn mask(&self, iv: &[u8], field: MaskField) -> [u8; 32] {
        sha256_concat(&[iv, self.field_key(field)])
    }

    /// Starting nonce for the given direction.
    ///
    /// The two directions start from unrelated points so a counter in one
    /// direction never reaches a value already used by the other.
    pub fn initial_nonce(&self, direction: Direction) -> [u8; NONCE_SIZE] {
        let side = match direction {
            Direction::ClientToServer => &self.client,
            Direction::ServerToClient => &self.server,
        };
        let digest = sha256_concat(&[&self.nonce_seed, side]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        nonce
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring").finish_non_exhaustive()
    }
}

fn sub_key(name: &str, secret: &[u8]) -> [u8; KEY_SIZE] {
    sha256_concat(&[name.as_bytes(), b"_", secret])
}
