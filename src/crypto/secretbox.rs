//! Payload boxes: XChaCha20-Poly1305 with a counter nonce
//!
//! A `Sealer` and an `Opener` each own the nonce counter for one direction.
//! The counter only moves as a side effect of a seal or open, and it moves
//! on failure too, so both peers stay in lock-step frame by frame.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};

use crate::error::{Error, Result};

use super::KEY_SIZE;

/// XChaCha20 nonce size (192 bits)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// 192-bit little-endian nonce counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceCounter([u8; NONCE_SIZE]);

impl NonceCounter {
    pub fn new(initial: [u8; NONCE_SIZE]) -> Self {
        Self(initial)
    }

    /// The value the next seal/open will use
    pub fn current(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn advance(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                return;
            }
        }
    }
}

/// Sending half: seals payloads in strictly increasing nonce order
pub struct Sealer {
    cipher: XChaCha20Poly1305,
    nonce: NonceCounter,
}

impl Sealer {
    pub fn new(key: &[u8; KEY_SIZE], nonce: NonceCounter) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            nonce,
        }
    }

    /// Seal `plaintext` with the current nonce, then advance it
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let result = self
            .cipher
            .encrypt(XNonce::from_slice(self.nonce.current()), plaintext);
        self.nonce.advance();
        result.map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
    }

    pub fn nonce(&self) -> &NonceCounter {
        &self.nonce
    }
}

/// Receiving half: opens payloads with the mirrored counter
pub struct Opener {
    cipher: XChaCha20Poly1305,
    nonce: NonceCounter,
}

impl Opener {
    pub fn new(key: &[u8; KEY_SIZE], nonce: NonceCounter) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            nonce,
        }
    }

    /// Open `ciphertext` with the current nonce, then advance it
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let result = if ciphertext.len() < TAG_SIZE {
            Err(Error::Crypto("Ciphertext too short".to_string()))
        } else {
            self.cipher
                .decrypt(XNonce::from_slice(self.nonce.current()), ciphertext)
                .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
        };
        self.nonce.advance();
        result
    }

    pub fn nonce(&self) -> &NonceCounter {
        &self.nonce
    }
}
