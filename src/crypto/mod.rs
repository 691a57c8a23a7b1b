//! Cryptography module for Shroud
//!
//! Provides the two primitives the tunnel is built on:
//! - Keyring: named sub-keys derived from one shared secret
//! - Sealer/Opener: XChaCha20-Poly1305 payload boxes driven by
//!   per-direction nonce counters

mod keyring;
mod secretbox;

pub use keyring::{Direction, Keyring, MaskField, KEY_SIZE};
pub use secretbox::{NonceCounter, Opener, Sealer, NONCE_SIZE, TAG_SIZE};

use sha2::{Digest, Sha256};

/// Fill a buffer from the thread-local CSPRNG
pub fn fill_random(buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha256_concat(&[data])
}

/// SHA-256 over the concatenation of `parts`, without building the joined buffer
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// XOR `mask` into `dst`. `mask` must be at least as long as `dst`.
pub fn xor_in_place(dst: &mut [u8], mask: &[u8]) {
    debug_assert!(mask.len() >= dst.len());
    for (d, m) in dst.iter_mut().zip(mask) {
        *d ^= m;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_random() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        fill_random(&mut a);
        fill_random(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_sha256_concat_matches_joined_input() {
        assert_eq!(sha256_concat(&[b"cipher", b"_", b"secret"]), sha256(b"cipher_secret"));
    }

    #[test]
    fn test_xor_is_involution() {
        let mask = sha256(b"mask");
        let mut data = *b"payload";
        xor_in_place(&mut data, &mask);
        assert_ne!(&data, b"payload");
        xor_in_place(&mut data, &mask);
        assert_eq!(&data, b"payload");
    }
}
