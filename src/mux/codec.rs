//! Obfuscated frame header
//!
//! ```text
//! | iv(6) | timestamp(4) | version(1) | cmd(1) | sid(4) | length(2) | checksum(2) |
//! ```
//!
//! Multi-byte fields are little-endian. Every field after the IV is XORed
//! with `SHA256(iv || field_key)`, so the header is indistinguishable from
//! random bytes without the shared secret. The checksum is
//! `SHA256(first 18 bytes || checksum_key)[..2]`, computed before masking.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::crypto::{fill_random, sha256_concat, xor_in_place, Keyring, MaskField};
use crate::error::{Error, Result};

use super::frame::Cmd;

/// Encoded header size
pub const HEADER_SIZE: usize = 20;

/// Random IV prefix
pub const IV_SIZE: usize = 6;

const CHECKSUM_OFFSET: usize = 18;

const FIELDS: [(MaskField, Range<usize>); 6] = [
    (MaskField::Timestamp, 6..10),
    (MaskField::Version, 10..11),
    (MaskField::Cmd, 11..12),
    (MaskField::StreamId, 12..16),
    (MaskField::Length, 16..18),
    (MaskField::Checksum, 18..20),
];

/// Decoded header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub timestamp: u32,
    pub version: u8,
    pub cmd: Cmd,
    pub stream_id: u32,
    pub length: u16,
}

/// Masks and unmasks headers with a session's keyring
#[derive(Debug, Clone)]
pub struct HeaderCodec {
    keyring: Arc<Keyring>,
    replay_window: Option<Duration>,
}

impl HeaderCodec {
    pub fn new(keyring: Arc<Keyring>) -> Self {
        Self {
            keyring,
            replay_window: None,
        }
    }

    /// Reject decoded headers whose timestamp is further than `window` from now
    pub fn with_replay_window(mut self, window: Option<Duration>) -> Self {
        self.replay_window = window;
        self
    }

    /// Encode a header stamped with the current time
    pub fn encode(&self, version: u8, cmd: Cmd, stream_id: u32, length: u16) -> [u8; HEADER_SIZE] {
        self.encode_at(unix_now() as u32, version, cmd, stream_id, length)
    }

    pub fn encode_at(
        &self,
        timestamp: u32,
        version: u8,
        cmd: Cmd,
        stream_id: u32,
        length: u16,
    ) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        fill_random(&mut buf[..IV_SIZE]);
        buf[6..10].copy_from_slice(&timestamp.to_le_bytes());
        buf[10] = version;
        buf[11] = cmd as u8;
        buf[12..16].copy_from_slice(&stream_id.to_le_bytes());
        buf[16..18].copy_from_slice(&length.to_le_bytes());
        let checksum = self.checksum(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&checksum);

        self.apply_masks(&mut buf);
        buf
    }

    /// Decode and authenticate a header against the current time
    pub fn decode(&self, raw: &[u8; HEADER_SIZE]) -> Result<Header> {
        self.decode_at(raw, unix_now())
    }

    pub fn decode_at(&self, raw: &[u8; HEADER_SIZE], now: u64) -> Result<Header> {
        let mut buf = *raw;
        self.apply_masks(&mut buf);

        if self.checksum(&buf[..CHECKSUM_OFFSET]) != buf[CHECKSUM_OFFSET..] {
            return Err(Error::AuthFailed);
        }

        let timestamp = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
        if let Some(window) = self.replay_window {
            let skew = (now as i64 - timestamp as i64).unsigned_abs();
            if skew > window.as_secs() {
                return Err(Error::Protocol(format!(
                    "header timestamp {} outside replay window ({}s skew)",
                    timestamp, skew
                )));
            }
        }

        Ok(Header {
            timestamp,
            version: buf[10],
            cmd: Cmd::try_from(buf[11])?,
            stream_id: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            length: u16::from_le_bytes([buf[16], buf[17]]),
        })
    }

    fn apply_masks(&self, buf: &mut [u8; HEADER_SIZE]) {
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&buf[..IV_SIZE]);
        for (field, range) in FIELDS.iter() {
            let mask = self.keyring.mask(&iv, *field);
            xor_in_place(&mut buf[range.clone()], &mask);
        }
    }

    fn checksum(&self, raw: &[u8]) -> [u8; 2] {
        let digest = sha256_concat(&[raw, self.keyring.field_key(MaskField::Checksum)]);
        [digest[0], digest[1]]
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(secret: &[u8]) -> HeaderCodec {
        HeaderCodec::new(Arc::new(Keyring::derive(secret)))
            .with_replay_window(Some(Duration::from_secs(180)))
    }

    #[test]
    fn test_round_trip() {
        let codec = codec(b"secret");
        for (cmd, sid, len) in [(Cmd::Syn, 1, 0), (Cmd::Psh, 7, 65535), (Cmd::Upd, u32::MAX, 24)] {
            let raw = codec.encode(1, cmd, sid, len);
            let header = codec.decode(&raw).unwrap();
            assert_eq!((header.cmd, header.stream_id, header.length), (cmd, sid, len));
            assert_eq!(header.version, 1);
        }
    }

    #[test]
    fn test_header_is_masked() {
        let codec = codec(b"secret");
        let a = codec.encode_at(1000, 1, Cmd::Psh, 3, 100);
        let b = codec.encode_at(1000, 1, Cmd::Psh, 3, 100);
        // Same fields, fresh IV: nothing repeats on the wire.
        assert_ne!(a, b);
        assert_ne!(a[6..], b[6..]);
    }

    #[test]
    fn test_checksum_corruption_is_rejected() {
        let codec = codec(b"secret");
        let raw = codec.encode(1, Cmd::Psh, 5, 1024);
        for index in CHECKSUM_OFFSET..HEADER_SIZE {
            let mut corrupted = raw;
            corrupted[index] ^= 0x01;
            assert!(matches!(codec.decode(&corrupted), Err(Error::AuthFailed)), "byte {}", index);
        }
    }

    #[test]
    fn test_field_corruption_is_rejected() {
        // A 2-byte checksum lets roughly 1 in 65536 corrupted headers through.
        let codec = codec(b"secret");
        let raw = codec.encode(1, Cmd::Psh, 5, 1024);
        let accepted = (0..CHECKSUM_OFFSET)
            .filter(|&index| {
                let mut corrupted = raw;
                corrupted[index] ^= 0x80;
                codec.decode(&corrupted).is_ok()
            })
            .count();
        assert!(accepted <= 1);
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let sender = codec(b"one");
        let receiver = codec(b"two");
        let accepted = (0..32)
            .filter(|_| receiver.decode(&sender.encode(1, Cmd::Syn, 1, 0)).is_ok())
            .count();
        assert!(accepted <= 1);
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let codec = codec(b"secret");
        let raw = codec.encode_at(10_000, 1, Cmd::Nop, 0, 0);

        assert!(codec.decode_at(&raw, 10_000 + 180).is_ok());
        assert!(codec.decode_at(&raw, 10_000 - 180).is_ok());
        assert!(matches!(codec.decode_at(&raw, 10_000 + 181), Err(Error::Protocol(_))));
        assert!(matches!(codec.decode_at(&raw, 10_000 - 181), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_freshness_check_can_be_disabled() {
        let codec = HeaderCodec::new(Arc::new(Keyring::derive(b"secret")));
        let raw = codec.encode_at(1, 1, Cmd::Nop, 0, 0);
        assert!(codec.decode(&raw).is_ok());
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let codec = codec(b"secret");
        let ring = Keyring::derive(b"secret");

        // Hand-build a header with cmd = 9 and a valid checksum.
        let mut buf = [0u8; HEADER_SIZE];
        buf[6..10].copy_from_slice(&(unix_now() as u32).to_le_bytes());
        buf[10] = 1;
        buf[11] = 9;
        let digest = sha256_concat(&[&buf[..18], ring.field_key(MaskField::Checksum)]);
        buf[18] = digest[0];
        buf[19] = digest[1];
        codec.apply_masks(&mut buf);

        assert!(matches!(codec.decode(&buf), Err(Error::Protocol(_))));
    }
}
