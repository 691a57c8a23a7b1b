//! Multiplexing frames and the UPD control payload

use bytes::Bytes;

use crate::error::{Error, Result};

/// Token bucket only
pub const VERSION_1: u8 = 1;

/// Adds per-stream windows carried by UPD
pub const VERSION_2: u8 = 2;

/// Size of the UPD payload: |consumed(4)|window(4)|, little-endian
pub const UPD_SIZE: usize = 8;

/// Window assumed for the peer until its first UPD arrives
pub const INITIAL_PEER_WINDOW: u32 = 262_144;

/// Frame commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cmd {
    /// Stream open
    Syn = 0,
    /// Stream close, a.k.a. EOF mark
    Fin = 1,
    /// Data push
    Psh = 2,
    /// No operation, keepalive
    Nop = 3,
    /// Bytes consumed by the peer and its window
    Upd = 4,
}

impl Cmd {
    /// Commands whose payload travels sealed
    pub fn carries_payload(self) -> bool {
        matches!(self, Cmd::Psh | Cmd::Upd)
    }
}

impl TryFrom<u8> for Cmd {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Cmd::Syn),
            1 => Ok(Cmd::Fin),
            2 => Ok(Cmd::Psh),
            3 => Ok(Cmd::Nop),
            4 => Ok(Cmd::Upd),
            other => Err(Error::Protocol(format!("unknown command 0x{:02x}", other))),
        }
    }
}

/// A frame waiting to be sealed and written, or just read and opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub cmd: Cmd,
    pub stream_id: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(version: u8, cmd: Cmd, stream_id: u32) -> Self {
        Self {
            version,
            cmd,
            stream_id,
            data: Bytes::new(),
        }
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }
}

/// UPD payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    /// Total bytes the sender of the UPD has read from the stream
    pub consumed: u32,
    /// Receive window the sender of the UPD grants
    pub window: u32,
}

impl WindowUpdate {
    pub fn encode(&self) -> [u8; UPD_SIZE] {
        let mut buf = [0u8; UPD_SIZE];
        buf[..4].copy_from_slice(&self.consumed.to_le_bytes());
        buf[4..].copy_from_slice(&self.window.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != UPD_SIZE {
            return Err(Error::Protocol(format!(
                "window update must be {} bytes, got {}",
                UPD_SIZE,
                data.len()
            )));
        }
        Ok(Self {
            consumed: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            window: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_codes() {
        for (code, cmd) in [(0u8, Cmd::Syn), (1, Cmd::Fin), (2, Cmd::Psh), (3, Cmd::Nop), (4, Cmd::Upd)] {
            assert_eq!(cmd as u8, code);
            assert_eq!(Cmd::try_from(code).unwrap(), cmd);
        }
        assert!(matches!(Cmd::try_from(5), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_payload_commands() {
        assert!(Cmd::Psh.carries_payload());
        assert!(Cmd::Upd.carries_payload());
        assert!(!Cmd::Syn.carries_payload());
        assert!(!Cmd::Nop.carries_payload());
    }

    #[test]
    fn test_window_update_layout() {
        let upd = WindowUpdate { consumed: 0x0102_0304, window: 65536 };
        let raw = upd.encode();
        assert_eq!(&raw[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(WindowUpdate::decode(&raw).unwrap(), upd);
        assert!(WindowUpdate::decode(&raw[..7]).is_err());
    }
}
