//! Multiplexer tunables

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::TAG_SIZE;
use crate::error::{Error, Result};

use super::frame::{VERSION_1, VERSION_2};

/// Session configuration shared by both endpoints.
///
/// Both peers must agree on `version`; the buffer sizes are local choices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Protocol version: 1 (token bucket only) or 2 (adds per-stream windows)
    pub version: u8,

    /// Disable the NOP keepalive and dead-peer detection
    pub keep_alive_disabled: bool,

    /// NOP interval
    pub keep_alive_interval_ms: u64,

    /// Close the session if nothing arrived for this long
    pub keep_alive_timeout_ms: u64,

    /// Largest plaintext payload carried by one PSH frame
    pub max_frame_size: usize,

    /// Session-wide receive credit (initial token bucket)
    pub max_receive_buffer: usize,

    /// Per-stream receive window advertised with version 2
    pub max_stream_buffer: usize,

    /// Accepted clock skew for header timestamps; 0 disables the check
    pub replay_window_secs: u64,

    /// Streams opened by the peer and not yet accepted
    pub accept_backlog: usize,

    /// Pending write requests held by the shaper
    pub shaper_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            version: VERSION_1,
            keep_alive_disabled: false,
            keep_alive_interval_ms: 10_000,
            keep_alive_timeout_ms: 30_000,
            max_frame_size: 32 * 1024,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 64 * 1024,
            replay_window_secs: 180,
            accept_backlog: 1024,
            shaper_capacity: 1024,
        }
    }
}

impl MuxConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn replay_window(&self) -> Option<Duration> {
        (self.replay_window_secs > 0).then(|| Duration::from_secs(self.replay_window_secs))
    }

    /// Check the configuration for values the session cannot run with
    pub fn verify(&self) -> Result<()> {
        if self.version != VERSION_1 && self.version != VERSION_2 {
            return Err(Error::Config(format!("unsupported protocol version {}", self.version)));
        }
        if !self.keep_alive_disabled {
            if self.keep_alive_interval_ms == 0 {
                return Err(Error::Config("keep-alive interval must be positive".into()));
            }
            if self.keep_alive_timeout_ms < self.keep_alive_interval_ms {
                return Err(Error::Config(
                    "keep-alive timeout must be larger than keep-alive interval".into(),
                ));
            }
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("max frame size must be positive".into()));
        }
        if self.max_frame_size > u16::MAX as usize - TAG_SIZE {
            return Err(Error::Config(format!(
                "max frame size must not be larger than {}",
                u16::MAX as usize - TAG_SIZE
            )));
        }
        if self.max_receive_buffer == 0 {
            return Err(Error::Config("max receive buffer must be positive".into()));
        }
        if self.max_receive_buffer > i32::MAX as usize {
            return Err(Error::Config("max receive buffer must not exceed i32::MAX".into()));
        }
        if self.max_stream_buffer == 0 {
            return Err(Error::Config("max stream buffer must be positive".into()));
        }
        if self.max_stream_buffer > self.max_receive_buffer {
            return Err(Error::Config(
                "max stream buffer must not be larger than max receive buffer".into(),
            ));
        }
        if self.max_stream_buffer > i32::MAX as usize {
            return Err(Error::Config("max stream buffer must not exceed i32::MAX".into()));
        }
        if self.accept_backlog == 0 || self.shaper_capacity == 0 {
            return Err(Error::Config("accept backlog and shaper capacity must be positive".into()));
        }
        Ok(())
    }
}
