//! Shroud - an obfuscated, encrypted multiplexing tunnel
//!
//! # Architecture
//!
//! ```text
//! local TCP ─► TunnelClient ─► mux Stream ═╗
//!                                          ║ one Session per TCP connection
//!                                          ║ (masked headers, sealed payloads)
//! target TCP ◄─ SOCKS5 ◄─ TunnelServer ◄═══╝
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Address, boxed streams, bidirectional relay
//! ├── crypto/          # Keyring, nonce counters, payload sealing
//! ├── mux/             # Header codec, frames, Session and Stream
//! ├── protocol/        # SOCKS5 CONNECT negotiation
//! ├── transport/       # TCP connect/listen
//! └── app/             # TunnelClient, TunnelServer
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod mux;
pub mod protocol;
pub mod app;

// Supporting modules
pub mod config;
pub mod crypto;

// Re-exports for convenience
pub use common::Address;
pub use config::Config;
pub use error::{Error, Result};

pub use app::{TunnelClient, TunnelServer};
pub use mux::{MuxConfig, Role, Session, Stream};
pub use transport::Transport;
