//! Proxy Protocol Layer
//!
//! The tunnel itself carries opaque bytes. The server end of each mux
//! stream speaks SOCKS5 to learn where the bytes should go.

pub mod socks5;

pub use socks5::Reply as Socks5Reply;
