//! Transport Layer
//!
//! Raw byte transport only: establishing and accepting connections.
//! No encryption and no protocol parsing happen here.

mod tcp;

pub use tcp::TcpTransport;

use async_trait::async_trait;

use crate::common::{Address, BoxedStream, Result};

/// Transport trait for establishing raw connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote address
    async fn connect(&self, addr: &Address) -> Result<BoxedStream>;

    /// Create a listener bound to an address
    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>>;
}

/// Listener trait for accepting incoming connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new connection
    async fn accept(&self) -> Result<(BoxedStream, Address)>;

    /// Get the local bound address
    fn local_addr(&self) -> Result<Address>;
}
