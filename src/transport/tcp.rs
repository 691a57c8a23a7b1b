//! TCP Transport implementation

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

use crate::common::{Address, BoxedStream, Result};
use crate::error::Error;

use super::{Listener, Transport};

/// TCP transport - raw TCP connections with TCP_NODELAY
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail dials that take longer than `timeout` with `Error::Timeout`
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    async fn dial(addr: &Address) -> Result<TcpStream> {
        let stream = match addr {
            Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await?,
            Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await?,
        };
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &Address) -> Result<BoxedStream> {
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, Self::dial(addr))
                .await
                .map_err(|_| Error::Timeout)??,
            None => Self::dial(addr).await?,
        };

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;
        trace!("tcp connected to {}", addr);

        Ok(Box::new(stream))
    }

    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>> {
        let listener = match addr {
            Address::Socket(socket_addr) => TcpListener::bind(socket_addr).await?,
            Address::Domain(domain, port) => TcpListener::bind((domain.as_str(), *port)).await?,
        };
        Ok(Box::new(TcpListenerWrapper { listener }))
    }
}

/// Wrapper for TcpListener to implement Listener trait
struct TcpListenerWrapper {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerWrapper {
    async fn accept(&self) -> Result<(BoxedStream, Address)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), Address::Socket(addr)))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.listener.local_addr()?))
    }
}
