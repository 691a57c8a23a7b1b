//! Stream abstraction
//!
//! Local TCP connections, tunnel connections and mux streams all end up as
//! a [`BoxedStream`] before being relayed.

use tokio::io::{AsyncRead, AsyncWrite};

/// Type-erased bidirectional byte stream
pub type BoxedStream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
