//! Common types and abstractions
//!
//! - Address: destination / listen address representation
//! - BoxedStream: type-erased async byte stream
//! - relay: bidirectional copy with half-close propagation

mod address;
mod pipe;
mod stream;

pub use address::Address;
pub use pipe::{relay, PipeStats};
pub use stream::{AsyncReadWrite, BoxedStream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
