//! Stream multiplexing
//!
//! A [`Session`] carries many [`Stream`]s over one physical connection.
//! Every frame on the wire is a 20-byte masked header (see [`codec`])
//! followed by an XChaCha20-Poly1305 sealed payload for PSH and UPD.
//!
//! ```text
//! Stream::write -> shaper (ordered by seq) -> send loop -> seal + mask -> conn
//! conn -> recv loop -> unmask + open -> stream buffer -> Stream::read
//! ```

pub mod codec;
mod config;
pub mod frame;
mod session;
mod shaper;
mod signal;
mod stream;

pub use codec::{Header, HeaderCodec, HEADER_SIZE};
pub use config::MuxConfig;
pub use frame::{Cmd, Frame, WindowUpdate, VERSION_1, VERSION_2};
pub use session::{Role, Session};
pub use stream::Stream;
