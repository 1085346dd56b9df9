//! Raw byte channels for rpcprims.
//!
//! A [`Transport`] moves bytes for a [`ChannelId`] and is allowed to move
//! fewer bytes than asked, including none at all. Everything above this
//! layer (framing, integrity, call correlation) lives in other crates.
//!
//! Two implementations ship here:
//! - [`StreamTransport`] over any `Read`/`Write` pair (serial ports, sockets, pipes)
//! - [`MemoryTransport`] for in-process links and tests

pub mod channel;
pub mod error;
pub mod memory;
pub mod traits;

pub use channel::ChannelId;
pub use error::{Result, TransportError};
pub use memory::MemoryTransport;
pub use traits::{StreamTransport, Transport};
