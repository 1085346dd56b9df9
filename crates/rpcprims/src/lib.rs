//! Embedded-style RPC over framed, CRC-checked byte channels.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte channels that may move fewer bytes than asked
//! - [`frame`]: size-tripled, CRC-16 checked message frames
//! - [`codec`]: message envelope and typed field encoding
//! - [`rpc`]: clients, steppable servers and the server registry
//! - [`echo`]: a small service used by the CLI and the demos

pub mod echo;

/// Re-export transport types.
pub mod transport {
    pub use rpcprims_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rpcprims_frame::*;
}

/// Re-export codec types.
pub mod codec {
    pub use rpcprims_codec::*;
}

/// Re-export client and server types.
pub mod rpc {
    pub use rpcprims_rpc::*;
}
