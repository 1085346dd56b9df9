//! Message envelopes and value serialization.
//!
//! A [`Codec`] owns the [`MessageBuffer`](rpcprims_frame::MessageBuffer) it
//! writes into or reads from. Every message starts with a
//! [`MessageHeader`]: message type, service id, method id and sequence
//! number. Arguments and results follow as typed values.

pub mod basic;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod factory;

pub use basic::BasicCodec;
pub use codec::Codec;
pub use envelope::{MessageHeader, MessageType, MethodId, CODEC_VERSION, ENVELOPE_SIZE};
pub use error::{CodecError, Result};
pub use factory::{BasicCodecFactory, CodecFactory, CodecStats};
