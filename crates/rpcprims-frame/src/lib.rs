//! Integrity-checked message framing over partial-transfer byte channels.
//!
//! Every message travels as one frame:
//! - the payload size, three times, as 16-bit host-order integers
//! - a CRC-16 of the payload
//! - the payload itself (at most 65535 bytes)
//!
//! [`FramedTransport`] retries short transfers until a frame is complete and
//! rejects frames whose size copies disagree or whose checksum is wrong.

pub mod buffer;
pub mod config;
pub mod crc;
pub mod error;
pub mod framed;
pub mod header;

pub use buffer::{
    BufferStats, DynamicBufferFactory, MessageBuffer, MessageBufferFactory, PooledBufferFactory,
    MAX_MESSAGE_SIZE,
};
pub use config::{crc16_for, CrcAlgorithm, FrameConfig};
pub use crc::{Crc16, ReferenceCrc16, TableCrc16, DEFAULT_CRC_START};
pub use error::{FrameError, Result};
pub use framed::{FramedTransport, MessageTransport};
pub use header::{FrameHeader, HEADER_SIZE};
