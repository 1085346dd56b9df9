//! The message envelope that precedes every call, reply and notification.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Encoded envelope length for [`BasicCodec`](crate::BasicCodec).
pub const ENVELOPE_SIZE: usize = 16;

/// Envelope format version written by [`BasicCodec`](crate::BasicCodec).
pub const CODEC_VERSION: u8 = 1;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Kind of message carried in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MessageType {
    /// A call that expects a reply.
    Invocation = 0,
    /// A call that expects no reply.
    Oneway = 1,
    Reply = 2,
    Notification = 3,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(MessageType::Invocation),
            1 => Ok(MessageType::Oneway),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Notification),
            other => Err(CodecError::InvalidMessageType(other)),
        }
    }
}

/// Identifier of a method within a service.
///
/// Stub generators usually derive it from the method name, so
/// [`MethodId::from_name`] hashes names with 32-bit FNV-1a.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MethodId(u32);

impl MethodId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash = FNV_OFFSET_BASIS;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
            i += 1;
        }
        Self(hash)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for MethodId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Decoded message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub service_id: u32,
    pub method_id: MethodId,
    /// Correlates a reply with its invocation.
    pub sequence: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, service_id: u32, method_id: MethodId, sequence: u32) -> Self {
        Self {
            msg_type,
            service_id,
            method_id,
            sequence,
        }
    }

    /// The reply envelope answering this message.
    pub fn reply(&self) -> Self {
        Self {
            msg_type: MessageType::Reply,
            ..*self
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.msg_type == MessageType::Oneway
    }
}
