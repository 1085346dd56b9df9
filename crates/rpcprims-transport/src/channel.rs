//! Channel identifiers.
//!
//! A channel selects a logical link on a transport and scopes call
//! correlation. Identifiers are plain 32-bit values; named channels are
//! hashed with FNV-1a so both ends derive the same id from the same name.

use std::fmt;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Opaque, equality-comparable channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChannelId(u32);

impl ChannelId {
    /// The default channel, used by single-link transports.
    pub const DEFAULT: ChannelId = ChannelId(0);

    /// Create a channel id from a raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Derive a channel id from a name.
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

    /// Raw identifier value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for ChannelId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<u16> for ChannelId {
    fn from(raw: u16) -> Self {
        Self(raw as u32)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
