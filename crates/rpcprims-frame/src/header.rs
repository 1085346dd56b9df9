//! The 8-byte frame header.
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬────────────┐
//! │ size (2B)  │ size (2B)  │ size (2B)  │ crc16 (2B) │
//! └────────────┴────────────┴────────────┴────────────┘
//! ```
//!
//! The payload size is carried three times; a receiver rejects the frame
//! unless all three copies agree. Fields use host byte order, so both ends
//! of a link must share endianness.

/// Encoded header length in bytes.
pub const HEADER_SIZE: usize = 8;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// The three redundant copies of the payload size.
    pub sizes: [u16; 3],
    /// CRC-16 of the payload.
    pub crc: u16,
}

impl FrameHeader {
    /// Header for a `size`-byte payload with checksum `crc`.
    pub fn new(size: u16, crc: u16) -> Self {
        Self {
            sizes: [size; 3],
            crc,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        for (i, size) in self.sizes.iter().enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&size.to_ne_bytes());
        }
        out[6..8].copy_from_slice(&self.crc.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let field = |at: usize| u16::from_ne_bytes([bytes[at], bytes[at + 1]]);
        Self {
            sizes: [field(0), field(2), field(4)],
            crc: field(6),
        }
    }

    /// The payload size, or `None` if the redundant copies disagree.
    pub fn message_size(&self) -> Option<u16> {
        let [a, b, c] = self.sizes;
        (a == b && b == c).then_some(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_repeated() {
        let header = FrameHeader::new(300, 0xBEEF);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..2], &bytes[2..4]);
        assert_eq!(&bytes[2..4], &bytes[4..6]);
        assert_eq!(u16::from_ne_bytes([bytes[0], bytes[1]]), 300);
        assert_eq!(u16::from_ne_bytes([bytes[6], bytes[7]]), 0xBEEF);
        assert_eq!(FrameHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn disagreeing_sizes_are_rejected() {
        for position in 0..3 {
            let mut header = FrameHeader::new(10, 0);
            header.sizes[position] = 11;
            assert_eq!(header.message_size(), None);
        }
        assert_eq!(FrameHeader::new(10, 0).message_size(), Some(10));
    }
}
