//! CRC-16 strategies.
//!
//! Polynomial 0x1021, MSB first, no reflection, no final xor. The start
//! value is configurable and defaults to [`DEFAULT_CRC_START`]; both ends of
//! a link must agree on it.

/// Start value used when none is configured.
pub const DEFAULT_CRC_START: u16 = 0xEF4A;

const POLYNOMIAL: u16 = 0x1021;

/// A CRC-16 function over a byte slice.
pub trait Crc16: Send + Sync {
    fn compute(&self, data: &[u8]) -> u16;

    /// The configured start value.
    fn start(&self) -> u16;
}

/// Bit-at-a-time implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceCrc16 {
    start: u16,
}

impl ReferenceCrc16 {
    pub const fn new(start: u16) -> Self {
        Self { start }
    }
}

impl Default for ReferenceCrc16 {
    fn default() -> Self {
        Self::new(DEFAULT_CRC_START)
    }
}

impl Crc16 for ReferenceCrc16 {
    fn compute(&self, data: &[u8]) -> u16 {
        let mut crc = u32::from(self.start);
        for &byte in data {
            crc ^= u32::from(byte) << 8;
            for _ in 0..8 {
                let carry = crc & 0x8000 != 0;
                crc <<= 1;
                if carry {
                    crc ^= u32::from(POLYNOMIAL);
                }
            }
        }
        crc as u16
    }

    fn start(&self) -> u16 {
        self.start
    }
}

/// Byte-at-a-time implementation using a 256-entry table.
#[derive(Debug, Clone)]
pub struct TableCrc16 {
    start: u16,
    table: [u16; 256],
}

impl TableCrc16 {
    pub const fn new(start: u16) -> Self {
        Self {
            start,
            table: build_table(),
        }
    }
}

impl Default for TableCrc16 {
    fn default() -> Self {
        Self::new(DEFAULT_CRC_START)
    }
}

impl Crc16 for TableCrc16 {
    fn compute(&self, data: &[u8]) -> u16 {
        data.iter().fold(self.start, |crc, &byte| {
            let index = ((crc >> 8) ^ u16::from(byte)) & 0xff;
            (crc << 8) ^ self.table[index as usize]
        })
    }

    fn start(&self) -> u16 {
        self.start
    }
}

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}
