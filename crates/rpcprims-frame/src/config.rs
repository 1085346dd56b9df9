use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crc::{Crc16, ReferenceCrc16, TableCrc16, DEFAULT_CRC_START};

/// Which CRC-16 implementation a framed transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrcAlgorithm {
    /// Bit-at-a-time.
    #[default]
    Reference,
    /// Table driven.
    Fast,
}

/// Configuration for a [`FramedTransport`](crate::FramedTransport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub crc: CrcAlgorithm,
    /// CRC start value. Both ends must use the same one.
    pub crc_start: u16,
    /// Consecutive zero-byte transfers tolerated before an operation
    /// reports [`FrameError::Stalled`](crate::FrameError::Stalled).
    pub max_idle_retries: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            crc: CrcAlgorithm::default(),
            crc_start: DEFAULT_CRC_START,
            max_idle_retries: 64,
        }
    }
}

impl FrameConfig {
    pub fn with_crc(mut self, crc: CrcAlgorithm) -> Self {
        self.crc = crc;
        self
    }

    pub fn with_crc_start(mut self, crc_start: u16) -> Self {
        self.crc_start = crc_start;
        self
    }

    pub fn with_max_idle_retries(mut self, retries: u32) -> Self {
        self.max_idle_retries = retries;
        self
    }

    /// Build the configured CRC strategy.
    pub fn crc16(&self) -> Arc<dyn Crc16> {
        crc16_for(self.crc, self.crc_start)
    }
}

/// Build a CRC strategy for `algorithm` starting at `start`.
pub fn crc16_for(algorithm: CrcAlgorithm, start: u16) -> Arc<dyn Crc16> {
    match algorithm {
        CrcAlgorithm::Reference => Arc::new(ReferenceCrc16::new(start)),
        CrcAlgorithm::Fast => Arc::new(TableCrc16::new(start)),
    }
}
