use rpcprims_transport::{ChannelId, TransportError};

/// Errors that can occur while sending or receiving frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The underlying byte channel failed.
    #[error("frame transport error: {0}")]
    Transport(#[from] TransportError),

    /// The three redundant size fields of a received header disagree.
    #[error("corrupted frame header (sizes {sizes:?})")]
    CorruptedHeader { sizes: [u16; 3] },

    /// The payload CRC does not match the header.
    #[error("frame CRC mismatch (header {expected:#06x}, computed {actual:#06x})")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Too many consecutive zero-byte transfers. Progress is kept and the
    /// same operation can be resumed.
    #[error("channel {channel} stalled after {transferred} of {expected} bytes")]
    Stalled {
        channel: ChannelId,
        transferred: usize,
        expected: usize,
    },

    /// The buffer factory could not provide room for the declared payload.
    #[error("no buffer available for a {requested}-byte payload")]
    Allocation { requested: usize },

    /// A partially transferred frame is pending and the call did not match it.
    #[error("a partial frame on channel {channel} must be resumed first")]
    ResumeMismatch { channel: ChannelId },
}

impl FrameError {
    /// True for integrity failures (redundant size disagreement or CRC).
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            FrameError::CorruptedHeader { .. } | FrameError::CrcMismatch { .. }
        )
    }

    /// True when the operation can be resumed by calling it again.
    pub fn is_stalled(&self) -> bool {
        matches!(self, FrameError::Stalled { .. })
    }

    /// True when the channel is gone for good.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, FrameError::Transport(err) if err.is_disconnect())
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
