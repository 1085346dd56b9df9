/// Errors raised while encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Fewer bytes left than the value needs.
    #[error("message truncated: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// The envelope was written by an incompatible codec version.
    #[error("unsupported codec version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid message type {0}")]
    InvalidMessageType(u8),

    #[error("string is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Writing would grow the buffer past its limit.
    #[error("buffer overrun: need {needed} bytes, {remaining} remaining")]
    BufferOverrun { needed: usize, remaining: usize },

    /// The codec has no buffer attached.
    #[error("codec has no buffer")]
    NoBuffer,
}

pub type Result<T> = std::result::Result<T, CodecError>;
