/// Errors that can occur on a raw byte channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// An I/O error occurred on the underlying stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the channel; no further bytes will arrive.
    #[error("channel closed by peer")]
    Closed,

    /// The transport has been shut down locally.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// True when the channel can never transfer again.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::Shutdown)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
