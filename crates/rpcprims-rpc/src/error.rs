use rpcprims_codec::{CodecError, MessageType, MethodId};
use rpcprims_frame::FrameError;
use rpcprims_transport::TransportError;
use serde::Serialize;

use crate::registry::ServerId;
use crate::request::RequestState;

/// Coarse outcome reported to error handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// A buffer or codec factory was exhausted.
    AllocationFailure,
    /// I/O error, closed channel or stalled transfer.
    TransportFailure,
    /// Redundant header sizes disagree or the payload CRC is wrong.
    CrcCheckFailed,
    /// The reply was missing, of the wrong type or for another call.
    SequenceMismatch,
    /// Malformed envelope or unexpected message.
    ProtocolFailure,
    /// A service handler failed.
    ServiceFailure,
    /// API misuse, such as performing a request twice.
    InvalidState,
}

/// Errors that can occur in client and server operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// A buffer or codec could not be obtained.
    #[error("no {0} available")]
    Allocation(&'static str),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// A message of this type is not valid where it arrived.
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageType),

    /// A reply arrived but with the wrong type.
    #[error("expected a reply, got {0:?}")]
    UnexpectedReplyType(MessageType),

    /// A reply arrived for another call.
    #[error("reply sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u32, actual: u32 },

    /// A handler reported failure. Raised by service implementations.
    #[error("{0}")]
    Handler(String),

    /// Dispatch to a service failed.
    #[error("service {service_id} method {method_id} failed: {source}")]
    Service {
        service_id: u32,
        method_id: MethodId,
        #[source]
        source: Box<RpcError>,
    },

    #[error("no service registered with id {0}")]
    UnknownService(u32),

    #[error("request is {actual:?}, expected {expected:?}")]
    InvalidRequestState {
        expected: RequestState,
        actual: RequestState,
    },

    #[error("server stopped")]
    ServerStopped,

    #[error("no server registered as {0}")]
    ServerNotFound(ServerId),

    #[error("server registry full ({0} slots)")]
    RegistryFull(usize),
}

impl RpcError {
    pub fn status(&self) -> Status {
        match self {
            RpcError::Allocation(_) => Status::AllocationFailure,
            RpcError::Frame(FrameError::Allocation { .. }) => Status::AllocationFailure,
            RpcError::Frame(err) if err.is_integrity() => Status::CrcCheckFailed,
            RpcError::Frame(_) | RpcError::Transport(_) => Status::TransportFailure,
            RpcError::Protocol(_) | RpcError::UnexpectedMessage(_) => Status::ProtocolFailure,
            RpcError::UnexpectedReplyType(_) | RpcError::SequenceMismatch { .. } => {
                Status::SequenceMismatch
            }
            RpcError::Handler(_) | RpcError::Service { .. } | RpcError::UnknownService(_) => {
                Status::ServiceFailure
            }
            RpcError::InvalidRequestState { .. }
            | RpcError::ServerStopped
            | RpcError::ServerNotFound(_)
            | RpcError::RegistryFull(_) => Status::InvalidState,
        }
    }

    /// True when the underlying channel is gone for good.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RpcError::Transport(err) => err.is_disconnect(),
            RpcError::Frame(err) => err.is_disconnect(),
            _ => false,
        }
    }

    pub(crate) fn is_stalled(&self) -> bool {
        matches!(self, RpcError::Frame(err) if err.is_stalled())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
