use std::fmt;
use std::io;

use rpcprims_frame::FrameError;
use rpcprims_rpc::{RpcError, Status};
use rpcprims_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const CONFIG_INVALID: i32 = 78;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    match err {
        RpcError::Transport(err) | RpcError::Frame(FrameError::Transport(err)) => {
            transport_error(context, err)
        }
        RpcError::Frame(FrameError::Stalled { .. }) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        other => {
            let code = match other.status() {
                Status::TransportFailure => TRANSPORT_ERROR,
                Status::CrcCheckFailed | Status::SequenceMismatch | Status::ProtocolFailure => {
                    DATA_INVALID
                }
                Status::ServiceFailure => FAILURE,
                Status::InvalidState => USAGE,
                Status::AllocationFailure => INTERNAL,
            };
            CliError::new(code, format!("{context}: {other}"))
        }
    }
}
