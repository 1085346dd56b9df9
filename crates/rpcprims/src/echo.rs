//! Echo service: answers `echo` with its argument and counts `notify` calls.

use std::sync::atomic::{AtomicU64, Ordering};

use rpcprims_codec::MethodId;
use rpcprims_rpc::{Invocation, MethodRef, Result, RpcError, Service};
use tracing::info;

pub const ECHO_SERVICE_ID: u32 = 1;

/// Reply with the string argument unchanged.
pub const ECHO: MethodRef = MethodRef::new(ECHO_SERVICE_ID, MethodId::from_name("echo"));

/// Oneway: log the string argument.
pub const NOTIFY: MethodRef = MethodRef::new(ECHO_SERVICE_ID, MethodId::from_name("notify"));

#[derive(Debug, Default)]
pub struct EchoService {
    notifications: AtomicU64,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `notify` calls handled so far.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl Service for EchoService {
    fn service_id(&self) -> u32 {
        ECHO_SERVICE_ID
    }

    fn handle_invocation(&self, invocation: &mut Invocation<'_>) -> Result<()> {
        let method = invocation.header().method_id;
        let text = invocation.args().read_string()?;
        if method == ECHO.method_id {
            invocation.reply()?.write_string(&text)?;
            Ok(())
        } else if method == NOTIFY.method_id {
            self.notifications.fetch_add(1, Ordering::Relaxed);
            info!(size = text.len(), "notify: {text}");
            Ok(())
        } else {
            Err(RpcError::Handler(format!("echo has no method {method}")))
        }
    }
}
