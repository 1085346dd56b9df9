use std::fmt;

use rpcprims_codec::{Codec, MethodId};
use rpcprims_transport::ChannelId;
use serde::Serialize;
use tracing::warn;

/// Lifecycle of a [`RequestContext`].
///
/// `Invalid → Valid → Sending → Sent → (Done | Pending → Done)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    #[default]
    Invalid,
    Valid,
    Sending,
    Sent,
    /// Sent and waiting for its reply.
    Pending,
    Done,
}

/// Target of a call: a service and one of its methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub service_id: u32,
    pub method_id: MethodId,
}

impl MethodRef {
    pub const fn new(service_id: u32, method_id: MethodId) -> Self {
        Self {
            service_id,
            method_id,
        }
    }
}

/// One outbound call and the codec it is encoded in.
///
/// Created by [`ClientManager::create_request`](crate::ClientManager::create_request)
/// and handed back with
/// [`ClientManager::release_request`](crate::ClientManager::release_request).
/// Dropping a context without releasing it loses its buffer and codec.
#[derive(Default)]
pub struct RequestContext {
    pub(crate) channel: ChannelId,
    pub(crate) sequence: u32,
    pub(crate) method: Option<MethodRef>,
    pub(crate) codec: Option<Box<dyn Codec>>,
    pub(crate) oneway: bool,
    pub(crate) state: RequestState,
}

impl RequestContext {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn method(&self) -> Option<MethodRef> {
        self.method
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Codec for writing arguments before the call and reading results after.
    pub fn codec(&mut self) -> Option<&mut dyn Codec> {
        let codec: &mut dyn Codec = self.codec.as_deref_mut()?;
        Some(codec)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("channel", &self.channel)
            .field("sequence", &self.sequence)
            .field("method", &self.method)
            .field("oneway", &self.oneway)
            .field("state", &self.state)
            .field("has_codec", &self.codec.is_some())
            .finish()
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if self.codec.is_some() {
            warn!(
                channel = %self.channel,
                sequence = self.sequence,
                state = ?self.state,
                "request dropped without release"
            );
        }
    }
}
