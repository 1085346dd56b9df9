use rpcprims_frame::FrameConfig;
use serde::{Deserialize, Serialize};

/// How servers decide whether a client call is nested inside dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadingMode {
    /// Single-threaded: any call made while dispatching is nested.
    None,
    /// Cooperative scheduler: same rule as `None`.
    Cooperative,
    /// OS threads: only calls from the dispatching thread are nested.
    #[default]
    Preemptive,
}

/// Configuration shared by clients, servers and the server registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub threading: ThreadingMode,
    /// Hold a per-channel lock across the send and receive of each
    /// non-oneway call.
    pub per_channel_lock: bool,
    /// Slots in a [`ServerRegistry`](crate::ServerRegistry).
    pub max_servers: usize,
    pub frame: FrameConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            threading: ThreadingMode::default(),
            per_channel_lock: true,
            max_servers: 4,
            frame: FrameConfig::default(),
        }
    }
}
