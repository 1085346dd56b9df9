//! Request/reply runtime on top of framed channels.
//!
//! A [`ClientManager`] sends invocations and matches replies by sequence
//! number. A [`SimpleServer`] receives requests on one channel, dispatches
//! them to registered [`Service`]s and answers them, one state transition
//! per [`poll`](SimpleServer::poll). A [`ServerRegistry`] holds a fixed
//! number of servers addressed by [`ServerId`].
//!
//! A client attached to a server with [`ClientManager::with_server`] can
//! call out from inside a service handler: while it waits for its reply it
//! keeps serving requests arriving on the same channel.

pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod request;
mod resources;
pub mod server;
pub mod service;

pub use client::{ClientManager, ErrorHandler};
pub use config::{RpcConfig, ThreadingMode};
pub use error::{Result, RpcError, Status};
pub use registry::{ServerId, ServerRegistry};
pub use request::{MethodRef, RequestContext, RequestState};
pub use server::{ServerState, SimpleServer};
pub use service::{Invocation, Service};
