use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};

use rpcprims_codec::{Codec, CodecFactory, MessageHeader, MessageType, MethodId};
use rpcprims_frame::{MessageBufferFactory, MessageTransport};
use rpcprims_transport::ChannelId;
use tracing::{debug, trace, warn};

use crate::config::RpcConfig;
use crate::error::{Result, RpcError, Status};
use crate::request::{MethodRef, RequestContext, RequestState};
use crate::resources::{receive_message, send_message, Resources};
use crate::server::SimpleServer;

/// Callback notified after a failed call.
pub type ErrorHandler = Arc<dyn Fn(Status, MethodId) + Send + Sync>;

/// Issues calls and matches each one with its reply.
///
/// Every request gets the next sequence number; the reply must echo it.
/// When a [`SimpleServer`] is attached and a call is made from inside one
/// of its handlers, the call waits by serving that server's channel
/// instead of blocking on a plain receive.
pub struct ClientManager {
    transport: Arc<dyn MessageTransport>,
    resources: Resources,
    sequence: AtomicU32,
    error_handler: RwLock<Option<ErrorHandler>>,
    server: RwLock<Option<Weak<SimpleServer>>>,
    channel_locks: Option<ChannelLocks>,
}

impl ClientManager {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        buffers: Arc<dyn MessageBufferFactory>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        Self {
            transport,
            resources: Resources { buffers, codecs },
            sequence: AtomicU32::new(0),
            error_handler: RwLock::new(None),
            server: RwLock::new(None),
            channel_locks: Some(ChannelLocks::default()),
        }
    }

    /// Apply the per-channel lock setting from `config`.
    pub fn with_config(mut self, config: &RpcConfig) -> Self {
        self.channel_locks = config.per_channel_lock.then(ChannelLocks::default);
        self
    }

    /// Continue numbering after `sequence`.
    pub fn with_last_sequence(self, sequence: u32) -> Self {
        self.sequence.store(sequence, Ordering::Relaxed);
        self
    }

    /// Attach the server to re-enter for nested calls.
    pub fn with_server(self, server: &Arc<SimpleServer>) -> Self {
        self.set_server(Some(server));
        self
    }

    pub fn set_server(&self, server: Option<&Arc<SimpleServer>>) {
        *self.server.write().unwrap_or_else(PoisonError::into_inner) = server.map(Arc::downgrade);
    }

    pub fn set_error_handler(&self, handler: impl Fn(Status, MethodId) + Send + Sync + 'static) {
        *self
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn clear_error_handler(&self) {
        *self
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Notify the error handler, if one is registered.
    pub fn call_error_handler(&self, status: Status, method_id: MethodId) {
        let handler = self
            .error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(status, method_id),
            None => trace!(?status, %method_id, "no error handler registered"),
        }
    }

    /// Allocate a request and write its envelope.
    ///
    /// Fails with [`RpcError::Allocation`] before any I/O if no buffer or
    /// codec is available.
    pub fn create_request(
        &self,
        channel: ChannelId,
        method: MethodRef,
        oneway: bool,
    ) -> Result<RequestContext> {
        let mut codec = self.resources.allocate()?;
        let sequence = self.next_sequence();
        let msg_type = if oneway {
            MessageType::Oneway
        } else {
            MessageType::Invocation
        };
        let header = MessageHeader::new(msg_type, method.service_id, method.method_id, sequence);
        if let Err(err) = codec.start_write_message(&header) {
            self.resources.dispose(codec);
            return Err(err.into());
        }

        trace!(%channel, sequence, oneway, "request created");
        Ok(RequestContext {
            channel,
            sequence,
            method: Some(method),
            codec: Some(codec),
            oneway,
            state: RequestState::Valid,
        })
    }

    /// Send the request and, unless it is oneway, wait for its reply.
    ///
    /// On success the request is `Done` and its codec is positioned after
    /// the reply envelope.
    pub fn perform_request(&self, request: &mut RequestContext) -> Result<()> {
        if request.state != RequestState::Valid {
            return Err(RpcError::InvalidRequestState {
                expected: RequestState::Valid,
                actual: request.state,
            });
        }
        let _guard = match &self.channel_locks {
            Some(locks) if !request.oneway => Some(locks.acquire(request.channel)),
            _ => None,
        };
        let channel = request.channel;
        let Some(codec) = request.codec.as_deref_mut() else {
            return Err(RpcError::Allocation("codec"));
        };

        request.state = RequestState::Sending;
        if let Err(err) = send_message(self.transport.as_ref(), channel, codec) {
            if err.is_stalled() {
                self.transport.abandon_send();
            }
            return Err(err);
        }
        request.state = RequestState::Sent;

        if request.oneway {
            request.state = RequestState::Done;
            debug!(%channel, sequence = request.sequence, "oneway request sent");
            return Ok(());
        }
        request.state = RequestState::Pending;

        match self.nested_server() {
            Some(server) => {
                trace!(%channel, sequence = request.sequence, "waiting for reply inside dispatch");
                let mut reply = codec
                    .take_buffer()
                    .ok_or(RpcError::Allocation("message buffer"))?;
                let outcome = server.run_until_reply(channel, request.sequence, &mut reply);
                codec.set_buffer(reply);
                outcome?;
            }
            None => {
                if let Err(err) = receive_message(self.transport.as_ref(), channel, codec) {
                    if err.is_stalled() {
                        self.transport.abandon_receive();
                    }
                    return Err(err);
                }
            }
        }

        verify_reply(codec, request.sequence)?;
        request.state = RequestState::Done;
        debug!(%channel, sequence = request.sequence, "reply received");
        Ok(())
    }

    /// Return the request's codec and buffer to their factories.
    pub fn release_request(&self, mut request: RequestContext) {
        if let Some(codec) = request.codec.take() {
            self.resources.dispose(codec);
        }
        request.state = RequestState::Invalid;
    }

    /// Make a call and decode its result.
    ///
    /// `write_args` encodes the arguments after the envelope; `read_reply`
    /// decodes the result after the reply envelope. The request is always
    /// released, and the error handler is notified on failure.
    pub fn call<T>(
        &self,
        channel: ChannelId,
        method: MethodRef,
        write_args: impl FnOnce(&mut dyn Codec) -> rpcprims_codec::Result<()>,
        read_reply: impl FnOnce(&mut dyn Codec) -> rpcprims_codec::Result<T>,
    ) -> Result<T> {
        let result = self
            .create_request(channel, method, false)
            .and_then(|mut request| {
                let outcome = self.send_with_args(&mut request, write_args).and_then(|()| {
                    let codec = request.codec().ok_or(RpcError::Allocation("codec"))?;
                    Ok(read_reply(codec)?)
                });
                self.release_request(request);
                outcome
            });
        self.notify_on_error(&result, method);
        result
    }

    /// Make a oneway call.
    pub fn call_oneway(
        &self,
        channel: ChannelId,
        method: MethodRef,
        write_args: impl FnOnce(&mut dyn Codec) -> rpcprims_codec::Result<()>,
    ) -> Result<()> {
        let result = self
            .create_request(channel, method, true)
            .and_then(|mut request| {
                let outcome = self.send_with_args(&mut request, write_args);
                self.release_request(request);
                outcome
            });
        self.notify_on_error(&result, method);
        result
    }

    fn send_with_args(
        &self,
        request: &mut RequestContext,
        write_args: impl FnOnce(&mut dyn Codec) -> rpcprims_codec::Result<()>,
    ) -> Result<()> {
        let codec = request.codec().ok_or(RpcError::Allocation("codec"))?;
        write_args(codec)?;
        self.perform_request(request)
    }

    fn notify_on_error<T>(&self, result: &Result<T>, method: MethodRef) {
        if let Err(err) = result {
            warn!(service_id = method.service_id, method_id = %method.method_id, "call failed: {err}");
            self.call_error_handler(err.status(), method.method_id);
        }
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn nested_server(&self) -> Option<Arc<SimpleServer>> {
        let server = self
            .server
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()?
            .upgrade()?;
        server.is_server_thread().then_some(server)
    }
}

/// Check that the message in `codec` is the reply to `sequence`.
fn verify_reply(codec: &mut dyn Codec, sequence: u32) -> Result<()> {
    let header = codec.start_read_message()?;
    if header.msg_type != MessageType::Reply {
        warn!(sequence, msg_type = ?header.msg_type, "expected a reply");
        return Err(RpcError::UnexpectedReplyType(header.msg_type));
    }
    if header.sequence != sequence {
        warn!(expected = sequence, actual = header.sequence, "reply sequence mismatch");
        return Err(RpcError::SequenceMismatch {
            expected: sequence,
            actual: header.sequence,
        });
    }
    Ok(())
}

/// Per-channel locks, reentrant for the owning thread.
#[derive(Default)]
struct ChannelLocks {
    owners: Mutex<HashMap<ChannelId, (ThreadId, usize)>>,
    released: Condvar,
}

impl ChannelLocks {
    fn acquire(&self, channel: ChannelId) -> ChannelGuard<'_> {
        let me = thread::current().id();
        let mut owners = lock(&self.owners);
        loop {
            let owner = owners.get(&channel).map(|(owner, _)| *owner);
            match owner {
                None => {
                    owners.insert(channel, (me, 1));
                    break;
                }
                Some(owner) if owner == me => {
                    if let Some((_, depth)) = owners.get_mut(&channel) {
                        *depth += 1;
                    }
                    break;
                }
                Some(_) => {
                    trace!(%channel, "waiting for channel lock");
                    owners = self
                        .released
                        .wait(owners)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        ChannelGuard {
            locks: self,
            channel,
        }
    }
}

struct ChannelGuard<'a> {
    locks: &'a ChannelLocks,
    channel: ChannelId,
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        let mut owners = lock(&self.locks.owners);
        let released = match owners.get_mut(&self.channel) {
            Some((_, depth)) if *depth > 1 => {
                *depth -= 1;
                false
            }
            _ => true,
        };
        if released {
            owners.remove(&self.channel);
            drop(owners);
            self.locks.released.notify_all();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
