use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use rpcprims_codec::{Codec, CodecFactory, MessageHeader, MessageType};
use rpcprims_frame::{
    crc16_for, CrcAlgorithm, FrameError, MessageBuffer, MessageBufferFactory, MessageTransport,
};
use rpcprims_transport::ChannelId;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::{RpcConfig, ThreadingMode};
use crate::error::{Result, RpcError};
use crate::resources::{receive_message, send_message, Resources};
use crate::service::{Invocation, Service};

/// Position of a [`SimpleServer`] in its request cycle.
///
/// `SendDone → Receive → ReceiveDone → Process → ProcessDone → Send → SendDone`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Idle between requests.
    #[default]
    SendDone,
    Receive,
    ReceiveDone,
    Process,
    ProcessDone,
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ReplyPlan {
    #[default]
    Skip,
    /// The handler wrote nothing; send the bare reply envelope.
    Envelope,
    Ready,
}

#[derive(Default)]
struct Cycle {
    state: ServerState,
    last_channel: Option<ChannelId>,
    codec: Option<Box<dyn Codec>>,
    header: Option<MessageHeader>,
    service: Option<Arc<dyn Service>>,
    reply: ReplyPlan,
}

/// Receives requests on one channel, dispatches them and sends replies.
///
/// The cycle is an explicit state machine. [`poll`](Self::poll) advances it
/// by one transition, [`run_once`](Self::run_once) through one request and
/// [`run`](Self::run) until [`stop`](Self::stop).
///
/// Failures are isolated to the request they occur in: the cycle still
/// returns to [`ServerState::SendDone`] and the buffer and codec of the
/// request are always disposed.
pub struct SimpleServer {
    channel: ChannelId,
    transport: Arc<dyn MessageTransport>,
    resources: Resources,
    services: RwLock<Vec<Arc<dyn Service>>>,
    running: AtomicBool,
    cycle: Mutex<Cycle>,
    dispatch_depth: AtomicUsize,
    serving_thread: Mutex<Option<ThreadId>>,
    threading: ThreadingMode,
    crc: CrcAlgorithm,
}

impl SimpleServer {
    pub fn new(
        channel: ChannelId,
        transport: Arc<dyn MessageTransport>,
        buffers: Arc<dyn MessageBufferFactory>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        Self {
            channel,
            transport,
            resources: Resources { buffers, codecs },
            services: RwLock::new(Vec::new()),
            running: AtomicBool::new(true),
            cycle: Mutex::new(Cycle::default()),
            dispatch_depth: AtomicUsize::new(0),
            serving_thread: Mutex::new(None),
            threading: ThreadingMode::default(),
            crc: CrcAlgorithm::default(),
        }
    }

    /// Apply threading mode and CRC algorithm from `config`.
    pub fn with_config(mut self, config: &RpcConfig) -> Self {
        self.threading = config.threading;
        self.crc = config.frame.crc;
        self
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn state(&self) -> ServerState {
        lock(&self.cycle).state
    }

    /// Channel of the most recently received request.
    pub fn last_channel(&self) -> Option<ChannelId> {
        lock(&self.cycle).last_channel
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register `service`, replacing any service with the same id.
    pub fn add_service(&self, service: Arc<dyn Service>) -> Option<Arc<dyn Service>> {
        let id = service.service_id();
        let mut services = write(&self.services);
        let index = services.iter().position(|s| s.service_id() == id);
        let previous = index.map(|index| services.remove(index));
        services.push(service);
        debug!(service_id = id, replaced = previous.is_some(), "service added");
        previous
    }

    pub fn remove_service(&self, service_id: u32) -> Option<Arc<dyn Service>> {
        let mut services = write(&self.services);
        let index = services.iter().position(|s| s.service_id() == service_id)?;
        debug!(service_id, "service removed");
        Some(services.remove(index))
    }

    pub fn service_ids(&self) -> Vec<u32> {
        read(&self.services).iter().map(|s| s.service_id()).collect()
    }

    /// Switch the transport to a CRC starting at `start`.
    pub fn set_crc_start(&self, start: u16) {
        info!(channel = %self.channel, start, "crc start value changed");
        self.transport.set_crc16(crc16_for(self.crc, start));
    }

    /// Allow new cycles to begin.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Stop beginning new cycles. The cycle in progress still completes.
    pub fn stop(&self) {
        info!(channel = %self.channel, "server stop requested");
        self.running.store(false, Ordering::Release);
    }

    /// True while a service is being dispatched on behalf of this caller.
    ///
    /// In [`ThreadingMode::Preemptive`] the caller must also be the thread
    /// doing the dispatch.
    pub fn is_server_thread(&self) -> bool {
        if self.dispatch_depth.load(Ordering::Acquire) == 0 {
            return false;
        }
        match self.threading {
            ThreadingMode::Preemptive => {
                *lock(&self.serving_thread) == Some(thread::current().id())
            }
            ThreadingMode::None | ThreadingMode::Cooperative => true,
        }
    }

    /// Advance the cycle by one transition and return the new state.
    ///
    /// An error describes a failure of the current request; the cycle has
    /// already moved on and the next call continues normally. Receiving with
    /// nothing available leaves the server in [`ServerState::Receive`]
    /// without error. Must not be called from inside a service handler.
    pub fn poll(&self) -> Result<ServerState> {
        let mut cycle = lock(&self.cycle);
        let result = match cycle.state {
            ServerState::SendDone => {
                if self.is_running() {
                    cycle.state = ServerState::Receive;
                }
                Ok(())
            }
            ServerState::Receive => self.receive_request(&mut cycle),
            ServerState::ReceiveDone => self.resolve_service(&mut cycle),
            ServerState::Process => self.process_request(&mut cycle),
            ServerState::ProcessDone => {
                cycle.state = ServerState::Send;
                Ok(())
            }
            ServerState::Send => self.send_reply(&mut cycle),
        };
        trace!(state = ?cycle.state, "server poll");
        result.map(|()| cycle.state)
    }

    /// Poll until one request has gone through the full cycle.
    ///
    /// Returns the first failure of that request, if any.
    pub fn run_once(&self) -> Result<()> {
        let mut started = self.state() != ServerState::SendDone;
        let mut failure = None;
        loop {
            let state = match self.poll() {
                Ok(state) => state,
                Err(err) if err.is_disconnect() => return Err(err),
                Err(err) => {
                    failure.get_or_insert(err);
                    self.state()
                }
            };
            if state != ServerState::SendDone {
                started = true;
            } else if started {
                break;
            } else if !self.is_running() {
                return Err(RpcError::ServerStopped);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Serve requests until [`stop`](Self::stop) is called.
    ///
    /// Per-request failures are logged and serving continues. Returns an
    /// error only when the channel is closed.
    pub fn run(&self) -> Result<()> {
        info!(channel = %self.channel, "server loop started");
        loop {
            match self.poll() {
                Ok(ServerState::SendDone) if !self.is_running() => break,
                Ok(_) => {}
                Err(err) if err.is_disconnect() => {
                    info!(channel = %self.channel, "channel closed, server loop ending");
                    return Err(err);
                }
                Err(err) => warn!(channel = %self.channel, status = ?err.status(), "request failed: {err}"),
            }
        }
        info!(channel = %self.channel, "server loop stopped");
        Ok(())
    }

    /// Complete the reply of the cycle in progress, if any.
    pub fn flush(&self) -> Result<()> {
        while matches!(self.state(), ServerState::ProcessDone | ServerState::Send) {
            self.poll()?;
        }
        Ok(())
    }

    /// Serve inbound frames on `channel` until the reply for `sequence`
    /// arrives, then copy it into `reply`.
    ///
    /// Used by nested client calls made from inside a service handler.
    /// Invocations arriving meanwhile are dispatched and answered; their
    /// failures are logged and do not end the wait.
    pub fn run_until_reply(
        &self,
        channel: ChannelId,
        sequence: u32,
        reply: &mut MessageBuffer,
    ) -> Result<()> {
        trace!(%channel, sequence, "serving until reply");
        loop {
            if !self.is_running() {
                return Err(RpcError::ServerStopped);
            }
            let mut codec = self.resources.allocate()?;
            let outcome = self.nested_step(channel, sequence, &mut *codec, reply);
            self.resources.dispose(codec);
            if outcome? {
                return Ok(());
            }
        }
    }

    fn nested_step(
        &self,
        channel: ChannelId,
        sequence: u32,
        codec: &mut dyn Codec,
        reply: &mut MessageBuffer,
    ) -> Result<bool> {
        if let Err(err) = receive_message(self.transport.as_ref(), channel, codec) {
            if err.is_stalled() {
                self.transport.abandon_receive();
            }
            return Err(err);
        }

        let header = codec.start_read_message()?;
        match header.msg_type {
            MessageType::Reply if header.sequence == sequence => {
                let bytes = codec
                    .buffer()
                    .map(MessageBuffer::as_slice)
                    .unwrap_or_default();
                reply.clear();
                if !reply.put_slice(bytes) {
                    return Err(RpcError::Allocation("reply buffer space"));
                }
                debug!(%channel, sequence, "nested reply received");
                Ok(true)
            }
            MessageType::Reply => {
                warn!(%channel, expected = sequence, actual = header.sequence, "reply for another call");
                Err(RpcError::SequenceMismatch {
                    expected: sequence,
                    actual: header.sequence,
                })
            }
            MessageType::Notification => {
                warn!(%channel, sequence = header.sequence, "notification ignored while waiting for reply");
                Ok(false)
            }
            MessageType::Invocation | MessageType::Oneway => {
                let plan = match self
                    .find_service(&header)
                    .and_then(|service| self.dispatch(service.as_ref(), header, &mut *codec))
                {
                    Ok(plan) => plan,
                    Err(err) => {
                        warn!(%channel, sequence = header.sequence, "nested request failed: {err}");
                        return Ok(false);
                    }
                };
                if plan == ReplyPlan::Skip {
                    return Ok(false);
                }
                if plan == ReplyPlan::Envelope {
                    codec.start_write_message(&header.reply())?;
                }
                if let Err(err) = send_message(self.transport.as_ref(), channel, codec) {
                    if err.is_stalled() {
                        self.transport.abandon_send();
                    }
                    return Err(err);
                }
                debug!(%channel, sequence = header.sequence, "nested reply sent");
                Ok(false)
            }
        }
    }

    fn receive_request(&self, cycle: &mut Cycle) -> Result<()> {
        let mut codec = match cycle.codec.take() {
            Some(codec) => codec,
            None => match self.resources.allocate() {
                Ok(codec) => codec,
                Err(err) => {
                    self.finish_cycle(cycle);
                    return Err(err);
                }
            },
        };

        match receive_message(self.transport.as_ref(), self.channel, &mut *codec) {
            Ok(()) => {}
            Err(RpcError::Frame(FrameError::Stalled { transferred, .. })) => {
                if transferred == 0 && !self.is_running() {
                    self.transport.abandon_receive();
                    self.resources.dispose(codec);
                    self.finish_cycle(cycle);
                } else {
                    cycle.codec = Some(codec);
                }
                return Ok(());
            }
            Err(err) => {
                self.resources.dispose(codec);
                self.finish_cycle(cycle);
                return Err(err);
            }
        }

        let decoded = codec.start_read_message();
        cycle.codec = Some(codec);
        cycle.last_channel = Some(self.channel);
        cycle.state = ServerState::ReceiveDone;

        let header = decoded?;
        debug!(
            channel = %self.channel,
            sequence = header.sequence,
            msg_type = ?header.msg_type,
            service_id = header.service_id,
            "request received"
        );
        cycle.header = Some(header);
        Ok(())
    }

    fn resolve_service(&self, cycle: &mut Cycle) -> Result<()> {
        cycle.state = ServerState::Process;
        let Some(header) = cycle.header else {
            return Ok(());
        };
        cycle.service = Some(self.find_service(&header)?);
        Ok(())
    }

    fn process_request(&self, cycle: &mut Cycle) -> Result<()> {
        cycle.state = ServerState::ProcessDone;
        let (Some(service), Some(header), Some(codec)) =
            (cycle.service.take(), cycle.header, cycle.codec.as_mut())
        else {
            return Ok(());
        };
        cycle.reply = self.dispatch(service.as_ref(), header, &mut **codec)?;
        Ok(())
    }

    fn send_reply(&self, cycle: &mut Cycle) -> Result<()> {
        let result = self.transmit_reply(cycle);
        if result.as_ref().is_err_and(|err| err.is_stalled()) {
            trace!(channel = %self.channel, "reply send stalled");
            return Ok(());
        }
        self.finish_cycle(cycle);
        result
    }

    fn transmit_reply(&self, cycle: &mut Cycle) -> Result<()> {
        let (Some(header), Some(codec)) = (cycle.header, cycle.codec.as_mut()) else {
            return Ok(());
        };
        match cycle.reply {
            ReplyPlan::Skip => return Ok(()),
            ReplyPlan::Envelope => {
                codec.start_write_message(&header.reply())?;
                cycle.reply = ReplyPlan::Ready;
            }
            ReplyPlan::Ready => {}
        }
        send_message(self.transport.as_ref(), self.channel, &**codec)?;
        debug!(channel = %self.channel, sequence = header.sequence, "reply sent");
        Ok(())
    }

    fn finish_cycle(&self, cycle: &mut Cycle) {
        if let Some(codec) = cycle.codec.take() {
            self.resources.dispose(codec);
        }
        cycle.header = None;
        cycle.service = None;
        cycle.reply = ReplyPlan::Skip;
        cycle.state = ServerState::SendDone;
    }

    fn find_service(&self, header: &MessageHeader) -> Result<Arc<dyn Service>> {
        if !matches!(header.msg_type, MessageType::Invocation | MessageType::Oneway) {
            return Err(RpcError::UnexpectedMessage(header.msg_type));
        }
        read(&self.services)
            .iter()
            .find(|s| s.service_id() == header.service_id)
            .cloned()
            .ok_or(RpcError::UnknownService(header.service_id))
    }

    fn dispatch(
        &self,
        service: &dyn Service,
        header: MessageHeader,
        codec: &mut dyn Codec,
    ) -> Result<ReplyPlan> {
        let _scope = DispatchScope::enter(self);
        let mut invocation = Invocation::new(header, codec);
        let outcome = service.handle_invocation(&mut invocation);
        let replied = invocation.has_replied();

        if let Err(err) = outcome {
            return Err(RpcError::Service {
                service_id: header.service_id,
                method_id: header.method_id,
                source: Box::new(err),
            });
        }
        Ok(if header.is_oneway() {
            ReplyPlan::Skip
        } else if replied {
            ReplyPlan::Ready
        } else {
            ReplyPlan::Envelope
        })
    }
}

/// Marks the current thread as dispatching for the lifetime of the scope.
struct DispatchScope<'a> {
    server: &'a SimpleServer,
}

impl<'a> DispatchScope<'a> {
    fn enter(server: &'a SimpleServer) -> Self {
        if server.dispatch_depth.load(Ordering::Acquire) == 0 {
            *lock(&server.serving_thread) = Some(thread::current().id());
        }
        server.dispatch_depth.fetch_add(1, Ordering::AcqRel);
        Self { server }
    }
}

impl Drop for DispatchScope<'_> {
    fn drop(&mut self) {
        self.server.dispatch_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::{OnceLock, Weak};

    use rpcprims_codec::{BasicCodec, BasicCodecFactory, MethodId};
    use rpcprims_frame::{
        DynamicBufferFactory, FrameConfig, FramedTransport, HEADER_SIZE, MAX_MESSAGE_SIZE,
    };
    use rpcprims_transport::{MemoryTransport, Transport};

    use super::*;

    const ECHO: u32 = 1;

    struct Echo;

    impl Service for Echo {
        fn service_id(&self) -> u32 {
            ECHO
        }

        fn handle_invocation(&self, invocation: &mut Invocation<'_>) -> Result<()> {
            let text = invocation.args().read_string()?;
            if text == "fail" {
                return Err(RpcError::Handler("refused".into()));
            }
            if text != "silent" {
                invocation.reply()?.write_string(&text)?;
            }
            Ok(())
        }
    }

    struct Fixture {
        server: SimpleServer,
        peer: FramedTransport<MemoryTransport>,
        buffers: Arc<DynamicBufferFactory>,
        codecs: Arc<BasicCodecFactory>,
    }

    fn fixture() -> Fixture {
        let (a, b) = MemoryTransport::pair();
        let quick = FrameConfig::default().with_max_idle_retries(2);
        let buffers = Arc::new(DynamicBufferFactory::new());
        let codecs = Arc::new(BasicCodecFactory::new());
        let server = SimpleServer::new(
            ChannelId::DEFAULT,
            Arc::new(FramedTransport::with_config(b.with_blocking(false), quick.clone())),
            buffers.clone(),
            codecs.clone(),
        );
        server.add_service(Arc::new(Echo));
        Fixture {
            server,
            peer: FramedTransport::with_config(a.with_blocking(false), quick),
            buffers,
            codecs,
        }
    }

    fn request(msg_type: MessageType, service_id: u32, sequence: u32, text: &str) -> MessageBuffer {
        let mut codec = BasicCodec::with_buffer(MessageBuffer::new(MAX_MESSAGE_SIZE));
        let header = MessageHeader::new(msg_type, service_id, MethodId::from_name("echo"), sequence);
        codec.start_write_message(&header).unwrap();
        codec.write_string(text).unwrap();
        codec.take_buffer().unwrap()
    }

    fn read_reply(peer: &FramedTransport<MemoryTransport>) -> Option<(MessageHeader, Option<String>)> {
        let mut buffer = MessageBuffer::new(MAX_MESSAGE_SIZE);
        peer.receive(ChannelId::DEFAULT, &mut buffer).ok()?;
        let mut codec = BasicCodec::with_buffer(buffer);
        let header = codec.start_read_message().unwrap();
        Some((header, codec.read_string().ok()))
    }

    #[test]
    fn one_request_takes_six_polls() {
        let f = fixture();
        f.peer
            .send(ChannelId::DEFAULT, &request(MessageType::Invocation, ECHO, 5, "hi"))
            .unwrap();

        let states: Vec<_> = (0..6).map(|_| f.server.poll().unwrap()).collect();
        assert_eq!(
            states,
            [
                ServerState::Receive,
                ServerState::ReceiveDone,
                ServerState::Process,
                ServerState::ProcessDone,
                ServerState::Send,
                ServerState::SendDone,
            ]
        );

        let (header, text) = read_reply(&f.peer).unwrap();
        assert_eq!(header.msg_type, MessageType::Reply);
        assert_eq!(header.sequence, 5);
        assert_eq!(text.as_deref(), Some("hi"));
        assert_eq!(f.server.last_channel(), Some(ChannelId::DEFAULT));
    }

    #[test]
    fn idle_receive_stays_in_receive() {
        let f = fixture();
        assert_eq!(f.server.poll().unwrap(), ServerState::Receive);
        assert_eq!(f.server.poll().unwrap(), ServerState::Receive);
        assert_eq!(f.buffers.stats().outstanding(), 1);

        f.server.stop();
        assert_eq!(f.server.poll().unwrap(), ServerState::SendDone);
        assert_eq!(f.server.poll().unwrap(), ServerState::SendDone);
        assert_eq!(f.buffers.stats().outstanding(), 0);
    }

    #[test]
    fn handler_without_reply_sends_bare_envelope() {
        let f = fixture();
        f.peer
            .send(ChannelId::DEFAULT, &request(MessageType::Invocation, ECHO, 9, "silent"))
            .unwrap();
        f.server.run_once().unwrap();

        let (header, text) = read_reply(&f.peer).unwrap();
        assert_eq!(header.sequence, 9);
        assert_eq!(text, None);
    }

    #[test]
    fn failures_produce_no_reply_and_release_everything() {
        let f = fixture();
        f.peer
            .send(ChannelId::DEFAULT, &request(MessageType::Invocation, ECHO, 1, "fail"))
            .unwrap();
        let err = f.server.run_once().unwrap_err();
        assert!(matches!(err, RpcError::Service { service_id: ECHO, .. }));

        f.peer
            .send(ChannelId::DEFAULT, &request(MessageType::Invocation, 77, 2, "x"))
            .unwrap();
        assert!(matches!(
            f.server.run_once().unwrap_err(),
            RpcError::UnknownService(77)
        ));

        f.peer
            .send(ChannelId::DEFAULT, &request(MessageType::Reply, ECHO, 3, "x"))
            .unwrap();
        assert!(matches!(
            f.server.run_once().unwrap_err(),
            RpcError::UnexpectedMessage(MessageType::Reply)
        ));

        f.peer
            .send(ChannelId::DEFAULT, &MessageBuffer::from_slice(&[9, 9]).unwrap())
            .unwrap();
        assert!(matches!(
            f.server.run_once().unwrap_err(),
            RpcError::Protocol(_)
        ));

        assert!(read_reply(&f.peer).is_none());
        assert_eq!(f.server.state(), ServerState::SendDone);
        assert_eq!(f.buffers.stats().outstanding(), 0);
        assert_eq!(f.codecs.stats().live(), 0);
    }

    #[test]
    fn crc_failure_returns_to_idle() {
        let f = fixture();
        f.peer.set_crc16(crc16_for(CrcAlgorithm::Reference, 0x1111));
        f.peer
            .send(ChannelId::DEFAULT, &request(MessageType::Invocation, ECHO, 1, "x"))
            .unwrap();

        assert_eq!(f.server.poll().unwrap(), ServerState::Receive);
        let err = f.server.poll().unwrap_err();
        assert_eq!(err.status(), crate::Status::CrcCheckFailed);
        assert_eq!(f.server.state(), ServerState::SendDone);
        assert_eq!(f.buffers.stats().outstanding(), 0);
    }

    #[test]
    fn service_registry_replaces_by_id() {
        let f = fixture();
        assert!(f.server.add_service(Arc::new(Echo)).is_some());
        assert_eq!(f.server.service_ids(), vec![ECHO]);
        assert!(f.server.remove_service(ECHO).is_some());
        assert!(f.server.remove_service(ECHO).is_none());
    }

    #[test]
    fn stopped_server_does_not_start_cycles() {
        let f = fixture();
        f.server.stop();
        assert!(matches!(f.server.run_once(), Err(RpcError::ServerStopped)));
        let mut reply = MessageBuffer::new(MAX_MESSAGE_SIZE);
        assert!(matches!(
            f.server.run_until_reply(ChannelId::DEFAULT, 1, &mut reply),
            Err(RpcError::ServerStopped)
        ));
    }

    #[test]
    fn not_server_thread_outside_dispatch() {
        let f = fixture();
        assert!(!f.server.is_server_thread());
    }

    /// Memory link whose sends stop once the byte budget runs out.
    struct Gated {
        inner: MemoryTransport,
        budget: Mutex<usize>,
        sent: Mutex<usize>,
    }

    impl Gated {
        fn grant(&self, bytes: usize) {
            *self.budget.lock().unwrap() += bytes;
        }
    }

    impl Transport for Gated {
        fn send(&self, channel: ChannelId, data: &[u8]) -> rpcprims_transport::Result<usize> {
            let mut budget = self.budget.lock().unwrap();
            let n = data.len().min(*budget);
            if n == 0 {
                return Ok(0);
            }
            let sent = self.inner.send(channel, &data[..n])?;
            *budget -= sent;
            *self.sent.lock().unwrap() += sent;
            Ok(sent)
        }

        fn receive(&self, channel: ChannelId, data: &mut [u8]) -> rpcprims_transport::Result<usize> {
            self.inner.receive(channel, data)
        }
    }

    #[test]
    fn stalled_reply_waits_in_send_until_flushed() {
        let (a, b) = MemoryTransport::pair();
        let quick = FrameConfig::default().with_max_idle_retries(2);
        let gated = Arc::new(Gated {
            inner: b.with_blocking(false),
            budget: Mutex::new(4),
            sent: Mutex::new(0),
        });
        let buffers = Arc::new(DynamicBufferFactory::new());
        let server = SimpleServer::new(
            ChannelId::DEFAULT,
            Arc::new(FramedTransport::with_config(gated.clone(), quick.clone())),
            buffers.clone(),
            Arc::new(BasicCodecFactory::new()),
        );
        server.add_service(Arc::new(Echo));
        let peer = FramedTransport::with_config(a.with_blocking(false), quick);
        let sent = request(MessageType::Invocation, ECHO, 11, "later");
        peer.send(ChannelId::DEFAULT, &sent).unwrap();

        for _ in 0..5 {
            server.poll().unwrap();
        }
        assert_eq!(server.state(), ServerState::Send);
        assert_eq!(server.poll().unwrap(), ServerState::Send);
        assert_eq!(server.poll().unwrap(), ServerState::Send);
        assert_eq!(*gated.sent.lock().unwrap(), 4);
        assert_eq!(peer.get_ref().pending(ChannelId::DEFAULT), 4);

        gated.grant(MAX_MESSAGE_SIZE);
        server.flush().unwrap();
        assert_eq!(server.state(), ServerState::SendDone);
        assert_eq!(buffers.stats().outstanding(), 0);

        let (header, text) = read_reply(&peer).unwrap();
        assert_eq!(header.msg_type, MessageType::Reply);
        assert_eq!(header.sequence, 11);
        assert_eq!(text.as_deref(), Some("later"));
        assert!(read_reply(&peer).is_none());

        let mut reply = BasicCodec::with_buffer(MessageBuffer::new(MAX_MESSAGE_SIZE));
        reply.start_write_message(&header).unwrap();
        reply.write_string("later").unwrap();
        let reply_len = reply.buffer().unwrap().len();
        assert_eq!(*gated.sent.lock().unwrap(), HEADER_SIZE + reply_len);

        server.flush().unwrap();
        assert_eq!(server.state(), ServerState::SendDone);
    }

    #[test]
    fn nested_wait_rejects_reply_for_another_call() {
        let f = fixture();
        f.peer
            .send(ChannelId::DEFAULT, &request(MessageType::Reply, ECHO, 8, "late"))
            .unwrap();

        let mut reply = MessageBuffer::new(MAX_MESSAGE_SIZE);
        let err = f
            .server
            .run_until_reply(ChannelId::DEFAULT, 7, &mut reply)
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::SequenceMismatch {
                expected: 7,
                actual: 8
            }
        ));
        assert!(reply.is_empty());
        assert_eq!(f.buffers.stats().outstanding(), 0);
        assert_eq!(f.codecs.stats().live(), 0);
    }

    #[test]
    fn nested_wait_skips_notifications() {
        let f = fixture();
        f.peer
            .send(ChannelId::DEFAULT, &request(MessageType::Notification, ECHO, 3, "note"))
            .unwrap();
        f.peer
            .send(ChannelId::DEFAULT, &request(MessageType::Reply, ECHO, 7, "done"))
            .unwrap();

        let mut reply = MessageBuffer::new(MAX_MESSAGE_SIZE);
        f.server
            .run_until_reply(ChannelId::DEFAULT, 7, &mut reply)
            .unwrap();

        let mut codec = BasicCodec::with_buffer(reply);
        let header = codec.start_read_message().unwrap();
        assert_eq!(header.msg_type, MessageType::Reply);
        assert_eq!(header.sequence, 7);
        assert_eq!(codec.read_string().unwrap(), "done");
        assert!(read_reply(&f.peer).is_none());
        assert_eq!(f.buffers.stats().outstanding(), 0);
        assert_eq!(f.codecs.stats().live(), 0);
    }

    /// Records `is_server_thread` seen from the dispatching thread and from
    /// a second thread while the handler runs.
    #[derive(Default)]
    struct ThreadCheck {
        server: OnceLock<Weak<SimpleServer>>,
        seen: Mutex<Option<(bool, bool)>>,
    }

    impl Service for ThreadCheck {
        fn service_id(&self) -> u32 {
            ECHO
        }

        fn handle_invocation(&self, _invocation: &mut Invocation<'_>) -> Result<()> {
            let server = self
                .server
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| RpcError::Handler("server gone".into()))?;
            let here = server.is_server_thread();
            let elsewhere = thread::scope(|scope| {
                scope.spawn(|| server.is_server_thread()).join().unwrap()
            });
            *self.seen.lock().unwrap() = Some((here, elsewhere));
            Ok(())
        }
    }

    fn dispatch_visibility(threading: ThreadingMode) -> (bool, bool) {
        let (a, b) = MemoryTransport::pair();
        let quick = FrameConfig::default().with_max_idle_retries(2);
        let config = RpcConfig {
            threading,
            ..RpcConfig::default()
        };
        let server = Arc::new(
            SimpleServer::new(
                ChannelId::DEFAULT,
                Arc::new(FramedTransport::with_config(b.with_blocking(false), quick.clone())),
                Arc::new(DynamicBufferFactory::new()),
                Arc::new(BasicCodecFactory::new()),
            )
            .with_config(&config),
        );
        let check = Arc::new(ThreadCheck::default());
        check.server.set(Arc::downgrade(&server)).unwrap();
        server.add_service(check.clone());

        let peer = FramedTransport::with_config(a.with_blocking(false), quick);
        peer.send(ChannelId::DEFAULT, &request(MessageType::Invocation, ECHO, 1, "x"))
            .unwrap();
        server.run_once().unwrap();
        assert!(!server.is_server_thread());

        let seen = check.seen.lock().unwrap().take();
        seen.unwrap()
    }

    #[test]
    fn server_thread_depends_on_threading_mode() {
        assert_eq!(dispatch_visibility(ThreadingMode::None), (true, true));
        assert_eq!(dispatch_visibility(ThreadingMode::Cooperative), (true, true));
        assert_eq!(dispatch_visibility(ThreadingMode::Preemptive), (true, false));
    }
}
