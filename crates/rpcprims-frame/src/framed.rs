use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rpcprims_transport::{ChannelId, Transport};
use tracing::{debug, trace, warn};

use crate::buffer::{DynamicBufferFactory, MessageBuffer, MessageBufferFactory, MAX_MESSAGE_SIZE};
use crate::config::FrameConfig;
use crate::crc::Crc16;
use crate::error::{FrameError, Result};
use crate::header::{FrameHeader, HEADER_SIZE};

/// Whole-message transport shared by clients and servers.
pub trait MessageTransport: Send + Sync {
    /// Send `message` as one frame on `channel`.
    fn send(&self, channel: ChannelId, message: &MessageBuffer) -> Result<()>;

    /// Receive one frame from `channel` into `message`, replacing its contents.
    fn receive(&self, channel: ChannelId, message: &mut MessageBuffer) -> Result<()>;

    /// Replace the CRC strategy for subsequent frames.
    fn set_crc16(&self, crc: Arc<dyn Crc16>);

    /// Drop the progress of a stalled send.
    fn abandon_send(&self);

    /// Drop the progress of a stalled receive.
    fn abandon_receive(&self);
}

#[derive(Debug, Default)]
struct SendProgress {
    channel: Option<ChannelId>,
    header: [u8; HEADER_SIZE],
    header_done: usize,
    body_len: usize,
    body_crc: u16,
    body_done: usize,
}

#[derive(Debug, Default)]
struct ReceiveProgress {
    channel: Option<ChannelId>,
    header: [u8; HEADER_SIZE],
    header_done: usize,
    prepared: bool,
    body_done: usize,
}

/// Frames messages over a partial-transfer [`Transport`].
///
/// Each frame is an 8-byte [`FrameHeader`] followed by the payload. Partial
/// transfers are retried until the frame completes or the channel stays idle
/// for more than [`FrameConfig::max_idle_retries`] attempts in a row.
///
/// Sends and receives are serialized by separate locks: one sender and one
/// receiver can be active at the same time, but frames in the same
/// direction never interleave. The receive lock covers every channel, so a
/// blocking receive on one channel holds up receives on all others until a
/// frame arrives. Callers that wait on different channels concurrently
/// need one framed transport each.
///
/// A stalled operation keeps its progress. Calling it again on the same
/// channel picks up where it stopped; [`abandon_send`](Self::abandon_send)
/// and [`abandon_receive`](Self::abandon_receive) throw the progress away.
pub struct FramedTransport<T> {
    inner: T,
    buffers: Arc<dyn MessageBufferFactory>,
    crc: RwLock<Arc<dyn Crc16>>,
    config: FrameConfig,
    send_progress: Mutex<SendProgress>,
    receive_progress: Mutex<ReceiveProgress>,
}

impl<T: Transport> FramedTransport<T> {
    /// Create a framed transport with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a framed transport with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buffers: Arc::new(DynamicBufferFactory::new()),
            crc: RwLock::new(config.crc16()),
            config,
            send_progress: Mutex::new(SendProgress::default()),
            receive_progress: Mutex::new(ReceiveProgress::default()),
        }
    }

    /// Use `buffers` to size receive buffers.
    pub fn with_buffer_factory(mut self, buffers: Arc<dyn MessageBufferFactory>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Borrow the underlying byte channel.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the framed transport and return the byte channel.
    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Send `message` as one frame on `channel`.
    pub fn send(&self, channel: ChannelId, message: &MessageBuffer) -> Result<()> {
        let payload = message.as_slice();
        debug_assert!(payload.len() <= MAX_MESSAGE_SIZE);

        let mut progress = lock(&self.send_progress);
        let crc = self.crc().compute(payload);
        match progress.channel {
            Some(pending)
                if pending != channel
                    || progress.body_len != payload.len()
                    || progress.body_crc != crc =>
            {
                return Err(FrameError::ResumeMismatch { channel: pending });
            }
            Some(_) => trace!(%channel, "resuming frame send"),
            None => {
                *progress = SendProgress {
                    channel: Some(channel),
                    header: FrameHeader::new(payload.len() as u16, crc).to_bytes(),
                    header_done: 0,
                    body_len: payload.len(),
                    body_crc: crc,
                    body_done: 0,
                };
            }
        }

        let result = self.send_frame(channel, payload, &mut progress);
        if !keeps_progress(&result) {
            *progress = SendProgress::default();
        }
        result
    }

    /// Receive one frame from `channel` into `message`.
    ///
    /// The header is validated before any payload byte is read. The
    /// message is then sized through the buffer factory and filled.
    pub fn receive(&self, channel: ChannelId, message: &mut MessageBuffer) -> Result<()> {
        let mut progress = lock(&self.receive_progress);
        match progress.channel {
            Some(pending) if pending != channel => {
                return Err(FrameError::ResumeMismatch { channel: pending });
            }
            Some(_) => trace!(%channel, "resuming frame receive"),
            None => {
                *progress = ReceiveProgress {
                    channel: Some(channel),
                    ..ReceiveProgress::default()
                };
            }
        }

        let result = self.receive_frame(channel, message, &mut progress);
        if !keeps_progress(&result) {
            *progress = ReceiveProgress::default();
        }
        result
    }

    pub fn set_crc16(&self, crc: Arc<dyn Crc16>) {
        debug!(start = crc.start(), "crc strategy replaced");
        *self.crc.write().unwrap_or_else(PoisonError::into_inner) = crc;
    }

    pub fn abandon_send(&self) {
        let mut progress = lock(&self.send_progress);
        if let Some(channel) = progress.channel {
            debug!(%channel, sent = progress.header_done + progress.body_done, "abandoning partial send");
        }
        *progress = SendProgress::default();
    }

    pub fn abandon_receive(&self) {
        let mut progress = lock(&self.receive_progress);
        if let Some(channel) = progress.channel {
            debug!(%channel, received = progress.header_done + progress.body_done, "abandoning partial receive");
        }
        *progress = ReceiveProgress::default();
    }

    fn crc(&self) -> Arc<dyn Crc16> {
        Arc::clone(&self.crc.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn send_frame(
        &self,
        channel: ChannelId,
        payload: &[u8],
        progress: &mut SendProgress,
    ) -> Result<()> {
        let header = progress.header;
        if !self.send_from(channel, &header, &mut progress.header_done)?
            || !self.send_from(channel, payload, &mut progress.body_done)?
        {
            return Err(FrameError::Stalled {
                channel,
                transferred: progress.header_done + progress.body_done,
                expected: HEADER_SIZE + payload.len(),
            });
        }
        debug!(%channel, size = payload.len(), "frame sent");
        Ok(())
    }

    fn receive_frame(
        &self,
        channel: ChannelId,
        message: &mut MessageBuffer,
        progress: &mut ReceiveProgress,
    ) -> Result<()> {
        if !self.receive_into(channel, &mut progress.header, &mut progress.header_done)? {
            return Err(FrameError::Stalled {
                channel,
                transferred: progress.header_done,
                expected: HEADER_SIZE,
            });
        }

        let header = FrameHeader::from_bytes(&progress.header);
        let Some(size) = header.message_size() else {
            warn!(%channel, sizes = ?header.sizes, "corrupted frame header");
            return Err(FrameError::CorruptedHeader {
                sizes: header.sizes,
            });
        };
        let size = usize::from(size);

        if !progress.prepared {
            message.clear();
            if !self.buffers.prepare_for_receive(message, size) {
                return Err(FrameError::Allocation { requested: size });
            }
            progress.prepared = true;
        } else if message.len() != size {
            return Err(FrameError::ResumeMismatch { channel });
        }

        if !self.receive_into(channel, message.as_mut_slice(), &mut progress.body_done)? {
            return Err(FrameError::Stalled {
                channel,
                transferred: HEADER_SIZE + progress.body_done,
                expected: HEADER_SIZE + size,
            });
        }

        let actual = self.crc().compute(message.as_slice());
        if actual != header.crc {
            warn!(%channel, size, expected = header.crc, actual, "frame CRC mismatch");
            return Err(FrameError::CrcMismatch {
                expected: header.crc,
                actual,
            });
        }
        debug!(%channel, size, "frame received");
        Ok(())
    }

    /// Push `data[*done..]`. Returns `Ok(false)` once the idle limit is hit.
    fn send_from(&self, channel: ChannelId, data: &[u8], done: &mut usize) -> Result<bool> {
        let mut idle = 0u32;
        while *done < data.len() {
            let n = self.inner.send(channel, &data[*done..])?;
            if n == 0 {
                idle += 1;
                if idle > self.config.max_idle_retries {
                    return Ok(false);
                }
                std::thread::yield_now();
                continue;
            }
            idle = 0;
            *done += n.min(data.len() - *done);
        }
        Ok(true)
    }

    /// Fill `data[*done..]`. Returns `Ok(false)` once the idle limit is hit.
    fn receive_into(&self, channel: ChannelId, data: &mut [u8], done: &mut usize) -> Result<bool> {
        let mut idle = 0u32;
        while *done < data.len() {
            let n = self.inner.receive(channel, &mut data[*done..])?;
            if n == 0 {
                idle += 1;
                if idle > self.config.max_idle_retries {
                    return Ok(false);
                }
                std::thread::yield_now();
                continue;
            }
            idle = 0;
            *done += n.min(data.len() - *done);
        }
        Ok(true)
    }
}

impl<T: Transport> MessageTransport for FramedTransport<T> {
    fn send(&self, channel: ChannelId, message: &MessageBuffer) -> Result<()> {
        FramedTransport::send(self, channel, message)
    }

    fn receive(&self, channel: ChannelId, message: &mut MessageBuffer) -> Result<()> {
        FramedTransport::receive(self, channel, message)
    }

    fn set_crc16(&self, crc: Arc<dyn Crc16>) {
        FramedTransport::set_crc16(self, crc)
    }

    fn abandon_send(&self) {
        FramedTransport::abandon_send(self)
    }

    fn abandon_receive(&self) {
        FramedTransport::abandon_receive(self)
    }
}

fn keeps_progress(result: &Result<()>) -> bool {
    matches!(
        result,
        Err(FrameError::Stalled { .. } | FrameError::ResumeMismatch { .. })
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rpcprims_transport::{MemoryTransport, TransportError};

    use super::*;
    use crate::buffer::PooledBufferFactory;
    use crate::crc::{ReferenceCrc16, TableCrc16};

    fn message(bytes: &[u8]) -> MessageBuffer {
        MessageBuffer::from_slice(bytes).unwrap()
    }

    fn empty() -> MessageBuffer {
        MessageBuffer::new(MAX_MESSAGE_SIZE)
    }

    /// Accepts at most `budget` bytes in total, then reports zero progress.
    #[derive(Default)]
    struct Throttled {
        budget: Mutex<usize>,
        written: Mutex<Vec<u8>>,
    }

    impl Throttled {
        fn grant(&self, bytes: usize) {
            *self.budget.lock().unwrap() += bytes;
        }
    }

    impl Transport for Throttled {
        fn send(&self, _channel: ChannelId, data: &[u8]) -> rpcprims_transport::Result<usize> {
            let mut budget = self.budget.lock().unwrap();
            let n = data.len().min(*budget);
            *budget -= n;
            self.written.lock().unwrap().extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn receive(&self, _channel: ChannelId, _data: &mut [u8]) -> rpcprims_transport::Result<usize> {
            Err(TransportError::Closed)
        }
    }

    /// Serves scripted bytes and records every requested read length.
    struct Scripted {
        inbound: Mutex<VecDeque<u8>>,
        requests: Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn new(bytes: &[u8]) -> Self {
            Self {
                inbound: Mutex::new(bytes.iter().copied().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for Scripted {
        fn send(&self, _channel: ChannelId, data: &[u8]) -> rpcprims_transport::Result<usize> {
            Ok(data.len())
        }

        fn receive(&self, _channel: ChannelId, data: &mut [u8]) -> rpcprims_transport::Result<usize> {
            self.requests.lock().unwrap().push(data.len());
            let mut inbound = self.inbound.lock().unwrap();
            if inbound.is_empty() {
                return Err(TransportError::Closed);
            }
            let n = data.len().min(inbound.len());
            for (slot, byte) in data.iter_mut().zip(inbound.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    #[test]
    fn roundtrip_boundary_sizes() {
        let (a, b) = MemoryTransport::pair();
        let tx = FramedTransport::new(a.with_max_chunk(7));
        let rx = FramedTransport::new(b);

        for size in [0usize, 1, 255, MAX_MESSAGE_SIZE] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            tx.send(ChannelId::DEFAULT, &message(&payload)).unwrap();

            let mut received = empty();
            rx.receive(ChannelId::DEFAULT, &mut received).unwrap();
            assert_eq!(received.as_slice(), payload.as_slice(), "size {size}");
        }
    }

    #[test]
    fn byte_at_a_time_transfer() {
        let (a, b) = MemoryTransport::pair();
        let tx = FramedTransport::new(a.with_max_chunk(1));
        let rx = FramedTransport::new(b.with_max_chunk(1));

        tx.send(ChannelId::from("A"), &message(b"slow and steady")).unwrap();
        let mut received = empty();
        rx.receive(ChannelId::from("A"), &mut received).unwrap();
        assert_eq!(received.as_slice(), b"slow and steady");
    }

    #[test]
    fn disagreeing_sizes_fail_before_body_read() {
        let mut wire = FrameHeader::new(4, 0).to_bytes().to_vec();
        wire[2..4].copy_from_slice(&5u16.to_ne_bytes());
        wire.extend_from_slice(b"body bytes that must stay unread");

        let framed = FramedTransport::new(Scripted::new(&wire));
        let err = framed.receive(ChannelId::DEFAULT, &mut empty()).unwrap_err();
        assert!(matches!(err, FrameError::CorruptedHeader { sizes: [4, 5, 4] }));
        assert!(err.is_integrity());

        let scripted = framed.into_inner();
        let requested: usize = scripted.requests.lock().unwrap().iter().sum();
        assert_eq!(requested, HEADER_SIZE);
        assert_eq!(scripted.inbound.lock().unwrap().len(), 32);
    }

    #[test]
    fn crc_mismatch_is_reported() {
        let mut wire = FrameHeader::new(3, 0x1234).to_bytes().to_vec();
        wire.extend_from_slice(b"abc");

        let framed = FramedTransport::new(Scripted::new(&wire));
        let err = framed.receive(ChannelId::DEFAULT, &mut empty()).unwrap_err();
        assert!(matches!(err, FrameError::CrcMismatch { expected: 0x1234, .. }));
    }

    #[test]
    fn empty_payload_carries_crc() {
        let throttled = Throttled::default();
        throttled.grant(usize::MAX);
        let framed = FramedTransport::new(throttled);
        framed.send(ChannelId::DEFAULT, &empty()).unwrap();

        let written = framed.into_inner().written.into_inner().unwrap();
        let expected = FrameHeader::new(0, ReferenceCrc16::default().compute(&[])).to_bytes();
        assert_eq!(written, expected);
    }

    #[test]
    fn stalled_send_resumes() {
        let config = FrameConfig::default().with_max_idle_retries(2);
        let throttled = Throttled::default();
        throttled.grant(5);
        let framed = FramedTransport::with_config(throttled, config);
        let msg = message(b"0123456789");

        let err = framed.send(ChannelId::DEFAULT, &msg).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Stalled {
                transferred: 5,
                expected: 18,
                ..
            }
        ));

        let other = framed.send(ChannelId::new(9), &msg).unwrap_err();
        assert!(matches!(other, FrameError::ResumeMismatch { .. }));

        framed.get_ref().grant(100);
        framed.send(ChannelId::DEFAULT, &msg).unwrap();

        let written = framed.into_inner().written.into_inner().unwrap();
        assert_eq!(written.len(), 18);
        assert_eq!(&written[HEADER_SIZE..], b"0123456789");
        let header: [u8; HEADER_SIZE] = written[..HEADER_SIZE].try_into().unwrap();
        assert_eq!(FrameHeader::from_bytes(&header).message_size(), Some(10));
    }

    #[test]
    fn stalled_send_rejects_different_payload_of_same_length() {
        let config = FrameConfig::default().with_max_idle_retries(0);
        let throttled = Throttled::default();
        throttled.grant(HEADER_SIZE + 2);
        let framed = FramedTransport::with_config(throttled, config);

        let first = message(b"abcdef");
        assert!(matches!(
            framed.send(ChannelId::DEFAULT, &first).unwrap_err(),
            FrameError::Stalled { transferred: 10, .. }
        ));

        framed.get_ref().grant(100);
        let err = framed.send(ChannelId::DEFAULT, &message(b"uvwxyz")).unwrap_err();
        assert!(matches!(err, FrameError::ResumeMismatch { .. }));

        framed.send(ChannelId::DEFAULT, &first).unwrap();
        let written = framed.into_inner().written.into_inner().unwrap();
        assert_eq!(&written[HEADER_SIZE..], b"abcdef");
        let header: [u8; HEADER_SIZE] = written[..HEADER_SIZE].try_into().unwrap();
        assert_eq!(
            FrameHeader::from_bytes(&header).crc,
            ReferenceCrc16::default().compute(b"abcdef")
        );
    }

    #[test]
    fn abandoned_send_starts_fresh() {
        let config = FrameConfig::default().with_max_idle_retries(0);
        let throttled = Throttled::default();
        throttled.grant(3);
        let framed = FramedTransport::with_config(throttled, config);

        assert!(framed.send(ChannelId::DEFAULT, &message(b"abc")).is_err());
        framed.abandon_send();

        framed.get_ref().grant(100);
        framed.send(ChannelId::new(2), &message(b"xyz")).unwrap();
        let written = framed.into_inner().written.into_inner().unwrap();
        assert_eq!(written.len(), 3 + HEADER_SIZE + 3);
    }

    #[test]
    fn stalled_receive_resumes() {
        let (a, b) = MemoryTransport::pair();
        let rx = FramedTransport::with_config(
            b.with_blocking(false),
            FrameConfig::default().with_max_idle_retries(1),
        );

        let mut wire = FrameHeader::new(5, ReferenceCrc16::default().compute(b"hello"))
            .to_bytes()
            .to_vec();
        wire.extend_from_slice(b"hello");

        let mut received = empty();
        let err = rx.receive(ChannelId::DEFAULT, &mut received).unwrap_err();
        assert!(matches!(err, FrameError::Stalled { transferred: 0, .. }));

        a.send(ChannelId::DEFAULT, &wire[..6]).unwrap();
        let err = rx.receive(ChannelId::DEFAULT, &mut received).unwrap_err();
        assert!(matches!(err, FrameError::Stalled { transferred: 6, .. }));

        a.send(ChannelId::DEFAULT, &wire[6..10]).unwrap();
        let err = rx.receive(ChannelId::DEFAULT, &mut received).unwrap_err();
        assert!(matches!(err, FrameError::Stalled { transferred: 10, expected: 13, .. }));

        a.send(ChannelId::DEFAULT, &wire[10..]).unwrap();
        rx.receive(ChannelId::DEFAULT, &mut received).unwrap();
        assert_eq!(received.as_slice(), b"hello");
    }

    #[test]
    fn pool_too_small_is_allocation_error() {
        let (a, b) = MemoryTransport::pair();
        let tx = FramedTransport::new(a);
        let pool = Arc::new(PooledBufferFactory::new(1, 4));
        let rx = FramedTransport::new(b).with_buffer_factory(pool.clone());

        tx.send(ChannelId::DEFAULT, &message(b"too long")).unwrap();
        let mut buf = pool.acquire().unwrap();
        let err = rx.receive(ChannelId::DEFAULT, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Allocation { requested: 8 }));
    }

    #[test]
    fn crc_strategy_must_match_on_both_ends() {
        let (a, b) = MemoryTransport::pair();
        let tx = FramedTransport::new(a);
        let rx = FramedTransport::new(b);
        tx.set_crc16(Arc::new(TableCrc16::new(0x1D0F)));

        tx.send(ChannelId::DEFAULT, &message(b"payload")).unwrap();
        let err = rx.receive(ChannelId::DEFAULT, &mut empty()).unwrap_err();
        assert!(matches!(err, FrameError::CrcMismatch { .. }));

        rx.set_crc16(Arc::new(ReferenceCrc16::new(0x1D0F)));
        tx.send(ChannelId::DEFAULT, &message(b"payload")).unwrap();
        rx.receive(ChannelId::DEFAULT, &mut empty()).unwrap();
    }

    #[test]
    fn closed_transport_is_disconnect() {
        let framed = FramedTransport::new(Scripted::new(&[]));
        let err = framed.receive(ChannelId::DEFAULT, &mut empty()).unwrap_err();
        assert!(err.is_disconnect());
    }
}
