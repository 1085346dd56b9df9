use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::channel::ChannelId;
use crate::error::{Result, TransportError};
use crate::traits::Transport;

/// One direction of an in-memory link: per-channel byte queues.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

#[derive(Default)]
struct PipeState {
    queues: HashMap<ChannelId, VecDeque<u8>>,
    closed: bool,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }
}

/// One end of an in-process duplex link.
///
/// Created in connected pairs with [`MemoryTransport::pair`]. Bytes sent on a
/// channel from one end are received on the same channel at the other end.
/// In blocking mode `receive` waits until at least one byte is queued; in
/// non-blocking mode it returns `Ok(0)` when nothing is there.
pub struct MemoryTransport {
    tx: Arc<Pipe>,
    rx: Arc<Pipe>,
    blocking: bool,
    max_chunk: usize,
}

impl MemoryTransport {
    /// Create two connected blocking endpoints.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let a = Self {
            tx: Arc::clone(&a_to_b),
            rx: Arc::clone(&b_to_a),
            blocking: true,
            max_chunk: usize::MAX,
        };
        let b = Self {
            tx: b_to_a,
            rx: a_to_b,
            blocking: true,
            max_chunk: usize::MAX,
        };
        (a, b)
    }

    /// Switch between blocking and non-blocking receives.
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Limit every transfer to at most `max_chunk` bytes.
    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk.max(1);
        self
    }

    /// Number of bytes queued for this end on `channel`.
    pub fn pending(&self, channel: ChannelId) -> usize {
        self.rx
            .lock()
            .queues
            .get(&channel)
            .map_or(0, VecDeque::len)
    }

    /// Close both directions. The peer drains what is queued, then sees `Closed`.
    pub fn close(&self) {
        self.tx.close();
        self.rx.close();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Transport for MemoryTransport {
    fn send(&self, channel: ChannelId, data: &[u8]) -> Result<usize> {
        let mut state = self.tx.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let n = data.len().min(self.max_chunk);
        state
            .queues
            .entry(channel)
            .or_default()
            .extend(&data[..n]);
        drop(state);
        self.tx.readable.notify_all();
        Ok(n)
    }

    fn receive(&self, channel: ChannelId, data: &mut [u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.rx.lock();
        loop {
            let queued = state.queues.get(&channel).map_or(0, VecDeque::len);
            if queued > 0 {
                let n = queued.min(data.len()).min(self.max_chunk);
                if let Some(queue) = state.queues.get_mut(&channel) {
                    for (slot, byte) in data.iter_mut().zip(queue.drain(..n)) {
                        *slot = byte;
                    }
                }
                return Ok(n);
            }
            if state.closed {
                return Err(TransportError::Closed);
            }
            if !self.blocking {
                return Ok(0);
            }
            state = self
                .rx
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
