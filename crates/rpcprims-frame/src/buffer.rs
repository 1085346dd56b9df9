//! Message buffers and the factories that hand them out.
//!
//! A [`MessageBuffer`] is a growable byte region with a hard upper bound.
//! Factories decide where buffers come from: [`DynamicBufferFactory`]
//! allocates on demand, [`PooledBufferFactory`] hands out a fixed set of
//! preallocated slots and fails once they are all in use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{BufMut, BytesMut};
use tracing::trace;

/// Largest payload a frame header can describe.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Initial capacity of dynamically allocated buffers.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// A bounded byte buffer holding one serialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBuffer {
    data: BytesMut,
    limit: usize,
}

impl MessageBuffer {
    /// Create an empty buffer that may grow up to `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY.min(limit), limit)
    }

    /// Create an empty buffer with `capacity` preallocated bytes.
    pub fn with_capacity(capacity: usize, limit: usize) -> Self {
        let limit = limit.min(MAX_MESSAGE_SIZE);
        Self {
            data: BytesMut::with_capacity(capacity.min(limit)),
            limit,
        }
    }

    /// Build a buffer holding `bytes`, bounded by [`MAX_MESSAGE_SIZE`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let mut buffer = Self::new(MAX_MESSAGE_SIZE);
        buffer.put_slice(bytes).then_some(buffer)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes that can still be appended before hitting the limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Append `bytes`. Returns `false` and leaves the buffer untouched if
    /// the limit would be exceeded.
    pub fn put_slice(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.data.put_slice(bytes);
        true
    }

    /// Resize to exactly `len` bytes, zero-filling any new space.
    /// Returns `false` if `len` exceeds the limit.
    pub fn resize(&mut self, len: usize) -> bool {
        if len > self.limit {
            return false;
        }
        self.data.resize(len, 0);
        true
    }

    fn into_storage(self) -> BytesMut {
        self.data
    }
}

/// Counters kept by every buffer factory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Successful acquisitions.
    pub acquired: usize,
    /// Buffers handed back.
    pub released: usize,
    /// Acquisitions that failed for lack of capacity.
    pub exhausted: usize,
}

impl BufferStats {
    /// Buffers currently held by callers.
    pub fn outstanding(&self) -> usize {
        self.acquired.saturating_sub(self.released)
    }
}

/// Source of message buffers.
///
/// Every buffer obtained from `acquire` must come back through `release`
/// on the same factory.
pub trait MessageBufferFactory: Send + Sync {
    /// Obtain an empty buffer, or `None` when none is available.
    fn acquire(&self) -> Option<MessageBuffer>;

    /// Make `buffer` exactly `size` bytes long ahead of a receive.
    /// Returns `false` if the buffer cannot hold that many bytes.
    fn prepare_for_receive(&self, buffer: &mut MessageBuffer, size: usize) -> bool {
        buffer.resize(size)
    }

    /// Return a buffer obtained from `acquire`.
    fn release(&self, buffer: MessageBuffer);

    fn stats(&self) -> BufferStats;
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
    exhausted: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> BufferStats {
        BufferStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Allocates a fresh buffer on every `acquire`.
#[derive(Debug)]
pub struct DynamicBufferFactory {
    capacity: usize,
    limit: usize,
    counters: Counters,
}

impl DynamicBufferFactory {
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            limit: MAX_MESSAGE_SIZE,
            counters: Counters::default(),
        }
    }

    /// Set the initial capacity of each buffer.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Cap the size every buffer may grow to.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.min(MAX_MESSAGE_SIZE);
        self
    }
}

impl Default for DynamicBufferFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBufferFactory for DynamicBufferFactory {
    fn acquire(&self) -> Option<MessageBuffer> {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Some(MessageBuffer::with_capacity(self.capacity, self.limit))
    }

    fn release(&self, buffer: MessageBuffer) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        drop(buffer);
    }

    fn stats(&self) -> BufferStats {
        self.counters.snapshot()
    }
}

/// Hands out a fixed number of preallocated, fixed-size slots.
#[derive(Debug)]
pub struct PooledBufferFactory {
    slots: Mutex<Vec<BytesMut>>,
    slot_size: usize,
    counters: Counters,
}

impl PooledBufferFactory {
    /// Preallocate `count` slots of `slot_size` bytes each.
    pub fn new(count: usize, slot_size: usize) -> Self {
        let slot_size = slot_size.min(MAX_MESSAGE_SIZE);
        let slots = (0..count)
            .map(|_| BytesMut::with_capacity(slot_size))
            .collect();
        Self {
            slots: Mutex::new(slots),
            slot_size,
            counters: Counters::default(),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Slots not currently handed out.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BytesMut>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageBufferFactory for PooledBufferFactory {
    fn acquire(&self) -> Option<MessageBuffer> {
        let Some(data) = self.lock().pop() else {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            trace!(slot_size = self.slot_size, "buffer pool exhausted");
            return None;
        };
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Some(MessageBuffer {
            data,
            limit: self.slot_size,
        })
    }

    fn prepare_for_receive(&self, buffer: &mut MessageBuffer, size: usize) -> bool {
        size <= self.slot_size && buffer.resize(size)
    }

    fn release(&self, buffer: MessageBuffer) {
        let mut data = buffer.into_storage();
        data.clear();
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        self.lock().push(data);
    }

    fn stats(&self) -> BufferStats {
        self.counters.snapshot()
    }
}
