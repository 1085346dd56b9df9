use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use crate::basic::BasicCodec;
use crate::codec::Codec;

/// Source of codecs.
///
/// Codecs must be handed back through `dispose` with their buffer already
/// taken out.
pub trait CodecFactory: Send + Sync {
    /// Create a codec, or `None` when the factory is at capacity.
    fn create(&self) -> Option<Box<dyn Codec>>;

    fn dispose(&self, codec: Box<dyn Codec>);
}

/// Counters kept by [`BasicCodecFactory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    pub created: usize,
    pub disposed: usize,
    /// Creations refused because the live limit was reached.
    pub exhausted: usize,
}

impl CodecStats {
    pub fn live(&self) -> usize {
        self.created.saturating_sub(self.disposed)
    }
}

/// Creates [`BasicCodec`]s, optionally capping how many are live at once.
#[derive(Debug, Default)]
pub struct BasicCodecFactory {
    max_live: Option<usize>,
    live: AtomicUsize,
    created: AtomicUsize,
    disposed: AtomicUsize,
    exhausted: AtomicUsize,
}

impl BasicCodecFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to create more than `max_live` codecs at a time.
    pub fn with_max_live(mut self, max_live: usize) -> Self {
        self.max_live = Some(max_live);
        self
    }

    pub fn stats(&self) -> CodecStats {
        CodecStats {
            created: self.created.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl CodecFactory for BasicCodecFactory {
    fn create(&self) -> Option<Box<dyn Codec>> {
        let max = self.max_live.unwrap_or(usize::MAX);
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            });
        if reserved.is_err() {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            trace!(max_live = max, "codec factory exhausted");
            return None;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Some(Box::new(BasicCodec::new()))
    }

    fn dispose(&self, codec: Box<dyn Codec>) {
        debug_assert!(codec.buffer().is_none());
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.disposed.fetch_add(1, Ordering::Relaxed);
    }
}
