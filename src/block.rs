use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Block is aligned on a boundary a listener may start streaming from.
pub const BLOCK_SYNC: u32 = 1 << 0;
/// Block has been linked onto a source queue.
pub const BLOCK_ON_QUEUE: u32 = 1 << 1;
/// Block was trimmed off the queue; any listener still holding it has
/// fallen off the retained window and must drop.
pub const BLOCK_RELEASED: u32 = 1 << 2;

/// An immutable chunk of encoded stream data.
///
/// The payload never changes once the block is created. The flag word
/// and the chain link are mutated only while holding the owning source's
/// lock; the link is set once on append and cleared once on trim.
/// Lifetime is reference counting: the queue chain, the queue's two
/// retention handles (tail, burst window) and every listener cursor each
/// hold an `Arc`.
pub struct RefBlock {
    data: Bytes,
    flags: AtomicU32,
    next: Mutex<Option<Arc<RefBlock>>>,
}

impl RefBlock {
    pub fn new(data: Bytes, flags: u32) -> Arc<Self> {
        Arc::new(Self {
            data,
            flags: AtomicU32::new(flags),
            next: Mutex::new(None),
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has_flag(&self, mask: u32) -> bool {
        self.flags() & mask != 0
    }

    pub fn set_flag(&self, mask: u32) {
        self.flags.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn next(&self) -> Option<Arc<RefBlock>> {
        self.next.lock().clone()
    }

    pub fn set_next(&self, next: Arc<RefBlock>) {
        *self.next.lock() = Some(next);
    }

    pub fn take_next(&self) -> Option<Arc<RefBlock>> {
        self.next.lock().take()
    }

    /// Private duplicate of this block for a detaching listener: same
    /// payload, no flags, no chain, so a pending write can finish without
    /// pinning the shared queue.
    pub fn private_copy(self: &Arc<Self>) -> Arc<RefBlock> {
        RefBlock::new(self.data.clone(), 0)
    }
}

impl std::fmt::Debug for RefBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefBlock")
            .field("len", &self.data.len())
            .field("flags", &self.flags())
            .finish()
    }
}
