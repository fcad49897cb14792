use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::{RefBlock, BLOCK_ON_QUEUE, BLOCK_RELEASED};
use crate::errors::{QueueError, QueueErrorValue};

/// The in-flight stream data of one source.
///
/// Blocks are chained oldest to newest. Two retention handles keep data
/// alive beyond the listener cursors: `tail` pins the most recent block
/// so the stream position survives when every listener has passed it,
/// and `window` pins the burst span (`min_cursor` through tail) so a
/// connecting listener can be started behind the live edge at a sync
/// point. `min_offset` is the byte distance from the window front
/// through the tail, inclusive.
pub struct SourceQueue {
    head: Option<Arc<RefBlock>>,
    tail: Option<Arc<RefBlock>>,
    window: VecDeque<Arc<RefBlock>>,
    pub min_offset: u64,
    pub min_size: u64,
    pub default_burst_size: u64,
    pub size: u64,
    pub size_limit: u64,
}

impl SourceQueue {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            window: VecDeque::new(),
            min_offset: 0,
            min_size: 0,
            default_burst_size: 0,
            size: 0,
            size_limit: 0,
        }
    }

    pub fn head(&self) -> Option<Arc<RefBlock>> {
        self.head.clone()
    }

    pub fn tail_block(&self) -> Option<Arc<RefBlock>> {
        self.tail.clone()
    }

    pub fn min_cursor(&self) -> Option<Arc<RefBlock>> {
        self.window.front().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append a freshly pulled block at the tail and advance the burst
    /// window. An `Err` reports a structural invariant breach; the append
    /// itself still completes so the caller can wind the source down
    /// without losing the block.
    pub fn append(&mut self, block: Arc<RefBlock>) -> Result<(), QueueError> {
        let mut breach = None;

        block.set_flag(BLOCK_ON_QUEUE);
        if self.head.is_none() {
            self.head = Some(block.clone());
            self.min_offset = 0;
        }
        if let Some(old_tail) = &self.tail {
            if self.min_offset > self.min_size {
                breach = Some(QueueErrorValue::MinOffsetOverrun {
                    offset: self.min_offset,
                    window: self.min_size,
                });
            }
            old_tail.set_next(block.clone());
        }
        self.tail = Some(block.clone());
        self.size += block.len() as u64;

        self.window.push_back(block.clone());
        self.min_offset += block.len() as u64;
        while self.min_offset > self.min_size {
            let front = self
                .window
                .front()
                .expect("window front present while min_offset > 0");
            if front.next().is_some() {
                self.min_offset -= front.len() as u64;
                self.window.pop_front();
                continue;
            }
            if !Arc::ptr_eq(front, &block) {
                return Err(QueueErrorValue::CursorDetached.into());
            }
            break;
        }

        match breach {
            Some(value) => Err(value.into()),
            None => Ok(()),
        }
    }

    /// Drop head blocks that are over the size limit or that nothing
    /// refers to any more (only the chain link remains). Trimmed blocks
    /// are marked released so a lagging listener still holding one drops
    /// on its next tick.
    pub fn trim(&mut self) {
        loop {
            let pop = match &self.head {
                Some(h) => self.size > self.size_limit || Arc::strong_count(h) == 1,
                None => false,
            };
            if !pop {
                break;
            }
            let old = self.head.take().expect("checked above");
            self.head = old.take_next();
            self.size -= old.len() as u64;
            old.set_flag(BLOCK_RELEASED);
        }
        if self.head.is_none() {
            self.tail = None;
            self.window.clear();
            self.min_offset = 0;
            self.size = 0;
        }
    }

    /// Release everything: retention handles first, then the chain,
    /// unlinking as we go so drops never recurse down a long queue.
    pub fn clear(&mut self) {
        self.window.clear();
        self.tail = None;
        let mut p = self.head.take();
        while let Some(block) = p {
            p = block.take_next();
        }
        self.size = 0;
        self.min_offset = 0;
        self.min_size = 0;
        self.default_burst_size = 0;
        self.size_limit = 0;
    }

    /// Bytes actually linked from head through tail. Used by consistency
    /// checks; `size` is the incrementally maintained equivalent.
    pub fn chain_bytes(&self) -> u64 {
        let mut total = 0;
        let mut p = self.head.clone();
        while let Some(block) = p {
            total += block.len() as u64;
            p = block.next();
        }
        total
    }
}

impl Default for SourceQueue {
    fn default() -> Self {
        Self::new()
    }
}
