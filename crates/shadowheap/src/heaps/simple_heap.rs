//! The default block heap: one envelope per allocation, carved from a
//! private low heap.

use super::{BlockHeap, HeapKind, LowHeap};
use crate::block::BlockLayout;
use crate::sync::RawMutex;
use crate::util::{align_up, SHADOW_RATIO};

pub struct SimpleBlockHeap {
    raw: LowHeap,
    lock: RawMutex,
}

impl SimpleBlockHeap {
    pub fn new() -> SimpleBlockHeap {
        SimpleBlockHeap {
            raw: LowHeap::new(),
            lock: RawMutex::new(),
        }
    }
}

impl Default for SimpleBlockHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockHeap for SimpleBlockHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Simple
    }

    fn allocate_block(
        &self,
        alignment: usize,
        body_size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<(usize, BlockLayout)> {
        let layout = BlockLayout::plan(alignment, body_size, min_left_redzone, min_right_redzone)?;
        self.lock.lock();
        let base = self.raw.allocate(layout.block_size, alignment);
        self.lock.unlock();
        base.map(|base| (base, layout))
    }

    fn free_block(&self, base: usize, total_size: usize) -> bool {
        self.lock.lock();
        self.raw.free(base, total_size);
        self.lock.unlock();
        true
    }

    fn allocate_raw(&self, size: usize) -> Option<usize> {
        self.lock.lock();
        let ptr = self.raw.allocate(raw_size(size), SHADOW_RATIO);
        self.lock.unlock();
        ptr
    }

    fn free_raw(&self, ptr: usize, size: usize) -> bool {
        if !self.raw.contains(ptr) {
            return false;
        }
        self.lock.lock();
        self.raw.free(ptr, raw_size(size));
        self.lock.unlock();
        true
    }

    fn lock(&self) {
        self.lock.lock();
    }

    fn unlock(&self) {
        self.lock.unlock();
    }

    fn try_lock(&self) -> bool {
        self.lock.try_lock()
    }
}

fn raw_size(size: usize) -> usize {
    align_up(size.max(1), SHADOW_RATIO)
}
