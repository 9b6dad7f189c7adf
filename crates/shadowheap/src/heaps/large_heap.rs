//! Large-block heap: every allocation gets its own page-granular mapping.
//!
//! The left redzone is a full page holding the header; the tail of the
//! block always contains one page lying entirely in the right redzone.
//! Once those pages are protected, an access one page or more outside the
//! body faults immediately instead of waiting for an instrumented check.

use super::{BlockHeap, HeapKind};
use crate::block::{BlockLayout, HEADER_SIZE, TRAILER_SIZE};
use crate::platform;
use crate::sync::RawMutex;
use crate::util::{align_up, PAGE_SIZE, SHADOW_RATIO};

pub struct LargeBlockHeap {
    lock: RawMutex,
}

impl LargeBlockHeap {
    pub fn new() -> LargeBlockHeap {
        LargeBlockHeap {
            lock: RawMutex::new(),
        }
    }

    /// One page of header redzone, the body, then enough tail to contain a
    /// whole redzone page.
    fn plan(alignment: usize, body_size: usize) -> Option<BlockLayout> {
        if !alignment.is_power_of_two() || alignment > PAGE_SIZE {
            return None;
        }
        let body_granules = align_up(body_size, SHADOW_RATIO);
        let block_size = align_up(PAGE_SIZE + body_granules, PAGE_SIZE) + PAGE_SIZE;
        Some(BlockLayout {
            alignment,
            block_size,
            header_size: HEADER_SIZE,
            header_padding_size: PAGE_SIZE - HEADER_SIZE,
            body_size,
            trailer_padding_size: block_size - PAGE_SIZE - body_size - TRAILER_SIZE,
            trailer_size: TRAILER_SIZE,
        })
    }
}

impl Default for LargeBlockHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockHeap for LargeBlockHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Large
    }

    fn allocate_block(
        &self,
        alignment: usize,
        body_size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<(usize, BlockLayout)> {
        // The page-sized redzones subsume any reasonable minimum.
        if min_left_redzone > PAGE_SIZE || min_right_redzone > PAGE_SIZE {
            return None;
        }
        let layout = Self::plan(alignment, body_size)?;
        self.lock.lock();
        let base = unsafe { platform::map_anonymous_low(layout.block_size) };
        self.lock.unlock();
        if base.is_null() {
            return None;
        }
        Some((base as usize, layout))
    }

    fn free_block(&self, base: usize, total_size: usize) -> bool {
        self.lock.lock();
        unsafe { platform::unmap(base as *mut u8, total_size) };
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
