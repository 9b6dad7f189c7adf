//! Zebra block heap: a fixed slab carved into two-page stripes, one
//! addressable body page followed by one guard page.
//!
//! Blocks are placed so the body's last granule abuts the guard page; the
//! whole guard page is the right redzone, with the trailer at its end.
//! A read one byte past a granule-aligned body therefore lands on the
//! protected page and faults at the instruction itself.

use super::{BlockHeap, HeapKind};
use crate::block::{BlockLayout, HEADER_SIZE, TRAILER_SIZE};
use crate::error::RuntimeError;
use crate::platform;
use crate::sync::{Mutex, RawMutex};
use crate::util::{align_up, PAGE_SIZE, SHADOW_RATIO};

/// Fixed slab size; the zebra heap cannot grow after creation.
pub const ZEBRA_SLAB_SIZE: usize = 8 << 20; // 8 MiB

const STRIPE_SIZE: usize = 2 * PAGE_SIZE;

pub struct ZebraBlockHeap {
    slab_base: usize,
    num_stripes: usize,
    free_stripes: Mutex<Vec<u32>>,
    lock: RawMutex,
}

impl ZebraBlockHeap {
    pub fn new() -> Result<ZebraBlockHeap, RuntimeError> {
        let slab = unsafe { platform::map_anonymous_low(ZEBRA_SLAB_SIZE) };
        if slab.is_null() {
            return Err(RuntimeError::AddressSpaceExhausted);
        }
        let num_stripes = ZEBRA_SLAB_SIZE / STRIPE_SIZE;
        Ok(ZebraBlockHeap {
            slab_base: slab as usize,
            num_stripes,
            free_stripes: Mutex::new((0..num_stripes as u32).rev().collect()),
            lock: RawMutex::new(),
        })
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.slab_base && addr < self.slab_base + self.num_stripes * STRIPE_SIZE
    }

    /// Whether a body of this size can be laid out in one stripe.
    pub fn fits(&self, body_size: usize, min_left_redzone: usize) -> bool {
        let left = align_up(HEADER_SIZE.max(min_left_redzone), SHADOW_RATIO);
        left + align_up(body_size, SHADOW_RATIO) <= PAGE_SIZE
    }
}

impl BlockHeap for ZebraBlockHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Zebra
    }

    fn allocate_block(
        &self,
        alignment: usize,
        body_size: usize,
        min_left_redzone: usize,
        _min_right_redzone: usize,
    ) -> Option<(usize, BlockLayout)> {
        if !alignment.is_power_of_two() || alignment < SHADOW_RATIO {
            return None;
        }
        let left = align_up(HEADER_SIZE.max(min_left_redzone), alignment);
        let body_granules = align_up(body_size, SHADOW_RATIO);
        if left + body_granules > PAGE_SIZE {
            return None;
        }

        let stripe = {
            self.lock.lock();
            let stripe = self.free_stripes.lock().pop();
            self.lock.unlock();
            stripe?
        } as usize;

        let stripe_base = self.slab_base + stripe * STRIPE_SIZE;
        let guard_page = stripe_base + PAGE_SIZE;
        let base = guard_page - left - body_granules;
        if base % alignment != 0 {
            // Cannot satisfy the alignment while abutting the guard page.
            self.free_stripes.lock().push(stripe as u32);
            return None;
        }
        // The stripe's guard page may still be protected from its last use.
        unsafe { platform::protect_read_write(guard_page as *mut u8, PAGE_SIZE) };

        let block_size = left + body_granules + PAGE_SIZE;
        let layout = BlockLayout {
            alignment,
            block_size,
            header_size: HEADER_SIZE,
            header_padding_size: left - HEADER_SIZE,
            body_size,
            trailer_padding_size: block_size - left - body_size - TRAILER_SIZE,
            trailer_size: TRAILER_SIZE,
        };
        Some((base, layout))
    }

    fn free_block(&self, base: usize, _total_size: usize) -> bool {
        if !self.contains(base) {
            return false;
        }
        let stripe = (base - self.slab_base) / STRIPE_SIZE;
        self.lock.lock();
        self.free_stripes.lock().push(stripe as u32);
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

impl Drop for ZebraBlockHeap {
    fn drop(&mut self) {
        unsafe {
            // Stripe guard pages may be protected; unmap does not care.
            platform::unmap(self.slab_base as *mut u8, ZEBRA_SLAB_SIZE);
        }
    }
}
