//! The block heaps: suppliers of envelope-shaped allocations.
//!
//! A heap hands out whole envelopes (base + realized layout); the heap
//! manager owns header initialization, shadow upkeep and quarantining.

pub mod large_heap;
pub mod low_heap;
pub mod simple_heap;
pub mod zebra_heap;

pub use large_heap::LargeBlockHeap;
pub use low_heap::LowHeap;
pub use simple_heap::SimpleBlockHeap;
pub use zebra_heap::ZebraBlockHeap;

use crate::block::{BlockInfo, BlockLayout};
use crate::platform;
use crate::shadow::Shadow;
use crate::util::{align_down, align_up, PAGE_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapKind {
    Simple,
    Large,
    Zebra,
}

pub trait BlockHeap: Send + Sync {
    fn kind(&self) -> HeapKind;

    /// Allocate an envelope meeting the alignment and minimum redzones.
    /// Returns the block base and the layout the heap settled on, or None
    /// when this heap cannot serve the request.
    fn allocate_block(
        &self,
        alignment: usize,
        body_size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<(usize, BlockLayout)>;

    /// Release an envelope previously returned by `allocate_block`.
    fn free_block(&self, base: usize, total_size: usize) -> bool;

    /// Raw allocation without an envelope, for unguarded (sampled-out)
    /// allocations. Only the simple heaps serve these.
    fn allocate_raw(&self, size: usize) -> Option<usize> {
        let _ = size;
        None
    }

    fn free_raw(&self, ptr: usize, size: usize) -> bool {
        let _ = (ptr, size);
        false
    }

    /// External heap lock, also excluding allocate/free on this heap.
    fn lock(&self);
    fn unlock(&self);
    fn try_lock(&self) -> bool;
}

/// The pages lying entirely inside a block envelope, if any. Protection is
/// only ever applied to these: pages shared with neighbouring memory must
/// stay accessible.
fn contained_pages(base: usize, end: usize) -> Option<(usize, usize)> {
    let first = align_up(base, PAGE_SIZE);
    let last = align_down(end, PAGE_SIZE);
    if first < last {
        Some((first, last - first))
    } else {
        None
    }
}

/// Lift page protection from every page of the block so its metadata can
/// be read and written. The bitmap is updated under its lock.
///
/// # Safety
/// The block's memory must be a live mapping.
pub unsafe fn block_protect_none(info: &BlockInfo, shadow: &Shadow) {
    if let Some((page, size)) = contained_pages(info.base, info.end()) {
        platform::protect_read_write(page as *mut u8, size);
        shadow.mark_pages_unprotected(page, size);
    }
}

/// Protect every page fully contained in the block. Applied to
/// quarantined blocks so stale pointers fault immediately.
///
/// # Safety
/// The block's memory must be a live mapping, and its metadata must not
/// be needed until protection is lifted again.
pub unsafe fn block_protect_all(info: &BlockInfo, shadow: &Shadow) {
    if let Some((page, size)) = contained_pages(info.base, info.end()) {
        platform::protect_none(page as *mut u8, size);
        shadow.mark_pages_protected(page, size);
    }
}

/// Protect the pages fully contained in the left and right redzones. For
/// page-granular heaps this arms the guard pages; for small blocks it is
/// a no-op.
///
/// # Safety
/// The block's memory must be a live mapping with valid metadata; the
/// header or trailer may land on a protected page and must from now on be
/// accessed only after `block_protect_none`.
pub unsafe fn block_protect_redzones(info: &BlockInfo, shadow: &Shadow) {
    if let Some((page, size)) = contained_pages(info.base, info.body()) {
        platform::protect_none(page as *mut u8, size);
        shadow.mark_pages_protected(page, size);
    }
    if let Some((page, size)) = contained_pages(info.body_end(), info.end()) {
        platform::protect_none(page as *mut u8, size);
        shadow.mark_pages_protected(page, size);
    }
}

/// True when any page of the block is currently marked protected.
pub fn block_has_protected_pages(info: &BlockInfo, shadow: &Shadow) -> bool {
    let mut page = align_down(info.base, PAGE_SIZE);
    while page < info.end() {
        if shadow.page_is_protected(page) {
            return true;
        }
        page += PAGE_SIZE;
    }
    false
}
