//! Whole-heap corruption scan.
//!
//! Walks the shadow between the address bounds, verifies every block it
//! encodes, and gathers corrupt blocks into address ranges. Runs of
//! corrupt blocks with nothing but addressable bytes between them merge
//! into a single range.

use crate::block::{self, BlockInfo};
use crate::heaps;
use crate::shadow::Shadow;
use crate::shadow_walker::ShadowWalker;
use crate::util::{ADDRESS_LOWER_BOUND, ADDRESS_UPPER_BOUND};

#[derive(Clone, Copy, Debug, Default)]
pub struct CorruptRange {
    pub address: usize,
    pub length: usize,
    pub block_count: usize,
    /// The first corrupt block of the range, for the error report.
    pub first_block: Option<BlockInfo>,
}

pub struct HeapChecker<'a> {
    shadow: &'a Shadow,
}

impl<'a> HeapChecker<'a> {
    pub fn new(shadow: &'a Shadow) -> HeapChecker<'a> {
        HeapChecker { shadow }
    }

    /// Scan the whole instrumentable range and yield each corrupt range.
    /// Returns the total number of ranges found.
    ///
    /// Protection is removed from the blocks visited and left off, so a
    /// downstream minidump can introspect them.
    ///
    /// # Safety
    /// Heap mutation must be quiesced (callers hold the heap locks via
    /// `BestEffortLockAll`) and the page-protection lock must be held.
    pub unsafe fn for_each_corrupt_range(
        &self,
        mut f: impl FnMut(CorruptRange),
    ) -> usize {
        let mut walker = ShadowWalker::new(
            self.shadow,
            true,
            ADDRESS_LOWER_BOUND,
            ADDRESS_UPPER_BOUND,
        );

        let mut ranges = 0usize;
        let mut current: Option<CorruptRange> = None;

        while let Some(info) = walker.next() {
            if heaps::block_has_protected_pages(&info, self.shadow) {
                heaps::block_protect_none(&info, self.shadow);
            }
            if block::block_is_corrupt(&info) {
                match current.as_mut() {
                    Some(range) if self.extends_range(range, &info) => {
                        range.length = range.length.max(info.end() - range.address);
                        range.block_count += 1;
                    }
                    _ => {
                        if let Some(range) = current.take() {
                            ranges += 1;
                            f(range);
                        }
                        current = Some(CorruptRange {
                            address: info.base,
                            length: info.block_size,
                            block_count: 1,
                            first_block: Some(info),
                        });
                    }
                }
            } else if let Some(range) = current.take() {
                ranges += 1;
                f(range);
            }
        }
        if let Some(range) = current.take() {
            ranges += 1;
            f(range);
        }
        ranges
    }

    /// A corrupt block joins the current range only when it is adjacent
    /// (or nested within it), or separated from it by nothing but fully
    /// addressable bytes. Freed, runtime or invalid runs in between split
    /// the ranges.
    fn extends_range(&self, range: &CorruptRange, info: &BlockInfo) -> bool {
        let range_end = range.address + range.length;
        if info.base <= range_end {
            return true;
        }
        self.shadow.is_range_addressable(range_end, info.base)
    }

    /// Convenience form collecting the ranges.
    ///
    /// # Safety
    /// Same as `for_each_corrupt_range`.
    pub unsafe fn is_heap_corrupt(&self) -> Vec<CorruptRange> {
        let mut out = Vec::new();
        self.for_each_corrupt_range(|r| out.push(r));
        out
    }
}
