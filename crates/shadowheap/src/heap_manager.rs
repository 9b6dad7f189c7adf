//! The block heap manager: heap registry, allocation dispatch, the free
//! path and quarantine upkeep.
//!
//! The manager owns the shadow state transitions for every block. User
//! code asks for a heap and gets a simple block heap; the manager may
//! still serve an individual allocation from the zebra or large-block
//! heap, and records enough in the block trailer to find the owner again
//! at release time.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, warn};

use crate::block::{self, BlockState};
use crate::config::RuntimeParams;
use crate::error::{fill_bad_access_info, BadAccessKind, ErrorInfo, ERROR_SENTINEL_CODE};
use crate::heaps::{self, BlockHeap, LargeBlockHeap, SimpleBlockHeap, ZebraBlockHeap};
use crate::quarantine::{QuarantineEntry, ShardedQuarantine, DEFAULT_SHARDS};
use crate::shadow::Shadow;
use crate::stack_cache::StackCache;

/// Stable heap handle. Ids are never reused, so a stale handle stays
/// invalid forever; validity is a single map lookup.
pub type HeapId = u32;

/// Alignment served to instrumented code.
pub const DEFAULT_ALLOCATION_ALIGNMENT: usize = 8;

/// Minimum redzone bytes on either side of a body.
pub const MIN_REDZONE_SIZE: usize = 16;

pub type HeapErrorCallback = Arc<dyn Fn(&mut ErrorInfo) + Send + Sync>;

thread_local! {
    static ALLOCATION_FILTER_FLAG: Cell<bool> = const { Cell::new(false) };
}

struct UnguardedAlloc {
    heap: HeapId,
    size: usize,
}

struct Registry {
    heaps: HashMap<HeapId, Arc<dyn BlockHeap>>,
    next_id: HeapId,
    /// Heaps locked by the last `best_effort_lock_all`.
    locked: Vec<HeapId>,
}

impl Registry {
    fn insert(&mut self, heap: Arc<dyn BlockHeap>) -> HeapId {
        let id = self.next_id;
        self.next_id += 1;
        self.heaps.insert(id, heap);
        id
    }
}

pub struct HeapManager {
    shadow: Arc<Shadow>,
    stack_cache: Arc<StackCache>,
    registry: crate::sync::Mutex<Registry>,
    quarantine: ShardedQuarantine,
    unguarded: crate::sync::Mutex<HashMap<usize, UnguardedAlloc>>,
    error_callback: crate::sync::Mutex<Option<HeapErrorCallback>>,

    // Hot-path parameter mirrors, set once by `set_parameters`.
    guard_rate_bits: AtomicU32,
    quarantine_size: AtomicUsize,
    quarantine_block_size: AtomicUsize,
    large_threshold: AtomicUsize,
    trailer_padding: AtomicUsize,
    allocation_filter_enabled: AtomicBool,
    large_heap_disabled: AtomicBool,

    large_heap: Arc<LargeBlockHeap>,
    large_heap_id: HeapId,
    zebra: crate::sync::Mutex<Option<Arc<ZebraBlockHeap>>>,
    zebra_heap_id: AtomicU32,
    zebra_enabled: AtomicBool,
    process_heap_id: HeapId,
}

impl HeapManager {
    pub fn new(shadow: Arc<Shadow>, stack_cache: Arc<StackCache>) -> HeapManager {
        let mut registry = Registry {
            heaps: HashMap::new(),
            next_id: 1,
            locked: Vec::new(),
        };

        let large_heap = Arc::new(LargeBlockHeap::new());
        let large_heap_id = registry.insert(large_heap.clone());
        let process_heap_id = registry.insert(Arc::new(SimpleBlockHeap::new()));

        HeapManager {
            shadow,
            stack_cache,
            registry: crate::sync::Mutex::new(registry),
            quarantine: ShardedQuarantine::new(DEFAULT_SHARDS),
            unguarded: crate::sync::Mutex::new(HashMap::new()),
            error_callback: crate::sync::Mutex::new(None),
            guard_rate_bits: AtomicU32::new(1.0f32.to_bits()),
            quarantine_size: AtomicUsize::new(crate::config::DEFAULT_QUARANTINE_SIZE),
            quarantine_block_size: AtomicUsize::new(crate::config::DEFAULT_QUARANTINE_BLOCK_SIZE),
            large_threshold: AtomicUsize::new(crate::config::DEFAULT_LARGE_ALLOCATION_THRESHOLD),
            trailer_padding: AtomicUsize::new(0),
            allocation_filter_enabled: AtomicBool::new(false),
            large_heap_disabled: AtomicBool::new(false),
            large_heap,
            large_heap_id,
            zebra: crate::sync::Mutex::new(None),
            zebra_heap_id: AtomicU32::new(0),
            zebra_enabled: AtomicBool::new(false),
            process_heap_id,
        }
    }

    /// Push parameter values to the hot-path mirrors and create the zebra
    /// heap on first enable. The zebra heap has a fixed size and survives
    /// a later disable (deallocations keep working, allocations stop).
    pub fn set_parameters(&self, params: &RuntimeParams) {
        self.guard_rate_bits
            .store(params.allocation_guard_rate.to_bits(), Ordering::Relaxed);
        self.quarantine_size
            .store(params.quarantine_size, Ordering::Relaxed);
        self.quarantine_block_size
            .store(params.quarantine_block_size, Ordering::Relaxed);
        self.large_threshold
            .store(params.large_allocation_threshold, Ordering::Relaxed);
        self.trailer_padding
            .store(params.trailer_padding_size, Ordering::Relaxed);
        self.allocation_filter_enabled
            .store(params.enable_allocation_filter, Ordering::Relaxed);
        self.large_heap_disabled
            .store(params.disable_large_block_heap, Ordering::Relaxed);

        if params.enable_zebra_block_heap {
            let mut zebra = self.zebra.lock();
            if zebra.is_none() {
                match ZebraBlockHeap::new() {
                    Ok(heap) => {
                        let heap = Arc::new(heap);
                        let id = self.registry.lock().insert(heap.clone());
                        self.zebra_heap_id.store(id, Ordering::Relaxed);
                        *zebra = Some(heap);
                    }
                    Err(e) => error!("failed to create the zebra block heap: {}", e),
                }
            }
            self.zebra_enabled.store(true, Ordering::Relaxed);
        } else {
            self.zebra_enabled.store(false, Ordering::Relaxed);
        }
    }

    pub fn set_heap_error_callback(&self, callback: HeapErrorCallback) {
        *self.error_callback.lock() = Some(callback);
    }

    pub fn process_heap(&self) -> HeapId {
        self.process_heap_id
    }

    // ------------------------------------------------------------------
    // Heap registry
    // ------------------------------------------------------------------

    pub fn create_heap(&self) -> HeapId {
        self.registry
            .lock()
            .insert(Arc::new(SimpleBlockHeap::new()))
    }

    pub fn is_valid_heap(&self, heap_id: HeapId) -> bool {
        self.registry.lock().heaps.contains_key(&heap_id)
    }

    fn resolve(&self, heap_id: HeapId) -> Option<Arc<dyn BlockHeap>> {
        self.registry.lock().heaps.get(&heap_id).cloned()
    }

    /// Destroy a heap, first releasing every quarantined block it owns.
    pub fn destroy_heap(&self, heap_id: HeapId) -> bool {
        if !self.is_valid_heap(heap_id) {
            return false;
        }

        // Flush the shared quarantine: release this heap's blocks, keep
        // everything else.
        let mut keep = Vec::new();
        self.quarantine.flush(|entry| {
            if self.entry_owner(&entry) == Some(heap_id) {
                self.release_entry(entry);
            } else {
                keep.push(entry);
            }
        });
        for entry in keep {
            self.quarantine.push(entry);
        }

        self.registry.lock().heaps.remove(&heap_id).is_some()
    }

    /// Release everything and drop all heaps. Called at runtime teardown.
    pub fn teardown(&self) {
        self.quarantine.flush(|entry| self.release_entry(entry));
        let mut registry = self.registry.lock();
        registry.heaps.clear();
        *self.zebra.lock() = None;
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    pub fn allocate(&self, heap_id: HeapId, bytes: usize) -> Option<usize> {
        let user_heap = self.resolve(heap_id)?;

        // Sampling: unguarded allocations skip the envelope entirely but
        // stay recognisable to `free`.
        if !self.sample_guarded() {
            let ptr = user_heap.allocate_raw(bytes)?;
            self.unguarded
                .lock()
                .insert(ptr, UnguardedAlloc { heap: heap_id, size: bytes });
            return Some(ptr);
        }

        let min_right = MIN_REDZONE_SIZE + self.trailer_padding.load(Ordering::Relaxed);
        let mut placed: Option<(HeapId, usize, block::BlockLayout)> = None;

        // The per-thread filter flag routes selected allocations to the
        // zebra heap when it fits a stripe.
        if self.allocation_filter_enabled.load(Ordering::Relaxed)
            && self.zebra_enabled.load(Ordering::Relaxed)
            && allocation_filter_flag()
        {
            let zebra = self.zebra.lock().clone();
            if let Some(zebra) = zebra {
                if zebra.fits(bytes, MIN_REDZONE_SIZE) {
                    if let Some((base, layout)) = zebra.allocate_block(
                        DEFAULT_ALLOCATION_ALIGNMENT,
                        bytes,
                        MIN_REDZONE_SIZE,
                        min_right,
                    ) {
                        let id = self.zebra_heap_id.load(Ordering::Relaxed);
                        placed = Some((id, base, layout));
                    }
                }
            }
        }

        if placed.is_none()
            && bytes >= self.large_threshold.load(Ordering::Relaxed)
            && !self.large_heap_disabled.load(Ordering::Relaxed)
        {
            if let Some((base, layout)) = self.large_heap.allocate_block(
                DEFAULT_ALLOCATION_ALIGNMENT,
                bytes,
                MIN_REDZONE_SIZE,
                min_right,
            ) {
                placed = Some((self.large_heap_id, base, layout));
            }
        }

        if placed.is_none() {
            let (base, layout) = user_heap.allocate_block(
                DEFAULT_ALLOCATION_ALIGNMENT,
                bytes,
                MIN_REDZONE_SIZE,
                min_right,
            )?;
            placed = Some((heap_id, base, layout));
        }

        let (owner_id, base, layout) = placed?;
        let alloc_stack = self.stack_cache.capture_and_save();

        let info = unsafe { block::initialize(&layout, base, false, alloc_stack) };
        unsafe { (*info.trailer_ptr()).heap_tag = owner_id };
        self.shadow.poison_allocated_block(&info);
        unsafe { block::set_checksum(&info) };
        unsafe { heaps::block_protect_redzones(&info, &self.shadow) };

        Some(info.body())
    }

    // ------------------------------------------------------------------
    // Free path
    // ------------------------------------------------------------------

    pub fn free(&self, heap_id: HeapId, ptr: usize) -> bool {
        // Unguarded allocations first.
        if let Some(unguarded) = self.unguarded.lock().remove(&ptr) {
            if let Some(heap) = self.resolve(unguarded.heap) {
                return heap.free_raw(ptr, unguarded.size);
            }
            return false;
        }

        if !self.shadow.is_beginning_of_block_body(ptr) {
            self.report_heap_error(ptr, BadAccessKind::CorruptBlock);
            return false;
        }

        let page_lock = self.shadow.page_protection_lock();
        page_lock.lock();

        let info = match self.shadow.block_info_from_shadow(ptr) {
            Some(info) => info,
            None => {
                page_lock.unlock();
                self.report_heap_error(ptr, BadAccessKind::CorruptBlock);
                return false;
            }
        };
        if heaps::block_has_protected_pages(&info, &self.shadow) {
            unsafe { heaps::block_protect_none(&info, &self.shadow) };
        }

        // The header walk must agree with the shadow about where the
        // block starts; a mismatch means the padding tags were stomped.
        let header = unsafe { block::header_from_body(ptr) };
        if header != Some(info.header_ptr()) {
            page_lock.unlock();
            self.report_heap_error(ptr, BadAccessKind::CorruptBlock);
            return self.free_corrupt_block(&info, heap_id);
        }

        let corrupt = unsafe { block::block_is_corrupt(&info) };
        let state = unsafe { (*info.header_ptr()).block_state() };

        if corrupt {
            page_lock.unlock();
            self.report_heap_error(ptr, BadAccessKind::CorruptBlock);
            return self.free_corrupt_block(&info, heap_id);
        }

        match state {
            Some(BlockState::Allocated) => {}
            _ => {
                // A valid checksum with a non-allocated state is the
                // signature of a double free.
                page_lock.unlock();
                self.report_heap_error(ptr, BadAccessKind::DoubleFree);
                return false;
            }
        }

        let free_stack = self.stack_cache.capture_and_save();
        unsafe { block::convert_to_quarantined(&info, free_stack) };
        self.shadow.mark_as_freed(info.base, info.block_size);
        unsafe { heaps::block_protect_all(&info, &self.shadow) };
        page_lock.unlock();

        let entry = QuarantineEntry {
            base: info.base,
            total_size: info.block_size,
            hash: block::block_hash(info.base),
        };

        let cap = self.quarantine_size.load(Ordering::Relaxed);
        let block_cap = self.quarantine_block_size.load(Ordering::Relaxed);
        if cap == 0 || entry.total_size > block_cap {
            // No quarantine, or the block alone busts the per-block cap.
            self.release_entry(entry);
        } else {
            self.quarantine.push(entry);
            self.trim_quarantine();
        }
        true
    }

    /// Body size of a live allocation, or 0.
    pub fn size(&self, _heap_id: HeapId, ptr: usize) -> usize {
        if let Some(unguarded) = self.unguarded.lock().get(&ptr) {
            return unguarded.size;
        }
        if !self.shadow.is_beginning_of_block_body(ptr) {
            return 0;
        }
        self.shadow
            .block_info_from_shadow(ptr)
            .map_or(0, |info| info.body_size)
    }

    pub fn lock(&self, heap_id: HeapId) {
        if let Some(heap) = self.resolve(heap_id) {
            heap.lock();
        }
    }

    pub fn unlock(&self, heap_id: HeapId) {
        if let Some(heap) = self.resolve(heap_id) {
            heap.unlock();
        }
    }

    /// Try to lock every heap for coordinated inspection. Heaps whose lock
    /// cannot be acquired immediately are skipped; their ids are returned
    /// so the inspector treats them as unreliable.
    pub fn best_effort_lock_all(&self) -> Vec<HeapId> {
        let mut registry = self.registry.lock();
        let mut skipped = Vec::new();
        let ids: Vec<HeapId> = registry.heaps.keys().copied().collect();
        for id in ids {
            let heap = registry.heaps.get(&id).cloned();
            if let Some(heap) = heap {
                if heap.try_lock() {
                    registry.locked.push(id);
                } else {
                    skipped.push(id);
                }
            }
        }
        skipped
    }

    pub fn unlock_all(&self) {
        let mut registry = self.registry.lock();
        let locked = core::mem::take(&mut registry.locked);
        for id in locked {
            if let Some(heap) = registry.heaps.get(&id).cloned() {
                heap.unlock();
            }
        }
    }

    // ------------------------------------------------------------------
    // Quarantine upkeep
    // ------------------------------------------------------------------

    fn trim_quarantine(&self) {
        let cap = self.quarantine_size.load(Ordering::Relaxed);
        self.quarantine.shrink(cap, |entry| self.release_entry(entry));
    }

    pub fn quarantine_size_in_use(&self) -> usize {
        self.quarantine.total_size()
    }

    /// Owner heap of a quarantined entry, recorded in its trailer.
    fn entry_owner(&self, entry: &QuarantineEntry) -> Option<HeapId> {
        let page_lock = self.shadow.page_protection_lock();
        page_lock.lock();
        let owner = self.shadow.block_info_from_shadow(entry.base).map(|info| {
            if heaps::block_has_protected_pages(&info, &self.shadow) {
                unsafe { heaps::block_protect_none(&info, &self.shadow) };
            }
            unsafe { (*info.trailer_ptr()).heap_tag }
        });
        page_lock.unlock();
        owner
    }

    /// Fully release an evicted entry: re-verify the checksum, flip the
    /// state to freed, make the shadow addressable again and hand the raw
    /// memory back to the underlying heap.
    fn release_entry(&self, entry: QuarantineEntry) {
        let page_lock = self.shadow.page_protection_lock();
        page_lock.lock();

        let info = match self.shadow.block_info_from_shadow(entry.base) {
            Some(info) => info,
            None => {
                page_lock.unlock();
                self.report_heap_error(entry.base, BadAccessKind::CorruptBlock);
                return;
            }
        };
        if heaps::block_has_protected_pages(&info, &self.shadow) {
            unsafe { heaps::block_protect_none(&info, &self.shadow) };
        }

        let corrupt = unsafe { block::block_is_corrupt(&info) }
            || unsafe { (*info.header_ptr()).block_state() } != Some(BlockState::Quarantined);
        let owner = unsafe { (*info.trailer_ptr()).heap_tag };
        page_lock.unlock();

        if corrupt {
            self.report_heap_error(entry.base, BadAccessKind::CorruptBlock);
            unsafe { block::clear_corrupt_metadata(&info) };
        } else {
            unsafe { block::convert_to_freed(&info) };
        }

        self.shadow.unpoison(info.base, info.block_size);
        match self.resolve(owner) {
            Some(heap) => {
                heap.free_block(info.base, info.block_size);
            }
            None => {
                warn!(
                    "quarantined block 0x{:08x} has no live owner heap; leaking it",
                    info.base
                );
            }
        }
    }

    /// Best-effort release of a block that failed verification on free.
    fn free_corrupt_block(&self, info: &block::BlockInfo, fallback_heap: HeapId) -> bool {
        let owner = unsafe { (*info.trailer_ptr()).heap_tag };
        unsafe { block::clear_corrupt_metadata(info) };
        self.shadow.unpoison(info.base, info.block_size);
        let heap = self.resolve(owner).or_else(|| self.resolve(fallback_heap));
        match heap {
            Some(heap) => heap.free_block(info.base, info.block_size),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Error reporting
    // ------------------------------------------------------------------

    /// Report an error originating from heap metadata itself (double
    /// free, corrupt block). Read/write errors are detected outside the
    /// manager and classified there.
    fn report_heap_error(&self, address: usize, kind: BadAccessKind) {
        let mut info = ErrorInfo::new(address, kind);
        info.sentinel_code = ERROR_SENTINEL_CODE;
        info.crash_stack_id = crate::stack_cache::current_stack_fingerprint();

        {
            let page_lock = self.shadow.page_protection_lock();
            page_lock.lock();
            unsafe { fill_bad_access_info(&self.shadow, &mut info) };
            page_lock.unlock();
        }
        // Classification refines overflow/underflow from markers; the
        // originating kind wins for metadata errors.
        info.kind = kind;
        self.shadow
            .append_shadow_memory_text(address, &mut info.shadow_text);

        let callback = self.error_callback.lock().clone();
        match callback {
            Some(callback) => callback(&mut info),
            None => error!(
                "{} on address 0x{:08x} (no error callback installed)",
                kind.as_str(),
                address
            ),
        }
    }
}

/// Per-thread allocation filter flag; multiple threads never share it.
pub fn allocation_filter_flag() -> bool {
    ALLOCATION_FILTER_FLAG.with(|flag| flag.get())
}

pub fn set_allocation_filter_flag(value: bool) {
    ALLOCATION_FILTER_FLAG.with(|flag| flag.set(value));
}

impl HeapManager {
    fn sample_guarded(&self) -> bool {
        let rate = f32::from_bits(self.guard_rate_bits.load(Ordering::Relaxed));
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        let threshold = (rate as f64 * (1u64 << 32) as f64) as u64;
        (crate::platform::fast_random_u64() & 0xFFFF_FFFF) < threshold
    }
}
