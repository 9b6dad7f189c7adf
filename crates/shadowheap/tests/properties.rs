//! Property tests for the shadow, block envelope, quarantine and
//! allocation sampling invariants.
//!
//! All shadow-touching tests share the global runtime's shadow and
//! serialise on one lock, so concurrent cases never interleave their
//! marker updates. Every case unpoisons and unmaps what it created.

use std::sync::{Arc, Mutex, MutexGuard};

use proptest::prelude::*;

use shadowheap::block::{self, BlockInfo, BlockLayout};
use shadowheap::heap_checker::HeapChecker;
use shadowheap::heap_manager::HeapManager;
use shadowheap::platform;
use shadowheap::quarantine::{QuarantineEntry, ShardedQuarantine, DEFAULT_SHARDS};
use shadowheap::runtime::{self, Runtime};
use shadowheap::shadow::Shadow;
use shadowheap::shadow_marker as marker;
use shadowheap::stack_cache::StackCache;
use shadowheap::util::{align_up, PAGE_SIZE, SHADOW_RATIO};

static SHADOW_GUARD: Mutex<()> = Mutex::new(());

fn lock_shadow() -> MutexGuard<'static, ()> {
    SHADOW_GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

fn ensure_runtime() -> &'static Runtime {
    let _ = runtime::setup(None);
    runtime::global().expect("runtime unavailable")
}

/// A low mapping released on drop.
struct LowRegion {
    base: usize,
    size: usize,
}

impl LowRegion {
    fn map(size: usize) -> LowRegion {
        let size = align_up(size, PAGE_SIZE);
        let ptr = unsafe { platform::map_anonymous_low(size) };
        assert!(!ptr.is_null(), "no low address space left for the test");
        LowRegion {
            base: ptr as usize,
            size,
        }
    }
}

impl Drop for LowRegion {
    fn drop(&mut self) {
        unsafe { platform::unmap(self.base as *mut u8, self.size) };
    }
}

/// A fully built envelope whose shadow markers are reverted on drop.
struct TestBlock<'a> {
    shadow: &'a Shadow,
    info: BlockInfo,
    _region: LowRegion,
}

impl<'a> TestBlock<'a> {
    fn build(
        shadow: &'a Shadow,
        alignment: usize,
        body_size: usize,
        layout: BlockLayout,
    ) -> TestBlock<'a> {
        let region = LowRegion::map(layout.block_size + alignment);
        let base = align_up(region.base, alignment);
        let info = unsafe { block::initialize(&layout, base, false, 1) };
        assert_eq!(info.body_size, body_size);
        shadow.poison_allocated_block(&info);
        unsafe { block::set_checksum(&info) };
        TestBlock {
            shadow,
            info,
            _region: region,
        }
    }
}

impl Drop for TestBlock<'_> {
    fn drop(&mut self) {
        self.shadow.unpoison(self.info.base, self.info.block_size);
    }
}

fn alignments() -> impl Strategy<Value = usize> {
    (3u32..=12).prop_map(|s| 1usize << s)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Envelope round-trip: the shadow alone recovers the planned info.
    #[test]
    fn envelope_round_trip(
        alignment in alignments(),
        body_size in 0usize..=(1 << 20),
        min_left in 0usize..256,
        min_right in 0usize..256,
    ) {
        let rt = ensure_runtime();
        let _guard = lock_shadow();
        let shadow = rt.shadow();

        let layout = BlockLayout::plan(alignment, body_size, min_left, min_right).unwrap();
        let tb = TestBlock::build(shadow, alignment, body_size, layout);

        prop_assert!(shadow.is_beginning_of_block_body(tb.info.body()));
        let recovered = shadow
            .block_info_from_shadow(tb.info.body())
            .expect("block not recoverable from shadow");
        prop_assert_eq!(recovered, tb.info);

        // Any interior address recovers the same block.
        if body_size > 0 {
            let mid = tb.info.body() + body_size / 2;
            prop_assert_eq!(shadow.block_info_from_shadow(mid), Some(tb.info));
        }
    }

    /// Partial-byte law: after Unpoison(addr, size) exactly the bytes of
    /// [addr, addr+size) are accessible within the poisoned page.
    #[test]
    fn unpoison_partial_byte_law(size in 0usize..=64) {
        let rt = ensure_runtime();
        let _guard = lock_shadow();
        let shadow = rt.shadow();

        let region = LowRegion::map(PAGE_SIZE);
        let addr = region.base;
        shadow.poison(addr, PAGE_SIZE, marker::USER_REDZONE);
        shadow.unpoison(addr, size);

        let end = align_up(size.max(1), SHADOW_RATIO) + SHADOW_RATIO;
        for p in addr..addr + end {
            let expected = p - addr < size;
            prop_assert_eq!(
                shadow.is_accessible(p),
                expected,
                "byte at offset {} (size {})",
                p - addr,
                size
            );
        }
        shadow.unpoison(addr, PAGE_SIZE);
    }

    /// Freed preservation: the body reads as freed, the flanking redzone
    /// granules keep their markers.
    #[test]
    fn mark_as_freed_preserves_redzones(
        body_size in 1usize..4096,
        min_left in 0usize..64,
        min_right in 0usize..64,
    ) {
        let rt = ensure_runtime();
        let _guard = lock_shadow();
        let shadow = rt.shadow();

        let layout = BlockLayout::plan(8, body_size, min_left, min_right).unwrap();
        let tb = TestBlock::build(shadow, 8, body_size, layout);
        let info = tb.info;

        let before_left = shadow.marker_at(info.body() - 1);
        let after_right = shadow.marker_at(info.body_end() + SHADOW_RATIO - 1);

        shadow.mark_as_freed(info.body(), body_size);

        let mut p = info.body();
        while p < info.body() + body_size {
            prop_assert_eq!(shadow.marker_at(p), marker::FREED);
            p += SHADOW_RATIO;
        }
        prop_assert_eq!(shadow.marker_at(info.body() - 1), before_left);
        prop_assert_eq!(
            shadow.marker_at(info.body_end() + SHADOW_RATIO - 1),
            after_right
        );
        // The envelope is still recoverable after the free.
        prop_assert_eq!(shadow.block_info_from_shadow(info.body()), Some(info));
    }

    /// Checksum tamper-detection: every metadata bit matters, no body bit
    /// does.
    #[test]
    fn checksum_tamper_detection(body_size in 1usize..64, min_left in 0usize..48) {
        let rt = ensure_runtime();
        let _guard = lock_shadow();
        let shadow = rt.shadow();

        let layout = BlockLayout::plan(8, body_size, min_left, 16).unwrap();
        let tb = TestBlock::build(shadow, 8, body_size, layout);
        let info = tb.info;
        let baseline = unsafe { block::compute_checksum(&info) };

        // Header bytes before the checksum field, the header padding, and
        // the whole right redzone including the trailer.
        let mut metadata: Vec<usize> = (info.base..info.base + 12).collect();
        metadata.extend(info.base + 16..info.body());
        metadata.extend(info.body_end()..info.end());

        for addr in metadata {
            for bit in 0..8u8 {
                unsafe {
                    let p = addr as *mut u8;
                    *p ^= 1 << bit;
                    let tampered = block::compute_checksum(&info);
                    *p ^= 1 << bit;
                    prop_assert_ne!(
                        tampered,
                        baseline,
                        "flip at offset {} bit {} went undetected",
                        addr - info.base,
                        bit
                    );
                }
            }
        }

        for addr in info.body()..info.body_end() {
            unsafe {
                let p = addr as *mut u8;
                *p ^= 0xFF;
                let tampered = block::compute_checksum(&info);
                *p ^= 0xFF;
                prop_assert_eq!(tampered, baseline);
            }
        }
    }

    /// Quarantine size bound: after any pushes and a final shrink the
    /// remaining total never exceeds the cap.
    #[test]
    fn quarantine_size_bound(
        sizes in proptest::collection::vec(8usize..8192, 1..128),
        cap in 0usize..65536,
    ) {
        let q = ShardedQuarantine::new(DEFAULT_SHARDS);
        let mut pushed_total = 0usize;
        for (i, &size) in sizes.iter().enumerate() {
            pushed_total += size;
            q.push(QuarantineEntry {
                base: 0x10000 + i * 0x100,
                total_size: size,
                hash: block::block_hash(0x10000 + i * 0x100),
            });
        }
        let mut evicted_total = 0usize;
        q.shrink(cap, |e| evicted_total += e.total_size);
        prop_assert!(q.total_size() <= cap);
        prop_assert_eq!(q.total_size() + evicted_total, pushed_total);
    }
}

/// Sampling rate: over N allocations at rate r, the guarded fraction
/// lands within a few standard deviations of r.
#[test]
fn allocation_guard_sampling_rate() {
    let rt = ensure_runtime();
    let _guard = lock_shadow();

    const N: usize = 10_000;
    for &rate in &[0.0f32, 0.25, 0.5, 0.9, 1.0] {
        let manager = HeapManager::new(rt.shadow().clone(), Arc::new(StackCache::new()));
        let mut params = shadowheap::config::RuntimeParams::default();
        params.allocation_guard_rate = rate;
        manager.set_parameters(&params);

        let heap = manager.create_heap();
        let mut guarded = 0usize;
        let mut ptrs = Vec::with_capacity(N);
        for _ in 0..N {
            let p = manager.allocate(heap, 16).expect("allocation failed");
            if rt.shadow().is_beginning_of_block_body(p) {
                guarded += 1;
            }
            ptrs.push(p);
        }
        for p in ptrs {
            assert!(manager.free(heap, p));
        }
        manager.teardown();

        let fraction = guarded as f64 / N as f64;
        // 1/sqrt(N) = 0.01; allow five sigma.
        let epsilon = 0.05;
        assert!(
            (fraction - rate as f64).abs() <= epsilon,
            "rate {}: got fraction {}",
            rate,
            fraction
        );
    }
}

/// Heap-corruption scan completeness: k tampered trailers are all found.
#[test]
fn heap_corruption_scan_finds_tampered_blocks() {
    let rt = ensure_runtime();
    let _guard = lock_shadow();

    let manager = HeapManager::new(rt.shadow().clone(), Arc::new(StackCache::new()));
    let params = shadowheap::config::RuntimeParams::default();
    manager.set_parameters(&params);
    let heap = manager.create_heap();

    const TOTAL: usize = 12;
    const CORRUPT: usize = 5;
    let ptrs: Vec<usize> = (0..TOTAL)
        .map(|_| manager.allocate(heap, 48).expect("allocation failed"))
        .collect();

    // Flip one trailer bit in every other block.
    let mut tampered = Vec::new();
    for &p in ptrs.iter().step_by(2).take(CORRUPT) {
        let info = rt.shadow().block_info_from_shadow(p).unwrap();
        let last = (info.end() - 1) as *mut u8;
        unsafe { *last ^= 0x10 };
        tampered.push(last);
    }

    let checker = HeapChecker::new(rt.shadow());
    let ranges = unsafe { checker.is_heap_corrupt() };
    let found: usize = ranges.iter().map(|r| r.block_count).sum();
    assert!(
        found >= CORRUPT,
        "expected at least {} corrupt blocks, found {} in {} ranges",
        CORRUPT,
        found,
        ranges.len()
    );

    // Repair and release everything.
    for last in tampered {
        unsafe { *last ^= 0x10 };
    }
    for p in ptrs {
        assert!(manager.free(heap, p));
    }
    manager.teardown();
}

/// Corrupt ranges fuse only across fully addressable gaps: a freed run
/// between two corrupt blocks splits them into separate ranges.
#[test]
fn corrupt_ranges_split_on_non_addressable_gaps() {
    let rt = ensure_runtime();
    let _guard = lock_shadow();
    let shadow = rt.shadow();

    let layout = BlockLayout::plan(8, 32, 16, 16).unwrap();
    let region = LowRegion::map(PAGE_SIZE);
    let base_a = region.base;
    let base_b = region.base + 256;

    let a = unsafe { block::initialize(&layout, base_a, false, 1) };
    shadow.poison_allocated_block(&a);
    unsafe { block::set_checksum(&a) };
    let b = unsafe { block::initialize(&layout, base_b, false, 1) };
    shadow.poison_allocated_block(&b);
    unsafe { block::set_checksum(&b) };

    // Tamper with both trailers.
    unsafe {
        *((a.end() - 1) as *mut u8) ^= 0x01;
        *((b.end() - 1) as *mut u8) ^= 0x01;
    }

    let checker = HeapChecker::new(shadow);
    let local = |ranges: &[shadowheap::heap_checker::CorruptRange]| {
        ranges
            .iter()
            .filter(|r| r.address >= region.base && r.address < region.base + PAGE_SIZE)
            .cloned()
            .collect::<Vec<_>>()
    };

    // The gap between the blocks is addressable, so they fuse.
    let fused = local(&unsafe { checker.is_heap_corrupt() });
    assert_eq!(fused.len(), 1);
    assert_eq!(fused[0].block_count, 2);
    assert_eq!(fused[0].address, a.base);
    assert_eq!(fused[0].length, b.end() - a.base);

    // A freed run in the gap splits them into two ranges.
    shadow.poison(a.end(), base_b - a.end(), marker::FREED);
    let split = local(&unsafe { checker.is_heap_corrupt() });
    assert_eq!(split.len(), 2);
    assert!(split.iter().all(|r| r.block_count == 1));

    shadow.unpoison(region.base, PAGE_SIZE);
}

/// Nested envelopes: an inner block inside an outer body is recovered at
/// the right depth, and the parent lookup finds the outer block.
#[test]
fn nested_block_recovery() {
    let rt = ensure_runtime();
    let _guard = lock_shadow();
    let shadow = rt.shadow();

    let outer_layout = BlockLayout::plan(8, 4096, 16, 16).unwrap();
    let outer_tb = TestBlock::build(shadow, 8, 4096, outer_layout);
    let outer = outer_tb.info;

    // Build a nested block inside the outer body.
    let inner_layout = BlockLayout::plan(8, 64, 16, 16).unwrap();
    let inner_base = align_up(outer.body() + 128, 8);
    let inner = unsafe { block::initialize(&inner_layout, inner_base, true, 2) };
    shadow.poison_allocated_block(&inner);

    let recovered = shadow
        .block_info_from_shadow(inner.body())
        .expect("inner block not recoverable");
    assert_eq!(recovered, inner);
    assert!(recovered.is_nested);

    let parent = shadow
        .parent_block_info_from_shadow(&recovered)
        .expect("parent block not recoverable");
    assert_eq!(parent, outer);

    // Outer addresses outside the inner block still resolve to the outer.
    assert_eq!(shadow.block_info_from_shadow(outer.body()), Some(outer));

    shadow.unpoison(inner.base, inner.block_size);
}
