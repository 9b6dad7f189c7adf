//! End-to-end error detection scenarios.
//!
//! The synchronous paths (instrumented checks, free-path verification)
//! run in-process with a recording error callback. Scenarios that end in
//! a real page fault, or that exercise the default terminal handler, run
//! as subprocesses: we re-spawn the test binary with a scenario name in
//! the environment and assert on its exit status and stderr.

use std::sync::{Arc, Mutex, MutexGuard};

use shadowheap::error::{AccessMode, BadAccessKind, ErrorInfo};
use shadowheap::runtime::{self, Runtime};

static TEST_GUARD: Mutex<()> = Mutex::new(());

fn lock_tests() -> MutexGuard<'static, ()> {
    TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

fn ensure_runtime() -> &'static Runtime {
    let _ = runtime::setup(None);
    runtime::global().expect("runtime unavailable")
}

#[derive(Clone, Debug)]
struct Captured {
    kind: BadAccessKind,
    access_mode: AccessMode,
    access_size: usize,
    location: usize,
    alloc_stack: u32,
    free_stack: u32,
    milliseconds_since_free: u64,
}

/// Install a recording callback, run `f`, restore the default handler and
/// return everything captured.
fn with_error_capture(rt: &Runtime, f: impl FnOnce()) -> Vec<Captured> {
    let captured: Arc<Mutex<Vec<Captured>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    rt.set_error_callback(Arc::new(move |info: &mut ErrorInfo| {
        sink.lock().unwrap().push(Captured {
            kind: info.kind,
            access_mode: info.access_mode,
            access_size: info.access_size,
            location: info.location,
            alloc_stack: info.alloc_stack,
            free_stack: info.free_stack,
            milliseconds_since_free: info.milliseconds_since_free,
        });
    }));
    f();
    rt.clear_error_callback();
    let result = captured.lock().unwrap().clone();
    result
}

// ---------------------------------------------------------------------------
// E1: overflow read one byte past a 10-byte body.
// ---------------------------------------------------------------------------

#[test]
fn overflow_read_is_reported() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();
    let p = rt.heap_manager().allocate(heap, 10).unwrap();

    let captured = with_error_capture(rt, || {
        assert!(!rt.check_access(p + 10, 1, AccessMode::Read));
    });

    assert_eq!(captured.len(), 1);
    let err = &captured[0];
    assert_eq!(err.kind, BadAccessKind::HeapBufferOverflow);
    assert_eq!(err.access_mode, AccessMode::Read);
    assert_eq!(err.access_size, 1);
    assert_eq!(err.location, p + 10);
    assert_ne!(err.alloc_stack, 0);

    assert!(rt.heap_manager().free(heap, p));
    assert!(rt.heap_manager().destroy_heap(heap));
}

// ---------------------------------------------------------------------------
// E2: underflow read one byte before the body.
// ---------------------------------------------------------------------------

#[test]
fn underflow_read_is_reported() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();
    let p = rt.heap_manager().allocate(heap, 10).unwrap();

    let captured = with_error_capture(rt, || {
        assert!(!rt.check_access(p - 1, 1, AccessMode::Read));
    });

    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].kind, BadAccessKind::HeapBufferUnderflow);
    assert_eq!(captured[0].access_mode, AccessMode::Read);
    assert_eq!(captured[0].access_size, 1);

    assert!(rt.heap_manager().free(heap, p));
    assert!(rt.heap_manager().destroy_heap(heap));
}

// ---------------------------------------------------------------------------
// E3: use-after-free read with the free stack populated.
// ---------------------------------------------------------------------------

#[test]
fn use_after_free_is_reported_with_free_stack() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();
    let p = rt.heap_manager().allocate(heap, 16).unwrap();
    assert!(rt.heap_manager().free(heap, p));

    let captured = with_error_capture(rt, || {
        assert!(!rt.check_access(p, 1, AccessMode::Read));
    });

    assert_eq!(captured.len(), 1);
    let err = &captured[0];
    assert_eq!(err.kind, BadAccessKind::UseAfterFree);
    assert_eq!(err.access_mode, AccessMode::Read);
    assert_eq!(err.access_size, 1);
    assert_ne!(err.free_stack, 0, "free stack missing from UAF report");
    assert_ne!(err.alloc_stack, 0);
    assert!(err.milliseconds_since_free < 60_000);

    assert!(rt.heap_manager().destroy_heap(heap));
}

// ---------------------------------------------------------------------------
// E4: double free.
// ---------------------------------------------------------------------------

#[test]
fn double_free_is_reported() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();
    let p = rt.heap_manager().allocate(heap, 16).unwrap();
    assert!(rt.heap_manager().free(heap, p));

    let captured = with_error_capture(rt, || {
        assert!(!rt.heap_manager().free(heap, p));
    });

    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].kind, BadAccessKind::DoubleFree);
    assert_ne!(captured[0].free_stack, 0);

    assert!(rt.heap_manager().destroy_heap(heap));
}

// ---------------------------------------------------------------------------
// E5: free of a block with a corrupted header survives without crashing.
// ---------------------------------------------------------------------------

#[test]
fn corrupt_header_is_reported_on_free() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();
    let p = rt.heap_manager().allocate(heap, 16).unwrap();

    // Overwrite the header magic. The header directly precedes the body
    // for granule-aligned allocations without padding.
    let info = rt.shadow().block_info_from_shadow(p).unwrap();
    unsafe { *(info.base as *mut u16) = 0x1234 };

    let captured = with_error_capture(rt, || {
        // The free path classifies, reports and recovers best-effort.
        rt.heap_manager().free(heap, p);
    });

    assert!(!captured.is_empty());
    assert_eq!(captured[0].kind, BadAccessKind::CorruptBlock);

    assert!(rt.heap_manager().destroy_heap(heap));
}

// ---------------------------------------------------------------------------
// Subprocess scenarios: real faults and the default terminal handler.
// ---------------------------------------------------------------------------

const SCENARIO_ENV_VAR: &str = "SHADOWHEAP_DETECTION_SCENARIO";

/// Run the current test binary with a scenario name and verify it died
/// abnormally with the expected diagnostic on stderr.
fn expect_death_subprocess(scenario_name: &str, expected_msg: &str) {
    let exe = std::env::current_exe().expect("cannot determine test binary path");

    let output = std::process::Command::new(&exe)
        .env(SCENARIO_ENV_VAR, scenario_name)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess");

    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have died, but exited cleanly. stderr:\n{}",
        scenario_name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "subprocess for scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}

/// When the scenario env var is set, run the requested scenario instead
/// of normal test assertions. The scenario is expected to die.
#[test]
fn scenario_driver() {
    let scenario = match std::env::var(SCENARIO_ENV_VAR) {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "zebra_guard_page_overflow" => scenario_zebra_guard_page_overflow(),
        "default_handler_aborts" => scenario_default_handler_aborts(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

/// E6: with the zebra heap enabled, a read one byte past a granule-sized
/// body lands on the stripe's guard page. The resulting fault must come
/// back out as a heap-buffer-overflow report.
fn scenario_zebra_guard_page_overflow() {
    runtime::teardown();
    runtime::setup(Some(
        "--enable_zebra_block_heap --enable_allocation_filter --quarantine_size=0",
    ))
    .expect("runtime setup failed");
    let rt = runtime::global().unwrap();

    shadowheap::heap_manager::set_allocation_filter_flag(true);
    let heap = rt.heap_manager().create_heap();
    let p = rt.heap_manager().allocate(heap, 64).unwrap();

    // The body ends exactly at the guard page; this read faults.
    let past = (p + 64) as *const u8;
    let value = unsafe { core::ptr::read_volatile(past) };

    // Never reached: the fault filter reports and the default handler
    // terminates the process.
    unreachable!("guard page read returned {}", value);
}

/// The default error handler must terminate with a diagnostic.
fn scenario_default_handler_aborts() {
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();
    let p = rt.heap_manager().allocate(heap, 8).unwrap();
    rt.check_access(p + 8, 1, AccessMode::Write);
    unreachable!("default handler returned");
}

#[test]
fn zebra_guard_page_fault_reports_overflow() {
    let _guard = lock_tests();
    expect_death_subprocess("zebra_guard_page_overflow", "heap-buffer-overflow");
}

#[test]
fn default_handler_terminates_with_diagnostic() {
    let _guard = lock_tests();
    expect_death_subprocess("default_handler_aborts", "heap-buffer-overflow");
}

// ---------------------------------------------------------------------------
// Size, locks and heap lifecycle.
// ---------------------------------------------------------------------------

#[test]
fn size_reports_the_body_size() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();
    let p = rt.heap_manager().allocate(heap, 100).unwrap();
    assert_eq!(rt.heap_manager().size(heap, p), 100);
    assert!(rt.heap_manager().free(heap, p));
    assert!(rt.heap_manager().destroy_heap(heap));
}

#[test]
fn destroyed_heap_id_stays_invalid() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();
    assert!(rt.heap_manager().is_valid_heap(heap));
    assert!(rt.heap_manager().destroy_heap(heap));
    assert!(!rt.heap_manager().is_valid_heap(heap));
    assert!(!rt.heap_manager().destroy_heap(heap));
    assert!(rt.heap_manager().allocate(heap, 16).is_none());
}

#[test]
fn quarantine_defers_address_reuse() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();

    let p = rt.heap_manager().allocate(heap, 64).unwrap();
    assert!(rt.heap_manager().free(heap, p));
    assert!(rt.heap_manager().quarantine_size_in_use() > 0);

    // With the default 16 MiB quarantine the freed envelope is still
    // held, so the next allocation must land elsewhere.
    let q = rt.heap_manager().allocate(heap, 64).unwrap();
    assert_ne!(p, q);

    assert!(rt.heap_manager().free(heap, q));
    assert!(rt.heap_manager().destroy_heap(heap));
}

#[test]
fn large_allocations_get_page_guards() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();

    // Above the default large-allocation threshold.
    let p = rt.heap_manager().allocate(heap, 32 * 1024).unwrap();
    let info = rt.shadow().block_info_from_shadow(p).unwrap();
    assert!(
        rt.shadow().page_is_protected(info.base),
        "header page of a large block should be protected"
    );
    assert!(
        rt.shadow().page_is_protected(info.end() - 1),
        "tail page of a large block should be protected"
    );
    assert!(!rt.shadow().page_is_protected(p));

    assert!(rt.heap_manager().free(heap, p));
    assert!(rt.heap_manager().destroy_heap(heap));
}

#[test]
fn best_effort_lock_all_reports_busy_heaps() {
    let _guard = lock_tests();
    let rt = ensure_runtime();
    let heap = rt.heap_manager().create_heap();

    rt.heap_manager().lock(heap);
    let skipped = rt.heap_manager().best_effort_lock_all();
    assert!(skipped.contains(&heap));
    rt.heap_manager().unlock_all();
    rt.heap_manager().unlock(heap);

    assert!(rt.heap_manager().destroy_heap(heap));
}
