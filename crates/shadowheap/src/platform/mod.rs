#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// Anonymous read-write mapping at any address, or null.
///
/// # Safety
/// `size` must be a non-zero page multiple.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Anonymous read-write mapping inside the instrumentable range (below
/// `util::ADDRESS_UPPER_BOUND`), or null when no such placement exists.
/// Callers treat null as address-space exhaustion, never as permission
/// to fall back to a high mapping.
///
/// # Safety
/// `size` must be a non-zero page multiple.
#[inline]
pub unsafe fn map_anonymous_low(size: usize) -> *mut u8 {
    sys::map_anonymous_low(size)
}

/// Release a mapping.
///
/// # Safety
/// `ptr`/`size` must describe exactly one prior map result.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Make whole pages inaccessible (guard pages).
///
/// # Safety
/// The page-aligned region must lie within a live mapping.
#[inline]
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    sys::protect_none(ptr, size);
}

/// Restore read-write access to whole pages.
///
/// # Safety
/// The page-aligned region must lie within a live mapping.
#[inline]
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) {
    sys::protect_read_write(ptr, size);
}

/// Get a cheap thread-local identifier. Never zero.
#[inline]
pub fn thread_id() -> usize {
    sys::thread_id()
}

/// Bytes of stack left below the current frame before the guard page.
/// Returns 0 when the bounds cannot be determined.
pub fn stack_headroom() -> usize {
    sys::stack_headroom()
}

/// Milliseconds on a monotonic clock. Used for block trailer timestamps.
#[inline]
pub fn tick_count_ms() -> u64 {
    sys::tick_count_ms()
}

/// Probe fixed hints below the 2 GiB bound until the kernel grants one.
/// Shared fallback for targets without a low-mapping mmap flag.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[allow(dead_code)]
pub(crate) unsafe fn map_low_by_probing(size: usize) -> *mut u8 {
    use crate::util::{ADDRESS_LOWER_BOUND, ADDRESS_UPPER_BOUND, PAGE_SIZE};

    // Walk hints upward in 64 MiB steps; the kernel may round placement,
    // so verify the range after every attempt.
    const STEP: usize = 64 << 20;
    let mut hint = crate::util::align_up(ADDRESS_LOWER_BOUND, PAGE_SIZE).max(STEP);
    while hint + size <= ADDRESS_UPPER_BOUND {
        let result = libc::mmap(
            hint as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if result != libc::MAP_FAILED {
            let addr = result as usize;
            if addr >= ADDRESS_LOWER_BOUND && addr + size <= ADDRESS_UPPER_BOUND {
                return result as *mut u8;
            }
            libc::munmap(result, size);
        }
        hint += STEP;
    }
    core::ptr::null_mut()
}

/// Cheap per-thread randomness for sampling decisions and quarantine
/// shard picks. Statistical quality only; a Marsaglia xorshift64 step
/// over state seeded from the thread id.
pub fn fast_random_u64() -> u64 {
    use core::cell::Cell;
    use core::sync::atomic::{AtomicU64, Ordering};

    thread_local! {
        static RNG: Cell<u64> = const { Cell::new(0) };
    }

    RNG.try_with(|cell| {
        let mut s = cell.get();
        if s == 0 {
            // xorshift state must never be zero.
            s = crate::util::splitmix64(thread_id() as u64) | 1;
        }
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        cell.set(s);
        s
    })
    .unwrap_or_else(|_| {
        // The TLS slot is unavailable during thread setup and teardown; a
        // global counter run through the finalizer still decorrelates
        // callers.
        static FALLBACK: AtomicU64 = AtomicU64::new(1);
        crate::util::splitmix64(FALLBACK.fetch_add(1, Ordering::Relaxed))
    })
}
