use core::ptr;

/// Anonymous read-write mapping at any address, or null.
///
/// # Safety
/// `size` must be a non-zero page multiple.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// There is no MAP_32BIT on macOS; probe address hints instead.
///
/// # Safety
/// `size` must be a non-zero page multiple.
pub unsafe fn map_anonymous_low(size: usize) -> *mut u8 {
    super::map_low_by_probing(size)
}

/// Release a mapping.
///
/// # Safety
/// `ptr`/`size` must describe exactly one prior map result.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Make whole pages inaccessible.
///
/// # Safety
/// The page-aligned region must lie within a live mapping.
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE);
}

/// Restore read-write access.
///
/// # Safety
/// The page-aligned region must lie within a live mapping.
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    );
}

/// Per-thread identifier, never zero. Cached in TLS.
#[inline]
pub fn thread_id() -> usize {
    use std::cell::Cell;

    thread_local! {
        static CACHED_TID: Cell<usize> = const { Cell::new(0) };
    }

    CACHED_TID
        .try_with(|tid| {
            let cached = tid.get();
            if cached != 0 {
                return cached;
            }
            let mut new_tid: u64 = 0;
            unsafe { libc::pthread_threadid_np(ptr::null_mut(), &mut new_tid) };
            tid.set(new_tid as usize);
            new_tid as usize
        })
        .unwrap_or_else(|_| {
            let mut new_tid: u64 = 0;
            unsafe { libc::pthread_threadid_np(ptr::null_mut(), &mut new_tid) };
            new_tid as usize
        })
}

/// Distance from the current stack pointer down to the stack's low bound.
pub fn stack_headroom() -> usize {
    unsafe {
        let thread = libc::pthread_self();
        let top = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        let here = &thread as *const _ as usize;
        here.saturating_sub(top.saturating_sub(size))
    }
}

/// Monotonic milliseconds.
pub fn tick_count_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}
