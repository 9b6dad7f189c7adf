use core::ptr;

#[cfg(target_arch = "x86_64")]
use crate::util::ADDRESS_UPPER_BOUND;

/// Anonymous read-write mapping at any address, or null.
///
/// # Safety
/// `size` must be a non-zero page multiple.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// MAP_32BIT gives placements under the 2 GiB bound directly.
///
/// # Safety
/// `size` must be a non-zero page multiple.
#[cfg(target_arch = "x86_64")]
pub unsafe fn map_anonymous_low(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_32BIT,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        return ptr::null_mut();
    }
    let addr = result as usize;
    if addr.checked_add(size).map_or(true, |end| end > ADDRESS_UPPER_BOUND) {
        // The kernel placed us out of range anyway; give the mapping back.
        libc::munmap(result, size);
        return ptr::null_mut();
    }
    result as *mut u8
}

/// Hint-probing fallback for targets without MAP_32BIT.
///
/// # Safety
/// `size` must be a non-zero page multiple.
#[cfg(not(target_arch = "x86_64"))]
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

/// Per-thread identifier, never zero. The gettid result is cached in TLS
/// so the usual case costs no syscall.
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
            let new_tid = unsafe { libc::syscall(libc::SYS_gettid) as usize };
            tid.set(new_tid);
            new_tid
        })
        .unwrap_or_else(|_| unsafe { libc::syscall(libc::SYS_gettid) as usize })
}

/// Distance from the current stack pointer down to the stack's low bound.
pub fn stack_headroom() -> usize {
    unsafe {
        let mut attr: libc::pthread_attr_t = core::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return 0;
        }
        let mut stack_base: *mut libc::c_void = ptr::null_mut();
        let mut stack_size: usize = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut stack_base, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return 0;
        }
        let here = &rc as *const _ as usize;
        here.saturating_sub(stack_base as usize)
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
