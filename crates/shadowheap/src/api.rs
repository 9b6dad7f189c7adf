//! C-ABI entry points for instrumented code.
//!
//! Every call goes through the init-state dispatch: a ready runtime
//! serves it, an uninitialized one is initialized first, and a disabled
//! runtime (setup failed) degrades to no-ops that keep the application
//! running uninstrumented.

use core::ffi::c_void;

use crate::error::{AccessMode, ErrorInfo};
use crate::heap_manager::{self, HeapId};
use crate::runtime::{self, Runtime, STATE_READY};

fn dispatch() -> Option<&'static Runtime> {
    if runtime::state() != STATE_READY {
        let _ = runtime::setup(None);
    }
    match runtime::state() {
        STATE_READY => runtime::global(),
        _ => None,
    }
}

/// Access modes as encoded by the instrumentation.
pub const ACCESS_READ: u8 = 0;
pub const ACCESS_WRITE: u8 = 1;

/// The hot path: returns normally iff the access is permitted. On a bad
/// access the error pipeline runs and, under the default callback, the
/// process does not come back.
///
/// # Safety
/// `addr` is an application pointer about to be dereferenced; it may be
/// any value.
#[no_mangle]
pub unsafe extern "C" fn shadowheap_check_access(addr: *const c_void, size: usize, mode: u8) {
    if let Some(runtime) = dispatch() {
        let mode = if mode == ACCESS_WRITE {
            AccessMode::Write
        } else {
            AccessMode::Read
        };
        runtime.check_access(addr as usize, size, mode);
    }
}

#[no_mangle]
pub extern "C" fn shadowheap_create_heap() -> HeapId {
    match dispatch() {
        Some(runtime) => runtime.heap_manager().create_heap(),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn shadowheap_destroy_heap(heap_id: HeapId) -> bool {
    match dispatch() {
        Some(runtime) => runtime.heap_manager().destroy_heap(heap_id),
        None => false,
    }
}

/// The process heap: usable without ever calling `shadowheap_create_heap`.
#[no_mangle]
pub extern "C" fn shadowheap_process_heap() -> HeapId {
    match dispatch() {
        Some(runtime) => runtime.heap_manager().process_heap(),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn shadowheap_allocate(heap_id: HeapId, size: usize) -> *mut c_void {
    match dispatch() {
        Some(runtime) => runtime
            .heap_manager()
            .allocate(heap_id, size)
            .map_or(core::ptr::null_mut(), |body| body as *mut c_void),
        None => core::ptr::null_mut(),
    }
}

/// # Safety
/// `ptr` must be a pointer previously returned by `shadowheap_allocate`
/// (or null, which is ignored).
#[no_mangle]
pub unsafe extern "C" fn shadowheap_free(heap_id: HeapId, ptr: *mut c_void) -> bool {
    if ptr.is_null() {
        return true;
    }
    match dispatch() {
        Some(runtime) => runtime.heap_manager().free(heap_id, ptr as usize),
        None => false,
    }
}

/// # Safety
/// `ptr` may be any value; unknown pointers report size 0.
#[no_mangle]
pub unsafe extern "C" fn shadowheap_size(heap_id: HeapId, ptr: *const c_void) -> usize {
    match dispatch() {
        Some(runtime) => runtime.heap_manager().size(heap_id, ptr as usize),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn shadowheap_lock(heap_id: HeapId) {
    if let Some(runtime) = dispatch() {
        runtime.heap_manager().lock(heap_id);
    }
}

#[no_mangle]
pub extern "C" fn shadowheap_unlock(heap_id: HeapId) {
    if let Some(runtime) = dispatch() {
        runtime.heap_manager().unlock(heap_id);
    }
}

#[no_mangle]
pub extern "C" fn shadowheap_set_allocation_filter_flag(value: bool) {
    heap_manager::set_allocation_filter_flag(value);
}

#[no_mangle]
pub extern "C" fn shadowheap_get_allocation_filter_flag() -> bool {
    heap_manager::allocation_filter_flag()
}

/// Replace the error callback. Passing null restores the default handler.
///
/// # Safety
/// `callback` must be a valid function pointer or null, and must not
/// re-enter the runtime's allocation paths.
#[no_mangle]
pub unsafe extern "C" fn shadowheap_set_error_callback(
    callback: Option<extern "C" fn(*mut ErrorInfo)>,
) {
    if let Some(runtime) = dispatch() {
        match callback {
            Some(callback) => {
                runtime.set_error_callback(std::sync::Arc::new(move |info: &mut ErrorInfo| {
                    callback(info as *mut ErrorInfo);
                }));
            }
            None => {
                // Dropping back to the default handler.
                runtime.clear_error_callback();
            }
        }
    }
}
