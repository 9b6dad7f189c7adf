//! Process-wide fault interception.
//!
//! Structured exception filtering is modelled with POSIX signals: a
//! SIGSEGV/SIGBUS action reads the faulting address, hands it to the
//! runtime for classification, and chains to the previously installed
//! action when the fault is not ours. Chaining works by restoring the
//! previous action and returning, which re-executes the faulting
//! instruction under the old disposition.

use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::runtime;

struct PreviousAction(UnsafeCell<mem::MaybeUninit<libc::sigaction>>);
unsafe impl Sync for PreviousAction {}

impl PreviousAction {
    const fn new() -> Self {
        PreviousAction(UnsafeCell::new(mem::MaybeUninit::uninit()))
    }

    /// Valid only after `install` has filled it.
    unsafe fn get(&self) -> *mut libc::sigaction {
        (*self.0.get()).as_mut_ptr()
    }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);
static PREV_SEGV: PreviousAction = PreviousAction::new();
static PREV_BUS: PreviousAction = PreviousAction::new();

/// Read/write disposition of the fault from the saved CPU context, where
/// the platform exposes it. The report must describe the faulting
/// instruction, not the runtime's own frame, so this is the only place
/// the context is consulted.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn fault_was_write(ctx: *mut libc::c_void) -> Option<bool> {
    if ctx.is_null() {
        return None;
    }
    let uc = ctx as *mut libc::ucontext_t;
    // Page-fault error code bit 1: set for writes.
    let err = (*uc).uc_mcontext.gregs[libc::REG_ERR as usize];
    Some(err & 0x2 != 0)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
unsafe fn fault_was_write(_ctx: *mut libc::c_void) -> Option<bool> {
    None
}

unsafe fn previous_for(sig: libc::c_int) -> *mut libc::sigaction {
    if sig == libc::SIGBUS {
        PREV_BUS.get()
    } else {
        PREV_SEGV.get()
    }
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    (*info).si_addr() as usize
}

#[cfg(target_os = "macos")]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    (*info).si_addr as usize
}

extern "C" fn fault_filter(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    if let Some(runtime) = runtime::global() {
        if !info.is_null() {
            let fault_addr = unsafe { fault_address(info) };
            let was_write = unsafe { fault_was_write(ctx) };
            runtime.filter_fault(fault_addr, was_write);
        }
    }

    // Reached only when the report did not terminate the process (or the
    // fault was not ours): restore the previous disposition and return,
    // which re-executes the faulting instruction under it. Reported
    // errors are marked processed by the runtime, so this cannot loop.
    unsafe {
        let prev = previous_for(sig);
        if (*prev).sa_sigaction == libc::SIG_DFL || (*prev).sa_sigaction == libc::SIG_IGN {
            let mut dfl: libc::sigaction = mem::zeroed();
            dfl.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut dfl.sa_mask);
            libc::sigaction(sig, &dfl, core::ptr::null_mut());
        } else {
            libc::sigaction(sig, prev, core::ptr::null_mut());
        }
    }
}

/// Install the fault filter, saving whatever was there before.
///
/// # Safety
/// Process-global signal state; call once from runtime setup.
pub unsafe fn install() {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = fault_filter as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    libc::sigemptyset(&mut action.sa_mask);

    libc::sigaction(libc::SIGSEGV, &action, PREV_SEGV.get());
    libc::sigaction(libc::SIGBUS, &action, PREV_BUS.get());
}

/// Restore the previously installed actions.
///
/// # Safety
/// Process-global signal state; call once from runtime teardown.
pub unsafe fn uninstall() {
    if !INSTALLED.swap(false, Ordering::AcqRel) {
        return;
    }
    libc::sigaction(libc::SIGSEGV, PREV_SEGV.get(), core::ptr::null_mut());
    libc::sigaction(libc::SIGBUS, PREV_BUS.get(), core::ptr::null_mut());
}
