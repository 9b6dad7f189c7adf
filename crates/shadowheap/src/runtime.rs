//! Runtime assembly: the process-wide singleton tying together shadow,
//! stack cache, heap manager and the error pipeline.

use core::ffi::c_char;
use core::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, info};

use crate::config::{self, RuntimeParams};
use crate::error::{
    fill_bad_access_info, AccessMode, BadAccessKind, ErrorInfo, RuntimeError,
    ERROR_SENTINEL_CODE, MAX_REPORTED_CORRUPT_RANGES,
};
use crate::error_filter;
use crate::heap_checker::HeapChecker;
use crate::heap_manager::HeapManager;
use crate::logging::{self, TextBuffer};
use crate::platform;
use crate::shadow::Shadow;
use crate::stack_cache::{current_stack_fingerprint, StackCache};
use crate::sync::RawMutex;

pub type ErrorCallback = Arc<dyn Fn(&mut ErrorInfo) + Send + Sync>;
pub type MinidumpCallback = Arc<dyn Fn(&ErrorInfo) + Send + Sync>;

/// Stack bytes reserved for whatever runs after us during a crash
/// (the host crash reporter, the abort machinery).
const RESERVED_STACK_BYTES: usize = 5 * 1024;

/// Host crash-reporter exports, resolved from the executable by symbol
/// name. When present, error reports are annotated and handed to the
/// reporter's own entry point instead of aborting.
pub struct CrashReporterFunctions {
    crash_for_exception: unsafe extern "C" fn(*mut ErrorInfo) -> i32,
    set_crash_key_value_pair: Option<unsafe extern "C" fn(*const c_char, *const c_char)>,
}

const CRASH_HANDLER_SYMBOL: &[u8] = b"CrashForException\0";
const SET_CRASH_KEY_VALUE_PAIR_SYMBOL: &[u8] = b"SetCrashKeyValuePair\0";

fn resolve_crash_reporter() -> Option<CrashReporterFunctions> {
    unsafe {
        let crash =
            libc::dlsym(libc::RTLD_DEFAULT, CRASH_HANDLER_SYMBOL.as_ptr() as *const c_char);
        if crash.is_null() {
            return None;
        }
        let set_pair = libc::dlsym(
            libc::RTLD_DEFAULT,
            SET_CRASH_KEY_VALUE_PAIR_SYMBOL.as_ptr() as *const c_char,
        );
        Some(CrashReporterFunctions {
            crash_for_exception: core::mem::transmute::<
                *mut libc::c_void,
                unsafe extern "C" fn(*mut ErrorInfo) -> i32,
            >(crash),
            set_crash_key_value_pair: if set_pair.is_null() {
                None
            } else {
                Some(core::mem::transmute::<
                    *mut libc::c_void,
                    unsafe extern "C" fn(*const c_char, *const c_char),
                >(set_pair))
            },
        })
    }
}

pub struct Runtime {
    params: RuntimeParams,
    shadow: Arc<Shadow>,
    stack_cache: Arc<StackCache>,
    heap_manager: Arc<HeapManager>,
    error_callback: crate::sync::Mutex<Option<ErrorCallback>>,
    minidump_callback: crate::sync::Mutex<Option<MinidumpCallback>>,
    crash_reporter: Option<CrashReporterFunctions>,
    /// Serialises concurrent crashes.
    error_lock: RawMutex,
    /// Thread currently inside the error pipeline; a fault raised by that
    /// same thread falls through to the OS instead of recursing.
    error_thread: AtomicUsize,
    /// Set once a report has gone out, so the fault filter treats any
    /// follow-up fault as already processed.
    error_reported: AtomicBool,
}

impl Runtime {
    fn create(options: Option<&str>) -> Result<Runtime, RuntimeError> {
        logging::init();

        let mut params = RuntimeParams::default();
        let parse_result = match options {
            Some(options) => config::parse_options(options, &mut params),
            None => config::read_from_env(&mut params),
        };
        parse_result.map_err(RuntimeError::InvalidOptions)?;

        let shadow = Arc::new(Shadow::new()?);

        let stack_cache = Arc::new(StackCache::new());
        stack_cache.set_max_num_frames(params.max_num_frames);
        stack_cache.set_bottom_frames_to_skip(params.bottom_frames_to_skip);
        stack_cache.set_reporting_period(params.reporting_period);

        let heap_manager = Arc::new(HeapManager::new(shadow.clone(), stack_cache.clone()));
        heap_manager.set_parameters(&params);

        let crash_reporter = if params.disable_breakpad_reporting {
            None
        } else {
            resolve_crash_reporter()
        };
        if crash_reporter.is_some() {
            info!("using the host crash reporter for error handoff");
        } else {
            info!("using the default error handler");
        }

        Ok(Runtime {
            params,
            shadow,
            stack_cache,
            heap_manager,
            error_callback: crate::sync::Mutex::new(None),
            minidump_callback: crate::sync::Mutex::new(None),
            crash_reporter,
            error_lock: RawMutex::new(),
            error_thread: AtomicUsize::new(0),
            error_reported: AtomicBool::new(false),
        })
    }

    pub fn params(&self) -> &RuntimeParams {
        &self.params
    }

    pub fn shadow(&self) -> &Arc<Shadow> {
        &self.shadow
    }

    pub fn stack_cache(&self) -> &Arc<StackCache> {
        &self.stack_cache
    }

    pub fn heap_manager(&self) -> &Arc<HeapManager> {
        &self.heap_manager
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.error_callback.lock() = Some(callback);
    }

    /// Drop any custom callback, restoring the default terminal handler.
    pub fn clear_error_callback(&self) {
        *self.error_callback.lock() = None;
    }

    pub fn set_minidump_callback(&self, callback: MinidumpCallback) {
        *self.minidump_callback.lock() = Some(callback);
    }

    // ------------------------------------------------------------------
    // Hot path
    // ------------------------------------------------------------------

    /// Validate a `size`-byte access at `addr`. If this returns true the
    /// access is permitted; otherwise the error pipeline ran (and, under
    /// the default callback, never came back).
    #[inline]
    pub fn check_access(&self, addr: usize, size: usize, mode: AccessMode) -> bool {
        if size == 0 {
            return true;
        }
        let last = addr.saturating_add(size - 1);
        if self.shadow.is_accessible(addr) && (size == 1 || self.shadow.is_accessible(last)) {
            return true;
        }
        self.report_bad_access(addr, size, mode);
        false
    }

    #[cold]
    #[inline(never)]
    fn report_bad_access(&self, addr: usize, size: usize, mode: AccessMode) {
        let mut info = ErrorInfo::new(addr, BadAccessKind::UnknownBadAccess);
        info.access_mode = mode;
        info.access_size = size;
        info.sentinel_code = ERROR_SENTINEL_CODE;
        info.crash_stack_id = current_stack_fingerprint();

        self.error_lock.lock();
        self.error_thread
            .store(platform::thread_id(), Ordering::Relaxed);

        let page_lock = self.shadow.page_protection_lock();
        page_lock.lock();
        unsafe { fill_bad_access_info(&self.shadow, &mut info) };
        page_lock.unlock();

        let mut text = TextBuffer::new();
        self.shadow.append_shadow_memory_text(addr, &mut text);
        info.shadow_text = text;

        self.on_error(&mut info);

        self.error_thread.store(0, Ordering::Relaxed);
        self.error_lock.unlock();
    }

    // ------------------------------------------------------------------
    // Fault filter entry
    // ------------------------------------------------------------------

    /// Handle an access-violation fault at `fault_addr`. Returns true when
    /// the fault was recognised and reported; false tells the filter to
    /// chain to the previous handler.
    pub fn filter_fault(&self, fault_addr: usize, was_write: Option<bool>) -> bool {
        // Errors raised by the runtime itself are already processed, and
        // errors during error reporting fall through to the OS.
        if self.error_reported.load(Ordering::Relaxed) {
            return false;
        }
        if self.error_thread.load(Ordering::Relaxed) == platform::thread_id() {
            return false;
        }

        self.error_lock.lock();
        self.error_thread
            .store(platform::thread_id(), Ordering::Relaxed);
        let page_lock = self.shadow.page_protection_lock();
        page_lock.lock();

        info!("handling an access-violation exception");

        // Until proven otherwise, treat this as someone else's crash with
        // possible heap corruption as the root cause.
        let mut err = ErrorInfo::new(fault_addr, BadAccessKind::CorruptHeap);
        err.crash_stack_id = current_stack_fingerprint();
        let mut emit = false;

        let m = self.shadow.marker_at(fault_addr);
        if crate::shadow_marker::is_redzone(m) && crate::shadow_marker::is_active_block(m) {
            if let Some(block) = self.shadow.block_info_from_shadow(fault_addr) {
                // Page protections must come off before our own inspection;
                // they stay off so a minidump can introspect the block.
                unsafe { crate::heaps::block_protect_none(&block, &self.shadow) };
                info!("caught an invalid access via an access-violation exception");

                err.access_size = 1;
                err.access_mode = match was_write {
                    Some(true) => AccessMode::Write,
                    Some(false) => AccessMode::Read,
                    None => AccessMode::Unknown,
                };
                unsafe { fill_bad_access_info(&self.shadow, &mut err) };
                emit = true;
            }
        }

        self.check_heap(&mut err);
        if err.heap_is_corrupt {
            emit = true;
        }

        if emit {
            let mut text = TextBuffer::new();
            self.shadow.append_shadow_memory_text(fault_addr, &mut text);
            err.shadow_text = text;
            self.on_error(&mut err);
            // If a custom callback declined to terminate, make sure any
            // re-fault goes straight to the OS.
            self.error_reported.store(true, Ordering::Relaxed);
        }

        self.error_thread.store(0, Ordering::Relaxed);
        page_lock.unlock();
        self.error_lock.unlock();
        emit
    }

    // ------------------------------------------------------------------
    // Error pipeline
    // ------------------------------------------------------------------

    /// The single funnel for every detected error: suppression, heap
    /// check, logging, minidump, then the configured callback.
    pub fn on_error(&self, info: &mut ErrorInfo) {
        if self.params.ignored_stack_ids.contains(&info.crash_stack_id) {
            info!(
                "ignoring {} (stack id 0x{:08x} is suppressed)",
                info.kind.as_str(),
                info.crash_stack_id
            );
            return;
        }

        if !info.heap_is_corrupt && info.corrupt_range_count == 0 {
            self.check_heap(info);
        }

        self.log_error_info(info);

        if self.params.minidump_on_failure {
            let minidump = self.minidump_callback.lock().clone();
            if let Some(minidump) = minidump {
                minidump(info);
            }
        }

        if self.params.exit_on_failure {
            self.error_reported.store(true, Ordering::Relaxed);
            unsafe { libc::_exit(1) };
        }

        let callback = self.error_callback.lock().clone();
        match callback {
            Some(callback) => callback(info),
            None => self.default_error_handler(info),
        }
    }

    /// Default terminal handling: annotate and enter the host crash
    /// reporter when one is exported, otherwise abort so the OS surfaces
    /// the failure.
    fn default_error_handler(&self, info: &mut ErrorInfo) -> ! {
        self.error_reported.store(true, Ordering::Relaxed);

        if let Some(reporter) = &self.crash_reporter {
            if let Some(set_pair) = reporter.set_crash_key_value_pair {
                let mut key_buf: TextBuffer<64> = TextBuffer::new();
                let _ = write!(key_buf, "asan-error-type\0");
                let mut value_buf: TextBuffer<64> = TextBuffer::new();
                let _ = write!(value_buf, "{}\0", info.kind.as_str());
                unsafe {
                    set_pair(
                        key_buf.as_bytes().as_ptr() as *const c_char,
                        value_buf.as_bytes().as_ptr() as *const c_char,
                    );
                }
            }
            unsafe { (reporter.crash_for_exception)(info as *mut ErrorInfo) };
            // The reporter should not return; fall through if it does.
        }

        let mut msg: TextBuffer<128> = TextBuffer::new();
        let _ = write!(
            msg,
            "shadowheap: {} on address 0x{:08x}",
            info.kind.as_str(),
            info.location
        );
        logging::abort_with_message(msg.as_str());
    }

    /// Run the heap checker and serialise as many corrupt ranges as fit
    /// within the report record and the remaining stack.
    fn check_heap(&self, info: &mut ErrorInfo) {
        if !self.params.check_heap_on_failure {
            info!("heap checker disabled, ignoring exception");
            return;
        }
        info!("heap checker enabled, processing exception");

        let skipped = self.heap_manager.best_effort_lock_all();
        if !skipped.is_empty() {
            info!("{} heap(s) could not be locked for the scan", skipped.len());
        }

        let headroom = platform::stack_headroom().saturating_sub(RESERVED_STACK_BYTES);
        let budget = headroom / core::mem::size_of::<crate::heap_checker::CorruptRange>();
        let capacity = MAX_REPORTED_CORRUPT_RANGES.min(budget);

        let page_lock = self.shadow.page_protection_lock();
        page_lock.lock();
        let checker = HeapChecker::new(&self.shadow);
        let mut reported = 0usize;
        let total = unsafe {
            checker.for_each_corrupt_range(|range| {
                if reported < capacity {
                    info.corrupt_ranges[reported] = range;
                    reported += 1;
                }
            })
        };
        page_lock.unlock();

        self.heap_manager.unlock_all();

        info.corrupt_range_count = total;
        info.corrupt_ranges_reported = reported;
        info.heap_is_corrupt = total > 0;
    }

    fn log_error_info(&self, info: &ErrorInfo) {
        if !self.params.log_as_text {
            return;
        }

        error!(
            "{} on address 0x{:08x} (stack_id=0x{:08x})",
            info.kind.as_str(),
            info.location,
            info.crash_stack_id
        );
        if info.access_mode != AccessMode::Unknown {
            error!(
                "{} of size {} at 0x{:08x}",
                info.access_mode.as_str(),
                info.access_size,
                info.location
            );
        }
        if info.kind == BadAccessKind::UseAfterFree {
            error!(
                "block freed {} ms ago by thread {}",
                info.milliseconds_since_free, info.free_tid
            );
        }
        if info.free_stack != 0 {
            self.log_stack("freed here:", info.free_stack);
        }
        if info.alloc_stack != 0 {
            self.log_stack("previously allocated here:", info.alloc_stack);
        }
        if info.heap_is_corrupt {
            error!(
                "heap is corrupt: {} range(s) found, {} reported",
                info.corrupt_range_count, info.corrupt_ranges_reported
            );
        }
        logging::write_stderr(info.shadow_text.as_bytes());
    }

    fn log_stack(&self, label: &str, id: crate::stack_cache::StackId) {
        let mut buf: TextBuffer<1024> = TextBuffer::new();
        let _ = writeln!(buf, "{}", label);
        self.stack_cache.with_frames(id, |frames| {
            for (i, frame) in frames.iter().enumerate() {
                let _ = writeln!(buf, "  #{} 0x{:08x}", i, frame);
            }
        });
        logging::write_stderr(buf.as_bytes());
    }
}

// ----------------------------------------------------------------------
// Process-wide singleton
// ----------------------------------------------------------------------

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const DISABLED: u8 = 3;

pub static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

struct RuntimeHolder(core::cell::UnsafeCell<Option<Runtime>>);
unsafe impl Sync for RuntimeHolder {}

static RUNTIME: RuntimeHolder = RuntimeHolder(core::cell::UnsafeCell::new(None));

/// Initialize the global runtime. `options` overrides the environment
/// variable when given. Safe to call more than once; later calls return
/// AlreadyInitialized.
pub fn setup(options: Option<&str>) -> Result<(), RuntimeError> {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return Err(RuntimeError::AlreadyInitialized);
        }
        Err(_) => return Err(RuntimeError::AlreadyInitialized),
    }

    match Runtime::create(options) {
        Ok(runtime) => {
            unsafe { *RUNTIME.0.get() = Some(runtime) };
            if let Some(runtime) = global() {
                // Metadata errors found by the heap manager feed the same
                // pipeline as instrumented accesses.
                runtime
                    .heap_manager
                    .set_heap_error_callback(Arc::new(|info| {
                        if let Some(runtime) = global() {
                            runtime.on_error(info);
                        }
                    }));
            }
            unsafe { error_filter::install() };
            INIT_STATE.store(READY, Ordering::Release);
            Ok(())
        }
        Err(e) => {
            error!("runtime setup failed: {}", e);
            INIT_STATE.store(DISABLED, Ordering::Release);
            Err(e)
        }
    }
}

/// Tear the global runtime down: flush quarantines, drop the heaps,
/// restore the previous fault handlers.
pub fn teardown() {
    if INIT_STATE.load(Ordering::Acquire) != READY {
        return;
    }
    unsafe { error_filter::uninstall() };
    if let Some(runtime) = global() {
        runtime.stack_cache.log_statistics();
        runtime.heap_manager.teardown();
    }
    unsafe { *RUNTIME.0.get() = None };
    INIT_STATE.store(UNINIT, Ordering::Release);
}

/// The live runtime. Also visible during setup itself, which wires the
/// heap-error callback through this accessor.
#[inline]
pub fn global() -> Option<&'static Runtime> {
    match INIT_STATE.load(Ordering::Acquire) {
        READY | INITIALIZING => unsafe { (*RUNTIME.0.get()).as_ref() },
        _ => None,
    }
}

pub fn state() -> u8 {
    INIT_STATE.load(Ordering::Acquire)
}

pub const STATE_READY: u8 = READY;
pub const STATE_DISABLED: u8 = DISABLED;

/// Library constructor -- instrumented binaries get the runtime before
/// main() without an explicit call.
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        let _ = setup(None);
    }
    init
};
