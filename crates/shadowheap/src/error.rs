//! Error kinds, the error record handed to callbacks, and classification
//! of a bad access from the shadow state.

use core::fmt;

use crate::block::{self, BlockInfo, BlockState};
use crate::config::OptionsError;
use crate::heap_checker::CorruptRange;
use crate::heaps;
use crate::logging::TextBuffer;
use crate::platform;
use crate::shadow::Shadow;
use crate::shadow_marker as marker;
use crate::stack_cache::{StackId, EMPTY_STACK_ID};
use crate::util::ADDRESS_UPPER_BOUND;

/// Failures surfaced by runtime setup and the public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// No placement below the 2 GiB bound could be obtained. This is also
    /// how a process with a large address space is refused.
    AddressSpaceExhausted,
    AlreadyInitialized,
    NotInitialized,
    InvalidOptions(OptionsError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::AddressSpaceExhausted => {
                write!(f, "no instrumentable address space below the 2 GiB bound")
            }
            RuntimeError::AlreadyInitialized => write!(f, "runtime already initialized"),
            RuntimeError::NotInitialized => write!(f, "runtime not initialized"),
            RuntimeError::InvalidOptions(e) => write!(f, "invalid options: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}

const ASAN_FACILITY: u32 = 0x68B; // no more than 11 bits
const ASAN_STATUS: u32 = 0x5AD0; // no more than 16 bits

/// Custom error code marking reports raised by the runtime itself, so the
/// fault filter never re-processes them: severity = error, customer bit
/// set, then the facility and status fields.
pub const ERROR_SENTINEL_CODE: u32 =
    (3 << 30) | (1 << 29) | (ASAN_FACILITY << 16) | ASAN_STATUS;

const _: () = assert!(ASAN_FACILITY >> 11 == 0);
const _: () = assert!(ASAN_STATUS >> 16 == 0);
const _: () = assert!(ERROR_SENTINEL_CODE & (3 << 27) == 0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BadAccessKind {
    HeapBufferOverflow,
    HeapBufferUnderflow,
    UseAfterFree,
    DoubleFree,
    CorruptBlock,
    CorruptHeap,
    WildAccess,
    InvalidAddress,
    UnknownBadAccess,
}

impl BadAccessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadAccessKind::HeapBufferOverflow => "heap-buffer-overflow",
            BadAccessKind::HeapBufferUnderflow => "heap-buffer-underflow",
            BadAccessKind::UseAfterFree => "use-after-free",
            BadAccessKind::DoubleFree => "double-free",
            BadAccessKind::CorruptBlock => "corrupt-block",
            BadAccessKind::CorruptHeap => "corrupt-heap",
            BadAccessKind::WildAccess => "wild-access",
            BadAccessKind::InvalidAddress => "invalid-address",
            BadAccessKind::UnknownBadAccess => "unknown-bad-access",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Unknown,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "READ",
            AccessMode::Write => "WRITE",
            AccessMode::Unknown => "ACCESS",
        }
    }
}

/// Upper bound on corrupt ranges serialised into one report. The record
/// lives on the reporting thread's stack, so this stays small; the true
/// count is still reported.
pub const MAX_REPORTED_CORRUPT_RANGES: usize = 4;

/// The record handed to the error callback. Everything is inline or a
/// stack-cache id: the error path never allocates.
pub struct ErrorInfo {
    pub location: usize,
    pub kind: BadAccessKind,
    pub access_mode: AccessMode,
    pub access_size: usize,
    pub block_info: Option<BlockInfo>,
    pub block_state: Option<BlockState>,
    pub alloc_stack: StackId,
    pub alloc_tid: u32,
    pub free_stack: StackId,
    pub free_tid: u32,
    pub milliseconds_since_free: u64,
    /// Fingerprint of the reporting site, matched against the ignore list.
    pub crash_stack_id: StackId,
    /// `ERROR_SENTINEL_CODE` when the runtime raised this itself.
    pub sentinel_code: u32,
    pub heap_is_corrupt: bool,
    /// Total corrupt ranges found by the scan.
    pub corrupt_range_count: usize,
    /// How many of them fit in `corrupt_ranges`.
    pub corrupt_ranges_reported: usize,
    pub corrupt_ranges: [CorruptRange; MAX_REPORTED_CORRUPT_RANGES],
    pub shadow_text: TextBuffer<1600>,
}

impl ErrorInfo {
    pub fn new(location: usize, kind: BadAccessKind) -> ErrorInfo {
        ErrorInfo {
            location,
            kind,
            access_mode: AccessMode::Unknown,
            access_size: 0,
            block_info: None,
            block_state: None,
            alloc_stack: EMPTY_STACK_ID,
            alloc_tid: 0,
            free_stack: EMPTY_STACK_ID,
            free_tid: 0,
            milliseconds_since_free: 0,
            crash_stack_id: EMPTY_STACK_ID,
            sentinel_code: 0,
            heap_is_corrupt: false,
            corrupt_range_count: 0,
            corrupt_ranges_reported: 0,
            corrupt_ranges: [CorruptRange::default(); MAX_REPORTED_CORRUPT_RANGES],
            shadow_text: TextBuffer::new(),
        }
    }
}

/// Classify `info.location` against the shadow and fill in the block
/// fields. Returns false when nothing recognisable brackets the address.
///
/// # Safety
/// Must run while page-protection state is frozen (the caller holds the
/// page-protection lock); this lifts protection from the block it finds
/// so its metadata can be read.
pub unsafe fn fill_bad_access_info(shadow: &Shadow, info: &mut ErrorInfo) -> bool {
    let m = shadow.marker_at(info.location);

    // Above the bound, or inside the runtime's own tables.
    if info.location >= ADDRESS_UPPER_BOUND || m == marker::ASAN_MEMORY {
        info.kind = BadAccessKind::WildAccess;
        return true;
    }
    if m == marker::INVALID_ADDRESS {
        info.kind = BadAccessKind::InvalidAddress;
        return true;
    }

    let block = match shadow.block_info_from_shadow(info.location) {
        Some(block) => block,
        None => {
            info.kind = BadAccessKind::UnknownBadAccess;
            return false;
        }
    };
    info.block_info = Some(block);

    // The block's metadata may live on protected guard pages.
    if heaps::block_has_protected_pages(&block, shadow) {
        heaps::block_protect_none(&block, shadow);
    }

    let header = &*block.header_ptr();
    if header.magic != block::BLOCK_HEADER_MAGIC || !block::verify_checksum(&block) {
        info.kind = BadAccessKind::CorruptBlock;
        info.alloc_stack = header.alloc_stack;
        return true;
    }

    let trailer = &*block.trailer_ptr();
    info.block_state = header.block_state();
    info.alloc_stack = header.alloc_stack;
    info.alloc_tid = trailer.alloc_tid;

    let freed = info.block_state != Some(BlockState::Allocated)
        || shadow.marker_at(info.location) == marker::FREED;
    if freed {
        info.kind = BadAccessKind::UseAfterFree;
        info.free_stack = trailer.free_stack;
        info.free_tid = trailer.free_tid;
        // Trailer ticks are truncated to 32 bits; difference in the same
        // modular arithmetic.
        info.milliseconds_since_free =
            (platform::tick_count_ms() as u32).wrapping_sub(trailer.free_ticks) as u64;
    } else if info.location < block.body() {
        info.kind = BadAccessKind::HeapBufferUnderflow;
    } else if info.location >= block.body_end() {
        info.kind = BadAccessKind::HeapBufferOverflow;
    } else {
        info.kind = BadAccessKind::UnknownBadAccess;
    }
    true
}
