//! Interned call stacks.
//!
//! Allocation and free sites are captured once and referenced by a 32-bit
//! fingerprint everywhere else (block headers, trailers, error reports).
//! The cache lives for the process; frames are stored at first sight and
//! deduplicated by fingerprint from then on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::info;

use crate::sync::Mutex;
use crate::util::{fnv1a_accumulate, FNV_OFFSET_BASIS};

pub type StackId = u32;

/// Id meaning "no stack recorded".
pub const EMPTY_STACK_ID: StackId = 0;

/// Hard cap on frames kept per capture.
pub const MAX_FRAMES: usize = 62;

pub struct StackCache {
    stacks: Mutex<HashMap<StackId, Box<[usize]>>>,
    max_num_frames: AtomicUsize,
    bottom_frames_to_skip: AtomicUsize,
    /// Log a statistics line every this many saves; 0 disables.
    reporting_period: AtomicUsize,
    saves: AtomicU64,
    reuses: AtomicU64,
}

impl StackCache {
    pub fn new() -> StackCache {
        StackCache {
            stacks: Mutex::new(HashMap::new()),
            max_num_frames: AtomicUsize::new(MAX_FRAMES),
            bottom_frames_to_skip: AtomicUsize::new(0),
            reporting_period: AtomicUsize::new(0),
            saves: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    pub fn set_max_num_frames(&self, n: usize) {
        self.max_num_frames.store(n.min(MAX_FRAMES), Ordering::Relaxed);
    }

    pub fn set_bottom_frames_to_skip(&self, n: usize) {
        self.bottom_frames_to_skip.store(n, Ordering::Relaxed);
    }

    pub fn set_reporting_period(&self, n: usize) {
        self.reporting_period.store(n, Ordering::Relaxed);
    }

    /// Fingerprint of a frame list. Never returns EMPTY_STACK_ID.
    pub fn fingerprint(frames: &[usize]) -> StackId {
        let mut hash = FNV_OFFSET_BASIS;
        for frame in frames {
            hash = fnv1a_accumulate(hash, &frame.to_ne_bytes());
        }
        if hash == EMPTY_STACK_ID {
            hash = 1;
        }
        hash
    }

    /// Capture the current call stack and intern it.
    ///
    /// This allocates on first sight of a stack and must therefore never
    /// be called from the fault filter; error reports only reference ids
    /// interned on the allocation and free paths.
    pub fn capture_and_save(&self) -> StackId {
        let max = self.max_num_frames.load(Ordering::Relaxed);
        let skip_bottom = self.bottom_frames_to_skip.load(Ordering::Relaxed);

        let mut frames = [0usize; MAX_FRAMES];
        let mut count = 0;
        backtrace::trace(|frame| {
            if count < MAX_FRAMES {
                frames[count] = frame.ip() as usize;
                count += 1;
                true
            } else {
                false
            }
        });

        // frames[0] is the innermost frame, i.e. this function and the
        // runtime wrappers above it. The skip drops those before the
        // depth limit applies, so captures start at application code.
        let start = skip_bottom.min(count);
        let kept = &frames[start..(start + max).min(count)];
        self.save(kept)
    }

    /// Intern a frame list, returning the existing id when already known.
    pub fn save(&self, frames: &[usize]) -> StackId {
        let id = Self::fingerprint(frames);
        {
            let mut stacks = self.stacks.lock();
            if stacks.contains_key(&id) {
                self.reuses.fetch_add(1, Ordering::Relaxed);
            } else {
                stacks.insert(id, frames.to_vec().into_boxed_slice());
            }
        }
        let saves = self.saves.fetch_add(1, Ordering::Relaxed) + 1;
        let period = self.reporting_period.load(Ordering::Relaxed) as u64;
        if period != 0 && saves % period == 0 {
            self.log_statistics();
        }
        id
    }

    /// Run `f` over the frames of `id`, if known. Total on ids handed out
    /// by `save`; the closure form keeps the error path allocation-free.
    pub fn with_frames<R>(&self, id: StackId, f: impl FnOnce(&[usize]) -> R) -> Option<R> {
        if id == EMPTY_STACK_ID {
            return None;
        }
        let stacks = self.stacks.lock();
        stacks.get(&id).map(|frames| f(frames))
    }

    pub fn contains(&self, id: StackId) -> bool {
        self.stacks.lock().contains_key(&id)
    }

    /// Reuse ratio over the cache lifetime, as interned-vs-saved counts.
    pub fn log_statistics(&self) {
        let saves = self.saves.load(Ordering::Relaxed);
        let reuses = self.reuses.load(Ordering::Relaxed);
        let unique = self.stacks.lock().len();
        info!(
            "stack cache: {} saves, {} reuses, {} unique stacks retained",
            saves, reuses, unique
        );
    }
}

impl Default for StackCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Fingerprint of the current raw call stack, without interning it.
/// Allocation-free, so the error path can use it for the ignore list.
pub fn current_stack_fingerprint() -> StackId {
    let mut frames = [0usize; 16];
    let mut count = 0;
    backtrace::trace(|frame| {
        if count < frames.len() {
            frames[count] = frame.ip() as usize;
            count += 1;
            true
        } else {
            false
        }
    });
    StackCache::fingerprint(&frames[..count])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_is_idempotent() {
        let cache = StackCache::new();
        let frames = [0x1000usize, 0x2000, 0x3000];
        let a = cache.save(&frames);
        let b = cache.save(&frames);
        assert_eq!(a, b);
        assert_ne!(a, EMPTY_STACK_ID);
        let got = cache.with_frames(a, |f| f.to_vec()).unwrap();
        assert_eq!(got, frames);
    }

    #[test]
    fn distinct_stacks_get_distinct_ids() {
        let cache = StackCache::new();
        let a = cache.save(&[0x1000, 0x2000]);
        let b = cache.save(&[0x2000, 0x1000]);
        assert_ne!(a, b);
    }

    #[test]
    fn capture_respects_limits() {
        let cache = StackCache::new();
        cache.set_max_num_frames(4);
        let id = cache.capture_and_save();
        let len = cache.with_frames(id, |f| f.len()).unwrap();
        assert!(len <= 4);
    }

    #[test]
    fn unknown_id_yields_none() {
        let cache = StackCache::new();
        assert!(cache.with_frames(0xDEAD_BEEF, |_| ()).is_none());
        assert!(cache.with_frames(EMPTY_STACK_ID, |_| ()).is_none());
    }
}
