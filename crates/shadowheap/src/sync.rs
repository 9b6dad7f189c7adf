use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::platform;

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

/// Futex-backed lock used for all runtime synchronisation. Several of
/// these are taken inside the fault filter, mid-crash, so unlike the std
/// primitives they never allocate and never poison.
pub struct RawMutex {
    state: AtomicI32,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(UNLOCKED),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if !self.try_lock() {
            self.lock_contended();
        }
    }

    /// Try to lock without blocking. Returns true if the lock was taken.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[cold]
    fn lock_contended(&self) {
        // Flag the lock as contended before sleeping, so the holder knows
        // a wake is owed on release. A stray extra wake when the previous
        // holder saw CONTENDED but the queue drained is harmless.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex_wait(&self.state, CONTENDED);
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake_one(&self.state);
        }
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(state: &AtomicI32, expected: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicI32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_state: &AtomicI32, _expected: i32) {
    core::hint::spin_loop();
}

#[cfg(target_os = "linux")]
fn futex_wake_one(state: &AtomicI32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicI32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1i32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake_one(_state: &AtomicI32) {}

/// Data-carrying wrapper over `RawMutex` with a scoped guard.
pub struct Mutex<T> {
    raw: RawMutex,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { lock: self })
        } else {
            None
        }
    }
}

/// Releases the mutex on drop.
pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

/// A recursive mutex keyed on the platform thread id.
///
/// The page-protection bitmap lock is held across the whole fault filter,
/// which itself flips protection bits while inspecting a block; a plain
/// mutex would self-deadlock there.
pub struct ReentrantMutex {
    raw: RawMutex,
    owner: AtomicUsize,
    depth: UnsafeCell<usize>,
}

unsafe impl Send for ReentrantMutex {}
unsafe impl Sync for ReentrantMutex {}

impl ReentrantMutex {
    pub const fn new() -> Self {
        Self {
            raw: RawMutex::new(),
            owner: AtomicUsize::new(0),
            depth: UnsafeCell::new(0),
        }
    }

    pub fn lock(&self) {
        let tid = platform::thread_id();
        if self.owner.load(Ordering::Relaxed) == tid {
            // Already owned by this thread.
            unsafe { *self.depth.get() += 1 };
            return;
        }
        self.raw.lock();
        self.owner.store(tid, Ordering::Relaxed);
        unsafe { *self.depth.get() = 1 };
    }

    pub fn unlock(&self) {
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), platform::thread_id());
        let depth = unsafe { &mut *self.depth.get() };
        *depth -= 1;
        if *depth == 0 {
            self.owner.store(0, Ordering::Relaxed);
            self.raw.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_round_trip() {
        let m = Mutex::new(5usize);
        {
            let mut guard = m.lock();
            *guard += 1;
        }
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = RawMutex::new();
        m.lock();
        assert!(!m.try_lock());
        m.unlock();
        assert!(m.try_lock());
        m.unlock();
    }

    #[test]
    fn reentrant_lock_nests() {
        let m = ReentrantMutex::new();
        m.lock();
        m.lock();
        m.unlock();
        m.unlock();
        // Fully released: another plain lock cycle succeeds.
        m.lock();
        m.unlock();
    }

    #[test]
    fn contended_lock_hands_over() {
        use std::sync::Arc;

        let m = Arc::new(Mutex::new(0usize));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let m = m.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *m.lock() += 1;
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }
}
