//! §4.1 — mutual exclusion shorter than a scheduler quantum.
//!
//! Ported from tbox's `tb_spinlock_enter`: compare-and-set a single word
//! 0 -> 1, spin up to five attempts, then yield the processor and reset the
//! spin budget. Release is a plain store; the CAS side already provides the
//! acquire/release fences. Debug builds (or the `profiler` feature) record
//! contention through [`crate::profiler`], mirroring tbox's
//! `tb_lock_profiler_occupied` hook, via a separate entrypoint so the
//! profiler's own internal locks can avoid reentering themselves.

use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(any(debug_assertions, feature = "profiler"))]
use crate::profiler;

const SPIN_TRIES: u32 = 5;

/// A test-and-set lock with bounded spin + yield.
#[derive(Debug)]
pub struct SpinLock {
    locked: AtomicBool,
    #[cfg(any(debug_assertions, feature = "profiler"))]
    name: &'static str,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock {
            locked: AtomicBool::new(false),
            #[cfg(any(debug_assertions, feature = "profiler"))]
            name: "spinlock",
        }
    }

    #[cfg(any(debug_assertions, feature = "profiler"))]
    pub const fn named(name: &'static str) -> SpinLock {
        SpinLock {
            locked: AtomicBool::new(false),
            name,
        }
    }

    /// Acquire the lock, recording contention with the lock profiler.
    pub fn enter(&self) {
        #[cfg(any(debug_assertions, feature = "profiler"))]
        {
            let mut occupied = false;
            let mut tries = SPIN_TRIES;
            while self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                if !occupied {
                    occupied = true;
                    profiler::occupied(self.addr(), self.name);
                }
                if tries == 0 {
                    std::thread::yield_now();
                    tries = SPIN_TRIES;
                } else {
                    tries -= 1;
                }
            }
        }
        #[cfg(not(any(debug_assertions, feature = "profiler")))]
        {
            self.enter_without_profiler();
        }
    }

    /// Acquire the lock without touching the profiler, used by the
    /// profiler's own bookkeeping lock to avoid reentry.
    pub fn enter_without_profiler(&self) {
        let mut tries = SPIN_TRIES;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if tries == 0 {
                std::thread::yield_now();
                tries = SPIN_TRIES;
            } else {
                tries -= 1;
            }
        }
    }

    /// Non-blocking acquire.
    pub fn try_enter(&self) -> bool {
        let ok = self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        #[cfg(any(debug_assertions, feature = "profiler"))]
        if !ok {
            profiler::occupied(self.addr(), self.name);
        }
        ok
    }

    pub fn leave(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Acquire the lock and return an RAII guard that releases it on drop.
    pub fn enter_guard(&self) -> SpinGuard<'_> {
        SpinGuard::acquire(self)
    }

    #[cfg(any(debug_assertions, feature = "profiler"))]
    fn addr(&self) -> usize {
        self as *const SpinLock as usize
    }
}

impl Default for SpinLock {
    fn default() -> SpinLock {
        SpinLock::new()
    }
}

/// RAII guard mirroring `std::sync::MutexGuard`'s ergonomics on top of the
/// raw `enter`/`leave` pair; unlike a real mutex the guard carries no data,
/// since `SpinLock` only ever protects state reached through other `&self`
/// methods (the pool, the priority queues, the killing list).
pub struct SpinGuard<'a>(&'a SpinLock);

impl<'a> SpinGuard<'a> {
    pub fn acquire(lock: &'a SpinLock) -> SpinGuard<'a> {
        lock.enter();
        SpinGuard(lock)
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}
