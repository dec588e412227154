//! §4.2 — lazy, thread-safe, ordered construction and teardown of named
//! process-wide services.
//!
//! Ported from tbox's `tb_singleton_instance`/`tb_singleton_kill`/
//! `tb_singleton_exit`: a fixed-size table of slots, each independently
//! lazy-initialized by its first caller (`EMPTY(0) -> INITIALIZING(1) ->
//! <pointer>`), with a separate kill phase (signal shutdown) before the
//! exit phase (actually reclaim), because some services — the AICP worker
//! threads among them — must be unblocked by `kill` before they can be
//! joined and dropped in `exit`.
//!
//! Design Note (spec.md §9): rather than truly global `static` state, the
//! registry here is a plain value (`Registry::new()`); callers thread a
//! `services: &Registry` capability through explicitly, which keeps the
//! lazy-init protocol testable without process-wide mutable state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Matches tbox's `__tb_small__` build split (32 small-footprint slots vs.
/// 128 otherwise); pick the small footprint by enabling the
/// `small_footprint` feature.
#[cfg(feature = "small_footprint")]
pub const MAXN: usize = 32;
#[cfg(not(feature = "small_footprint"))]
pub const MAXN: usize = 128;

const EMPTY: usize = 0;
const INITIALIZING: usize = 1;
// Any value > INITIALIZING is treated as "ready" and is the slot's stored
// generation counter, used only to hand back the right boxed instance from
// `instances`.

const WAIT_ATTEMPTS: u32 = 50;
const WAIT_STEP: Duration = Duration::from_millis(100);

type KillFn = Box<dyn FnOnce(&(dyn std::any::Any + Send + Sync)) + Send>;
type ExitFn = Box<dyn FnOnce(Box<dyn std::any::Any + Send + Sync>) + Send>;

struct Slot {
    state: AtomicUsize,
    instance: Mutex<Option<Box<dyn std::any::Any + Send + Sync>>>,
    kill: Mutex<Option<KillFn>>,
    exit: Mutex<Option<ExitFn>>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            state: AtomicUsize::new(EMPTY),
            instance: Mutex::new(None),
            kill: Mutex::new(None),
            exit: Mutex::new(None),
        }
    }
}

/// A process-wide (or test-scoped) table of lazily-initialized services.
pub struct Registry {
    slots: Vec<Slot>,
    // Insertion order, so kill/exit can walk in reverse.
    order: Mutex<Vec<usize>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            slots: (0..MAXN).map(|_| Slot::new()).collect(),
            order: Mutex::new(Vec::new()),
        }
    }

    /// First caller for `index` wins: it races EMPTY -> INITIALIZING, runs
    /// `init`, and on success stores the instance and its kill/exit hooks.
    /// Subsequent callers spin-wait up to ~5s for the winner to finish. A
    /// failed `init` (returns `None`) reverts the slot to EMPTY so a later
    /// caller may retry.
    pub fn instance<T, I, K, E>(&self, index: usize, init: I, kill: K, exit: E) -> Option<&T>
    where
        T: Send + Sync + 'static,
        I: FnOnce() -> Option<T> + Send,
        K: FnOnce(&T) + Send + 'static,
        E: FnOnce(T) + Send + 'static,
    {
        let slot = &self.slots[index];
        match slot
            .state
            .compare_exchange(EMPTY, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let built = init();
                match built {
                    Some(value) => {
                        *slot.instance.lock().unwrap() = Some(Box::new(value));
                        *slot.kill.lock().unwrap() = Some(Box::new(move |any| {
                            let v = any.downcast_ref::<T>().expect("singleton type mismatch");
                            kill(v);
                        }));
                        *slot.exit.lock().unwrap() = Some(Box::new(move |any| {
                            let v = *any.downcast::<T>().expect("singleton type mismatch");
                            exit(v);
                        }));
                        self.order.lock().unwrap().push(index);
                        slot.state.store(2, Ordering::Release);
                    }
                    None => {
                        slot.state.store(EMPTY, Ordering::Release);
                    }
                }
            }
            Err(_) => {
                let mut waited = 0;
                while slot.state.load(Ordering::Acquire) == INITIALIZING {
                    if waited >= WAIT_ATTEMPTS {
                        return None;
                    }
                    thread::sleep(WAIT_STEP);
                    waited += 1;
                }
            }
        }

        if slot.state.load(Ordering::Acquire) < 2 {
            return None;
        }
        let guard = slot.instance.lock().unwrap();
        guard.as_ref().map(|b| {
            let ptr = b.downcast_ref::<T>().expect("singleton type mismatch") as *const T;
            // SAFETY: the instance lives for the registry's lifetime once
            // installed; slots are never reused once populated.
            unsafe { &*ptr }
        })
    }

    /// Walk installed slots in reverse insertion order, signalling each to
    /// begin shutdown. Memory is not reclaimed yet — see [`Registry::exit`].
    pub fn kill(&self) {
        let order = self.order.lock().unwrap().clone();
        for index in order.into_iter().rev() {
            let slot = &self.slots[index];
            if let Some(kill) = slot.kill.lock().unwrap().take() {
                let guard = slot.instance.lock().unwrap();
                if let Some(instance) = guard.as_deref() {
                    kill(instance);
                }
            }
        }
    }

    /// Walk installed slots in reverse insertion order, atomically freeing
    /// each one and running its exit hook.
    pub fn exit(&self) {
        let order = std::mem::take(&mut *self.order.lock().unwrap());
        for index in order.into_iter().rev() {
            let slot = &self.slots[index];
            if slot.state.swap(EMPTY, Ordering::AcqRel) < 2 {
                continue;
            }
            let instance = slot.instance.lock().unwrap().take();
            let exit = slot.exit.lock().unwrap().take();
            if let (Some(instance), Some(exit)) = (instance, exit) {
                exit(instance);
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

/// The same lazy-init protocol over a caller-owned storage slot, for
/// services that may be queried before `Registry` itself exists (the
/// native allocator, the lock profiler, per tbox's
/// `tb_singleton_static_init`).
pub struct StaticSlot {
    state: AtomicUsize,
}

impl StaticSlot {
    pub const fn new() -> StaticSlot {
        StaticSlot {
            state: AtomicUsize::new(EMPTY),
        }
    }

    /// Runs `init` exactly once across all callers racing this slot,
    /// blocking the losers until the winner finishes.
    pub fn init_once<F: FnOnce() -> bool>(&self, init: F) -> bool {
        match self
            .state
            .compare_exchange(EMPTY, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let ok = init();
                self.state.store(if ok { 2 } else { EMPTY }, Ordering::Release);
                ok
            }
            Err(_) => {
                let mut waited = 0;
                while self.state.load(Ordering::Acquire) == INITIALIZING {
                    if waited >= WAIT_ATTEMPTS {
                        return false;
                    }
                    thread::sleep(WAIT_STEP);
                    waited += 1;
                }
                self.state.load(Ordering::Acquire) >= 2
            }
        }
    }
}

impl Default for StaticSlot {
    fn default() -> StaticSlot {
        StaticSlot::new()
    }
}
