//! §3/§4.7 — the priority two-queue (`spak[0]`/`spak[1]`) and the killing
//! list (spec.md §3), both guarded by the AICP [`crate::spinlock::SpinLock`]
//! as spec.md §5's "Shared-resource policy" prescribes.
//!
//! `spak[0]` carries `Acpt`/`Conn`/`RunTask`/`Clos` (spec.md's "higher
//! priority" class via [`crate::error::OpCode::is_high_priority`]);
//! `spak[1]` carries everything else. The worker always drains `spak[0]`
//! fully before looking at `spak[1]`, so a connect/accept never starves
//! behind bulk data I/O. spec.md §3 also requires this ordering for
//! entries that "transition out" of the pending set on reactor readiness,
//! not just for freshly-posted ones (Testable Property #3) — [`QueueItem`]
//! carries that distinction so both paths share one priority-ordered pop.

use std::collections::VecDeque;

use crate::aico::AicoRef;
use crate::aice::Aice;
use crate::spinlock::SpinLock;

/// An entry on `spak[0]`/`spak[1]`: either a caller's freshly-posted AICE
/// (needs the full first-attempt dispatch, including `Conn`'s initial
/// `connect(2)`) or one the reactor just reported ready and which needs a
/// retry attempt (`Conn` rechecks `SO_ERROR` instead of calling
/// `connect(2)` again). Both variants are ordered identically by
/// [`Queues::push`]/[`Queues::pop`] so a high-priority readiness
/// completion still preempts a low-priority one queued in the same batch.
pub enum QueueItem {
    Fresh(Aice),
    Retry(Aice),
}

impl QueueItem {
    fn aice(&self) -> &Aice {
        match self {
            QueueItem::Fresh(a) | QueueItem::Retry(a) => a,
        }
    }
}

/// The two FIFOs plus the killing list, all under one spinlock — mirroring
/// tbox's single AICP-wide spinlock guarding pool, queues, and killing
/// list together (spec.md §5).
pub struct Queues {
    lock: SpinLock,
    high: std::cell::UnsafeCell<VecDeque<QueueItem>>,
    low: std::cell::UnsafeCell<VecDeque<QueueItem>>,
    killing: std::cell::UnsafeCell<Vec<AicoRef>>,
}

// SAFETY: every access to the `UnsafeCell` fields goes through a method
// that first acquires `lock`; the spinlock is what makes concurrent access
// from multiple worker threads sound.
unsafe impl Send for Queues {}
unsafe impl Sync for Queues {}

impl Queues {
    pub fn new() -> Queues {
        Queues {
            lock: SpinLock::new(),
            high: std::cell::UnsafeCell::new(VecDeque::new()),
            low: std::cell::UnsafeCell::new(VecDeque::new()),
            killing: std::cell::UnsafeCell::new(Vec::new()),
        }
    }

    /// Enqueue onto `spak[0]` (high priority) or `spak[1]` (low priority)
    /// depending on the carried `Aice::code`'s class.
    pub fn push(&self, item: QueueItem) {
        let high_priority = item.aice().code.is_high_priority();
        let _guard = self.lock.enter_guard();
        // SAFETY: guard holds the spinlock.
        unsafe {
            if high_priority {
                (*self.high.get()).push_back(item);
            } else {
                (*self.low.get()).push_back(item);
            }
        }
    }

    /// Pop the next entry to run, draining `spak[0]` before `spak[1]`
    /// (spec.md §3, §5).
    pub fn pop(&self) -> Option<QueueItem> {
        let _guard = self.lock.enter_guard();
        // SAFETY: guard holds the spinlock.
        unsafe {
            (*self.high.get())
                .pop_front()
                .or_else(|| (*self.low.get()).pop_front())
        }
    }

    pub fn len(&self) -> usize {
        let _guard = self.lock.enter_guard();
        unsafe { (*self.high.get()).len() + (*self.low.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an `Aico` to the killing list — the deferred-cancel parking
    /// lot the reactor consults between waits (spec.md §3).
    pub fn park_for_killing(&self, aico: AicoRef) {
        let _guard = self.lock.enter_guard();
        unsafe { (*self.killing.get()).push(aico) };
    }

    /// Drain the killing list for the reactor to process between waits.
    pub fn drain_killing(&self) -> Vec<AicoRef> {
        let _guard = self.lock.enter_guard();
        unsafe { std::mem::take(&mut *self.killing.get()) }
    }
}

impl Default for Queues {
    fn default() -> Queues {
        Queues::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aice::AicePayload;
    use crate::error::OpCode;

    fn aice(code: OpCode) -> Aice {
        Aice::new(code, AicoRef(0), AicePayload::Clos, Box::new(|_| true))
    }

    #[test]
    fn high_priority_drains_before_low() {
        let q = Queues::new();
        q.push(QueueItem::Fresh(aice(OpCode::Recv)));
        q.push(QueueItem::Fresh(aice(OpCode::Acpt)));
        q.push(QueueItem::Fresh(aice(OpCode::Send)));

        let first = q.pop().unwrap();
        assert_eq!(first.aice().code, OpCode::Acpt);
        let second = q.pop().unwrap();
        assert_eq!(second.aice().code, OpCode::Recv);
        let third = q.pop().unwrap();
        assert_eq!(third.aice().code, OpCode::Send);
        assert!(q.pop().is_none());
    }

    /// Testable Property #3: a readiness-driven retry for a high-priority
    /// op (e.g. a just-accepted `Acpt`) still preempts a low-priority
    /// retry (e.g. a ready `Recv`) queued in the same readiness batch.
    #[test]
    fn high_priority_retry_drains_before_low_priority_retry() {
        let q = Queues::new();
        q.push(QueueItem::Retry(aice(OpCode::Recv)));
        q.push(QueueItem::Retry(aice(OpCode::Recv)));
        q.push(QueueItem::Retry(aice(OpCode::Acpt)));

        let first = q.pop().unwrap();
        assert_eq!(first.aice().code, OpCode::Acpt);
        assert!(matches!(first, QueueItem::Retry(_)));
        let second = q.pop().unwrap();
        assert_eq!(second.aice().code, OpCode::Recv);
        let third = q.pop().unwrap();
        assert_eq!(third.aice().code, OpCode::Recv);
    }

    #[test]
    fn fifo_within_a_priority_class() {
        let q = Queues::new();
        for i in 0..3 {
            let mut a = aice(OpCode::Recv);
            a.aico = AicoRef(i);
            q.push(QueueItem::Fresh(a));
        }
        assert_eq!(q.pop().unwrap().aice().aico, AicoRef(0));
        assert_eq!(q.pop().unwrap().aice().aico, AicoRef(1));
        assert_eq!(q.pop().unwrap().aice().aico, AicoRef(2));
    }

    #[test]
    fn killing_list_parks_and_drains() {
        let q = Queues::new();
        q.park_for_killing(AicoRef(1));
        q.park_for_killing(AicoRef(2));
        assert_eq!(q.drain_killing(), vec![AicoRef(1), AicoRef(2)]);
        assert!(q.drain_killing().is_empty());
    }
}
