//! High-precision timer: a binary min-heap keyed by absolute deadline.
//!
//! Used for the four per-operation timeout slots on an `Aico` (spec.md
//! §4.4, §6) — low cardinality (at most 4 live deadlines per connection)
//! but needing millisecond accuracy, unlike the bulk idle timers on
//! [`super::ltimer`]. Cancellation is lazy: a cancelled entry is removed
//! from the backing pool immediately but left in the heap; the heap only
//! drops it once it would otherwise be popped, following the fixed-size
//! pool + heap-of-indices approach tbox's `tb_timer` takes to avoid an
//! O(n) scan for removal.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::pool::Pool;
use crate::timer::TimerId;

struct Entry<T> {
    deadline: Instant,
    data: T,
}

/// A min-heap of absolute deadlines, each carrying an arbitrary payload.
pub struct HiresTimer<T> {
    pool: Pool<Entry<T>>,
    heap: BinaryHeap<Reverse<(Instant, usize)>>,
}

impl<T> HiresTimer<T> {
    pub fn new() -> HiresTimer<T> {
        HiresTimer {
            pool: Pool::new(0, 64),
            heap: BinaryHeap::new(),
        }
    }

    /// Schedule `data` to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, data: T) -> TimerId {
        let index = self.pool.insert(Entry { deadline, data });
        self.heap.push(Reverse((deadline, index)));
        TimerId(index)
    }

    /// Cancel a previously scheduled timeout, returning its payload if it
    /// had not already fired.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.pool.remove(id.0).map(|e| e.data)
    }

    /// The soonest deadline still pending, used to bound how long the
    /// reactor may block before the next poll.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pop and return the earliest timeout that has reached `now`, if any.
    /// Call repeatedly to drain every timeout due at `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, T)> {
        loop {
            self.drop_stale();
            let &Reverse((deadline, index)) = self.heap.peek()?;
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(entry) = self.pool.remove(index) {
                return Some((TimerId(index), entry.data));
            }
            // Entry was cancelled between peek and pop; keep draining.
        }
    }

    /// Drop heap entries whose backing pool slot was already cancelled or
    /// fired, so `peek`/`next_deadline` never return stale deadlines.
    fn drop_stale(&mut self) {
        while let Some(&Reverse((_, index))) = self.heap.peek() {
            if self.pool.contains(index) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

impl<T> Default for HiresTimer<T> {
    fn default() -> HiresTimer<T> {
        HiresTimer::new()
    }
}
