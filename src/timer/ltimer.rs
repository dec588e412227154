//! Low-precision timer: a hierarchical timing wheel, 1-second ticks.
//!
//! Structured as a `wheel: Vec<WheelEntry>`, an intrusive doubly-linked
//! list of entries per slot, `tick`/`mask`/`slot_for` arithmetic to map a
//! deadline to its slot, backed by [`crate::pool::Pool`] with no
//! background wakeup thread — tbox's `tb_ltimer` exists precisely because
//! coarse
//! deadlines (connection idle timeouts, keepalive) don't need their own
//! thread or millisecond accuracy; the AICP worker advances the wheel once
//! per loop iteration instead (spec.md §4.5).

use std::time::{Duration, Instant};

use crate::pool::Pool;
use crate::timer::TimerId;

const EMPTY: usize = usize::MAX;
const DEFAULT_SLOTS: usize = 256;

#[derive(Copy, Clone)]
struct Links {
    tick: u64,
    prev: usize,
    next: usize,
}

struct Entry<T> {
    data: T,
    links: Links,
}

#[derive(Copy, Clone)]
struct Slot {
    head: usize,
}

/// A hierarchical timing wheel ticking once per second.
pub struct LowResTimer<T> {
    entries: Pool<Entry<T>>,
    wheel: Vec<Slot>,
    mask: u64,
    start: Instant,
    tick: u64,
}

impl<T> LowResTimer<T> {
    pub fn new() -> LowResTimer<T> {
        LowResTimer::with_slots(DEFAULT_SLOTS)
    }

    pub fn with_slots(num_slots: usize) -> LowResTimer<T> {
        let num_slots = num_slots.next_power_of_two();
        LowResTimer {
            entries: Pool::new(0, 64),
            wheel: vec![Slot { head: EMPTY }; num_slots],
            mask: (num_slots as u64) - 1,
            start: Instant::now(),
            tick: 0,
        }
    }

    /// Schedule `data` to fire no sooner than `delay` from now, rounded up
    /// to the next whole second and at least one tick in the future.
    pub fn schedule(&mut self, delay: Duration, data: T) -> TimerId {
        let target = self.tick_for(self.start.elapsed() + delay).max(self.tick + 1);
        self.insert(target, data)
    }

    fn insert(&mut self, tick: u64, data: T) -> TimerId {
        let slot = self.slot_for(tick);
        let old_head = self.wheel[slot].head;
        let index = self.entries.insert_with(|_| Entry {
            data,
            links: Links {
                tick,
                prev: EMPTY,
                next: old_head,
            },
        });
        if old_head != EMPTY {
            self.entries.get_mut(old_head).unwrap().links.prev = index;
        }
        self.wheel[slot].head = index;
        TimerId(index)
    }

    /// Cancel a scheduled timeout before it fires.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let links = self.entries.get(id.0)?.links;
        self.unlink(id.0, links);
        self.entries.remove(id.0).map(|e| e.data)
    }

    fn unlink(&mut self, index: usize, links: Links) {
        if links.prev == EMPTY {
            let slot = self.slot_for(links.tick);
            self.wheel[slot].head = links.next;
        } else {
            self.entries.get_mut(links.prev).unwrap().links.next = links.next;
        }
        if links.next != EMPTY {
            self.entries.get_mut(links.next).unwrap().links.prev = links.prev;
        }
    }

    /// Advance the wheel to `now` and pop one expired entry, if any. Call
    /// repeatedly until it returns `None` to drain everything due.
    pub fn poll(&mut self, now: Instant) -> Option<(TimerId, T)> {
        let target_tick = self.tick_for(now.saturating_duration_since(self.start));
        while self.tick <= target_tick {
            let slot = self.slot_for(self.tick);
            let mut cursor = self.wheel[slot].head;
            while cursor != EMPTY {
                let links = self.entries.get(cursor).unwrap().links;
                if links.tick <= self.tick {
                    self.unlink(cursor, links);
                    let data = self.entries.remove(cursor).unwrap().data;
                    return Some((TimerId(cursor), data));
                }
                cursor = links.next;
            }
            self.tick += 1;
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot_for(&self, tick: u64) -> usize {
        (tick & self.mask) as usize
    }

    fn tick_for(&self, elapsed: Duration) -> u64 {
        elapsed.as_secs()
    }
}

impl<T> Default for LowResTimer<T> {
    fn default() -> LowResTimer<T> {
        LowResTimer::new()
    }
}
