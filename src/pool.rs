//! §4.3 — fixed-size object pool backing the `Aico`/`Aice` arenas.
//!
//! A `Vec<Entry<T>>` plus an intrusive free list threaded through the
//! vacant entries' `nxt` field, so removal and insertion are both O(1)
//! and never move live entries. Two extensions beyond a plain slab, both
//! required by spec.md §4.3:
//!
//! - `grow` lets the pool expand in fixed-size chunks instead of failing
//!   once built with a capacity, since AICP does not know the peer/session
//!   count up front (tbox's `tb_fixed_pool` grows the same way).
//! - [`Pool::walk`] visits every live entry by reference, used by the AICP
//!   worker to sweep all live `Aico`s during `aicp_exit` and
//!   `aicp_wait_all`.

use std::{fmt, mem};

const NONE: usize = usize::MAX;

enum Slot<T> {
    Vacant { next: usize },
    Occupied(T),
}

/// A growable arena of slots indexed by a stable `usize`, used wherever
/// spec.md hands out an opaque handle into a table of live objects.
pub struct Pool<T> {
    entries: Vec<Slot<T>>,
    len: usize,
    next_free: usize,
    grow_by: usize,
}

impl<T> Pool<T> {
    pub fn new(initial_capacity: usize, grow_by: usize) -> Pool<T> {
        assert!(grow_by > 0, "grow_by must be positive");
        Pool {
            entries: Vec::with_capacity(initial_capacity),
            len: 0,
            next_free: NONE,
            grow_by,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        match self.entries.get(index) {
            Some(Slot::Occupied(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.entries.get_mut(index) {
            Some(Slot::Occupied(v)) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        matches!(self.entries.get(index), Some(Slot::Occupied(_)))
    }

    /// Insert a value, growing the pool by `grow_by` if the free list is
    /// exhausted. Returns the stable index.
    pub fn insert(&mut self, value: T) -> usize {
        self.reserve_slot();
        let index = self.next_free;
        match self.entries[index] {
            Slot::Vacant { next } => self.next_free = next,
            Slot::Occupied(_) => unreachable!("free-list pointed at an occupied slot"),
        }
        self.entries[index] = Slot::Occupied(value);
        self.len += 1;
        index
    }

    /// Like [`Pool::insert`], but the value is constructed from its own
    /// about-to-be-assigned index, needed so an `Aico` can embed its own
    /// arena index for O(1) self-lookup on completion.
    pub fn insert_with<F: FnOnce(usize) -> T>(&mut self, f: F) -> usize {
        self.reserve_slot();
        let index = self.next_free;
        match self.entries[index] {
            Slot::Vacant { next } => self.next_free = next,
            Slot::Occupied(_) => unreachable!("free-list pointed at an occupied slot"),
        }
        self.entries[index] = Slot::Occupied(f(index));
        self.len += 1;
        index
    }

    fn reserve_slot(&mut self) {
        if self.next_free == NONE {
            let start = self.entries.len();
            let end = start + self.grow_by;
            self.entries.reserve(self.grow_by);
            for i in start..end {
                let next = if i + 1 == end { NONE } else { i + 1 };
                self.entries.push(Slot::Vacant { next });
            }
            self.next_free = start;
        }
    }

    /// Remove and return the value at `index`, if occupied.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let slot = self.entries.get_mut(index)?;
        if matches!(slot, Slot::Vacant { .. }) {
            return None;
        }
        let old = mem::replace(
            slot,
            Slot::Vacant {
                next: self.next_free,
            },
        );
        self.next_free = index;
        self.len -= 1;
        match old {
            Slot::Occupied(v) => Some(v),
            Slot::Vacant { .. } => unreachable!(),
        }
    }

    /// Visit every occupied slot in index order. Ported from tbox's
    /// `tb_fixed_pool_walk`, used to sweep live `Aico`s on shutdown.
    pub fn walk<F: FnMut(usize, &T)>(&self, mut f: F) {
        for (index, slot) in self.entries.iter().enumerate() {
            if let Slot::Occupied(v) = slot {
                f(index, v);
            }
        }
    }

    /// Mutable counterpart of [`Pool::walk`].
    pub fn walk_mut<F: FnMut(usize, &mut T)>(&mut self, mut f: F) {
        for (index, slot) in self.entries.iter_mut().enumerate() {
            if let Slot::Occupied(v) = slot {
                f(index, v);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied(v) => Some((i, v)),
            Slot::Vacant { .. } => None,
        })
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("len", &self.len)
            .field("capacity", &self.entries.capacity())
            .finish()
    }
}
