//! §4.9 — lock profiler (debug only).
//!
//! Ported from tbox's `tb_lock_profiler`: an open-addressed hash table of
//! `(lock_addr, occupied_count, name)` keyed by the lock's own address.
//! `register` probes up to 16 slots looking for an empty one or one already
//! holding the same address; `occupied` increments the counter of whichever
//! slot holds a matching address, also within 16 probes. Collisions beyond
//! that are silently dropped — the profiler is diagnostic, not
//! authoritative, exactly as tbox documents it.
//!
//! Compiled whenever `cfg(debug_assertions)` holds or the `profiler` feature
//! is enabled, so release embeds can still opt into field diagnostics.

#![cfg(any(debug_assertions, feature = "profiler"))]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

const PROBE_LIMIT: usize = 16;

#[cfg(feature = "small_footprint")]
const TABLE_SIZE: usize = 256;
#[cfg(not(feature = "small_footprint"))]
const TABLE_SIZE: usize = 512;

struct Slot {
    addr: AtomicUsize,
    name: std::sync::Mutex<&'static str>,
    count: AtomicU64,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            addr: AtomicUsize::new(0),
            name: std::sync::Mutex::new(""),
            count: AtomicU64::new(0),
        }
    }
}

struct Table {
    slots: Vec<Slot>,
    // Guards insertion of new entries; counting an existing entry never
    // needs it (a single `fetch_add` suffices).
    insert_lock: std::sync::Mutex<()>,
}

fn table() -> &'static Table {
    static TABLE: OnceLock<Table> = OnceLock::new();
    TABLE.get_or_init(|| Table {
        slots: (0..TABLE_SIZE).map(|_| Slot::empty()).collect(),
        insert_lock: std::sync::Mutex::new(()),
    })
}

fn probe_start(addr: usize) -> usize {
    // tbox hashes the pointer value directly; a multiplicative mix keeps
    // low-order-zero pointer alignment from clustering every lock into the
    // same few buckets.
    addr.wrapping_mul(0x9E3779B97F4A7C15) % TABLE_SIZE
}

/// Register `name` for `addr` if not already present. Idempotent.
pub fn register(addr: usize, name: &'static str) {
    let t = table();
    let _guard = t.insert_lock.lock().unwrap();
    let start = probe_start(addr);
    for i in 0..PROBE_LIMIT {
        let slot = &t.slots[(start + i) % TABLE_SIZE];
        let existing = slot.addr.load(Ordering::Relaxed);
        if existing == addr {
            return; // already registered
        }
        if existing == 0 {
            slot.addr.store(addr, Ordering::Relaxed);
            *slot.name.lock().unwrap() = name;
            return;
        }
    }
    // Table full within the probe budget: drop, diagnostic only.
}

/// Record that `addr` was found occupied by a contended acquisition.
pub fn occupied(addr: usize, name: &'static str) {
    let t = table();
    let start = probe_start(addr);
    for i in 0..PROBE_LIMIT {
        let slot = &t.slots[(start + i) % TABLE_SIZE];
        let existing = slot.addr.load(Ordering::Relaxed);
        if existing == addr {
            slot.count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if existing == 0 {
            // First time we've seen this lock contended: register it on
            // the fly, then count it.
            register(addr, name);
            occupied_once_registered(addr);
            return;
        }
    }
}

fn occupied_once_registered(addr: usize) {
    let t = table();
    let start = probe_start(addr);
    for i in 0..PROBE_LIMIT {
        let slot = &t.slots[(start + i) % TABLE_SIZE];
        if slot.addr.load(Ordering::Relaxed) == addr {
            slot.count.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
}

/// Render every non-empty slot as `(name @ addr: count)` lines.
pub fn dump() -> String {
    let t = table();
    let mut out = String::new();
    for slot in &t.slots {
        let addr = slot.addr.load(Ordering::Relaxed);
        if addr != 0 {
            let name = *slot.name.lock().unwrap();
            let count = slot.count.load(Ordering::Relaxed);
            out.push_str(&format!("{name} @ {addr:#x}: {count}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_occupy_accumulates() {
        let addr: usize = 0xdead_beef;
        register(addr, "test-lock");
        occupied(addr, "test-lock");
        occupied(addr, "test-lock");
        let dump = dump();
        assert!(dump.contains("test-lock"));
    }
}
