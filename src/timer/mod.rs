//! §4.4/§4.5 — the two timer services AICP schedules deadlines on:
//! [`hires::HiresTimer`] for per-`Aico` operation timeouts (precise to the
//! millisecond, low cardinality) and [`ltimer::LowResTimer`] for the bulk
//! connection-idle/keepalive deadlines tbox calls its "ltimer" (coarse
//! one-second resolution, high cardinality, O(1) insert/cancel).
//!
//! Neither timer runs its own wakeup thread: the AICP worker
//! already wakes once per reactor poll timeout, and consults
//! `next_deadline()` to bound how long the next poll may block, exactly as
//! tbox's `tb_aicp_loop_spak` consults `tb_timer_delay`/`tb_ltimer_delay`.

pub mod hires;
pub mod ltimer;

pub use hires::HiresTimer;
pub use ltimer::LowResTimer;

/// A handle returned by either timer's `schedule`, opaque to callers and
/// meaningful only to the timer that issued it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(pub(crate) usize);
