//! §3/§4.7 — the AICO: a long-lived endpoint of one of `{socket, file,
//! task}`, owning no data of its own beyond the OS handle, its state word,
//! and its four timeout slots.
//!
//! Grounded on tbox's `aico_t`, re-expressed per spec.md §9's Design Note
//! "cyclic ownership (aicp ↔ aico)": the source gives each AICO a raw
//! back-pointer to its AICP. Here the `Aicp` exclusively owns the `Aico`
//! pool (via [`crate::pool::Pool`]) and each `Aico` is addressed only by
//! its `AicoRef` arena index, never by pointer — eliminating the cycle
//! while keeping `aicp_exit`'s uniform pool walk.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::error::TimeoutKind;
use crate::net::SocketKind;

/// An opaque handle into an `Aicp`'s `Aico` pool. Never dereferenced
/// directly — always looked up through the owning `Aicp`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AicoRef(pub usize);

/// The endpoint kind an `Aico` was opened as (spec.md §3).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AicoKind {
    /// Not yet opened.
    None,
    Socket(SocketKind),
    File,
    /// A timer-backed endpoint with no OS handle; `use_ltimer` selects
    /// which timer service schedules its `RunTask` deadlines.
    Task { use_ltimer: bool },
}

/// The AICO state word (spec.md §3), stored packed into a single
/// `AtomicUsize` so every transition is a single compare_exchange.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum AicoState {
    Closed = 0,
    Opened = 1,
    Pending = 2,
    Killing = 3,
    Killed = 4,
}

impl AicoState {
    fn from_usize(v: usize) -> AicoState {
        match v {
            0 => AicoState::Closed,
            1 => AicoState::Opened,
            2 => AicoState::Pending,
            3 => AicoState::Killing,
            4 => AicoState::Killed,
            _ => unreachable!("corrupt Aico state word"),
        }
    }
}

/// The OS resource an `Aico` wraps, or none for a `Task`.
pub enum Handle {
    None,
    #[cfg(unix)]
    Fd(RawFd),
    #[cfg(windows)]
    Socket(std::os::windows::io::RawSocket),
}

/// A long-lived AICP endpoint. Allocated from an `Aicp`'s pool by
/// `Aico::init`, addressed only by its [`AicoRef`].
pub struct Aico {
    state: AtomicUsize,
    kind: AicoKind,
    handle: Handle,
    timeouts: [AtomicI64; TimeoutKind::COUNT],
    #[cfg(debug_assertions)]
    last_post: std::sync::Mutex<Option<PostSite>>,
}

/// File/line/function of the most recent post, carried only in debug
/// builds (spec.md §3; SPEC_FULL.md §10 supplementary feature). Populated
/// by the [`crate::post_at`] macro, never by a runtime backtrace.
#[cfg(debug_assertions)]
#[derive(Copy, Clone, Debug)]
pub struct PostSite {
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
}

/// Record the call site of a post onto `$aico`. Expands to nothing outside
/// debug builds.
#[macro_export]
macro_rules! post_at {
    ($aico:expr) => {
        #[cfg(debug_assertions)]
        {
            $aico.record_post_site($crate::aico::PostSite {
                file: file!(),
                line: line!(),
                function: {
                    fn f() {}
                    fn type_name_of<T>(_: T) -> &'static str {
                        std::any::type_name::<T>()
                    }
                    type_name_of(f)
                },
            });
        }
    };
}

impl Aico {
    /// `aico_init` — freshly allocated, CLOSED, NONE, all timeouts
    /// disabled (-1).
    pub fn new() -> Aico {
        Aico {
            state: AtomicUsize::new(AicoState::Closed as usize),
            kind: AicoKind::None,
            handle: Handle::None,
            timeouts: std::array::from_fn(|_| AtomicI64::new(-1)),
            #[cfg(debug_assertions)]
            last_post: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> AicoState {
        AicoState::from_usize(self.state.load(Ordering::Acquire))
    }

    pub fn kind(&self) -> &AicoKind {
        &self.kind
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// `open_sock`/`open_file`/`open_task` — requires CLOSED; binds the
    /// handle and transitions to OPENED. Registration with the reactor is
    /// the caller's (`Aicp`'s) responsibility, since it alone knows the
    /// backend.
    pub fn open(&mut self, kind: AicoKind, handle: Handle) -> Result<(), OpenError> {
        if self.state() != AicoState::Closed {
            return Err(OpenError::NotClosed);
        }
        self.kind = kind;
        self.handle = handle;
        self.state.store(AicoState::Opened as usize, Ordering::Release);
        Ok(())
    }

    /// `aico_kill` — race-tolerant cancel (spec.md §4.7).
    ///
    /// Returns `true` if this call is the one that triggered cancellation
    /// (OPENED→KILLED direct, or PENDING→KILLING deferred); `false` if the
    /// AICO was already terminal or already being killed.
    pub fn kill(&self) -> bool {
        if self
            .state
            .compare_exchange(
                AicoState::Opened as usize,
                AicoState::Killed as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return true;
        }
        self.state
            .compare_exchange(
                AicoState::Pending as usize,
                AicoState::Killing as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Attempt the fast-path post transition OPENED→PENDING, or treat a
    /// KILLED AICO as an immediate synthetic-completion candidate (spec.md
    /// §4.7 step 1, and the Open Question in §9: unify KILLED-state
    /// posting by accepting it and synthesizing a KILLED completion).
    pub fn begin_post(&self) -> PostOutcome {
        if self
            .state
            .compare_exchange(
                AicoState::Opened as usize,
                AicoState::Pending as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return PostOutcome::Armed;
        }
        if self.state() == AicoState::Killed {
            return PostOutcome::SynthesizeKilled;
        }
        PostOutcome::Rejected
    }

    /// Clear PENDING back to OPENED after a completion, except when the
    /// completion is a still-live ACPT(OK) (spec.md §4.7's worker-loop
    /// pseudocode: "ACPT stays live for the next accept").
    pub fn complete_pending(&self, acpt_ok_stays_live: bool) {
        if acpt_ok_stays_live {
            return;
        }
        let _ = self.state.compare_exchange(
            AicoState::Pending as usize,
            AicoState::Opened as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The worker loop's double KILLING→KILLED sweep (spec.md §4.7):
    /// called once before invoking the user callback (to catch a kill that
    /// raced the completion) and once after (to catch a kill triggered by
    /// the callback itself).
    pub fn sweep_killing(&self) -> bool {
        self.state
            .compare_exchange(
                AicoState::Killing as usize,
                AicoState::Killed as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_terminal_kill(&self) -> bool {
        matches!(self.state(), AicoState::Killed | AicoState::Killing)
    }

    /// `aico_clos` — transition to CLOSED once the final `Clos` completion
    /// has run.
    pub fn mark_closed(&self) {
        self.state.store(AicoState::Closed as usize, Ordering::Release);
    }

    pub fn timeout(&self, kind: TimeoutKind) -> i64 {
        self.timeouts[kind.index()].load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, millis: i64) {
        self.timeouts[kind.index()].store(millis, Ordering::Relaxed);
    }

    #[cfg(debug_assertions)]
    pub fn record_post_site(&self, site: PostSite) {
        *self.last_post.lock().unwrap() = Some(site);
    }

    #[cfg(debug_assertions)]
    pub fn debug_site(&self) -> Option<PostSite> {
        *self.last_post.lock().unwrap()
    }
}

impl Default for Aico {
    fn default() -> Aico {
        Aico::new()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PostOutcome {
    /// The AICO transitioned OPENED→PENDING; proceed with the operation.
    Armed,
    /// The AICO was already KILLED; synthesize a KILLED completion instead
    /// of arming anything.
    SynthesizeKilled,
    /// Any other state: per-AICO serial-operations violation.
    Rejected,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenError {
    NotClosed,
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("aico open requires state == CLOSED")
    }
}

impl std::error::Error for OpenError {}
