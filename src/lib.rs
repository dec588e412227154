//! AICP: an asynchronous I/O proactor built on a readiness reactor.
//!
//! Callers submit an [`Aice`] describing one operation (accept, connect,
//! recv/send — stream or datagram, vectored or not —, positional file I/O,
//! a timed task, or a close) against a long-lived [`Aico`] endpoint; the
//! [`Aicp`] worker loop runs it to completion and invokes the submitted
//! callback exactly once with the outcome, regardless of whether the
//! operation completed synchronously, went through the reactor, or was
//! cancelled.
//!
//! Grounded on tbox's `tb_aicp_t`/`tb_aico_t`/`tb_aice_t` design (a
//! completion layer over a `tb_poller_t` readiness backend), reworked onto
//! a per-OS readiness-selector split and a slab-style fixed-size pool.
//! See DESIGN.md for the module-by-module grounding ledger.
//!
//! ```no_run
//! use aicp::{Aice, AicePayload, Aicp, OpCode};
//!
//! let ptor = Aicp::new(64)?;
//! let aico = ptor.aico_init();
//! ptor.open_task(aico, false)?;
//! ptor.post(Aice::new(
//!     OpCode::RunTask,
//!     aico,
//!     AicePayload::RunTask { when: std::time::Instant::now(), period: None },
//!     Box::new(|_aice| true),
//! ))?;
//! ptor.run_until(|| ptor.is_killed())?;
//! # Ok::<(), std::io::Error>(())
//! ```

#![allow(dead_code)]

pub mod aice;
pub mod aico;
pub mod error;
pub mod fileio;
pub mod interest;
mod macros;
pub mod net;
pub mod pool;
pub mod proactor;
pub mod queue;
pub mod reactor;
pub mod singleton;
pub mod spinlock;
pub mod timer;
pub mod token;

#[cfg(any(debug_assertions, feature = "profiler"))]
pub mod profiler;

/// Documentation of this crate's Cargo features.
///
/// ## `log`
///
/// Enabled by default. Routes worker-loop diagnostics (callback failures,
/// backend registration errors) through the `log` crate's global logger
/// instead of being silently dropped.
///
/// ## `profiler`
///
/// Enables the lock-contention profiler (see [`crate::profiler`]) and
/// debug-only post-site tracking on top of whatever `cfg(debug_assertions)`
/// already turns on, so release builds can opt back in for field
/// diagnostics.
///
/// ## `small_footprint`
///
/// Shrinks the singleton registry and lock-profiler table to tbox's
/// `__tb_small__` slot counts, trading slot headroom for a smaller static
/// footprint.
pub mod features {}

pub use aice::{Aice, AicePayload, Completion, UserData};
pub use aico::{Aico, AicoKind, AicoRef, AicoState, Handle, OpenError, PostOutcome};
pub use error::{OpCode, TerminalState, TimeoutKind};
pub use interest::Interest;
pub use net::SocketKind;
pub use proactor::{default_instance, Aicp, DEFAULT_SLOT};
pub use singleton::Registry;
pub use token::Token;
