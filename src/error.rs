//! The closed vocabularies of spec.md §3 and §6: operation codes, terminal
//! completion states, and the four per-operation timeout slots.
//!
//! Posting errors (invalid `Aico` state, unsupported backend feature, bad
//! arguments) are reported synchronously via `std::io::Result`, the same
//! way a readiness registry surfaces backend registration failures.
//! Completion outcomes are reported asynchronously, exactly once, as a
//! [`TerminalState`] carried on the `Aice` handed back to the completion
//! callback.

use std::fmt;

/// The closed set of operations an `Aice` may name (spec.md §6).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum OpCode {
    /// Accept an incoming connection, producing a new `Aico`.
    Acpt,
    /// Connect to a remote address.
    Conn,
    /// Stream recv into a buffer.
    Recv,
    /// Stream send from a buffer.
    Send,
    /// Datagram recv, fills the peer address.
    URecv,
    /// Datagram send to a peer address.
    USend,
    /// Stream recv into an iovec list.
    RecvV,
    /// Stream send from an iovec list.
    SendV,
    /// Datagram recv into an iovec list, fills the peer address.
    URecvV,
    /// Datagram send from an iovec list to a peer address.
    USendV,
    /// Zero-copy file-to-socket send at an offset.
    SendF,
    /// Positional file read.
    Read,
    /// Positional file write.
    Writ,
    /// Positional iovec file read.
    ReadV,
    /// Positional iovec file write.
    WritV,
    /// Flush file buffers.
    Fsync,
    /// Fire a callback at an absolute wall-clock deadline.
    RunTask,
    /// Close an `Aico`; completion fires in state `Closed`.
    Clos,
}

impl OpCode {
    /// Which of the four timeout slots on an `Aico` governs this op.
    pub fn timeout_kind(self) -> Option<TimeoutKind> {
        use OpCode::*;
        match self {
            Conn => Some(TimeoutKind::Conn),
            Send | USend | SendV | USendV | SendF => Some(TimeoutKind::Send),
            Recv | URecv | RecvV | URecvV => Some(TimeoutKind::Recv),
            Acpt => Some(TimeoutKind::Aacpt),
            Read | Writ | ReadV | WritV | Fsync | RunTask | Clos => None,
        }
    }

    /// Whether this op is a positional file operation run synchronously by
    /// the worker rather than armed on the reactor (spec.md §4.8).
    pub fn is_file_op(self) -> bool {
        matches!(
            self,
            OpCode::Read | OpCode::Writ | OpCode::ReadV | OpCode::WritV | OpCode::Fsync
        )
    }

    /// Higher-priority ops (`spak[0]`) versus data I/O (`spak[1]`),
    /// spec.md §3.
    pub fn is_high_priority(self) -> bool {
        matches!(self, OpCode::Acpt | OpCode::Conn | OpCode::RunTask | OpCode::Clos)
    }
}

/// The four timeout slots on an `Aico` (spec.md §6). `-1` disables the
/// timeout for that slot; `0` means the deadline has already passed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(usize)]
pub enum TimeoutKind {
    Conn = 0,
    Send = 1,
    Recv = 2,
    Aacpt = 3,
}

impl TimeoutKind {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// The terminal state delivered on every completion, exactly once
/// (spec.md §3, §6, §7).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TerminalState {
    /// The operation completed successfully.
    Ok,
    /// The peer half-closed cleanly, or the fd is an orphan.
    Closed,
    /// Locally cancelled: a user `kill` or a timeout-triggered kill.
    Killed,
    /// A per-operation timeout elapsed before readiness.
    Timeout,
    /// The operation failed for a reason other than the above.
    Failed,
}

impl TerminalState {
    pub fn is_ok(self) -> bool {
        matches!(self, TerminalState::Ok)
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalState::Ok => "ok",
            TerminalState::Closed => "closed",
            TerminalState::Killed => "killed",
            TerminalState::Timeout => "timeout",
            TerminalState::Failed => "failed",
        };
        f.write_str(s)
    }
}
