//! §3 — the AICE: a single operation description plus its completion hook.
//!
//! Grounded on tbox's `aice_t` tagged union; `AicePayload::real` stands in
//! for the union's fixed-offset `real` field (spec.md §3: "so generic code
//! can read it without branching on the code") as an enum accessor rather
//! than a pointer-offset trick — the idiomatic Rust realization of the
//! same "no branching to find the shared field" property.

use std::net::SocketAddr;
use std::time::Instant;

use crate::aico::AicoRef;
use crate::error::{OpCode, TerminalState};

/// Per-operation payload (spec.md §3's tagged union).
pub enum AicePayload {
    /// `Acpt` result: the freshly-accepted `Aico`, or `None` on anything
    /// but `OK` (spec.md S2: "acpt.aico=null" on timeout).
    Acpt { accepted: Option<AicoRef> },
    /// `Conn`: the remote address to connect to.
    Conn { addr: SocketAddr },
    /// `Recv`/`Send`: a single buffer and the transferred-byte count.
    Buffer { buf: Vec<u8>, real: usize },
    /// `URecv`/`USend`: a buffer, the peer address, and the transferred
    /// count.
    UdpBuffer {
        buf: Vec<u8>,
        peer: Option<SocketAddr>,
        real: usize,
    },
    /// `RecvV`/`SendV`: an iovec-shaped list of buffers and the total
    /// transferred count.
    BufferVec { bufs: Vec<Vec<u8>>, real: usize },
    /// `URecvV`/`USendV`.
    UdpBufferVec {
        bufs: Vec<Vec<u8>>,
        peer: Option<SocketAddr>,
        real: usize,
    },
    /// `SendF`: file-to-socket send at `offset`, reading from `file`'s
    /// own `Aico` (tbox's `aice_t.u.sendfile.file` source descriptor).
    SendFile { file: AicoRef, offset: u64, size: u64, real: u64 },
    /// `Read`/`Writ`: positional file I/O.
    File { seek: u64, buf: Vec<u8>, real: usize },
    /// `ReadV`/`WritV`: positional iovec file I/O.
    FileVec { seek: u64, bufs: Vec<Vec<u8>>, real: usize },
    /// `Fsync`: nothing beyond the terminal state.
    Fsync,
    /// `RunTask`: the absolute deadline and, for periodic tasks, the
    /// repeat period.
    RunTask { when: Instant, period: Option<std::time::Duration> },
    /// `Clos`: nothing beyond the terminal state.
    Clos,
}

impl AicePayload {
    /// The transferred-byte count, at "the same offset" for every payload
    /// that carries one — 0 for payloads with no notion of a transfer
    /// (spec.md §3).
    pub fn real(&self) -> u64 {
        match self {
            AicePayload::Buffer { real, .. } => *real as u64,
            AicePayload::UdpBuffer { real, .. } => *real as u64,
            AicePayload::BufferVec { real, .. } => *real as u64,
            AicePayload::UdpBufferVec { real, .. } => *real as u64,
            AicePayload::SendFile { real, .. } => *real,
            AicePayload::File { real, .. } => *real as u64,
            AicePayload::FileVec { real, .. } => *real as u64,
            AicePayload::Acpt { .. }
            | AicePayload::Conn { .. }
            | AicePayload::Fsync
            | AicePayload::RunTask { .. }
            | AicePayload::Clos => 0,
        }
    }
}

/// The opaque per-operation user slot (spec.md §3's "opaque user
/// pointer"), realized as a type-erased box rather than a raw pointer.
pub type UserData = Box<dyn std::any::Any + Send>;

/// The completion callback shape (spec.md §6): returning `false` signals
/// unrecoverable user-code failure; the worker logs and continues rather
/// than propagating a panic.
pub type Completion = Box<dyn FnMut(&mut Aice) -> bool + Send>;

/// A single operation description plus its completion hook (spec.md §3).
pub struct Aice {
    pub code: OpCode,
    pub state: TerminalState,
    pub aico: AicoRef,
    pub payload: AicePayload,
    pub user: Option<UserData>,
    callback: Option<Completion>,
}

impl Aice {
    pub fn new(code: OpCode, aico: AicoRef, payload: AicePayload, callback: Completion) -> Aice {
        Aice {
            code,
            state: TerminalState::Ok,
            aico,
            payload,
            user: None,
            callback: Some(callback),
        }
    }

    pub fn with_user(mut self, user: UserData) -> Aice {
        self.user = Some(user);
        self
    }

    /// Invoke the completion callback exactly once. Returns `false` if the
    /// callback itself reported failure (spec.md §6) or if it had already
    /// been consumed — the latter would be an engine bug, not a user one.
    pub fn fire(&mut self) -> bool {
        match self.callback.take() {
            Some(mut cb) => cb(self),
            None => false,
        }
    }
}

impl std::fmt::Debug for Aice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aice")
            .field("code", &self.code)
            .field("state", &self.state)
            .field("aico", &self.aico)
            .finish()
    }
}
