//! §3/§4.7 — the AICP proactor core: the `Aicp` that owns the `Aico` pool,
//! the priority queues, both timers, and the reactor, and that runs the
//! completion-based worker loop described in spec.md §4.7's pseudocode:
//!
//! ```text
//! work++
//! loop:
//!     r = ptor->loop_spak(timeout)
//!     if r < 0: break
//!     if r == 0: continue
//!     ... dispatch ready aice, fire callback, double KILLING sweep ...
//! ```
//!
//! Grounded on tbox's `tb_aicp_t`/`tb_aicp_proactor_t` split, re-expressed
//! per spec.md §9's Design Note: instead of a raw `aico->aicp` back-pointer,
//! every `Aico` is addressed only through its [`AicoRef`] arena index into
//! this struct's own [`crate::pool::Pool`], eliminating the cycle.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};

use crate::aice::{Aice, AicePayload, Completion};
use crate::aico::{Aico, AicoKind, AicoRef, AicoState, Handle, PostOutcome};
use crate::error::{OpCode, TerminalState, TimeoutKind};
use crate::fileio;
use crate::interest::Interest;
use crate::net::{self, SocketKind};
use crate::pool::Pool;
use crate::queue::{QueueItem, Queues};
use crate::reactor::{RawFdLike, Readiness, Selector};
use crate::singleton::Registry;
use crate::spinlock::SpinLock;
use crate::timer::{HiresTimer, LowResTimer, TimerId};
use crate::token::Token;

/// An armed operation waiting on the reactor or a timeout (spec.md §4.7's
/// "pending set", threaded explicitly here rather than folded into the
/// `Aico` itself, since only one op is ever pending per `Aico` at a time).
struct Pending {
    aice: Aice,
    timeout: Option<TimerId>,
}

/// Guards the `Aico` arena the same way [`Queues`] guards the spak
/// queues — one spinlock, `UnsafeCell` payload, `unsafe impl Send + Sync`
/// justified by every access going through [`AicoTable::with`].
struct AicoTable {
    lock: SpinLock,
    pool: std::cell::UnsafeCell<Pool<Aico>>,
}

unsafe impl Send for AicoTable {}
unsafe impl Sync for AicoTable {}

impl AicoTable {
    fn new() -> AicoTable {
        AicoTable {
            lock: SpinLock::new(),
            pool: std::cell::UnsafeCell::new(Pool::new(0, 64)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Pool<Aico>) -> R) -> R {
        let _guard = self.lock.enter_guard();
        // SAFETY: guard holds the spinlock.
        unsafe { f(&mut *self.pool.get()) }
    }
}

/// The outcome of a non-blocking attempt at a socket operation.
enum Attempt {
    Done(TerminalState),
    WouldBlock(Interest),
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == Some(libc::EAGAIN)
        || e.raw_os_error() == Some(libc::EWOULDBLOCK)
}

/// The AICP proactor (spec.md §3, §4.7). Construct with [`Aicp::new`],
/// which returns an `Arc` since [`Aicp::post_after`] needs to hand a
/// `Weak` reference to the internal `RunTask` it schedules.
pub struct Aicp {
    aicos: AicoTable,
    selector: Selector,
    queues: Queues,
    pending: Mutex<HashMap<usize, Pending>>,
    registered: Mutex<std::collections::HashSet<usize>>,
    hires: Mutex<HiresTimer<Aice>>,
    ltimer: Mutex<LowResTimer<usize>>,
    /// `RunTask` AICOs opened with `use_ltimer = true` (spec.md §4.3: "the
    /// task variant stores the timer selector in the handle slot") schedule
    /// here instead of on [`Aicp::hires`], trading hires's logarithmic
    /// insert/cancel for the wheel's O(1) cost at second-granularity.
    ltimer_tasks: Mutex<LowResTimer<Aice>>,
    killed: AtomicBool,
    /// A weak handle to its own `Arc`, set at construction via
    /// `Arc::new_cyclic`. [`Aicp::post_after`] upgrades this to schedule an
    /// internal `RunTask` that calls back into `post`/`complete` without
    /// requiring every caller to carry an `Arc<Aicp>` receiver type.
    self_weak: std::sync::Weak<Aicp>,
}

impl Aicp {
    /// `aicp_init` — spec.md §4.7. `capacity_hint` sizes the reactor's
    /// per-wait event buffer; the `Aico` pool itself always starts empty
    /// and grows in fixed chunks (spec.md §4.3).
    pub fn new(capacity_hint: usize) -> io::Result<Arc<Aicp>> {
        let selector = Selector::new(capacity_hint)?;
        Ok(Arc::new_cyclic(|weak| Aicp {
            aicos: AicoTable::new(),
            selector,
            queues: Queues::new(),
            pending: Mutex::new(HashMap::new()),
            registered: Mutex::new(std::collections::HashSet::new()),
            hires: Mutex::new(HiresTimer::new()),
            ltimer: Mutex::new(LowResTimer::new()),
            ltimer_tasks: Mutex::new(LowResTimer::new()),
            killed: AtomicBool::new(false),
            self_weak: weak.clone(),
        }))
    }

    fn with_aico<R>(&self, aico_ref: AicoRef, f: impl FnOnce(&mut Aico) -> R) -> Option<R> {
        self.aicos.with(|pool| pool.get_mut(aico_ref.0).map(f))
    }

    fn raw_fd(&self, aico_ref: AicoRef) -> Option<RawFdLike> {
        self.with_aico(aico_ref, |a| match a.handle() {
            #[cfg(unix)]
            Handle::Fd(fd) => Some(*fd),
            #[cfg(windows)]
            Handle::Socket(s) => Some(*s),
            Handle::None => None,
        })
        .flatten()
    }

    // ---- AICO lifecycle -------------------------------------------------

    /// `aico_init` — allocate a fresh, CLOSED `Aico`.
    pub fn aico_init(&self) -> AicoRef {
        AicoRef(self.aicos.with(|pool| pool.insert(Aico::new())))
    }

    /// `open_sock` — bind an already-connected-or-listening socket handle
    /// to an `Aico` allocated by [`Aicp::aico_init`].
    #[cfg(unix)]
    pub fn open_sock(&self, aico_ref: AicoRef, fd: OwnedFd, kind: SocketKind) -> io::Result<()> {
        let raw = fd.into_raw_fd();
        match self.with_aico(aico_ref, |a| a.open(AicoKind::Socket(kind), Handle::Fd(raw))) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown aico")),
        }
    }

    /// `open_sock_from_type` — SPEC_FULL.md §10 supplementary feature:
    /// create and bind a fresh stream/datagram socket in one call, the way
    /// tbox's `tb_aico_init_sock` + `tb_socket_init` pair are usually driven
    /// together.
    #[cfg(unix)]
    pub fn open_sock_from_type(
        &self,
        aico_ref: AicoRef,
        addr: &std::net::SocketAddr,
        kind: SocketKind,
    ) -> io::Result<()> {
        let fd = net::new_socket(addr, kind)?;
        self.open_sock(aico_ref, fd, kind)
    }

    /// `open_file` — bind an already-open file handle.
    #[cfg(unix)]
    pub fn open_file(&self, aico_ref: AicoRef, file: std::fs::File) -> io::Result<()> {
        let raw = file.into_raw_fd();
        match self.with_aico(aico_ref, |a| a.open(AicoKind::File, Handle::Fd(raw))) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown aico")),
        }
    }

    /// `open_file_from_path` — spec.md §4.7: open-and-bind a file by path
    /// in one call, mirroring [`Aicp::open_sock_from_type`]'s
    /// create-and-bind convenience for sockets. `mode` follows
    /// `OpenOptions`-style read/write/create/append flags via the
    /// caller-supplied closure so this stays a thin wrapper rather than a
    /// second copy of `OpenOptions`'s surface.
    #[cfg(unix)]
    pub fn open_file_from_path(
        &self,
        aico_ref: AicoRef,
        path: impl AsRef<std::path::Path>,
        options: &std::fs::OpenOptions,
    ) -> io::Result<()> {
        let file = options.open(path)?;
        self.open_file(aico_ref, file)
    }

    /// `open_task` — a handle-less `Aico` whose only operation is
    /// `RunTask`.
    pub fn open_task(&self, aico_ref: AicoRef, use_ltimer: bool) -> io::Result<()> {
        match self.with_aico(aico_ref, |a| a.open(AicoKind::Task { use_ltimer }, Handle::None)) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown aico")),
        }
    }

    /// `aico_kill` — race-tolerant cancel (spec.md §4.7). If the `Aico`
    /// had a pending op, it is force-completed with `Killed` here rather
    /// than waiting for the reactor's next wait to notice.
    pub fn aico_kill(&self, aico_ref: AicoRef) {
        let transitioned = self.with_aico(aico_ref, |a| a.kill()).unwrap_or(false);
        if !transitioned {
            return;
        }
        self.queues.park_for_killing(aico_ref);
        self.process_killing_list();
        let _ = self.selector.wake();
    }

    /// `aico_exit` — block (briefly) until the `Aico` reaches CLOSED, then
    /// reclaim its pool slot. Callers normally post a `Clos` AICE and wait
    /// for its callback instead of calling this synchronously; it exists
    /// for the rare case of reclaiming an `Aico` that was never opened.
    pub fn aico_exit(&self, aico_ref: AicoRef) -> io::Result<()> {
        let state = self.with_aico(aico_ref, |a| a.state());
        match state {
            Some(AicoState::Closed) | None => {
                self.registered.lock().unwrap().remove(&aico_ref.0);
                self.aicos.with(|pool| pool.remove(aico_ref.0));
                Ok(())
            }
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "aico_exit requires state == CLOSED; post a Clos AICE first",
            )),
        }
    }

    /// `aico_timeout_set` — configure the per-`TimeoutKind` deadline
    /// (spec.md §4.6) consulted by [`Aicp::arm`] the next time a matching op
    /// is posted against this `Aico`. A negative `millis` disables the
    /// timeout for that kind (spec.md §4.6: "a negative value means the
    /// operation never times out").
    pub fn set_timeout(&self, aico_ref: AicoRef, kind: TimeoutKind, millis: i64) {
        self.with_aico(aico_ref, |a| a.set_timeout(kind, millis));
    }

    // ---- posting ----------------------------------------------------------

    /// `aico_post`/`aicp_post` — enqueue an operation (spec.md §4.7 step
    /// 1). Returns an `io::Error` only for a per-AICO serial-operations
    /// violation (posting while another op on the same `Aico` is already
    /// pending); every other failure mode is reported asynchronously via
    /// the completion's `TerminalState`.
    pub fn post(&self, mut aice: Aice) -> io::Result<()> {
        let outcome = self
            .with_aico(aice.aico, |a| a.begin_post())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown aico"))?;
        match outcome {
            PostOutcome::Rejected => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "aico already has an operation pending",
            )),
            PostOutcome::SynthesizeKilled => {
                aice.state = TerminalState::Killed;
                self.queues.push(QueueItem::Fresh(aice));
                self.selector.wake()
            }
            PostOutcome::Armed => {
                self.queues.push(QueueItem::Fresh(aice));
                self.selector.wake()
            }
        }
    }

    /// `aicp_post_after` — schedule `aice` to post itself once `delay` has
    /// elapsed, via a throwaway internal `Task` `Aico`. Unlike tbox's
    /// heap-allocated-and-manually-freed wrapper, the saved `Aice` is just
    /// owned by the closure and drops normally once consumed.
    pub fn post_after(&self, delay: Duration, aice: Aice) -> io::Result<()> {
        if delay.is_zero() {
            return self.post(aice);
        }
        let task_ref = self.aico_init();
        self.open_task(task_ref, false)?;
        let when = Instant::now() + delay;
        let weak = self.self_weak.clone();
        let saved = std::sync::Mutex::new(Some(aice));
        let callback: Completion = Box::new(move |task_aice: &mut Aice| {
            if let Some(proactor) = weak.upgrade() {
                if let Some(original) = saved.lock().unwrap().take() {
                    if task_aice.state == TerminalState::Ok {
                        let _ = proactor.post(original);
                    } else {
                        let mut original = original;
                        original.state = task_aice.state;
                        proactor.complete(original);
                    }
                }
                proactor.free_internal_task(task_aice.aico);
            }
            true
        });
        let runtask = Aice::new(OpCode::RunTask, task_ref, AicePayload::RunTask { when, period: None }, callback);
        self.post(runtask)
    }

    /// Reclaim a purely-internal bookkeeping `Aico` (the throwaway task
    /// `post_after` allocates) without the user-facing CLOSED/`Clos`
    /// protocol, since it was never exposed outside this module.
    fn free_internal_task(&self, aico_ref: AicoRef) {
        self.with_aico(aico_ref, |a| a.mark_closed());
        self.aicos.with(|pool| pool.remove(aico_ref.0));
    }

    // ---- shutdown -----------------------------------------------------

    /// `aicp_kill` — cancel every live `Aico`. Idempotent.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let refs: Vec<usize> = self.aicos.with(|pool| pool.iter().map(|(i, _)| i).collect());
        for i in refs {
            self.aico_kill(AicoRef(i));
        }
        let _ = self.selector.wake();
    }

    /// `aicp_wait_all` — block up to `timeout` for every `Aico` to reach
    /// CLOSED and be reclaimed (typically driven from a second thread
    /// while a worker thread runs [`Aicp::run`]).
    pub fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.aicos.with(|pool| pool.is_empty()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// `aicp_exit` — kill every `Aico`, wait for the pool to drain, then
    /// stop reporting further work from [`Aicp::run`].
    pub fn exit(&self) {
        self.kill();
        self.wait_all(Duration::from_secs(3));
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    // ---- worker loop ----------------------------------------------------

    /// `aicp_loop` — run until [`Aicp::exit`] has drained the pool. Meant
    /// to be called from one or more dedicated worker threads.
    pub fn run(&self) -> io::Result<()> {
        self.run_until(|| self.is_killed() && self.aicos.with(|pool| pool.is_empty()))
    }

    /// `aicp_loop` variant that stops as soon as `stop` returns `true`,
    /// checked once per iteration (spec.md §4.7's pseudocode checks a
    /// similar condition at the top of its `loop:`).
    pub fn run_until(&self, stop: impl Fn() -> bool) -> io::Result<()> {
        let mut events: Vec<Readiness> = Vec::new();
        loop {
            if stop() {
                return Ok(());
            }

            self.process_killing_list();
            self.drain_timers();

            let mut did_work = false;
            while let Some(item) = self.queues.pop() {
                self.dispatch_item(item);
                did_work = true;
            }
            if did_work {
                continue;
            }

            events.clear();
            let timeout = self.next_wait_bound();
            let n = self.selector.wait(&mut events, timeout)?;
            for r in events.iter().take(n) {
                self.handle_readiness(*r);
            }
        }
    }

    fn next_wait_bound(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut bound: Option<Duration> = None;
        if let Some(deadline) = self.hires.lock().unwrap().next_deadline() {
            let d = deadline.saturating_duration_since(now);
            bound = Some(bound.map_or(d, |b| b.min(d)));
        }
        let ltimer_due = !self.ltimer.lock().unwrap().is_empty()
            || !self.ltimer_tasks.lock().unwrap().is_empty();
        if ltimer_due {
            bound = Some(bound.map_or(Duration::from_secs(1), |b| b.min(Duration::from_secs(1))));
        }
        bound
    }

    /// Pop anything due from either timer (spec.md §4.4/§4.5) and hand it
    /// to completion: hires entries carry the full `Aice` (used for
    /// `RunTask`), ltimer entries carry only the `AicoRef` of a pending
    /// socket op whose per-operation timeout elapsed.
    fn drain_timers(&self) {
        let now = Instant::now();
        loop {
            let due = self.hires.lock().unwrap().pop_expired(now);
            match due {
                Some((_, aice)) => self.complete(aice),
                None => break,
            }
        }
        loop {
            let due = self.ltimer.lock().unwrap().poll(now);
            match due {
                Some((_, aico_index)) => self.handle_pending_timeout(aico_index),
                None => break,
            }
        }
        loop {
            let due = self.ltimer_tasks.lock().unwrap().poll(now);
            match due {
                Some((_, aice)) => self.complete(aice),
                None => break,
            }
        }
    }

    /// Drain the killing list (spec.md §3) and force-complete any op that
    /// was pending when its `Aico` was killed.
    fn process_killing_list(&self) {
        for aico_ref in self.queues.drain_killing() {
            let entry = self.pending.lock().unwrap().remove(&aico_ref.0);
            if let Some(Pending { mut aice, timeout }) = entry {
                if let Some(t) = timeout {
                    self.ltimer.lock().unwrap().cancel(t);
                }
                self.unregister(aico_ref);
                aice.state = TerminalState::Killed;
                self.complete(aice);
            }
        }
    }

    fn handle_pending_timeout(&self, aico_index: usize) {
        let entry = self.pending.lock().unwrap().remove(&aico_index);
        if let Some(Pending { mut aice, .. }) = entry {
            // The ltimer entry firing *is* the timeout; nothing left to
            // cancel on the hires side for this op.
            self.unregister(AicoRef(aico_index));
            aice.state = TerminalState::Timeout;
            self.complete(aice);
        }
    }

    fn unregister(&self, aico_ref: AicoRef) {
        if self.registered.lock().unwrap().remove(&aico_ref.0) {
            if let Some(fd) = self.raw_fd(aico_ref) {
                let _ = self.selector.deregister(fd);
            }
        }
    }

    /// Run whichever branch a popped [`QueueItem`] calls for: a freshly
    /// posted AICE gets the full first-attempt dispatch, a readiness-driven
    /// retry re-attempts the same operation without repeating the parts
    /// that only make sense once (`Conn`'s initial `connect(2)`, `RunTask`
    /// scheduling, file-op execution).
    fn dispatch_item(&self, item: QueueItem) {
        match item {
            QueueItem::Fresh(aice) => self.dispatch(aice),
            QueueItem::Retry(aice) => self.retry(aice),
        }
    }

    /// Pull `r`'s AICE out of the pending map and push it back onto the
    /// priority queues as a [`QueueItem::Retry`] instead of completing it
    /// inline, so a readiness completion competes for dispatch order the
    /// same way a freshly-posted one does (spec.md §3: entries "transition
    /// out" onto the appropriate spak on reactor readiness just as they do
    /// on post, and Testable Property #3 — ACPT before simultaneously-ready
    /// RECVs — has to hold for both paths).
    fn handle_readiness(&self, r: Readiness) {
        let aico_ref = AicoRef(r.token.as_usize());
        let entry = self.pending.lock().unwrap().remove(&aico_ref.0);
        let Some(Pending { mut aice, timeout }) = entry else {
            return; // stale event for an op already completed by a race.
        };
        if let Some(t) = timeout {
            self.ltimer.lock().unwrap().cancel(t);
        }
        if r.error {
            aice.state = TerminalState::Failed;
        }
        self.queues.push(QueueItem::Retry(aice));
    }

    /// Re-attempt an operation the reactor just reported ready (or failed).
    /// Unlike [`Aicp::dispatch`]'s first attempt, this always passes
    /// `first = false` to [`Aicp::attempt`] — correct for every op since
    /// `first` only changes behavior for `Conn`, and a retry by definition
    /// already made its initial `connect(2)` call.
    fn retry(&self, mut aice: Aice) {
        if aice.state != TerminalState::Ok {
            // `r.error` was set, or a prior pass already resolved this;
            // nothing left to attempt.
            self.complete(aice);
            return;
        }
        let aico_ref = aice.aico;
        let Some(fd) = self.raw_fd(aico_ref) else {
            aice.state = TerminalState::Failed;
            self.complete(aice);
            return;
        };
        #[cfg(unix)]
        match self.attempt(fd, &mut aice, false) {
            Attempt::Done(state) => {
                aice.state = state;
                self.complete(aice);
            }
            Attempt::WouldBlock(interest) => {
                self.arm(aico_ref, fd, interest, aice);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fd;
            aice.state = TerminalState::Failed;
            self.complete(aice);
        }
    }

    /// Dispatch a freshly-popped AICE: `RunTask` goes to the hires timer,
    /// `Clos` runs the close sequence, file ops run synchronously, and
    /// everything else gets a first non-blocking attempt before arming the
    /// reactor (spec.md §4.7/§4.8).
    fn dispatch(&self, mut aice: Aice) {
        // `Clos` always runs the close sequence, even if `begin_post`
        // already synthesized a KILLED state for it (spec.md §6: "CLOS
        // completion fires in state CLOSED" unconditionally) — otherwise
        // closing an already-killed `Aico` would leak its handle.
        if aice.code == OpCode::Clos {
            self.execute_clos(aice);
            return;
        }
        if aice.state != TerminalState::Ok {
            // Already resolved by `begin_post`'s KILLED-synthesis path.
            self.complete(aice);
            return;
        }
        match aice.code {
            OpCode::RunTask => self.schedule_runtask(aice),
            _ if aice.code.is_file_op() => self.execute_file_op(aice),
            #[cfg(unix)]
            _ => self.execute_socket_op(aice),
            #[cfg(not(unix))]
            _ => {
                aice.state = TerminalState::Failed;
                self.complete(aice);
            }
        }
    }

    fn schedule_runtask(&self, aice: Aice) {
        let when = match &aice.payload {
            AicePayload::RunTask { when, .. } => *when,
            _ => unreachable!("RunTask AICE without a RunTask payload"),
        };
        let now = Instant::now();
        if when <= now {
            self.complete(aice);
            return;
        }
        let use_ltimer = self
            .with_aico(aice.aico, |a| matches!(a.kind(), AicoKind::Task { use_ltimer: true }))
            .unwrap_or(false);
        if use_ltimer {
            let delay = when.saturating_duration_since(now);
            self.ltimer_tasks.lock().unwrap().schedule(delay, aice);
        } else {
            self.hires.lock().unwrap().schedule(when, aice);
        }
    }

    fn execute_clos(&self, mut aice: Aice) {
        let aico_ref = aice.aico;
        self.unregister(aico_ref);
        if let Some(Pending { aice: stale, .. }) = self.pending.lock().unwrap().remove(&aico_ref.0) {
            let mut stale = stale;
            stale.state = TerminalState::Killed;
            // A pending op outlived its owner's close; fire it first so
            // every posted AICE still gets exactly one completion.
            self.complete(stale);
        }
        #[cfg(unix)]
        if let Some(fd) = self.raw_fd(aico_ref) {
            net::close(fd);
        }
        aice.state = TerminalState::Closed;
        self.complete(aice);
    }

    fn execute_file_op(&self, mut aice: Aice) {
        let aico_ref = aice.aico;
        let Some(fd) = self.raw_fd(aico_ref) else {
            aice.state = TerminalState::Failed;
            self.complete(aice);
            return;
        };
        #[cfg(unix)]
        {
            let result = match (aice.code, &mut aice.payload) {
                (OpCode::Read, AicePayload::File { seek, buf, real }) => {
                    fileio::pread(fd, buf, *seek).map(|n| *real = n)
                }
                (OpCode::Writ, AicePayload::File { seek, buf, real }) => {
                    fileio::pwrite(fd, buf, *seek).map(|n| *real = n)
                }
                (OpCode::ReadV, AicePayload::FileVec { seek, bufs, real }) => {
                    fileio::preadv(fd, bufs, *seek).map(|n| *real = n)
                }
                (OpCode::WritV, AicePayload::FileVec { seek, bufs, real }) => {
                    fileio::pwritev(fd, bufs, *seek).map(|n| *real = n)
                }
                (OpCode::Fsync, _) => fileio::fsync(fd),
                _ => unreachable!("non-file OpCode reached execute_file_op"),
            };
            aice.state = match result {
                Ok(()) => TerminalState::Ok,
                Err(_) => TerminalState::Failed,
            };
        }
        #[cfg(not(unix))]
        {
            let _ = fd;
            aice.state = TerminalState::Failed;
        }
        self.complete(aice);
    }

    #[cfg(unix)]
    fn execute_socket_op(&self, mut aice: Aice) {
        let aico_ref = aice.aico;
        let Some(fd) = self.raw_fd(aico_ref) else {
            aice.state = TerminalState::Failed;
            self.complete(aice);
            return;
        };
        match self.attempt(fd, &mut aice, true) {
            Attempt::Done(state) => {
                aice.state = state;
                self.complete(aice);
            }
            Attempt::WouldBlock(interest) => self.arm(aico_ref, fd, interest, aice),
        }
    }

    /// Register (or re-register, since `ONESHOT` disarms on every
    /// delivery) interest in `aico_ref`'s handle and park the AICE in the
    /// pending map, arming its per-operation timeout if one is configured
    /// (spec.md §4.6, §6).
    #[cfg(unix)]
    fn arm(&self, aico_ref: AicoRef, fd: RawFd, interest: Interest, aice: Aice) {
        let token = Token(aico_ref.0);
        let full_interest = interest | Interest::CLEAR | Interest::ONESHOT;
        let first_time = self.registered.lock().unwrap().insert(aico_ref.0);
        let result = if first_time {
            self.selector.register(fd, token, full_interest)
        } else {
            self.selector.reregister(fd, token, full_interest)
        };
        if let Err(_e) = result {
            self.registered.lock().unwrap().remove(&aico_ref.0);
            let mut aice = aice;
            aice.state = TerminalState::Failed;
            self.complete(aice);
            return;
        }
        let timeout = aice.code.timeout_kind().and_then(|kind| {
            let millis = self.with_aico(aico_ref, |a| a.timeout(kind))?;
            if millis < 0 {
                return None;
            }
            Some(
                self.ltimer
                    .lock()
                    .unwrap()
                    .schedule(Duration::from_millis(millis as u64), aico_ref.0),
            )
        });
        self.pending.lock().unwrap().insert(aico_ref.0, Pending { aice, timeout });
    }

    /// One non-blocking attempt at `aice`'s operation. `first` distinguishes
    /// the initial `Conn` attempt (which must call `connect(2)`) from a
    /// post-readiness retry (which must instead read back `SO_ERROR`,
    /// since calling `connect(2)` again on an already-connecting socket
    /// fails with `EALREADY`/`EISCONN`).
    #[cfg(unix)]
    fn attempt(&self, fd: RawFd, aice: &mut Aice, first: bool) -> Attempt {
        match (aice.code, &mut aice.payload) {
            (OpCode::Acpt, AicePayload::Acpt { accepted }) => match net::accept(fd) {
                Ok((new_fd, _peer)) => {
                    let new_ref = self.aico_init();
                    match self.open_sock(new_ref, new_fd, SocketKind::Stream) {
                        Ok(()) => {
                            *accepted = Some(new_ref);
                            Attempt::Done(TerminalState::Ok)
                        }
                        Err(_) => Attempt::Done(TerminalState::Failed),
                    }
                }
                Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::ACPT),
                Err(_) => Attempt::Done(TerminalState::Failed),
            },
            (OpCode::Conn, AicePayload::Conn { addr }) => {
                if first {
                    match net::connect(fd, addr) {
                        Ok(()) => Attempt::Done(TerminalState::Ok),
                        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                            Attempt::WouldBlock(Interest::CONN)
                        }
                        Err(_) => Attempt::Done(TerminalState::Failed),
                    }
                } else {
                    match net::take_socket_error(fd) {
                        Ok(()) => Attempt::Done(TerminalState::Ok),
                        Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::CONN),
                        Err(_) => Attempt::Done(TerminalState::Failed),
                    }
                }
            }
            (OpCode::Recv, AicePayload::Buffer { buf, real }) => match net::recv(fd, buf) {
                Ok(0) => Attempt::Done(TerminalState::Closed),
                Ok(n) => {
                    *real = n;
                    Attempt::Done(TerminalState::Ok)
                }
                Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::RECV),
                Err(_) => Attempt::Done(TerminalState::Failed),
            },
            (OpCode::Send, AicePayload::Buffer { buf, real }) => match net::send(fd, buf) {
                Ok(n) => {
                    *real = n;
                    Attempt::Done(TerminalState::Ok)
                }
                Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::SEND),
                Err(_) => Attempt::Done(TerminalState::Failed),
            },
            (OpCode::URecv, AicePayload::UdpBuffer { buf, peer, real }) => match net::recvfrom(fd, buf) {
                Ok((n, p)) => {
                    *real = n;
                    *peer = Some(p);
                    Attempt::Done(TerminalState::Ok)
                }
                Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::RECV),
                Err(_) => Attempt::Done(TerminalState::Failed),
            },
            (OpCode::USend, AicePayload::UdpBuffer { buf, peer, real }) => match peer {
                Some(p) => match net::sendto(fd, buf, p) {
                    Ok(n) => {
                        *real = n;
                        Attempt::Done(TerminalState::Ok)
                    }
                    Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::SEND),
                    Err(_) => Attempt::Done(TerminalState::Failed),
                },
                None => Attempt::Done(TerminalState::Failed),
            },
            (OpCode::RecvV, AicePayload::BufferVec { bufs, real }) => match net::readv(fd, bufs) {
                Ok(0) => Attempt::Done(TerminalState::Closed),
                Ok(n) => {
                    *real = n;
                    Attempt::Done(TerminalState::Ok)
                }
                Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::RECV),
                Err(_) => Attempt::Done(TerminalState::Failed),
            },
            (OpCode::SendV, AicePayload::BufferVec { bufs, real }) => match net::writev(fd, bufs) {
                Ok(n) => {
                    *real = n;
                    Attempt::Done(TerminalState::Ok)
                }
                Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::SEND),
                Err(_) => Attempt::Done(TerminalState::Failed),
            },
            (OpCode::URecvV, AicePayload::UdpBufferVec { bufs, peer, real }) => {
                match net::recvmsg_vec(fd, bufs) {
                    Ok((n, p)) => {
                        *real = n;
                        *peer = Some(p);
                        Attempt::Done(TerminalState::Ok)
                    }
                    Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::RECV),
                    Err(_) => Attempt::Done(TerminalState::Failed),
                }
            }
            (OpCode::USendV, AicePayload::UdpBufferVec { bufs, peer, real }) => match peer {
                Some(p) => match net::sendmsg_vec(fd, bufs, p) {
                    Ok(n) => {
                        *real = n;
                        Attempt::Done(TerminalState::Ok)
                    }
                    Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::SEND),
                    Err(_) => Attempt::Done(TerminalState::Failed),
                },
                None => Attempt::Done(TerminalState::Failed),
            },
            (OpCode::SendF, AicePayload::SendFile { file, offset, size, real }) => {
                let Some(file_fd) = self.raw_fd(*file) else {
                    return Attempt::Done(TerminalState::Failed);
                };
                sendfile_chunk(fd, file_fd, offset, *size, real)
            }
            _ => Attempt::Done(TerminalState::Failed),
        }
    }

    /// The worker loop's completion step (spec.md §4.7): transitions the
    /// `Aico` out of PENDING (except a still-live ACPT(OK)), sweeps
    /// KILLING→KILLED once before firing and once after (to catch a kill
    /// that raced the completion either side of the user callback), fires
    /// the callback exactly once, and for `Clos` finally marks the `Aico`
    /// CLOSED.
    fn complete(&self, mut aice: Aice) {
        let aico_ref = aice.aico;
        let code = aice.code;
        let acpt_ok_stays_live = code == OpCode::Acpt && aice.state == TerminalState::Ok;

        self.with_aico(aico_ref, |a| {
            a.complete_pending(acpt_ok_stays_live);
            // `Clos` is exempt: spec.md §6 promises it fires in state
            // CLOSED unconditionally, even for an `Aico` mid-kill.
            if code != OpCode::Clos && (a.sweep_killing() || a.is_terminal_kill()) {
                aice.state = TerminalState::Killed;
            }
        });

        if !aice.fire() {
            #[cfg(feature = "log")]
            log::error!("aicp: completion callback reported failure for {:?} on {:?}", code, aico_ref);
        }

        self.with_aico(aico_ref, |a| {
            a.sweep_killing();
        });

        if code == OpCode::Clos {
            self.with_aico(aico_ref, |a| a.mark_closed());
        }
    }
}

/// The [`Registry`] slot [`default_instance`] installs itself into.
pub const DEFAULT_SLOT: usize = 0;

/// `tb_aicp()` — the process's default `Aicp`, lazily created on first
/// call and driven by its own background worker thread, exactly as
/// `examples/original_source/core/src/tbox/src/tbox/asio/deprecated/aicp.c`'s
/// `tb_aicp_instance_init`/`_kill`/`_exit` wire `tb_aicp_init` + a
/// `tb_thread_init`-spawned loop through `tb_singleton_instance`. Per
/// spec.md §9's Design Note, the registry is a capability the caller holds
/// and passes in rather than a hidden `static`; every caller that passes
/// the same `&Registry` gets the same `Aicp` and the same worker thread.
///
/// `kill` (`Registry::kill`) only signals shutdown (`Aicp::kill`); `exit`
/// (`Registry::exit`) waits for the pool to drain, joins the worker
/// thread, and finally calls `Aicp::exit` — mirroring
/// `tb_aicp_instance_exit`'s `wait_all` -> `kill` -> `thread_wait` ->
/// `aicp_exit` sequence.
pub fn default_instance(registry: &Registry) -> Option<&Arc<Aicp>> {
    registry
        .instance(
            DEFAULT_SLOT,
            || {
                let ptor = Aicp::new(0).ok()?;
                let worker = ptor.clone();
                let handle = std::thread::spawn(move || {
                    let _ = worker.run();
                });
                Some((ptor, handle))
            },
            |(ptor, _handle)| ptor.kill(),
            |(ptor, handle)| {
                let _ = ptor.wait_all(Duration::from_secs(5));
                ptor.kill();
                let _ = handle.join();
                ptor.exit();
            },
        )
        .map(|(ptor, _handle)| ptor)
}

/// Read up to 64KiB from `file_fd` at `*offset` and send it on `socket_fd`,
/// advancing `offset`/`real` by however much actually went out. Not a true
/// `sendfile(2)` zero-copy transfer (spec.md §9's Open Question: the
/// original ties this to a platform syscall this crate keeps portable
/// instead, documented in DESIGN.md) — one `pread`+`send` pair per reactor
/// wakeup, same shape as every other buffered op here.
#[cfg(unix)]
fn sendfile_chunk(socket_fd: RawFd, file_fd: RawFd, offset: &mut u64, size: u64, real: &mut u64) -> Attempt {
    if *real >= size {
        return Attempt::Done(TerminalState::Ok);
    }
    let remaining = (size - *real).min(64 * 1024) as usize;
    let mut buf = vec![0u8; remaining];
    match fileio::pread(file_fd, &mut buf, *offset) {
        Ok(0) => Attempt::Done(TerminalState::Ok),
        Ok(n) => match net::send(socket_fd, &buf[..n]) {
            Ok(sent) => {
                *offset += sent as u64;
                *real += sent as u64;
                if *real >= size {
                    Attempt::Done(TerminalState::Ok)
                } else {
                    Attempt::WouldBlock(Interest::SEND)
                }
            }
            Err(e) if would_block(&e) => Attempt::WouldBlock(Interest::SEND),
            Err(_) => Attempt::Done(TerminalState::Failed),
        },
        Err(_) => Attempt::Done(TerminalState::Failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool as StdAtomicBool, Ordering as StdOrdering};

    fn noop_callback() -> Completion {
        Box::new(|_| true)
    }

    #[test]
    fn run_task_due_in_the_past_completes_on_the_next_iteration() {
        let ptor = Aicp::new(16).unwrap();
        let aico = ptor.aico_init();
        ptor.open_task(aico, false).unwrap();

        let fired = Arc::new(StdAtomicBool::new(false));
        let fired2 = fired.clone();
        let callback: Completion = Box::new(move |a| {
            assert_eq!(a.state, TerminalState::Ok);
            fired2.store(true, StdOrdering::SeqCst);
            true
        });
        let aice = Aice::new(
            OpCode::RunTask,
            aico,
            AicePayload::RunTask { when: Instant::now(), period: None },
            callback,
        );
        ptor.post(aice).unwrap();
        ptor.run_until(|| fired.load(StdOrdering::SeqCst)).unwrap();
        assert!(fired.load(StdOrdering::SeqCst));
    }

    #[test]
    fn killing_an_opened_task_aico_synthesizes_no_completion() {
        let ptor = Aicp::new(16).unwrap();
        let aico = ptor.aico_init();
        ptor.open_task(aico, false).unwrap();
        ptor.aico_kill(aico);
        assert_eq!(ptor.with_aico(aico, |a| a.state()), Some(AicoState::Killed));
    }

    #[test]
    fn posting_to_a_killed_aico_synthesizes_a_killed_completion() {
        let ptor = Aicp::new(16).unwrap();
        let aico = ptor.aico_init();
        ptor.open_task(aico, false).unwrap();
        ptor.aico_kill(aico);

        let seen = Arc::new(StdAtomicBool::new(false));
        let seen2 = seen.clone();
        let callback: Completion = Box::new(move |a| {
            assert_eq!(a.state, TerminalState::Killed);
            seen2.store(true, StdOrdering::SeqCst);
            true
        });
        let aice = Aice::new(
            OpCode::RunTask,
            aico,
            AicePayload::RunTask { when: Instant::now(), period: None },
            callback,
        );
        ptor.post(aice).unwrap();
        ptor.run_until(|| seen.load(StdOrdering::SeqCst)).unwrap();
        assert!(seen.load(StdOrdering::SeqCst));
    }

    #[test]
    fn double_posting_to_the_same_aico_is_rejected() {
        let ptor = Aicp::new(16).unwrap();
        let aico = ptor.aico_init();
        ptor.open_task(aico, false).unwrap();
        let when = Instant::now() + Duration::from_secs(60);
        ptor.post(Aice::new(
            OpCode::RunTask,
            aico,
            AicePayload::RunTask { when, period: None },
            noop_callback(),
        ))
        .unwrap();
        let rejected = ptor.post(Aice::new(
            OpCode::RunTask,
            aico,
            AicePayload::RunTask { when, period: None },
            noop_callback(),
        ));
        assert!(rejected.is_err());
    }

    #[test]
    fn post_after_fires_once_the_delay_elapses() {
        let ptor = Aicp::new(16).unwrap();
        let aico = ptor.aico_init();
        ptor.open_task(aico, false).unwrap();

        let fired = Arc::new(StdAtomicBool::new(false));
        let fired2 = fired.clone();
        let callback: Completion = Box::new(move |_| {
            fired2.store(true, StdOrdering::SeqCst);
            true
        });
        let aice = Aice::new(OpCode::RunTask, aico, AicePayload::RunTask { when: Instant::now(), period: None }, callback);
        ptor.post_after(Duration::from_millis(5), aice).unwrap();
        ptor.run_until(|| fired.load(StdOrdering::SeqCst)).unwrap();
        assert!(fired.load(StdOrdering::SeqCst));
    }

    #[test]
    fn default_instance_is_shared_and_runs_posted_work_on_its_own_thread() {
        let registry = crate::singleton::Registry::new();

        let a = default_instance(&registry).unwrap().clone();
        let b = default_instance(&registry).unwrap().clone();
        assert!(Arc::ptr_eq(&a, &b));

        let aico = a.aico_init();
        a.open_task(aico, false).unwrap();
        let fired = Arc::new(StdAtomicBool::new(false));
        let fired2 = fired.clone();
        let callback: Completion = Box::new(move |_| {
            fired2.store(true, StdOrdering::SeqCst);
            true
        });
        a.post(Aice::new(
            OpCode::RunTask,
            aico,
            AicePayload::RunTask { when: Instant::now(), period: None },
            callback,
        ))
        .unwrap();

        for _ in 0..50 {
            if fired.load(StdOrdering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(fired.load(StdOrdering::SeqCst));

        registry.kill();
        registry.exit();
    }
}
