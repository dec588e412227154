//! §4.6 — the AIOP reactor: a unified readiness surface over
//! epoll/kqueue/poll/IOCP, reused internally by the AICP proactor as its
//! wait engine.
//!
//! Split into one source file per OS facility (`epoll.rs`/`kqueue.rs`/
//! `poll.rs`/`windows.rs`) behind one small `Backend` trait. spec.md's
//! Design Note calls the reactor/proactor vtable "a tagged-variant
//! candidate", so dispatch happens through [`Selector`], an enum over the
//! concrete backend types rather than a `Box<dyn Backend>`, keeping `wait`
//! free of virtual-call overhead on the hot path. The `select(2)` backend
//! named in spec.md's original backend-priority list is not implemented:
//! `poll` already covers every platform that would otherwise need it, so
//! this crate drops `select` as the redundant universal fallback — see
//! DESIGN.md.

use std::io;
use std::time::Duration;

use crate::interest::Interest;
use crate::token::Token;

pub mod sys;

/// One readiness notification returned from a [`Selector::wait`] call.
///
/// Rather than exposing the raw platform event (`libc::epoll_event`,
/// `kevent`, ...), AICP's backends normalize straight to this shape since
/// the proactor worker never needs anything past a token and a
/// readable/writable/error triple.
#[derive(Copy, Clone, Debug)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// The uniform readiness-surface contract every backend implements
/// (spec.md §4.6: `addo`/`delo`/`sete`/`wait`/`spak`/`kill`/`cler`).
pub trait Backend {
    /// `addo` — register `fd` for `interest`, producing readiness events
    /// tagged with `token`.
    fn register(&self, fd: RawFdLike, token: Token, interest: Interest) -> io::Result<()>;

    /// `sete` — modify a prior registration's interest set.
    fn reregister(&self, fd: RawFdLike, token: Token, interest: Interest) -> io::Result<()>;

    /// `delo` — drop a registration entirely.
    fn deregister(&self, fd: RawFdLike) -> io::Result<()>;

    /// `wait` — block up to `timeout` (or indefinitely if `None`),
    /// appending ready events to `out`. Returns the number appended.
    fn wait(&self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<usize>;

    /// `spak`/`kill` — unblock a concurrent `wait` without otherwise
    /// touching its registrations (used both to drain a spak queue that
    /// just gained work and to interrupt the worker during shutdown).
    fn wake(&self) -> io::Result<()>;
}

#[cfg(unix)]
pub type RawFdLike = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawFdLike = std::os::windows::io::RawSocket;

/// The backend chosen at `Selector::new` time, in spec.md §4.6's priority
/// order: epoll (Linux) > kqueue (BSD/macOS) > IOCP-front (Windows) > poll
/// (every other Unix, and the documented fallback everywhere poll is
/// available).
pub enum Selector {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(sys::epoll::Epoll),
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    ))]
    Kqueue(sys::kqueue::Kqueue),
    #[cfg(windows)]
    Iocp(sys::windows::Iocp),
    #[cfg(unix)]
    Poll(sys::poll::Poll),
}

impl Selector {
    /// Construct the best backend available on this platform, per spec.md
    /// §4.6's priority list. `aicp_unsupported_force_poll_poll` forces the
    /// generic `poll` backend even where epoll/kqueue would be chosen,
    /// a test knob for exercising the fallback backend on any platform.
    pub fn new(capacity_hint: usize) -> io::Result<Selector> {
        #[cfg(all(
            any(target_os = "linux", target_os = "android"),
            not(aicp_unsupported_force_poll_poll)
        ))]
        {
            return Ok(Selector::Epoll(sys::epoll::Epoll::new()?));
        }
        #[cfg(all(
            any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ),
            not(aicp_unsupported_force_poll_poll)
        ))]
        {
            return Ok(Selector::Kqueue(sys::kqueue::Kqueue::new()?));
        }
        #[cfg(windows)]
        {
            return Ok(Selector::Iocp(sys::windows::Iocp::new()?));
        }
        #[cfg(unix)]
        {
            let _ = capacity_hint;
            return Ok(Selector::Poll(sys::poll::Poll::new()?));
        }
        #[allow(unreachable_code)]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no AIOP backend available for this platform",
            ))
        }
    }

    pub fn register(&self, fd: RawFdLike, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(b) => b.register(fd, token, interest),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(b) => b.register(fd, token, interest),
            #[cfg(windows)]
            Selector::Iocp(b) => b.register(fd, token, interest),
            #[cfg(unix)]
            Selector::Poll(b) => b.register(fd, token, interest),
        }
    }

    pub fn reregister(&self, fd: RawFdLike, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(b) => b.reregister(fd, token, interest),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(b) => b.reregister(fd, token, interest),
            #[cfg(windows)]
            Selector::Iocp(b) => b.reregister(fd, token, interest),
            #[cfg(unix)]
            Selector::Poll(b) => b.reregister(fd, token, interest),
        }
    }

    pub fn deregister(&self, fd: RawFdLike) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(b) => b.deregister(fd),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(b) => b.deregister(fd),
            #[cfg(windows)]
            Selector::Iocp(b) => b.deregister(fd),
            #[cfg(unix)]
            Selector::Poll(b) => b.deregister(fd),
        }
    }

    pub fn wait(&self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<usize> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(b) => b.wait(out, timeout),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(b) => b.wait(out, timeout),
            #[cfg(windows)]
            Selector::Iocp(b) => b.wait(out, timeout),
            #[cfg(unix)]
            Selector::Poll(b) => b.wait(out, timeout),
        }
    }

    pub fn wake(&self) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(b) => b.wake(),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(b) => b.wake(),
            #[cfg(windows)]
            Selector::Iocp(b) => b.wake(),
            #[cfg(unix)]
            Selector::Poll(b) => b.wake(),
        }
    }
}
