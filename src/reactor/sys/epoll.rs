//! Linux backend: `epoll_create1`/`epoll_ctl`/`epoll_wait`. Requests
//! edge-triggered + one-shot (`EPOLLET | EPOLLONESHOT`) on every
//! registration per spec.md §4.6, so a fired event never needs a second
//! `epoll_ctl` to quiesce before the worker re-arms it.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::interest::Interest;
use crate::macros::syscall;
use crate::reactor::sys::waker::Waker;
use crate::reactor::Readiness;
use crate::token::Token;

const WAKE_TOKEN: u64 = u64::MAX;

pub struct Epoll {
    ep: OwnedFd,
    waker: Waker,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let raw = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: `epoll_create1(2)` returned a freshly opened, valid fd.
        let ep = unsafe { OwnedFd::from_raw_fd(raw) };
        let waker = Waker::new()?;
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        syscall!(epoll_ctl(
            ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker.as_raw_fd(),
            &mut event,
        ))?;
        Ok(Epoll { ep, waker })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interest),
            u64: token.as_usize() as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interest),
            u64: token.as_usize() as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }

    pub fn wait(&self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|d| {
                d.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let mut buf = vec![libc::epoll_event { events: 0, u64: 0 }; 256];
        let n = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            buf.as_mut_ptr(),
            buf.len() as i32,
            timeout_ms,
        ))?;

        let mut delivered = 0;
        for event in &buf[..n as usize] {
            if event.u64 == WAKE_TOKEN {
                self.waker.drain();
                continue;
            }
            out.push(Readiness {
                token: Token(event.u64 as usize),
                readable: event.events as libc::c_int & (libc::EPOLLIN | libc::EPOLLPRI) != 0,
                writable: event.events as libc::c_int & libc::EPOLLOUT != 0,
                error: event.events as libc::c_int & (libc::EPOLLERR | libc::EPOLLHUP) != 0,
            });
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

fn interests_to_epoll(interest: Interest) -> u32 {
    let mut bits: libc::c_int = 0;
    if interest.is_clear() {
        bits |= libc::EPOLLET;
    }
    if interest.is_readable() {
        bits |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT;
    }
    if interest.is_oneshot() {
        bits |= libc::EPOLLONESHOT;
    }
    bits as u32
}
