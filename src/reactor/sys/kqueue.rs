//! BSD/macOS backend: `kqueue`/`kevent`, with an `EVFILT_USER`-based
//! waker for cross-thread interruption. Requests edge-triggered +
//! one-shot via `EV_CLEAR | EV_ONESHOT` per spec.md §4.6.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::interest::Interest;
use crate::macros::syscall;
use crate::reactor::Readiness;
use crate::token::Token;

const WAKE_IDENT: usize = usize::MAX;

#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

#[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

macro_rules! kevent {
    ($id:expr, $filter:expr, $flags:expr, $data:expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $data as *mut libc::c_void,
        }
    };
}

pub struct Kqueue {
    kq: OwnedFd,
}

impl Kqueue {
    pub fn new() -> io::Result<Kqueue> {
        let raw = syscall!(kqueue())?;
        syscall!(fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC))?;
        // SAFETY: `kqueue(2)` returned a freshly opened, valid fd.
        let kq = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut setup = kevent!(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
            WAKE_IDENT
        );
        syscall!(kevent(kq.as_raw_fd(), &setup, 1, &mut setup, 1, std::ptr::null()))?;
        Ok(Kqueue { kq })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.submit_interest(fd, token, interest, libc::EV_ADD)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.submit_interest(fd, token, interest, libc::EV_ADD)
    }

    fn submit_interest(
        &self,
        fd: RawFd,
        token: Token,
        interest: Interest,
        base: u16,
    ) -> io::Result<()> {
        let mut flags = base | libc::EV_RECEIPT;
        if interest.is_clear() {
            flags |= libc::EV_CLEAR;
        }
        if interest.is_oneshot() {
            flags |= libc::EV_ONESHOT;
        }

        let mut changes = Vec::with_capacity(2);
        if interest.is_readable() {
            changes.push(kevent!(fd, libc::EVFILT_READ, flags, token.as_usize()));
        }
        if interest.is_writable() {
            changes.push(kevent!(fd, libc::EVFILT_WRITE, flags, token.as_usize()));
        }
        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            changes.as_mut_ptr(),
            changes.len() as Count,
            std::ptr::null(),
        ))
        .map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, flags, 0),
            kevent!(fd, libc::EVFILT_WRITE, flags, 0),
        ];
        // Either filter may not have been registered; ENOENT per-change is
        // expected and ignored.
        let _ = syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            changes.as_mut_ptr(),
            changes.len() as Count,
            std::ptr::null(),
        ));
        Ok(())
    }

    pub fn wait(&self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<usize> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const _)
            .unwrap_or(std::ptr::null());

        let mut buf: Vec<libc::kevent> = (0..256)
            .map(|_| kevent!(0, 0, 0, 0))
            .collect();
        let n = syscall!(kevent(
            self.kq.as_raw_fd(),
            std::ptr::null(),
            0,
            buf.as_mut_ptr(),
            buf.len() as Count,
            ts_ptr,
        ))?;

        let mut delivered = 0;
        for ev in &buf[..n as usize] {
            if ev.ident as usize == WAKE_IDENT {
                continue;
            }
            out.push(Readiness {
                token: Token(ev.udata as usize),
                readable: ev.filter as Filter == libc::EVFILT_READ as Filter,
                writable: ev.filter as Filter == libc::EVFILT_WRITE as Filter,
                error: ev.flags & libc::EV_ERROR != 0,
            });
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn wake(&self) -> io::Result<()> {
        let mut trigger = kevent!(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_RECEIPT,
            WAKE_IDENT
        );
        trigger.fflags = libc::NOTE_TRIGGER;
        syscall!(kevent(self.kq.as_raw_fd(), &trigger, 1, &mut trigger, 1, std::ptr::null()))
            .map(|_| ())
    }
}
