//! `eventfd`-backed cross-thread wakeup. Registered by every Unix
//! backend under a reserved token so `kill`/`spak` can interrupt a
//! concurrent blocking `wait` without touching any real I/O registration.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use crate::macros::syscall;

#[derive(Debug)]
pub struct Waker {
    fd: File,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let raw = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a freshly opened, valid fd.
        let fd = unsafe { File::from_raw_fd(raw) };
        Ok(Waker { fd })
    }

    pub fn wake(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Counter is about to overflow; drain and retry once.
                self.drain();
                (&self.fd).write(&buf).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Drain the counter after a readiness notification so the next
    /// `wait` doesn't spuriously return immediately.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = (&self.fd).read(&mut buf);
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
