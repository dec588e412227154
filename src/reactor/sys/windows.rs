//! Windows backend: a native I/O completion port.
//!
//! Unlike the Unix backends, IOCP is itself a completion API, not a
//! readiness one — spec.md §2 notes the proactor contract "is satisfied by
//! IOCP natively" here. A single `CompletionPort` is shared by every
//! registered handle, built directly over `windows-sys`. Registration
//! associates a handle with the port once (`CreateIoCompletionPort`);
//! actual per-operation arming happens when the caller issues the
//! overlapped read/write/accept, which is out of this module's scope
//! (spec.md §4.8 routes that through
//! `aicp::proactor`). `wake`/`kill` post a zero-length completion packet
//! tagged with the reserved wake key.

use std::io;
use std::os::windows::io::{AsRawHandle, RawHandle};
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
    OVERLAPPED_ENTRY,
};

use crate::interest::Interest;
use crate::reactor::{RawFdLike, Readiness};
use crate::token::Token;

const WAKE_KEY: usize = usize::MAX;

pub struct Iocp {
    port: HANDLE,
}

unsafe impl Send for Iocp {}
unsafe impl Sync for Iocp {}

impl Iocp {
    pub fn new() -> io::Result<Iocp> {
        // SAFETY: a null file handle with `existing_port == 0` asks the OS
        // to create a fresh completion port.
        let port = unsafe { CreateIoCompletionPort(-1isize as HANDLE, 0 as HANDLE, 0, 0) };
        if port == 0 as HANDLE {
            return Err(io::Error::last_os_error());
        }
        Ok(Iocp { port })
    }

    pub fn register(&self, handle: RawFdLike, token: Token, _interest: Interest) -> io::Result<()> {
        let raw = handle as HANDLE;
        // SAFETY: `raw` is a valid, open handle supplied by the caller.
        let result = unsafe { CreateIoCompletionPort(raw, self.port, token.as_usize(), 0) };
        if result == 0 as HANDLE {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn reregister(&self, _handle: RawFdLike, _token: Token, _interest: Interest) -> io::Result<()> {
        // A handle may only be associated with one completion port for its
        // lifetime; re-arming per operation happens at the overlapped-call
        // site in `aicp::proactor`, not here.
        Ok(())
    }

    pub fn deregister(&self, _handle: RawFdLike) -> io::Result<()> {
        // IOCP has no association-removal call; closing the handle is what
        // detaches it, which the owning `Aico` already does on `Clos`.
        Ok(())
    }

    pub fn wait(&self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout.map(|d| d.as_millis() as u32).unwrap_or(u32::MAX);
        let mut entries: [OVERLAPPED_ENTRY; 256] = unsafe { std::mem::zeroed() };
        let mut removed: u32 = 0;

        // SAFETY: `entries` is a valid, appropriately-sized output buffer.
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                timeout_ms,
                0,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::TimedOut {
                return Ok(0);
            }
            return Err(err);
        }

        let mut delivered = 0;
        for entry in &entries[..removed as usize] {
            if entry.lpCompletionKey == WAKE_KEY {
                continue;
            }
            out.push(Readiness {
                token: Token(entry.lpCompletionKey),
                readable: true,
                writable: true,
                error: false,
            });
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn wake(&self) -> io::Result<()> {
        // SAFETY: posting a zero-length packet with no overlapped pointer
        // is always valid and merely wakes one waiter.
        let ok = unsafe { PostQueuedCompletionStatus(self.port, 0, WAKE_KEY, std::ptr::null_mut()) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Iocp {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port) };
    }
}

impl AsRawHandle for Iocp {
    fn as_raw_handle(&self) -> RawHandle {
        self.port as RawHandle
    }
}
