//! §4.8 — positional file I/O, run synchronously on the worker thread
//! regardless of backend (spec.md §4.8, §9 Open Question: "the source does
//! not provide" a true async-file backend, and neither does this crate —
//! `pread`/`pwrite`/`preadv`/`pwritev`/`fsync` are plain blocking syscalls
//! here, same as tbox's `aicp_file_spak_*` family).

use std::io;
#[cfg(unix)]
use std::os::fd::RawFd;

use crate::macros::syscall;

/// These take a bare `RawFd` rather than `&File`: an `Aico`'s file handle
/// is a raw descriptor the proactor closes itself on `aico_clos`
/// (spec.md §3's `Handle` carries no OS-level ownership type distinct from
/// a socket's), so there is no `File` to borrow from at the call site.
#[cfg(unix)]
pub fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let n = syscall!(pread(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        offset as libc::off_t,
    ))?;
    Ok(n as usize)
}

#[cfg(unix)]
pub fn pwrite(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    let n = syscall!(pwrite(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        offset as libc::off_t,
    ))?;
    Ok(n as usize)
}

#[cfg(unix)]
pub fn preadv(fd: RawFd, bufs: &mut [Vec<u8>], offset: u64) -> io::Result<usize> {
    let mut iov: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let n = syscall!(preadv(
        fd,
        iov.as_mut_ptr(),
        iov.len() as libc::c_int,
        offset as libc::off_t,
    ))?;
    Ok(n as usize)
}

#[cfg(unix)]
pub fn pwritev(fd: RawFd, bufs: &[Vec<u8>], offset: u64) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let n = syscall!(pwritev(
        fd,
        iov.as_ptr(),
        iov.len() as libc::c_int,
        offset as libc::off_t,
    ))?;
    Ok(n as usize)
}

#[cfg(unix)]
pub fn fsync(fd: RawFd) -> io::Result<()> {
    syscall!(fsync(fd)).map(|_| ())
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::fd::AsRawFd;

    fn tempfile() -> File {
        let mut path = std::env::temp_dir();
        path.push(format!("aicp-fileio-test-{}-{:?}", std::process::id(), std::thread::current().id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        std::fs::remove_file(&path).ok();
        file
    }

    #[test]
    fn positional_writes_do_not_disturb_each_other() {
        let file = tempfile();
        let fd = file.as_raw_fd();
        pwrite(fd, b"AAAA", 0).unwrap();
        pwrite(fd, b"BBBB", 4).unwrap();

        let mut buf = [0u8; 8];
        pread(fd, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"AAAABBBB");
    }

    #[test]
    fn vectored_roundtrip() {
        let file = tempfile();
        let fd = file.as_raw_fd();
        let bufs = vec![b"hello ".to_vec(), b"world!".to_vec()];
        pwritev(fd, &bufs, 0).unwrap();

        let mut out = vec![vec![0u8; 6], vec![0u8; 6]];
        let n = preadv(fd, &mut out, 0).unwrap();
        assert_eq!(n, 12);
        assert_eq!(out[0], b"hello ");
        assert_eq!(out[1], b"world!");
    }

    #[test]
    fn fsync_does_not_error_on_a_plain_file() {
        let file = tempfile();
        let fd = file.as_raw_fd();
        pwrite(fd, b"data", 0).unwrap();
        fsync(fd).unwrap();
    }
}
