//! Raw socket creation helpers backing `Aico::open_sock`/
//! `open_sock_from_type` (SPEC_FULL.md §10). Out of scope per spec.md §1
//! ("platform shims... beyond what the reactor itself needs") as a general
//! facility — this module provides exactly the sliver AICP's own socket
//! AICOs need and nothing more: socket-address conversion helpers and
//! non-blocking TCP/UDP construction.

use std::io;
use std::mem;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::macros::syscall;

/// The two socket kinds AICP opens directly (spec.md §3's "socket" AICO
/// kind covers both TCP and UDP).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

#[cfg(unix)]
pub fn new_socket(addr: &SocketAddr, kind: SocketKind) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let ty = match kind {
        SocketKind::Stream => libc::SOCK_STREAM,
        SocketKind::Datagram => libc::SOCK_DGRAM,
    };
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ty = ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;

    let raw = syscall!(socket(domain, ty, 0))?;
    // SAFETY: `socket(2)` returned a freshly opened, valid fd.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    set_nonblocking(std::os::fd::AsRawFd::as_raw_fd(&fd))?;

    Ok(fd)
}

#[cfg(unix)]
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    Ok(())
}

#[cfg(unix)]
pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (ptr, len) = socket_addr_ptr(addr);
    syscall!(bind(fd, ptr, len)).map(|_| ())
}

#[cfg(unix)]
pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

/// Close a raw handle. `Aico` stores a bare descriptor (spec.md §3's
/// `Handle` is untyped beyond socket/file/none), so the proactor closes it
/// itself in `aico_clos` rather than relying on an owning wrapper's `Drop`.
#[cfg(unix)]
pub fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}

/// Best-effort, non-blocking connect: returns `Ok(())` immediately for a
/// synchronously-completed connect, and the `EINPROGRESS` error (which the
/// caller treats as "arm CONN readiness and wait") otherwise.
#[cfg(unix)]
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (ptr, len) = socket_addr_ptr(addr);
    match syscall!(connect(fd, ptr, len)) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Err(e),
        Err(e) => Err(e),
    }
}

/// Non-blocking `accept4` with `SOCK_NONBLOCK | SOCK_CLOEXEC` where the
/// platform has it, falling back to `accept` + a manual `set_nonblocking`
/// everywhere else.
#[cfg(unix)]
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as libc::socklen_t;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let raw = syscall!(accept4(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let raw = {
        let raw = syscall!(accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        set_nonblocking(raw)?;
        raw
    };

    // SAFETY: a successful `accept`/`accept4` returned a freshly opened fd.
    let accepted = unsafe { OwnedFd::from_raw_fd(raw) };
    let peer = unsafe { socket_addr_from_storage(&storage)? };
    Ok((accepted, peer))
}

#[cfg(unix)]
pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
    ))?;
    Ok(n as usize)
}

#[cfg(unix)]
pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(send(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        libc::MSG_NOSIGNAL,
    ))?;
    Ok(n as usize)
}

#[cfg(unix)]
pub fn recvfrom(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as libc::socklen_t;
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    let peer = unsafe { socket_addr_from_storage(&storage)? };
    Ok((n as usize, peer))
}

#[cfg(unix)]
pub fn sendto(fd: RawFd, buf: &[u8], peer: &SocketAddr) -> io::Result<usize> {
    let (ptr, len) = socket_addr_ptr(peer);
    let n = syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        libc::MSG_NOSIGNAL,
        ptr,
        len,
    ))?;
    Ok(n as usize)
}

#[cfg(unix)]
pub fn readv(fd: RawFd, bufs: &mut [Vec<u8>]) -> io::Result<usize> {
    let mut iov: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let n = syscall!(readv(fd, iov.as_mut_ptr(), iov.len() as libc::c_int))?;
    Ok(n as usize)
}

#[cfg(unix)]
pub fn writev(fd: RawFd, bufs: &[Vec<u8>]) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let n = syscall!(writev(fd, iov.as_ptr(), iov.len() as libc::c_int))?;
    Ok(n as usize)
}

/// Read back a connecting socket's pending error after a `CONN` readiness
/// event — calling `connect(2)` again on an already-connecting socket would
/// fail with `EALREADY`/`EISCONN`, so the retry path checks `SO_ERROR`
/// instead, the same dance every non-blocking-connect implementation takes.
#[cfg(unix)]
pub fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// Vectored datagram receive with the peer address, via `recvmsg(2)` —
/// `readv` has no way to learn who sent a packet.
#[cfg(unix)]
pub fn recvmsg_vec(fd: RawFd, bufs: &mut [Vec<u8>]) -> io::Result<(usize, SocketAddr)> {
    let mut iov: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of_val(&storage) as libc::socklen_t;
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;
    let n = syscall!(recvmsg(fd, &mut msg, 0))?;
    let peer = unsafe { socket_addr_from_storage(&storage)? };
    Ok((n as usize, peer))
}

/// Vectored datagram send to a specific peer, via `sendmsg(2)`.
#[cfg(unix)]
pub fn sendmsg_vec(fd: RawFd, bufs: &[Vec<u8>], peer: &SocketAddr) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let (ptr, len) = socket_addr_ptr(peer);
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = ptr as *mut libc::c_void;
    msg.msg_namelen = len;
    msg.msg_iov = iov.as_ptr() as *mut _;
    msg.msg_iovlen = iov.len() as _;
    let n = syscall!(sendmsg(fd, &msg, libc::MSG_NOSIGNAL))?;
    Ok(n as usize)
}

#[cfg(unix)]
fn socket_addr_ptr(addr: &SocketAddr) -> (*const libc::sockaddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => (
            a as *const _ as *const libc::sockaddr,
            mem::size_of_val(a) as libc::socklen_t,
        ),
        SocketAddr::V6(a) => (
            a as *const _ as *const libc::sockaddr,
            mem::size_of_val(a) as libc::socklen_t,
        ),
    }
}

/// Decode a filled `sockaddr_storage` back into a `SocketAddr`, used after
/// `accept`/`recvfrom`.
///
/// # Safety
/// `storage` must have been populated by a syscall that writes a
/// `sockaddr_in` or `sockaddr_in6`.
#[cfg(unix)]
pub unsafe fn socket_addr_from_storage(
    storage: &libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => Ok(SocketAddr::V4(*(storage as *const libc::sockaddr_storage
            as *const libc::sockaddr_in
            as *const _))),
        libc::AF_INET6 => Ok(SocketAddr::V6(*(storage as *const libc::sockaddr_storage
            as *const libc::sockaddr_in6
            as *const _))),
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}
