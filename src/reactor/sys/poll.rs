//! Fallback backend: `poll(2)`, for any Unix without epoll or kqueue.
//!
//! `poll(2)` doesn't echo a user token the way `epoll_wait`/`kevent` do,
//! so this backend keeps a parallel `RawFd -> Token` map (spec.md §4.8)
//! and reconstructs readiness from the
//! returned `revents`. One-shot is not a kernel feature of `poll`, so it is
//! synthesized manually: a delivered, one-shot registration has its
//! `events` mask cleared until the caller calls `reregister` again
//! (spec.md §4.6, §4.8).

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use crate::interest::Interest;
use crate::macros::syscall;
use crate::reactor::sys::waker::Waker;
use crate::reactor::Readiness;
use crate::token::Token;

struct Registration {
    token: Token,
    interest: Interest,
    /// Cleared after a one-shot delivery; restored by `reregister`.
    armed: bool,
}

struct State {
    regs: HashMap<RawFd, Registration>,
}

pub struct Poll {
    state: Mutex<State>,
    waker: Waker,
    waker_fd: RawFd,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        let waker = Waker::new()?;
        let waker_fd = std::os::fd::AsRawFd::as_raw_fd(&waker);
        Ok(Poll {
            state: Mutex::new(State {
                regs: HashMap::new(),
            }),
            waker,
            waker_fd,
        })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.regs.insert(
            fd,
            Registration {
                token,
                interest,
                armed: true,
            },
        );
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.register(fd, token, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.state.lock().unwrap().regs.remove(&fd);
        Ok(())
    }

    pub fn wait(&self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut pollfds: Vec<libc::pollfd> = {
            let state = self.state.lock().unwrap();
            let mut v: Vec<libc::pollfd> = state
                .regs
                .iter()
                .filter(|(_, r)| r.armed)
                .map(|(&fd, r)| libc::pollfd {
                    fd,
                    events: interest_to_poll(r.interest),
                    revents: 0,
                })
                .collect();
            v.push(libc::pollfd {
                fd: self.waker_fd,
                events: libc::POLLIN,
                revents: 0,
            });
            v
        };

        let timeout_ms = timeout.map(|d| d.as_millis() as libc::c_int).unwrap_or(-1);
        syscall!(poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms))?;

        let mut state = self.state.lock().unwrap();
        let mut delivered = 0;
        for pfd in &pollfds {
            if pfd.revents == 0 {
                continue;
            }
            if pfd.fd == self.waker_fd {
                self.waker.drain();
                continue;
            }
            let Some(reg) = state.regs.get_mut(&pfd.fd) else {
                continue;
            };
            out.push(Readiness {
                token: reg.token,
                readable: pfd.revents & (libc::POLLIN | libc::POLLPRI) != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
            });
            delivered += 1;
            if reg.interest.is_oneshot() {
                reg.armed = false;
            }
        }
        Ok(delivered)
    }

    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= libc::POLLIN;
    }
    if interest.is_writable() {
        bits |= libc::POLLOUT;
    }
    bits
}
