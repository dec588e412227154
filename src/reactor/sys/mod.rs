//! One module per OS facility, selected by [`super::Selector`] at
//! construction time (spec.md §4.8).

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
pub mod kqueue;

#[cfg(unix)]
pub mod poll;

#[cfg(unix)]
pub mod waker;

#[cfg(windows)]
pub mod windows;
