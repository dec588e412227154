//! Small helper macro shared by the backend implementations under
//! `crate::reactor::sys`: call a raw libc function and turn a `-1`
//! return into `io::Error::last_os_error()`.

#![allow(unused_macros)]

#[cfg(unix)]
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

#[cfg(unix)]
pub(crate) use syscall;
