//! Non-blocking read/write/close helpers shared by [`crate::protocol::SystemHooks`]
//! and the packet queue's `sendfile` fast path.
//!
//! Grounded on the `syscall!`-wrapped libc call convention used throughout
//! `tokio-rs-mio`'s `src/sys/unix/selector/epoll.rs`.

use crate::error::{Error, ErrorKind, Result};
use std::os::unix::io::RawFd;

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    match syscall!(read(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len()
    )) {
        Ok(n) => Ok(n as usize),
        Err(err) => Err(map_io_err(err)),
    }
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    match syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())) {
        Ok(n) => Ok(n as usize),
        Err(err) => Err(map_io_err(err)),
    }
}

pub(crate) fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}

pub(crate) fn set_nonblock(fd: RawFd) -> Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL, 0)).map_err(map_io_err)?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map_err(map_io_err)?;
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD, 0)).map_err(map_io_err)?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC)).map_err(map_io_err)?;
    Ok(())
}

fn map_io_err(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Error::with_io(ErrorKind::WouldBlock, err)
    } else {
        Error::with_io(ErrorKind::PollerFailure, err)
    }
}

/// A non-blocking, close-on-exec pipe, used for the cluster parent/worker
/// pipe pairs (spec.md §4.G) and the defer queue's wakeup self-pipe
/// fallback.
///
/// Grounded on the teacher's own `sys::unix::pipe()` helper
/// (`src/sys/unix/mod.rs`), ported from `nix::unistd::pipe2` to raw
/// `libc::pipe2` since this crate depends on `libc` directly rather than
/// `nix`.
pub(crate) fn pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    syscall!(pipe2(
        fds.as_mut_ptr(),
        libc::O_NONBLOCK | libc::O_CLOEXEC
    ))
    .map_err(map_io_err)?;
    Ok((fds[0], fds[1]))
}
