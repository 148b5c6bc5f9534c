//! `epoll(7)`-backed selector.
//!
//! Ported directly from `tokio-rs-mio`'s `src/sys/unix/selector/epoll.rs`:
//! same `OwnedFd`-wrapped `epoll_create1`, the same `epoll_wait`/`epoll_ctl`
//! shape. Generalized to key events on the raw fd (`u64` token) rather than
//! an opaque `Token`, since this crate's reactor already indexes everything
//! by fd via the UUID scheme.

use super::RawEvent;
use crate::error::{Error, ErrorKind, Result};
use crate::poll::Interest;
use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> Result<Selector> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(map_err(io::Error::last_os_error()));
        }
        Ok(Selector {
            ep: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        let cap = events.inner.capacity();
        let n = unsafe {
            libc::epoll_wait(
                self.ep.as_raw_fd(),
                events.inner.as_mut_ptr(),
                cap as i32,
                timeout_ms,
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(map_err(err));
        }
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }

    pub fn register(&self, fd: RawFd, interests: Interest) -> Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if ret == -1 {
            return Err(map_err(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, interests: Interest) -> Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)
        };
        if ret == -1 {
            return Err(map_err(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        // `epoll_ctl` requires a non-null `event` pointer pre-2.6.9; a
        // zeroed event is harmless and keeps us correct on old kernels.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let ret = unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut event)
        };
        if ret == -1 {
            return Err(map_err(io::Error::last_os_error()));
        }
        Ok(())
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = EPOLLET as u32;
    if interests.is_readable() {
        kind |= (EPOLLIN | EPOLLRDHUP) as u32;
    }
    if interests.is_writable() {
        kind |= EPOLLOUT as u32;
    }
    kind
}

fn map_err(err: io::Error) -> Error {
    Error::with_io(ErrorKind::PollerFailure, err)
}

#[derive(Debug)]
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            inner: Vec::with_capacity(cap),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = RawEvent> + '_ {
        self.inner.iter().map(|ev| RawEvent {
            fd: ev.u64 as i32,
            readable: ev.events & (EPOLLIN as u32) != 0,
            writable: ev.events & (EPOLLOUT as u32) != 0,
            hangup: ev.events & ((EPOLLHUP | EPOLLRDHUP | EPOLLERR) as u32) != 0,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
