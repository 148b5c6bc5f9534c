//! `kqueue(2)`-backed selector for the BSD family and macOS.
//!
//! Ported from `tokio-rs-mio`'s `src/sys/unix/selector/kqueue.rs`: same
//! `kevent` change-list/event-list split, same per-platform `Filter`/`Data`
//! type aliases (the kqueue ABI disagrees with itself across BSD variants
//! on the width of these fields).

use super::RawEvent;
use crate::error::{Error, ErrorKind, Result};
use crate::poll::Interest;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{cmp, ptr};

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
    ($id:expr, $filter:expr, $flags:expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        }
    };
}

#[derive(Debug)]
pub struct Selector {
    kq: RawFd,
}

impl Selector {
    pub fn new() -> Result<Selector> {
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(map_err(io::Error::last_os_error()));
        }
        unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) };
        Ok(Selector { kq })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> Result<()> {
        let ts = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const _)
            .unwrap_or(ptr::null());

        events.inner.clear();
        let cap = events.inner.capacity();
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.inner.as_mut_ptr(),
                cap as Count,
                ts_ptr,
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
        self.apply(fd, interests, libc::EV_ADD | libc::EV_CLEAR)
    }

    pub fn reregister(&self, fd: RawFd, interests: Interest) -> Result<()> {
        self.apply(fd, interests, libc::EV_ADD | libc::EV_CLEAR)
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        let changes = [
            kevent!(fd, libc::EVFILT_READ, libc::EV_DELETE),
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_DELETE),
        ];
        // Deleting a filter that was never added returns ENOENT; harmless.
        let _ = unsafe {
            libc::kevent(self.kq, changes.as_ptr(), 2, ptr::null_mut(), 0, ptr::null())
        };
        Ok(())
    }

    fn apply(&self, fd: RawFd, interests: Interest, flags: u16) -> Result<()> {
        let mut changes = Vec::with_capacity(2);
        if interests.is_readable() {
            changes.push(kevent!(fd, libc::EVFILT_READ, flags));
        }
        if interests.is_writable() {
            changes.push(kevent!(fd, libc::EVFILT_WRITE, flags));
        }
        let ret = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as Count,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret == -1 {
            return Err(map_err(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

fn map_err(err: io::Error) -> Error {
    Error::with_io(ErrorKind::PollerFailure, err)
}

#[derive(Debug)]
pub struct Events {
    inner: Vec<libc::kevent>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            inner: Vec::with_capacity(cap),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = RawEvent> + '_ {
        self.inner.iter().map(|ev| RawEvent {
            fd: ev.ident as RawFd,
            readable: ev.filter as i32 == libc::EVFILT_READ,
            writable: ev.filter as i32 == libc::EVFILT_WRITE,
            hangup: ev.flags & (libc::EV_EOF as u16) != 0,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
