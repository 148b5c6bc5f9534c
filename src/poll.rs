//! The reactor's poller interface (Component C, spec.md §4.C).
//!
//! A thin, cross-backend wrapper around [`crate::sys::Selector`]. Modeled
//! directly on `mio::Poll`/`mio::Interests` (`src/poll.rs`,
//! `src/interests.rs`), generalized to key events on a raw fd instead of an
//! opaque `Token` since the reactor already owns the fd→slot mapping.

use crate::error::Result;
use crate::sys;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// What to monitor a fd for.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    #[inline]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_readable() {
            parts.push("READABLE");
        }
        if self.is_writable() {
            parts.push("WRITABLE");
        }
        write!(f, "{}", parts.join(" | "))
    }
}

/// A readiness event returned from [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

/// The OS-level readiness source. One instance is shared (via `Arc`) by
/// every reactor thread in a worker process; the selector itself is
/// required to be safe to call concurrently from multiple threads.
pub struct Poller {
    selector: sys::Selector,
    events: parking_lot::Mutex<sys::Events>,
}

impl Poller {
    pub fn new(events_capacity: usize) -> Result<Poller> {
        Ok(Poller {
            selector: sys::Selector::new()?,
            events: parking_lot::Mutex::new(sys::Events::with_capacity(events_capacity)),
        })
    }

    /// Starts monitoring `fd` for `interest`.
    pub fn add(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.selector.register(fd, interest)
    }

    /// Changes the interest set for an already-monitored `fd`.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.selector.reregister(fd, interest)
    }

    /// Stops monitoring `fd`. Idempotent: removing an unmonitored fd is not
    /// an error, matching the reactor's own "validate, then remove from
    /// poller" shutdown path (spec.md §4.F step 4).
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        self.selector.deregister(fd)
    }

    /// Blocks (up to `timeout`) for readiness events, invoking `f` once
    /// per event. `timeout = None` blocks indefinitely.
    pub fn wait(&self, timeout: Option<Duration>, mut f: impl FnMut(ReadyEvent)) -> Result<()> {
        let mut events = self.events.lock();
        self.selector.select(&mut events, timeout)?;
        for raw in events.iter() {
            f(ReadyEvent {
                fd: raw.fd,
                readable: raw.readable,
                writable: raw.writable,
                hangup: raw.hangup,
            });
        }
        Ok(())
    }
}
