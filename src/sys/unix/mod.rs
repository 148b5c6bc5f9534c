//! Unix system layer: selector backend selection plus raw fd helpers.
//!
//! Mirrors `tokio-rs-mio`'s own `src/sys/unix/mod.rs`/`src/sys/unix/selector/mod.rs`
//! split: pick epoll on Linux/Android, kqueue on the BSD family and macOS.

#[cfg(any(target_os = "android", target_os = "linux"))]
mod epoll;
#[cfg(any(target_os = "android", target_os = "linux"))]
pub use self::epoll::{Events, Selector};

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
mod kqueue;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
pub use self::kqueue::{Events, Selector};

pub mod io;
pub mod net;

pub use self::io::pipe;

use std::os::unix::io::RawFd;

/// A single readiness event, generalized across the epoll/kqueue backends.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}
