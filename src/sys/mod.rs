//! Platform selector layer. Only Unix (epoll/kqueue) backends are provided;
//! spec.md's poller contract ("a thin interface over epoll/kqueue/poll") is
//! satisfied on the two OS families the pack's examples actually target.
//! A Windows IOCP backend is a natural extension but has no grounding
//! anywhere in this pack and is left out rather than invented.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use self::unix::{Events, RawEvent, Selector};
