//! The protocol and read/write hook interfaces consumed by the reactor
//! (spec.md §6), generalized from the optional-capability shape of
//! `mio::event::Source`.

use crate::connection::Connection;
use crate::uuid::Uuid;

/// The value an [`Protocol::on_shutdown`] implementation returns, deciding
/// how this connection participates in the graceful-shutdown drain
/// (spec.md §4.F, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// Close as soon as pending writes drain.
    Close,
    /// Delay up to `secs` seconds (capped at the 8-second shutdown budget)
    /// before forcing a close, to let the protocol wind down on its own.
    Delay { secs: u8 },
    /// Excluded from the graceful drain entirely; force-closed only after
    /// every other connection has been handled (spec.md §9's resolution
    /// of the 255 open question).
    Ignore,
}

impl ShutdownAction {
    pub(crate) fn from_raw(code: u8) -> ShutdownAction {
        match code {
            0 => ShutdownAction::Close,
            255 => ShutdownAction::Ignore,
            secs => ShutdownAction::Delay { secs },
        }
    }
}

/// A user-supplied callback bundle bound to a connection.
///
/// Every method has a no-op default, matching the "capability set" shape
/// of spec.md §6: a protocol implements only the callbacks it needs.
pub trait Protocol: Send + Sync {
    /// Invoked when the fd has readable data and the TASK lock was
    /// acquired for it. Never re-entered for the same connection while a
    /// prior `on_data` for it is still running.
    fn on_data(&self, conn: &Connection) {
        let _ = conn;
    }

    /// Invoked when the fd became writable and had no packets pending (a
    /// non-empty queue is flushed by the reactor instead). Holds the
    /// WRITE lock, so never runs concurrently with `ping`.
    fn on_ready(&self, conn: &Connection) {
        let _ = conn;
    }

    /// Invoked once per connection during the graceful shutdown sweep.
    /// The default politely closes as soon as pending writes drain.
    fn on_shutdown(&self, conn: &Connection) -> ShutdownAction {
        let _ = conn;
        ShutdownAction::Close
    }

    /// Invoked exactly once, after all pending writes have been drained
    /// or abandoned (spec.md §3 invariant 4). The connection's UUID is
    /// already invalid by this point; no slot operation can be taken on
    /// it any more.
    fn on_close(&self, uuid: Uuid) {
        let _ = uuid;
    }

    /// Invoked under the WRITE lock when the connection's inactivity
    /// timeout elapses and has not been reset by [`crate::fd_table::FdTable::touch`].
    fn ping(&self, conn: &Connection) {
        let _ = conn;
    }
}

/// A pluggable byte transport, matching spec.md §6's read/write hook
/// interface. The default hooks (installed by [`crate::fd_table::FdTable::open`])
/// wrap the system `read(2)`/`write(2)`/`close(2)`.
pub trait RwHooks: Send + Sync {
    /// Returns bytes read (`Ok(0)` = EOF), or an [`crate::Error`] whose
    /// `kind()` is [`crate::ErrorKind::WouldBlock`] if the call would
    /// block.
    fn read(&self, uuid: Uuid, buf: &mut [u8]) -> crate::error::Result<usize>;

    /// Returns bytes written, with the same would-block convention as
    /// `read`.
    fn write(&self, uuid: Uuid, buf: &[u8]) -> crate::error::Result<usize>;

    /// Tears down the underlying transport. Called exactly once, from
    /// `force_close`.
    fn close(&self, uuid: Uuid);

    /// Whether this hook set is the default system-call transport, used
    /// by [`crate::packet`] to decide whether the `sendfile`-equivalent
    /// fast path applies (spec.md §4.B).
    fn is_default(&self) -> bool {
        false
    }
}

/// The default hook set: raw `read(2)`/`write(2)`/`close(2)` on the fd
/// named by the UUID.
#[derive(Debug, Default)]
pub struct SystemHooks;

impl RwHooks for SystemHooks {
    fn read(&self, uuid: Uuid, buf: &mut [u8]) -> crate::error::Result<usize> {
        crate::sys::unix::io::read(uuid.fd(), buf)
    }

    fn write(&self, uuid: Uuid, buf: &[u8]) -> crate::error::Result<usize> {
        crate::sys::unix::io::write(uuid.fd(), buf)
    }

    fn close(&self, uuid: Uuid) {
        crate::sys::unix::io::close(uuid.fd());
    }

    fn is_default(&self) -> bool {
        true
    }
}
