//! The handle passed to [`crate::Protocol`] callbacks: a `Uuid` paired
//! with a reference to the owning [`crate::Runtime`], exposing the
//! operations spec.md's protocol callbacks are expected to call back into
//! (write, close, suspend, timeout, linked resources).

use crate::error::Result;
use crate::fd_table::EnvKey;
use crate::packet::Packet;
use crate::runtime::Runtime;
use crate::uuid::Uuid;
use std::net::SocketAddr;
use std::sync::Arc;

/// A live connection handle, valid for the lifetime of the callback it was
/// handed to. Cheaply cloneable (it is an `Arc` clone plus a `Copy` UUID),
/// so protocols may stash one to act on later (e.g. from another thread,
/// via `defer`) as long as they re-`validate` first.
#[derive(Clone)]
pub struct Connection {
    runtime: Arc<Runtime>,
    uuid: Uuid,
}

impl Connection {
    pub(crate) fn new(runtime: Arc<Runtime>, uuid: Uuid) -> Connection {
        Connection { runtime, uuid }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.runtime.fd_table().slot_for(self.uuid)?.peer_addr()
    }

    /// Enqueues `data` for sending, returning immediately. Ownership of
    /// `data` transfers to the queue (spec.md §4.B).
    pub fn write(&self, data: Vec<u8>) -> Result<()> {
        self.runtime.write2(self.uuid, Packet::memory(data), false)
    }

    pub fn write_urgent(&self, data: Vec<u8>) -> Result<()> {
        self.runtime.write2(self.uuid, Packet::memory(data), true)
    }

    pub fn write_packet(&self, packet: Packet, urgent: bool) -> Result<()> {
        self.runtime.write2(self.uuid, packet, urgent)
    }

    /// Reads directly through the slot's installed hooks (`SystemHooks` by
    /// default). Returns `Ok(0)` on EOF and an `ErrorKind::WouldBlock` error
    /// if no data is available yet, matching `RwHooks::read`'s convention.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let slot = self
            .runtime
            .fd_table()
            .slot_for(self.uuid)
            .ok_or_else(|| crate::error::Error::new(crate::error::ErrorKind::InvalidUuid))?;
        slot.hooks().read(self.uuid, buf)
    }

    pub fn pending(&self) -> Result<usize> {
        self.runtime.fd_table().pending(self.uuid)
    }

    /// Cooperative close: pending writes drain first (spec.md §4.A).
    pub fn close(&self) -> Result<()> {
        self.runtime.fd_table().close(self.uuid)
    }

    /// Immediate teardown, bypassing the drain.
    pub fn force_close(&self) -> Result<()> {
        self.runtime.force_close(self.uuid)
    }

    pub fn touch(&self) -> Result<()> {
        self.runtime.fd_table().touch(self.uuid)
    }

    pub fn set_timeout(&self, secs: u32) -> Result<()> {
        self.runtime.fd_table().set_timeout(self.uuid, secs)
    }

    /// Suspends event scheduling: incoming readiness stops triggering
    /// `on_data` until [`Connection::force_event`] is called (spec.md §8
    /// scenario E6).
    pub fn suspend(&self) -> Result<()> {
        self.runtime.fd_table().slot_for(self.uuid).map(|s| s.suspend());
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.runtime.fd_table().slot_for(self.uuid).map(|s| s.resume());
        Ok(())
    }

    /// Forces delivery of `event` even while suspended, or to re-trigger
    /// a callback out of band.
    pub fn force_event(&self, event: ForcedEvent) -> Result<()> {
        self.runtime.force_event(self.uuid, event)
    }

    pub fn uuid_link(&self, on_close: impl FnOnce() + Send + 'static) -> EnvKey {
        self.runtime.fd_table().uuid_link(self.uuid, on_close)
    }

    pub fn uuid_unlink(&self, key: EnvKey) {
        self.runtime.fd_table().uuid_unlink(self.uuid, key)
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }
}

/// An event that can be forced on a (possibly suspended) connection, used
/// by [`Connection::force_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedEvent {
    OnData,
    OnReady,
}
