//! Component A: the fd table and UUID scheme (spec.md §4.A).

use crate::error::{Error, ErrorKind, Result};
use crate::lock::ProtocolLock;
use crate::packet::{self, Packet};
use crate::protocol::{Protocol, RwHooks, SystemHooks};
use crate::uuid::Uuid;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const OPEN: u8 = 0b0000_0001;
const CLOSING: u8 = 0b0000_0010;
const SUSPENDED: u8 = 0b0000_0100;
const SCHEDULED_ON_DATA: u8 = 0b0000_1000;
const SCHEDULED_ON_READY: u8 = 0b0001_0000;

/// A destructor tied to a slot's lifetime, registered by
/// [`FdTable::uuid_link`].
type OnClose = Box<dyn FnOnce() + Send>;

struct EnvEntry {
    on_close: Option<OnClose>,
}

/// One row of the fd table, one per kernel fd up to
/// [`crate::config::ReactorConfig::fd_capacity`].
pub struct Slot {
    generation: AtomicU32,
    protocol: Mutex<Option<Arc<dyn Protocol>>>,
    hooks: RwLock<Arc<dyn RwHooks>>,
    timeout_secs: AtomicU32,
    last_active_ms: AtomicU64,
    packets: Mutex<packet::Queue>,
    state: AtomicU8,
    pub(crate) lock: ProtocolLock,
    env: Mutex<Slab<EnvEntry>>,
    peer_addr: Mutex<Option<SocketAddr>>,
}

impl Default for Slot {
    fn default() -> Slot {
        Slot {
            generation: AtomicU32::new(0),
            protocol: Mutex::new(None),
            hooks: RwLock::new(Arc::new(SystemHooks)),
            timeout_secs: AtomicU32::new(0),
            last_active_ms: AtomicU64::new(0),
            packets: Mutex::new(packet::Queue::default()),
            state: AtomicU8::new(0),
            lock: ProtocolLock::default(),
            env: Mutex::new(Slab::new()),
            peer_addr: Mutex::new(None),
        }
    }
}

impl Slot {
    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) & OPEN != 0
    }

    pub fn is_suspended(&self) -> bool {
        self.state.load(Ordering::Acquire) & SUSPENDED != 0
    }

    pub fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSING != 0
    }

    pub fn suspend(&self) {
        self.state.fetch_or(SUSPENDED, Ordering::AcqRel);
    }

    pub fn resume(&self) {
        self.state.fetch_and(!SUSPENDED, Ordering::AcqRel);
    }

    pub fn try_mark_scheduled_on_data(&self) -> bool {
        self.state.fetch_or(SCHEDULED_ON_DATA, Ordering::AcqRel) & SCHEDULED_ON_DATA == 0
    }

    pub fn clear_scheduled_on_data(&self) {
        self.state.fetch_and(!SCHEDULED_ON_DATA, Ordering::AcqRel);
    }

    pub fn try_mark_scheduled_on_ready(&self) -> bool {
        self.state.fetch_or(SCHEDULED_ON_READY, Ordering::AcqRel) & SCHEDULED_ON_READY == 0
    }

    pub fn clear_scheduled_on_ready(&self) {
        self.state.fetch_and(!SCHEDULED_ON_READY, Ordering::AcqRel);
    }

    pub fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol.lock().clone()
    }

    pub fn hooks(&self) -> Arc<dyn RwHooks> {
        self.hooks.read().clone()
    }

    pub fn packets(&self) -> &Mutex<packet::Queue> {
        &self.packets
    }

    pub fn touch(&self) {
        self.last_active_ms.store(now_ms(), Ordering::Release);
    }

    pub fn seconds_idle(&self) -> u64 {
        (now_ms().saturating_sub(self.last_active_ms.load(Ordering::Acquire))) / 1000
    }

    pub fn timeout_secs(&self) -> u32 {
        self.timeout_secs.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The fixed-size fd table, owned by [`crate::Runtime`].
///
/// Indexed directly by raw fd (not by a slab-assigned key): the kernel,
/// not this table, decides which fd number `accept`/`socket` hand back, so
/// a slot's position in the backing `Vec` simply mirrors that. See
/// `DESIGN.md` for why `slab::Slab` is instead used for the much smaller
/// per-slot `env` resource map.
pub struct FdTable {
    slots: Vec<Slot>,
}

impl FdTable {
    pub fn new(capacity: usize) -> FdTable {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        FdTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, fd: RawFd) -> Option<&Slot> {
        self.slots.get(fd as usize)
    }

    /// Claims the slot for `fd`: bumps its generation, installs default
    /// hooks, clears the packet queue and lock state. Returns the fresh
    /// [`Uuid`].
    pub fn open(&self, fd: RawFd) -> Result<Uuid> {
        let slot = self
            .slot(fd)
            .ok_or_else(|| Error::new(ErrorKind::InvalidUuid))?;
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *slot.protocol.lock() = None;
        *slot.hooks.write() = Arc::new(SystemHooks);
        slot.timeout_secs.store(0, Ordering::Release);
        slot.touch();
        slot.packets.lock().abandon_all();
        slot.state.store(OPEN, Ordering::Release);
        *slot.env.lock() = Slab::new();
        *slot.peer_addr.lock() = None;
        Ok(Uuid::pack(fd, generation))
    }

    /// Caches the remote address observed at `accept`/`connect` time.
    pub fn set_peer_addr(&self, uuid: Uuid, addr: SocketAddr) -> Result<()> {
        let slot = self.validate(uuid)?;
        *slot.peer_addr.lock() = Some(addr);
        Ok(())
    }

    /// Attaches a protocol object to an already-open slot.
    pub fn attach(&self, uuid: Uuid, protocol: Arc<dyn Protocol>) -> Result<()> {
        let slot = self.validate(uuid)?;
        *slot.protocol.lock() = Some(protocol);
        Ok(())
    }

    pub fn set_hooks(&self, uuid: Uuid, hooks: Arc<dyn RwHooks>) -> Result<()> {
        let slot = self.validate(uuid)?;
        *slot.hooks.write() = hooks;
        Ok(())
    }

    /// Validates `uuid` against the slot's current generation. Returns
    /// `Err(InvalidUuid)` rather than panicking - spec.md §7: "Invalid
    /// UUIDs are reported, never panic."
    pub fn validate(&self, uuid: Uuid) -> Result<&Slot> {
        if uuid.is_invalid() {
            return Err(Error::new(ErrorKind::InvalidUuid));
        }
        let slot = self
            .slot(uuid.fd())
            .ok_or_else(|| Error::new(ErrorKind::InvalidUuid))?;
        if slot.generation.load(Ordering::Acquire) != uuid.generation() || !slot.is_open() {
            return Err(Error::new(ErrorKind::InvalidUuid));
        }
        Ok(slot)
    }

    pub fn touch(&self, uuid: Uuid) -> Result<()> {
        self.validate(uuid)?.touch();
        Ok(())
    }

    pub fn set_timeout(&self, uuid: Uuid, secs: u32) -> Result<()> {
        self.validate(uuid)?
            .timeout_secs
            .store(secs, Ordering::Release);
        Ok(())
    }

    /// Cooperative close: marks the slot `CLOSING`. The reactor drains
    /// pending packets and then calls [`FdTable::force_close`].
    pub fn close(&self, uuid: Uuid) -> Result<()> {
        let slot = self.validate(uuid)?;
        slot.state.fetch_or(CLOSING, Ordering::AcqRel);
        Ok(())
    }

    /// Immediate teardown: runs the hook's `close`, invokes `on_close`,
    /// frees every queued packet (running each `dealloc`), and bumps the
    /// generation again so every outstanding `Uuid` for this fd becomes
    /// invalid (spec.md §4.A).
    pub fn force_close(&self, uuid: Uuid) -> Result<()> {
        let slot = match self.slot(uuid.fd()) {
            Some(slot) => slot,
            None => return Err(Error::new(ErrorKind::InvalidUuid)),
        };
        // Accept a uuid that has already raced ahead to CLOSING from
        // another thread; only reject a generation that never existed.
        if slot.generation.load(Ordering::Acquire) != uuid.generation() {
            return Err(Error::new(ErrorKind::InvalidUuid));
        }
        if !slot.is_open() {
            return Ok(());
        }

        let hooks = slot.hooks();
        hooks.close(uuid);

        let protocol = slot.protocol.lock().take();
        slot.packets.lock().abandon_all();

        let mut env = slot.env.lock();
        for (_, entry) in env.iter_mut() {
            if let Some(on_close) = entry.on_close.take() {
                on_close();
            }
        }
        env.clear();
        drop(env);

        slot.state.store(0, Ordering::Release);
        slot.generation.fetch_add(1, Ordering::AcqRel);

        if let Some(protocol) = protocol {
            protocol.on_close(uuid);
        }
        Ok(())
    }

    /// Registers a destructor tied to the slot's lifetime. If `uuid` is
    /// already invalid, `on_close` runs immediately (spec.md §4.A).
    pub fn uuid_link(&self, uuid: Uuid, on_close: impl FnOnce() + Send + 'static) -> EnvKey {
        match self.slot(uuid.fd()) {
            Some(slot) if slot.generation.load(Ordering::Acquire) == uuid.generation() && slot.is_open() => {
                let key = slot.env.lock().insert(EnvEntry {
                    on_close: Some(Box::new(on_close)),
                });
                EnvKey(key)
            }
            _ => {
                on_close();
                EnvKey(usize::MAX)
            }
        }
    }

    pub fn uuid_unlink(&self, uuid: Uuid, key: EnvKey) {
        if key.0 == usize::MAX {
            return;
        }
        if let Some(slot) = self.slot(uuid.fd()) {
            let mut env = slot.env.lock();
            if env.contains(key.0) {
                env.remove(key.0);
            }
        }
    }

    pub fn iter_open(&self) -> impl Iterator<Item = (RawFd, Uuid)> + '_ {
        self.slots.iter().enumerate().filter_map(|(fd, slot)| {
            if slot.is_open() {
                Some((
                    fd as RawFd,
                    Uuid::pack(fd as RawFd, slot.generation.load(Ordering::Acquire)),
                ))
            } else {
                None
            }
        })
    }

    pub fn slot_for(&self, uuid: Uuid) -> Option<&Slot> {
        self.validate(uuid).ok()
    }

    /// The UUID `fd` currently names, if its slot is open. Used by the
    /// reactor loop to turn a bare readiness event's fd back into a
    /// `Uuid` without the caller having kept one around.
    pub fn current_uuid(&self, fd: RawFd) -> Option<Uuid> {
        let slot = self.slot(fd)?;
        if slot.is_open() {
            Some(Uuid::pack(fd, slot.generation.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Enqueues a packet for `uuid`. On a closed/stale connection the
    /// packet's `dealloc` still runs (spec.md §7: "`write2` on a closed
    /// connection runs the packet's `dealloc` and returns −1").
    pub fn write2(&self, uuid: Uuid, packet: Packet, urgent: bool) -> Result<()> {
        match self.validate(uuid) {
            Ok(slot) => {
                let mut q = slot.packets.lock();
                if urgent {
                    q.push_urgent(packet);
                } else {
                    q.push(packet);
                }
                Ok(())
            }
            Err(err) => {
                let mut q = packet::Queue::default();
                q.push(packet);
                q.abandon_all();
                Err(err)
            }
        }
    }

    pub fn pending(&self, uuid: Uuid) -> Result<usize> {
        Ok(self.validate(uuid)?.packets.lock().pending())
    }
}

/// A handle to an `env` entry, returned by [`FdTable::uuid_link`] for use
/// with [`FdTable::uuid_unlink`].
#[derive(Clone, Copy, Debug)]
pub struct EnvKey(usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_invalidates_old_uuid() {
        let table = FdTable::new(16);
        let first = table.open(3).unwrap();
        assert!(table.validate(first).is_ok());
        let second = table.open(3).unwrap();
        assert_ne!(first, second);
        assert!(table.validate(first).is_err());
        assert!(table.validate(second).is_ok());
    }

    #[test]
    fn force_close_then_reopen_invalidates_both_prior_uuids() {
        let table = FdTable::new(16);
        let first = table.open(3).unwrap();
        table.force_close(first).unwrap();
        assert!(table.validate(first).is_err());
        let second = table.open(3).unwrap();
        assert!(table.validate(second).is_ok());
        assert_ne!(first, second);
    }

    #[test]
    fn write2_on_closed_connection_runs_dealloc_and_fails() {
        use std::cell::Cell;
        use std::rc::Rc;
        let table = FdTable::new(16);
        let uuid = table.open(3).unwrap();
        table.force_close(uuid).unwrap();

        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let packet = Packet::memory_with_dealloc(vec![1, 2, 3], move || ran2.set(true));
        let result = table.write2(uuid, packet, false);
        assert!(result.is_err());
        assert!(ran.get());
    }

    #[test]
    fn uuid_link_runs_on_close_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        use std::sync::Arc as StdArc;
        let table = FdTable::new(16);
        let uuid = table.open(3).unwrap();
        let count = StdArc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        table.uuid_link(uuid, move || {
            count2.fetch_add(1, O::SeqCst);
        });
        table.force_close(uuid).unwrap();
        assert_eq!(count.load(O::SeqCst), 1);
    }

    #[test]
    fn uuid_link_on_already_invalid_uuid_runs_immediately() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        use std::sync::Arc as StdArc;
        let table = FdTable::new(16);
        let uuid = table.open(3).unwrap();
        table.force_close(uuid).unwrap();
        let count = StdArc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        table.uuid_link(uuid, move || {
            count2.fetch_add(1, O::SeqCst);
        });
        assert_eq!(count.load(O::SeqCst), 1);
    }
}
