//! The runtime: the single owner of every component's state for one
//! worker process (spec.md §9's "global mutable state... owned by a
//! single `Runtime` struct").

use crate::config::ReactorConfig;
use crate::connection::{Connection, ForcedEvent};
use crate::defer::{DeferQueue, TimerControl};
use crate::error::{Error, ErrorKind, Result};
use crate::fd_table::FdTable;
use crate::lifecycle;
use crate::packet::Packet;
use crate::poll::{Interest, Poller};
use crate::protocol::Protocol;
use crate::pubsub::{self, Engine, Message, SubscriptionHandle};
use crate::sys::unix::net;
use crate::uuid::Uuid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

type ProtocolFactory = Arc<dyn Fn() -> Arc<dyn Protocol> + Send + Sync>;
type OnOpen = Arc<dyn Fn(&Connection) + Send + Sync>;

pub(crate) struct Listener {
    pub(crate) fd: RawFd,
    pub(crate) local_addr: SocketAddr,
    pub(crate) protocol_factory: ProtocolFactory,
    pub(crate) on_open: OnOpen,
}

pub(crate) struct PendingConnect {
    pub(crate) uuid: Uuid,
    on_start: Mutex<Option<Box<dyn FnOnce(&Connection) + Send>>>,
    on_fail: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// The single owner of one worker's fd table, poller, defer queue,
/// pub/sub registry, lifecycle registry, and (with the `cluster` feature)
/// its cluster link set.
pub struct Runtime {
    config: ReactorConfig,
    fd_table: FdTable,
    poller: Poller,
    defer: DeferQueue,
    pubsub: pubsub::Registry,
    lifecycle: lifecycle::Registry,
    #[cfg(feature = "cluster")]
    cluster: crate::cluster::Cluster,
    /// Which channel or pattern each still-live subscription mirrors to the
    /// parent, keyed by [`SubscriptionHandle::id`] - consulted only when
    /// `unsubscribe` needs to know whether (and what) to tell the parent
    /// to stop forwarding.
    #[cfg(feature = "cluster")]
    cluster_interest: Mutex<HashMap<u64, (bool, Vec<u8>)>>,
    #[cfg(feature = "cluster")]
    cluster_link_fd: Mutex<Option<RawFd>>,
    listeners: Mutex<HashMap<RawFd, Listener>>,
    pending_connects: Mutex<HashMap<RawFd, PendingConnect>>,
    accepting: AtomicBool,
    shutting_down: AtomicBool,
    self_weak: Weak<Runtime>,
}

impl Runtime {
    /// Builds a fresh runtime from `config`. Fires `OnInitialize` before
    /// returning (spec.md §4.I).
    pub fn init(config: ReactorConfig) -> Result<Arc<Runtime>> {
        let poller = Poller::new(config.events_capacity)?;
        let runtime = Arc::new_cyclic(|weak| Runtime {
            fd_table: FdTable::new(config.fd_capacity),
            poller,
            defer: DeferQueue::new(),
            pubsub: pubsub::Registry::new(),
            lifecycle: lifecycle::Registry::new(),
            #[cfg(feature = "cluster")]
            cluster: crate::cluster::Cluster::new(),
            #[cfg(feature = "cluster")]
            cluster_interest: Mutex::new(HashMap::new()),
            #[cfg(feature = "cluster")]
            cluster_link_fd: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
            pending_connects: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            self_weak: weak.clone(),
            config,
        });
        runtime.lifecycle.fire(lifecycle::Event::OnInitialize);
        log::info!("reactium runtime initialized (fd_capacity={})", runtime.config.fd_capacity);
        Ok(runtime)
    }

    /// An owned handle to this runtime, for callbacks that need to outlive
    /// the call that spawned them (deferred tasks, connection handles).
    fn arc(&self) -> Arc<Runtime> {
        self.self_weak.upgrade().expect("runtime outlives its own handles")
    }

    /// Tears the runtime down: fires `AtExit`. Idempotent only in the
    /// sense that firing `AtExit` twice is the caller's mistake, not
    /// guarded against here.
    pub fn teardown(&self) {
        self.lifecycle.fire(lifecycle::Event::AtExit);
        log::info!("reactium runtime shut down");
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub fn fd_table(&self) -> &FdTable {
        &self.fd_table
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn defer(&self) -> &DeferQueue {
        &self.defer
    }

    pub fn pubsub(&self) -> &pubsub::Registry {
        &self.pubsub
    }

    pub fn lifecycle(&self) -> &lifecycle::Registry {
        &self.lifecycle
    }

    #[cfg(feature = "cluster")]
    pub fn cluster(&self) -> &crate::cluster::Cluster {
        &self.cluster
    }

    /// Adopts `link` as this worker's connection to its parent: wires it
    /// into the cluster fan-out path and registers its read side with the
    /// poller so inbound frames drive [`Runtime::process_cluster_frames`]
    /// from the reactor loop (spec.md §4.G: links are "set up at fork
    /// time", read the same as any other fd).
    #[cfg(feature = "cluster")]
    pub fn attach_cluster_parent(&self, link: Arc<crate::cluster::Link>) -> Result<()> {
        let fd = link.read_fd();
        self.poller.add(fd, Interest::READABLE)?;
        *self.cluster_link_fd.lock() = Some(fd);
        self.cluster.set_parent(link);
        Ok(())
    }

    /// Whether `fd` is the read side of this worker's cluster link, so the
    /// reactor loop can route its readiness events to
    /// [`Runtime::process_cluster_frames`] instead of the fd table.
    #[cfg(feature = "cluster")]
    pub(crate) fn is_cluster_fd(&self, fd: RawFd) -> bool {
        *self.cluster_link_fd.lock() == Some(fd)
    }

    /// Drains and applies every frame currently available on this worker's
    /// parent link: a `Publish` is delivered to local subscribers exactly
    /// as if it had been published with `Engine::Process` (it has already
    /// been routed here by the parent's relay, so it must not be
    /// forwarded again); `Shutdown` begins this worker's own graceful
    /// shutdown; `Ping` is a no-op keepalive.
    #[cfg(feature = "cluster")]
    pub(crate) fn process_cluster_frames(&self) {
        let link = match self.cluster.parent() {
            Some(link) => link,
            None => return,
        };
        let frames = match link.recv_available() {
            Ok(frames) => frames,
            Err(err) => {
                log::warn!("cluster link read failed: {err}");
                return;
            }
        };
        for frame in frames {
            match frame.frame_type {
                crate::cluster::FrameType::Publish => {
                    let _ = self.pubsub.publish(
                        &self.defer,
                        frame.filter,
                        &frame.channel,
                        frame.payload,
                        frame.is_json,
                        &Engine::Process,
                    );
                }
                crate::cluster::FrameType::Shutdown => {
                    log::info!("parent requested shutdown over the cluster link");
                    if !self.is_shutting_down() {
                        self.shutdown();
                    }
                }
                crate::cluster::FrameType::Ping => {}
                _ => {}
            }
        }
        if link.is_closed() {
            log::error!("cluster parent link closed; firing OnParentCrash");
            self.lifecycle.fire(lifecycle::Event::OnParentCrash);
        }
    }

    #[cfg(feature = "cluster")]
    fn notify_parent(&self, frame_type: crate::cluster::FrameType, channel: Vec<u8>) {
        if let Some(parent) = self.cluster.parent() {
            let frame = crate::cluster::Frame {
                frame_type,
                flags: crate::cluster::FrameFlags::empty(),
                filter: 0,
                is_json: false,
                channel,
                payload: Vec::new(),
            };
            let _ = parent.send(&frame);
        }
    }

    /// Subscribes to exact-match deliveries on `channel`, additionally
    /// telling the parent (when running under [`crate::cluster`]) to start
    /// forwarding publications on `channel` down to this worker (spec.md
    /// §4.G's mirror table).
    pub fn subscribe(&self, channel: &[u8], on_message: impl Fn(&Message) + Send + Sync + 'static) -> SubscriptionHandle {
        let handle = self.pubsub.subscribe(channel, on_message);
        #[cfg(feature = "cluster")]
        {
            self.cluster_interest.lock().insert(handle.id(), (false, channel.to_vec()));
            self.notify_parent(crate::cluster::FrameType::Subscribe, channel.to_vec());
        }
        handle
    }

    /// As [`Runtime::subscribe`], for glob patterns.
    pub fn psubscribe(&self, pattern: &[u8], on_message: impl Fn(&Message) + Send + Sync + 'static) -> Result<SubscriptionHandle> {
        let handle = self.pubsub.psubscribe(pattern, on_message)?;
        #[cfg(feature = "cluster")]
        {
            self.cluster_interest.lock().insert(handle.id(), (true, pattern.to_vec()));
            self.notify_parent(crate::cluster::FrameType::PSubscribe, pattern.to_vec());
        }
        Ok(handle)
    }

    /// Removes `handle`'s subscription, telling the parent to stop
    /// forwarding the matching channel/pattern down to this worker if this
    /// was the last local subscriber mirroring it.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.pubsub.unsubscribe(handle);
        #[cfg(feature = "cluster")]
        {
            if let Some((is_pattern, target)) = self.cluster_interest.lock().remove(&handle.id()) {
                let frame_type = if is_pattern {
                    crate::cluster::FrameType::PUnsubscribe
                } else {
                    crate::cluster::FrameType::Unsubscribe
                };
                self.notify_parent(frame_type, target);
            }
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub(crate) fn listeners(&self) -> &Mutex<HashMap<RawFd, Listener>> {
        &self.listeners
    }

    pub(crate) fn pending_connects(&self) -> &Mutex<HashMap<RawFd, PendingConnect>> {
        &self.pending_connects
    }

    /// Binds and listens on `addr`. Each accepted connection gets a fresh
    /// protocol from `protocol_factory` and `on_open` runs once it is
    /// registered in the fd table (spec.md §6 "Listen/connect entry
    /// points"). Failures are reported as `Err` instead of the C API's
    /// `-1` sentinel.
    pub fn listen(
        &self,
        addr: SocketAddr,
        protocol_factory: impl Fn() -> Arc<dyn Protocol> + Send + Sync + 'static,
        on_open: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Result<Uuid> {
        let fd = net::bind(addr)?;
        let local_addr = net::local_addr(fd).unwrap_or(addr);
        let uuid = match self.fd_table.open(fd) {
            Ok(uuid) => uuid,
            Err(err) => {
                crate::sys::unix::io::close(fd);
                return Err(err);
            }
        };
        self.poller.add(fd, Interest::READABLE)?;
        self.listeners.lock().insert(
            fd,
            Listener {
                fd,
                local_addr,
                protocol_factory: Arc::new(protocol_factory),
                on_open: Arc::new(on_open),
            },
        );
        log::debug!("listening on {local_addr}");
        Ok(uuid)
    }

    /// The address a listener is actually bound to - the only way to learn
    /// which port the kernel picked for a `listen` call made against port
    /// `0`.
    pub fn listener_local_addr(&self, uuid: Uuid) -> Option<SocketAddr> {
        self.listeners.lock().get(&uuid.fd()).map(|l| l.local_addr)
    }

    /// Starts a non-blocking connect to `addr`. `on_start` fires once the
    /// connect completes; `on_fail` fires if it fails or exceeds
    /// `timeout` first - the returned `Uuid` is not usable for I/O until
    /// one of them runs (spec.md §6: "becomes live only when on_connect/
    /// on_fail fires").
    pub fn connect(
        &self,
        addr: SocketAddr,
        protocol: Arc<dyn Protocol>,
        on_start: impl FnOnce(&Connection) + Send + 'static,
        on_fail: impl FnOnce() + Send + 'static,
        timeout: Duration,
    ) -> Result<Uuid> {
        let fd = net::connect(addr)?;
        let uuid = match self.fd_table.open(fd) {
            Ok(uuid) => uuid,
            Err(err) => {
                crate::sys::unix::io::close(fd);
                return Err(err);
            }
        };
        self.fd_table.attach(uuid, protocol)?;
        self.poller.add(fd, Interest::WRITABLE)?;

        self.pending_connects.lock().insert(
            fd,
            PendingConnect {
                uuid,
                on_start: Mutex::new(Some(Box::new(on_start))),
                on_fail: Mutex::new(Some(Box::new(on_fail))),
            },
        );

        let runtime = self.arc();
        self.defer.run_every(
            timeout,
            1,
            move || TimerControl::Cancel,
            move || runtime.fail_pending_connect(fd, uuid),
        );
        Ok(uuid)
    }

    /// Times out a still-pending connect. Checked against `expected_uuid`
    /// so a `fd` the kernel has since handed to an unrelated connection
    /// (connect succeeded/failed and the fd was reused before this timer
    /// fired) is left alone.
    fn fail_pending_connect(&self, fd: RawFd, expected_uuid: Uuid) {
        let mut guard = self.pending_connects.lock();
        if guard.get(&fd).map(|p| p.uuid) != Some(expected_uuid) {
            return;
        }
        let pending = guard.remove(&fd).unwrap();
        drop(guard);
        let _ = self.poller.remove(fd);
        let _ = self.fd_table.force_close(pending.uuid);
        if let Some(on_fail) = pending.on_fail.lock().take() {
            on_fail();
        }
    }

    /// Called by the reactor loop when a pending connect's fd becomes
    /// writable: distinguishes a completed connect from a failed one.
    pub(crate) fn complete_pending_connect(&self, fd: RawFd) {
        let pending = match self.pending_connects.lock().remove(&fd) {
            Some(p) => p,
            None => return,
        };
        match net::take_error(fd) {
            Ok(()) => {
                if let Ok(addr) = net::peer_addr(fd) {
                    let _ = self.fd_table.set_peer_addr(pending.uuid, addr);
                }
                let _ = self.poller.modify(fd, Interest::READABLE);
                if let Some(on_start) = pending.on_start.lock().take() {
                    let conn = Connection::new(self.arc(), pending.uuid);
                    on_start(&conn);
                }
            }
            Err(_) => {
                let _ = self.poller.remove(fd);
                let _ = self.fd_table.force_close(pending.uuid);
                if let Some(on_fail) = pending.on_fail.lock().take() {
                    on_fail();
                }
            }
        }
    }

    /// Accepts every pending connection on `listener_fd`, attaching a
    /// fresh protocol instance from its factory to each.
    pub(crate) fn accept_all(&self, listener_fd: RawFd) {
        let (factory, on_open) = match self.listeners.lock().get(&listener_fd) {
            Some(listener) => (listener.protocol_factory.clone(), listener.on_open.clone()),
            None => return,
        };
        loop {
            let (fd, peer_addr) = match net::accept(listener_fd) {
                Ok(pair) => pair,
                Err(err) if err.is_would_block() => break,
                Err(err) => {
                    log::warn!("accept on fd {listener_fd} failed: {err}");
                    break;
                }
            };
            let uuid = match self.fd_table.open(fd) {
                Ok(uuid) => uuid,
                Err(_) => {
                    crate::sys::unix::io::close(fd);
                    continue;
                }
            };
            let _ = self.fd_table.set_peer_addr(uuid, peer_addr);
            if self.fd_table.attach(uuid, factory()).is_err() {
                let _ = self.fd_table.force_close(uuid);
                continue;
            }
            if self.poller.add(fd, Interest::READABLE.add(Interest::WRITABLE)).is_err() {
                let _ = self.fd_table.force_close(uuid);
                continue;
            }
            let conn = Connection::new(self.arc(), uuid);
            on_open(&conn);
        }
    }

    /// Enqueues `packet` for `uuid` (spec.md §4.B), then attempts an
    /// immediate flush under the WRITE lock.
    ///
    /// Edge-triggered epoll (`sys::unix::epoll`'s `interests_to_epoll`
    /// always sets `EPOLLET`) delivers a writable edge exactly once per
    /// transition to writable - the one consumed by `accept_all`'s initial
    /// `READABLE|WRITABLE` registration, or by a prior flush. A packet
    /// enqueued afterward has no edge left to wait for, so this call
    /// cannot defer the flush to "whenever the reactor next sees the fd
    /// writable" the way a level-triggered poller could; it must try to
    /// send inline instead (facil.io's own convention: flush immediately,
    /// only arm for writability again on `EAGAIN`). See
    /// [`Runtime::flush_or_rearm`].
    pub fn write2(&self, uuid: Uuid, packet: Packet, urgent: bool) -> Result<()> {
        self.fd_table.write2(uuid, packet, urgent)?;
        self.flush_or_rearm(uuid);
        Ok(())
    }

    /// Drains `uuid`'s packet queue right now, under the WRITE lock. If
    /// the lock is contended (an `on_ready`/`ping` is already running) or
    /// the flush can't fully drain the queue before hitting `WouldBlock`,
    /// re-registers the fd so the next `Poller::wait` reports a fresh
    /// writable edge instead of leaving the remainder stranded until some
    /// other event happens to touch this fd.
    pub(crate) fn flush_or_rearm(&self, uuid: Uuid) {
        let slot = match self.fd_table.slot_for(uuid) {
            Some(slot) => slot,
            None => return,
        };
        if slot.packets().lock().pending() == 0 {
            return;
        }
        let guard = match slot.lock.try_write() {
            Some(guard) => guard,
            None => {
                let _ = self
                    .poller
                    .modify(uuid.fd(), Interest::READABLE.add(Interest::WRITABLE));
                return;
            }
        };
        let mut queue = slot.packets().lock();
        let hooks = slot.hooks();
        let result = queue.flush(uuid, &*hooks);
        let still_pending = queue.pending() > 0;
        drop(queue);
        drop(guard);
        match result {
            Ok(_) if still_pending => {
                let _ = self
                    .poller
                    .modify(uuid.fd(), Interest::READABLE.add(Interest::WRITABLE));
            }
            Ok(_) => {}
            Err(_) => {
                let _ = self.force_close(uuid);
            }
        }
    }

    /// Immediately tears a connection down, running `on_close` and
    /// removing it from the poller.
    pub fn force_close(&self, uuid: Uuid) -> Result<()> {
        let fd = uuid.fd();
        self.fd_table.force_close(uuid)?;
        let _ = self.poller.remove(fd);
        Ok(())
    }

    /// Finishes off every connection marked `closing` (by
    /// [`crate::fd_table::FdTable::close`]) whose packet queue has
    /// finished draining, calling [`Runtime::force_close`] on each
    /// (spec.md §4.A: "`close` marks closing; the reactor drains packets
    /// then calls `force_close`"). Called once per reactor iteration so a
    /// cooperative close completes as soon as its last write goes out,
    /// without waiting for the idle-timeout sweep's slower cadence.
    pub(crate) fn drain_closing_connections(&self) {
        for (_fd, uuid) in self.fd_table.iter_open().collect::<Vec<_>>() {
            let slot = match self.fd_table.slot_for(uuid) {
                Some(slot) => slot,
                None => continue,
            };
            if slot.is_closing() && slot.packets().lock().pending() == 0 {
                let _ = self.force_close(uuid);
            }
        }
    }

    /// Forces delivery of `event` on `uuid`, bypassing suspension
    /// (spec.md §8 scenario E6).
    pub fn force_event(&self, uuid: Uuid, event: ForcedEvent) -> Result<()> {
        let slot = self.fd_table.slot_for(uuid).ok_or_else(|| Error::new(ErrorKind::InvalidUuid))?;
        match event {
            ForcedEvent::OnData => {
                if let Some(protocol) = slot.protocol() {
                    if slot.try_mark_scheduled_on_data() {
                        let runtime = self.arc();
                        self.defer.defer(move || {
                            if let Ok(slot) = runtime.fd_table.validate(uuid) {
                                slot.clear_scheduled_on_data();
                                if let Some(guard) = slot.lock.try_task() {
                                    protocol.on_data(&Connection::new(runtime.arc(), uuid));
                                    drop(guard);
                                }
                            }
                        })?;
                    }
                }
            }
            ForcedEvent::OnReady => {
                if let Some(protocol) = slot.protocol() {
                    if slot.try_mark_scheduled_on_ready() {
                        let runtime = self.arc();
                        self.defer.defer(move || {
                            if let Ok(slot) = runtime.fd_table.validate(uuid) {
                                slot.clear_scheduled_on_ready();
                                if let Some(guard) = slot.lock.try_write() {
                                    protocol.on_ready(&Connection::new(runtime.arc(), uuid));
                                    drop(guard);
                                }
                            }
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Publishes `payload` on `channel` (spec.md §4.H). Local delivery is
    /// handled by [`pubsub::Registry::publish`]; this adds the cluster
    /// fan-out the registry itself has no link to perform.
    pub fn publish(
        &self,
        filter: i32,
        channel: &[u8],
        payload: Vec<u8>,
        is_json: bool,
        engine: Engine,
    ) -> Result<usize> {
        #[cfg(feature = "cluster")]
        {
            let wants_cluster_fanout = matches!(engine, Engine::Cluster | Engine::Siblings | Engine::Root);
            if wants_cluster_fanout {
                let siblings_only = matches!(engine, Engine::Siblings);
                let root_only = matches!(engine, Engine::Root);
                let frames = crate::cluster::Frame::split_publish(
                    filter,
                    channel.to_vec(),
                    payload.clone(),
                    is_json,
                    siblings_only,
                    root_only,
                );
                if matches!(engine, Engine::Root) {
                    if let Some(parent) = self.cluster.parent() {
                        for frame in &frames {
                            let _ = parent.send(frame);
                        }
                    }
                } else {
                    for frame in &frames {
                        self.cluster.broadcast(frame);
                    }
                }
            }
        }
        self.pubsub.publish(&self.defer, filter, channel, payload, is_json, &engine)
    }

    /// Drives the graceful shutdown sequence of spec.md §4.F: stop
    /// accepting, ask every open connection's protocol how it wants to
    /// wind down, wait up to the configured drain budget, then force-close
    /// whatever remains (255-tagged connections excluded from the drain
    /// and force-closed last).
    pub fn shutdown(&self) {
        use crate::protocol::ShutdownAction;
        use std::time::Instant;

        self.begin_shutdown();
        self.stop_accepting();
        for (_, listener) in self.listeners.lock().drain() {
            let _ = self.poller.remove(listener.fd);
            crate::sys::unix::io::close(listener.fd);
        }

        #[cfg(feature = "cluster")]
        {
            if let Some(fd) = self.cluster_link_fd.lock().take() {
                let _ = self.poller.remove(fd);
            }
            self.cluster.shutdown();
        }

        let mut ignored = Vec::new();
        let mut draining = Vec::new();
        for (_fd, uuid) in self.fd_table.iter_open().collect::<Vec<_>>() {
            let slot = match self.fd_table.slot_for(uuid) {
                Some(slot) => slot,
                None => continue,
            };
            let action = match slot.protocol() {
                Some(protocol) => protocol.on_shutdown(&Connection::new(self.arc(), uuid)),
                None => ShutdownAction::Close,
            };
            match action {
                ShutdownAction::Ignore => ignored.push(uuid),
                ShutdownAction::Close | ShutdownAction::Delay { .. } => draining.push(uuid),
            }
        }

        let deadline = Instant::now() + self.config.shutdown_drain_budget;
        while Instant::now() < deadline && !draining.is_empty() {
            draining.retain(|&uuid| {
                let slot = match self.fd_table.slot_for(uuid) {
                    Some(slot) => slot,
                    None => return false,
                };
                let mut queue = slot.packets().lock();
                !matches!(queue.flush(uuid, &*slot.hooks()), Ok(0))
            });
            if draining.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        // 255-tagged ("Ignore") connections are force-closed last, after
        // every draining connection has had its chance (spec.md §9's
        // resolution of the on_shutdown-return-value open question).
        for uuid in draining {
            let _ = self.force_close(uuid);
        }
        for uuid in ignored {
            let _ = self.force_close(uuid);
        }

        self.lifecycle.fire(lifecycle::Event::OnFinish);
    }
}
