//! Component H: the pub/sub registry (spec.md §4.H).

mod message;
pub(crate) mod pattern;

pub use message::Message;

use crate::defer::DeferQueue;
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Where a publication should be routed (spec.md §4.H).
pub enum Engine {
    /// Local delivery plus cluster fan-out via Component G.
    Cluster,
    /// Cluster fan-out only; the publishing process does not deliver to
    /// its own local subscribers.
    Siblings,
    /// The current process only.
    Process,
    /// The parent process only (workers forward up, never sideways).
    Root,
    /// A user-supplied delivery mechanism, given `(channel, message,
    /// is_json)` and responsible for delivering it itself.
    Custom(Arc<dyn Fn(&[u8], &[u8], bool) + Send + Sync>),
}

type OnMessage = Arc<dyn Fn(&Message) + Send + Sync>;
type MetadataFn = Box<dyn Fn(&Message) + Send + Sync>;

thread_local! {
    /// Debug-build reentrancy guard: a custom [`Engine`] callback that
    /// turns around and publishes again, synchronously, on the same
    /// thread is a bug (spec.md §9's "engine reentrancy hazard") - the
    /// correct way to chain a publication from inside delivery is to
    /// `defer` it. Only asserted in debug builds to keep release-mode
    /// delivery free of the counter's overhead.
    static REENTRANCY_DEPTH: Cell<u32> = Cell::new(0);
}

struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter() -> ReentrancyGuard {
        REENTRANCY_DEPTH.with(|depth| {
            let d = depth.get();
            debug_assert!(d == 0, "publish() called reentrantly from delivery; use defer() instead");
            depth.set(d + 1);
        });
        ReentrancyGuard
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        REENTRANCY_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// One subscription: either a plain channel subscription, a pattern
/// subscription, or a filter subscription, distinguished by which table
/// of [`Registry`] holds it.
///
/// `delivering` and `in_flight` together enforce spec.md §4.H invariant 5:
/// `on_message` never runs concurrently with itself, and `on_unsubscribe`
/// fires exactly once, after the last in-flight delivery completes.
/// `in_flight` is incremented at match time (inside [`Registry::matched_subscriptions`]'s
/// read-lock scope) and decremented once a delivery attempt actually runs
/// `on_message` (or finds itself cancelled); `delivering` is a one-at-a-time
/// admission gate a contending delivery task re-defers behind rather than
/// blocking on.
pub struct Subscription {
    id: u64,
    pattern: Option<Box<[u8]>>,
    on_message: OnMessage,
    cancelled: Arc<AtomicBool>,
    delivering: AtomicBool,
    in_flight: AtomicU64,
    on_unsubscribe: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Cancels this subscription. Already-enqueued delivery tasks check
    /// [`Subscription::cancelled`] before invoking `on_message` rather
    /// than being revoked outright (spec.md §4.H).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fires `on_unsubscribe` if it is still armed, exactly once
    /// (subsequent calls are no-ops via `Option::take`).
    fn fire_on_unsubscribe(&self) {
        if let Some(f) = self.on_unsubscribe.lock().take() {
            f();
        }
    }

    /// Runs one queued delivery attempt: admits at most one concurrent
    /// `on_message` per subscription, re-deferring itself on `sender`
    /// (without touching `in_flight`, since the attempt hasn't completed,
    /// just been postponed) if another delivery already holds the gate.
    fn deliver(self: &Arc<Self>, sender: &crate::defer::RawSender, message: Message) {
        if self.delivering.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            let sub = self.clone();
            let sender = sender.clone();
            crate::defer::send_task(&sender, move || sub.deliver(&sender, message));
            return;
        }
        if !self.is_cancelled() {
            (self.on_message)(&message);
        }
        self.delivering.store(false, Ordering::Release);
        self.finish_one_delivery();
    }

    fn finish_one_delivery(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 && self.is_cancelled() {
            self.fire_on_unsubscribe();
        }
    }
}

/// A handle returned by [`Registry::subscribe`]/[`Registry::psubscribe`]/
/// [`Registry::subscribe_filter`] used to unsubscribe later and to arm an
/// `on_unsubscribe` callback.
#[derive(Clone)]
pub struct SubscriptionHandle {
    sub: Arc<Subscription>,
}

impl SubscriptionHandle {
    /// The id [`Registry`] allocated for this subscription - stable for its
    /// lifetime, used by [`crate::Runtime`] to key its cluster-interest
    /// side table (which channel/pattern each subscription mirrors to the
    /// parent over the cluster link).
    pub fn id(&self) -> u64 {
        self.sub.id
    }

    pub fn cancel(&self) {
        self.sub.cancel();
    }

    /// Arms `f` to run exactly once, after `unsubscribe` has been called
    /// *and* every delivery already in flight for this subscription has
    /// completed (spec.md §4.H invariant 5). If both conditions are
    /// already true by the time this is called, `f` runs immediately.
    pub fn on_unsubscribe(&self, f: impl FnOnce() + Send + 'static) {
        *self.sub.on_unsubscribe.lock() = Some(Box::new(f));
        if self.sub.is_cancelled() && self.sub.in_flight.load(Ordering::Acquire) == 0 {
            self.sub.fire_on_unsubscribe();
        }
    }
}

#[derive(Default)]
struct Channel {
    subscribers: Vec<Arc<Subscription>>,
}

/// The pub/sub registry, one instance per [`crate::Runtime`].
///
/// Grounded on the same "register callback, fire later through the defer
/// queue" shape as [`crate::lifecycle::Registry`], extended with the
/// channel/pattern/filter routing spec.md §4.H specifies.
pub struct Registry {
    channels: RwLock<HashMap<Box<[u8]>, Channel>>,
    patterns: RwLock<Vec<Arc<Subscription>>>,
    filters: RwLock<HashMap<i32, Vec<Arc<Subscription>>>>,
    metadata_fns: Mutex<Vec<MetadataFn>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Registry {
        Registry {
            channels: RwLock::new(HashMap::new()),
            patterns: RwLock::new(Vec::new()),
            filters: RwLock::new(HashMap::new()),
            metadata_fns: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn new_subscription(&self, pattern: Option<Box<[u8]>>, on_message: OnMessage) -> Arc<Subscription> {
        Arc::new(Subscription {
            id: self.alloc_id(),
            pattern,
            on_message,
            cancelled: Arc::new(AtomicBool::new(false)),
            delivering: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            on_unsubscribe: Mutex::new(None),
        })
    }

    /// Subscribes to exact-match deliveries on `channel`.
    pub fn subscribe(
        &self,
        channel: &[u8],
        on_message: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let sub = self.new_subscription(None, Arc::new(on_message));
        let handle = SubscriptionHandle { sub: sub.clone() };
        self.channels
            .write()
            .entry(channel.to_vec().into_boxed_slice())
            .or_default()
            .subscribers
            .push(sub);
        handle
    }

    /// Subscribes to every channel matching the glob `pattern` (spec.md
    /// §4.H "Channel matching").
    pub fn psubscribe(
        &self,
        pattern: &[u8],
        on_message: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        // Validate eagerly so a malformed pattern is rejected at
        // subscribe time rather than silently never matching.
        pattern::glob_match(pattern, b"")?;
        let sub = self.new_subscription(Some(pattern.to_vec().into_boxed_slice()), Arc::new(on_message));
        let handle = SubscriptionHandle { sub: sub.clone() };
        self.patterns.write().push(sub);
        Ok(handle)
    }

    /// Subscribes to a process-local integer `filter`, bypassing channel
    /// matching entirely (spec.md §4.H "Filter vs channel").
    pub fn subscribe_filter(
        &self,
        filter: i32,
        on_message: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let sub = self.new_subscription(None, Arc::new(on_message));
        let handle = SubscriptionHandle { sub: sub.clone() };
        self.filters.write().entry(filter).or_default().push(sub);
        handle
    }

    /// Removes `handle`'s subscription from every table it could be in and
    /// cancels it. `on_unsubscribe` (if armed) fires from here only when no
    /// delivery is currently in flight for it; otherwise the delivery that
    /// brings `in_flight` to zero fires it instead (spec.md §4.H invariant
    /// 5).
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let id = handle.sub.id;
        handle.cancel();
        self.channels.write().retain(|_, chan| {
            chan.subscribers.retain(|s| s.id != id);
            true
        });
        self.patterns.write().retain(|s| s.id != id);
        self.filters.write().retain(|_, subs| {
            subs.retain(|s| s.id != id);
            true
        });
        if handle.sub.in_flight.load(Ordering::Acquire) == 0 {
            handle.sub.fire_on_unsubscribe();
        }
    }

    /// Registers a `metadata_fn`, invoked once per publication before
    /// delivery, in registration order (spec.md §4.H "Metadata").
    pub fn register_metadata_fn(&self, f: impl Fn(&Message) + Send + Sync + 'static) {
        self.metadata_fns.lock().push(Box::new(f));
    }

    /// Collects every subscription a publication on `(filter, channel)`
    /// should reach, incrementing each one's `in_flight` count before it is
    /// released from the lock that's keeping `unsubscribe` from dropping it
    /// out from under this selection (spec.md §4.H invariant 5).
    fn matched_subscriptions(&self, filter: i32, channel: &[u8]) -> Vec<Arc<Subscription>> {
        let matched = if filter != 0 {
            self.filters.read().get(&filter).cloned().unwrap_or_default()
        } else {
            let mut matched = Vec::new();
            if let Some(chan) = self.channels.read().get(channel) {
                matched.extend(chan.subscribers.iter().cloned());
            }
            for sub in self.patterns.read().iter() {
                let pattern = sub.pattern.as_deref().unwrap_or_default();
                if pattern::glob_match(pattern, channel).unwrap_or(false) {
                    matched.push(sub.clone());
                }
            }
            matched
        };
        for sub in &matched {
            sub.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        matched
    }

    /// Publishes `payload` on `channel`. Local delivery (when `engine`
    /// calls for it) is dispatched as deferred tasks on `defer`; cluster
    /// fan-out is the caller's responsibility (normally
    /// [`crate::Runtime::publish`], which also owns the [`crate::cluster::Cluster`]
    /// link this registry has no handle to).
    pub fn publish(
        &self,
        defer: &DeferQueue,
        filter: i32,
        channel: &[u8],
        payload: Vec<u8>,
        is_json: bool,
        engine: &Engine,
    ) -> Result<usize> {
        let _guard = ReentrancyGuard::enter();

        if let Engine::Custom(callback) = engine {
            callback(channel, &payload, is_json);
            return Ok(0);
        }
        if matches!(engine, Engine::Root) {
            // Routing to the parent is Runtime's job (it owns the
            // cluster link); the registry itself has no local
            // subscribers to notify for a ROOT-only publish.
            return Ok(0);
        }
        if matches!(engine, Engine::Siblings) {
            return Ok(0);
        }

        let message = Message::new(channel.to_vec(), payload, is_json);
        for metadata_fn in self.metadata_fns.lock().iter() {
            metadata_fn(&message);
        }

        let matched = self.matched_subscriptions(filter, channel);
        let count = matched.len();
        let sender = defer.raw_sender();
        for sub in matched {
            let message = message.clone();
            let sender = sender.clone();
            defer.defer(move || sub.deliver(&sender, message))?;
        }
        Ok(count)
    }

    /// Re-queues the delivery of `message` without consuming any retry
    /// budget (spec.md §4.H "Message-defer"). Intended to be called from
    /// within an `on_message` callback that wants to wait for a resource.
    pub fn message_defer(&self, defer: &DeferQueue, message: Message, on_message: impl Fn(&Message) + Send + Sync + 'static) -> Result<()> {
        defer.defer(move || on_message(&message))
    }
}

/// Retrieves the metadata record attached to `message` under `type_id`,
/// if any (spec.md §4.H "Metadata": `message_metadata(msg, type_id)`).
pub fn message_metadata<F, R>(message: &Message, type_id: u32, f: F) -> Option<R>
where
    F: FnOnce(&(dyn Any + Send)) -> R,
{
    message.with_metadata(type_id, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn exact_channel_subscription_receives_its_publication() {
        let registry = Registry::new();
        let defer = DeferQueue::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        registry.subscribe(b"news.weather", move |msg| {
            r.lock().push(msg.payload().to_vec());
        });
        registry
            .publish(&defer, 0, b"news.weather", b"sunny".to_vec(), false, &Engine::Process)
            .unwrap();
        defer.perform();
        assert_eq!(*received.lock(), vec![b"sunny".to_vec()]);
    }

    #[test]
    fn pattern_subscription_matches_glob() {
        let registry = Registry::new();
        let defer = DeferQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        registry
            .psubscribe(b"news.*", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        registry
            .publish(&defer, 0, b"news.weather", Vec::new(), false, &Engine::Process)
            .unwrap();
        defer.perform();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_subscription_is_skipped_even_if_already_queued() {
        let registry = Registry::new();
        let defer = DeferQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = registry.subscribe(b"c", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        registry
            .publish(&defer, 0, b"c", Vec::new(), false, &Engine::Process)
            .unwrap();
        handle.cancel();
        defer.perform();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn on_unsubscribe_fires_once_after_last_in_flight_delivery() {
        let registry = Registry::new();
        let defer = DeferQueue::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        let handle = registry.subscribe(b"c", move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..3 {
            registry.publish(&defer, 0, b"c", Vec::new(), false, &Engine::Process).unwrap();
        }
        // Unsubscribing while 3 deliveries are still queued must not fire
        // `on_unsubscribe` until all 3 have run.
        registry.unsubscribe(&handle);
        let u = unsubscribed.clone();
        handle.on_unsubscribe(move || {
            u.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 0);
        defer.perform();
        assert_eq!(delivered.load(Ordering::SeqCst), 0, "unsubscribe cancels delivery of still-queued messages");
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);

        // Calling it twice never double-fires.
        handle.on_unsubscribe(|| panic!("on_unsubscribe must not be re-armable after it already fired"));
    }

    #[test]
    fn on_message_never_runs_concurrently_with_itself() {
        use std::thread;
        use std::time::Duration as StdDuration;

        let registry = Arc::new(Registry::new());
        let defer = Arc::new(DeferQueue::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let c = concurrent.clone();
        let m = max_concurrent.clone();
        registry.subscribe(b"c", move |_| {
            let now = c.fetch_add(1, Ordering::SeqCst) + 1;
            m.fetch_max(now, Ordering::SeqCst);
            thread::sleep(StdDuration::from_millis(5));
            c.fetch_sub(1, Ordering::SeqCst);
        });
        for _ in 0..8 {
            registry.publish(&defer, 0, b"c", Vec::new(), false, &Engine::Process).unwrap();
        }
        let mut threads = Vec::new();
        for _ in 0..4 {
            let defer = defer.clone();
            threads.push(thread::spawn(move || {
                for _ in 0..50 {
                    defer.perform();
                    thread::sleep(StdDuration::from_millis(1));
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn filter_subscription_bypasses_channel_matching() {
        let registry = Registry::new();
        let defer = DeferQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        registry.subscribe_filter(42, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        registry
            .publish(&defer, 42, b"irrelevant", Vec::new(), false, &Engine::Process)
            .unwrap();
        defer.perform();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metadata_attached_before_delivery_is_visible_to_subscribers() {
        let registry = Registry::new();
        let defer = DeferQueue::new();
        registry.register_metadata_fn(|msg| {
            msg.attach_metadata(1, Box::new(7u32), |_| {});
        });
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        registry.subscribe(b"c", move |msg| {
            let value = message_metadata(msg, 1, |record| *record.downcast_ref::<u32>().unwrap());
            *seen2.lock() = value;
        });
        registry
            .publish(&defer, 0, b"c", Vec::new(), false, &Engine::Process)
            .unwrap();
        defer.perform();
        assert_eq!(*seen.lock(), Some(7));
    }
}
