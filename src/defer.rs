//! Component D: the deferred-task queue and timer wheel (spec.md §4.D).
//!
//! The MPMC channel is `crossbeam_channel::unbounded`, grounded on the
//! pack's `mayastor`/`io-engine` `core/reactor.rs`, which uses exactly
//! `crossbeam::channel::{unbounded, Sender, Receiver}` to pass
//! `(fn, args)`-shaped work between cores.

use crate::error::{Error, ErrorKind, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type Task = Box<dyn FnOnce() + Send>;

/// A cheap, cloneable handle onto just the enqueue side of a
/// [`DeferQueue`], for callers (like [`crate::pubsub::Registry`]'s
/// per-subscription delivery retries) that need to re-enqueue work from
/// inside an already-running task without holding a borrow of the queue
/// itself.
pub(crate) type RawSender = Sender<Task>;

pub(crate) fn send_task(sender: &RawSender, task: impl FnOnce() + Send + 'static) {
    let _ = sender.send(Box::new(task));
}

/// What a periodic task returns to keep running or to stop itself early
/// (spec.md §4.D: "canceled by returning non-zero from the task").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerControl {
    Continue,
    Cancel,
}

type PeriodicTask = Box<dyn FnMut() -> TimerControl + Send>;
type OnFinish = Box<dyn FnOnce() + Send>;

struct Timer {
    deadline_ms: u64,
    interval_ms: u64,
    repetitions_left: u32, // 0 == forever
    task: PeriodicTask,
    on_finish: Option<OnFinish>,
    cancelled: Arc<AtomicBool>,
}

/// A handle that cancels a periodic task registered via
/// [`DeferQueue::run_every`]. Dropping the handle does *not* cancel the
/// timer; call [`TimerHandle::cancel`] explicitly.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct HeapEntry {
    deadline_ms: u64,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline_ms.cmp(&other.deadline_ms).then(self.seq.cmp(&other.seq))
    }
}

/// The MPMC task queue plus its timer wheel.
///
/// Enqueue (`defer`) is lock-free (a `crossbeam_channel` send); the timer
/// wheel itself is a small mutex-guarded binary heap, acceptable because
/// `run_every`/cancellation are orders of magnitude rarer than `defer`.
pub struct DeferQueue {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    timers: Mutex<(BinaryHeap<Reverse<HeapEntry>>, std::collections::HashMap<u64, Timer>)>,
    next_timer_seq: AtomicU64,
    idle_backoff: Mutex<Duration>,
    idle_cond: Condvar,
    idle_lock: Mutex<()>,
}

const MAX_BACKOFF: Duration = Duration::from_millis(4);

impl Default for DeferQueue {
    fn default() -> DeferQueue {
        let (sender, receiver) = crossbeam_channel::unbounded();
        DeferQueue {
            sender,
            receiver,
            timers: Mutex::new((BinaryHeap::new(), std::collections::HashMap::new())),
            next_timer_seq: AtomicU64::new(0),
            idle_backoff: Mutex::new(Duration::from_micros(50)),
            idle_cond: Condvar::new(),
            idle_lock: Mutex::new(()),
        }
    }
}

impl DeferQueue {
    pub fn new() -> DeferQueue {
        DeferQueue::default()
    }

    /// Non-blocking enqueue. FIFO within one producer thread; no ordering
    /// guarantee across producers (spec.md §4.D).
    pub fn defer(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.sender
            .send(Box::new(task))
            .map_err(|_| Error::new(ErrorKind::BufferFull))?;
        self.wake();
        Ok(())
    }

    /// Schedules a periodic task. `repetitions == 0` means forever.
    /// `on_finish` fires exactly once, whether the timer is canceled or
    /// exhausts its repetitions (spec.md §4.D), including when it errors
    /// out by returning [`TimerControl::Cancel`].
    pub fn run_every(
        &self,
        interval: Duration,
        repetitions: u32,
        task: impl FnMut() -> TimerControl + Send + 'static,
        on_finish: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TimerHandle {
            cancelled: cancelled.clone(),
        };
        let seq = self.next_timer_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = now_ms() + interval.as_millis() as u64;
        let timer = Timer {
            deadline_ms: deadline,
            interval_ms: interval.as_millis() as u64,
            repetitions_left: repetitions,
            task: Box::new(task),
            on_finish: Some(Box::new(on_finish)),
            cancelled,
        };
        let mut guard = self.timers.lock();
        guard.0.push(Reverse(HeapEntry {
            deadline_ms: deadline,
            seq,
        }));
        guard.1.insert(seq, timer);
        drop(guard);
        handle
    }

    /// Drains every task currently in the channel. Returns the number of
    /// tasks run. Safe to call from any thread, including concurrently
    /// from several reactor threads (spec.md §5: the defer queue "must
    /// tolerate enqueue from any thread").
    pub fn perform(&self) -> usize {
        let mut n = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            n += 1;
        }
        n
    }

    /// Runs every timer whose deadline has elapsed, rescheduling
    /// repeating ones and firing `on_finish` for any that are canceled or
    /// exhausted. Returns the earliest remaining deadline, if any, for
    /// the reactor's poll-timeout calculation.
    pub fn fire_due_timers(&self) -> Option<u64> {
        let now = now_ms();
        loop {
            let mut guard = self.timers.lock();
            let due = matches!(guard.0.peek(), Some(Reverse(e)) if e.deadline_ms <= now);
            if !due {
                return guard.0.peek().map(|Reverse(e)| e.deadline_ms);
            }
            let Reverse(entry) = guard.0.pop().unwrap();
            let mut timer = match guard.1.remove(&entry.seq) {
                Some(t) => t,
                None => continue, // already canceled and removed
            };
            drop(guard);

            if timer.cancelled.load(Ordering::Acquire) {
                if let Some(on_finish) = timer.on_finish.take() {
                    on_finish();
                }
                continue;
            }

            let control = (timer.task)();
            let exhausted = timer.repetitions_left == 1;
            if timer.repetitions_left > 0 {
                timer.repetitions_left -= 1;
            }
            let should_continue =
                control == TimerControl::Continue && !exhausted && !timer.cancelled.load(Ordering::Acquire);

            if should_continue {
                timer.deadline_ms = now_ms() + timer.interval_ms;
                let mut guard = self.timers.lock();
                guard.0.push(Reverse(HeapEntry {
                    deadline_ms: timer.deadline_ms,
                    seq: entry.seq,
                }));
                guard.1.insert(entry.seq, timer);
            } else if let Some(on_finish) = timer.on_finish.take() {
                on_finish();
            }
        }
    }

    /// Blocks the calling thread with a progressively-doubling backoff
    /// (capped at a few milliseconds) when there is no work - spec.md
    /// §4.D's "Throttling."
    pub fn idle_backoff(&self) {
        let mut backoff = self.idle_backoff.lock();
        let mut guard = self.idle_lock.lock();
        self.idle_cond.wait_for(&mut guard, *backoff);
        *backoff = (*backoff * 2).min(MAX_BACKOFF);
    }

    pub fn reset_backoff(&self) {
        *self.idle_backoff.lock() = Duration::from_micros(50);
    }

    pub(crate) fn raw_sender(&self) -> RawSender {
        self.sender.clone()
    }

    fn wake(&self) {
        self.idle_cond.notify_all();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn defer_runs_fifo_within_one_producer() {
        let queue = DeferQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            queue.defer(move || order.lock().push(i)).unwrap();
        }
        queue.perform();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn run_every_fires_on_finish_when_exhausted() {
        let queue = DeferQueue::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let ticks2 = ticks.clone();
        let finished2 = finished.clone();
        queue.run_every(
            Duration::from_millis(0),
            2,
            move || {
                ticks2.fetch_add(1, Ordering::SeqCst);
                TimerControl::Continue
            },
            move || finished2.store(true, Ordering::SeqCst),
        );
        // Two due-sweeps are required since each tick only becomes due
        // after its own interval elapses; with a zero interval both are
        // immediately due.
        queue.fire_due_timers();
        queue.fire_due_timers();
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelling_a_timer_fires_on_finish_without_further_ticks() {
        let queue = DeferQueue::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let ticks2 = ticks.clone();
        let finished2 = finished.clone();
        let handle = queue.run_every(
            Duration::from_millis(0),
            0,
            move || {
                ticks2.fetch_add(1, Ordering::SeqCst);
                TimerControl::Continue
            },
            move || finished2.store(true, Ordering::SeqCst),
        );
        handle.cancel();
        queue.fire_due_timers();
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert!(finished.load(Ordering::SeqCst));
    }
}
