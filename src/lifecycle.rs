//! Component I: lifecycle and state callbacks (spec.md §4.I).
//!
//! The ordered event list and "fires in reverse registration order" rule
//! generalize the `ReactorState` enum shape used by the pack's
//! `mayastor`/`io-engine` `core/reactor.rs` (`Init`/`Running`/`Shutdown`/
//! `Delayed`) into the richer event list spec.md names.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One of the ordered lifecycle events of spec.md §4.I.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    OnInitialize,
    PreStart,
    BeforeFork,
    AfterForkParent,
    AfterForkChild,
    InChild,
    OnStart,
    OnIdle,
    OnShutdown,
    OnFinish,
    OnChildCrash,
    OnParentCrash,
    AtExit,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Registry of lifecycle callbacks, one process-wide instance owned by
/// [`crate::Runtime`].
#[derive(Default)]
pub struct Registry {
    callbacks: Mutex<HashMap<Event, Vec<Callback>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Appends a callback for `event`. Registrations made *during* a
    /// [`Registry::fire`] of the same event are not seen by that firing -
    /// `fire` snapshots the callback list before running any of them.
    pub fn on(&self, event: Event, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .entry(event)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Removes every callback registered for `event`.
    pub fn clear(&self, event: Event) {
        self.callbacks.lock().remove(&event);
    }

    /// Fires every callback registered for `event`, **in reverse
    /// registration order** (spec.md §4.I, Testable property 7).
    pub fn fire(&self, event: Event) {
        let snapshot: Vec<Callback> = self
            .callbacks
            .lock()
            .get(&event)
            .cloned()
            .unwrap_or_default();
        for callback in snapshot.iter().rev() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn fires_in_reverse_registration_order() {
        let registry = Registry::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let a = order.clone();
        registry.on(Event::OnStart, move || a.lock().unwrap().push('A'));
        let b = order.clone();
        registry.on(Event::OnStart, move || b.lock().unwrap().push('B'));
        let c = order.clone();
        registry.on(Event::OnStart, move || c.lock().unwrap().push('C'));

        registry.fire(Event::OnStart);
        assert_eq!(*order.lock().unwrap(), vec!['C', 'B', 'A']);
    }

    #[test]
    fn registration_during_firing_is_ignored_for_that_firing() {
        let registry = Arc::new(Registry::new());
        let order = Arc::new(StdMutex::new(Vec::new()));

        let registry2 = registry.clone();
        let order2 = order.clone();
        registry.on(Event::OnIdle, move || {
            order2.lock().unwrap().push('1');
            let order3 = order2.clone();
            registry2.on(Event::OnIdle, move || order3.lock().unwrap().push('2'));
        });

        registry.fire(Event::OnIdle);
        assert_eq!(*order.lock().unwrap(), vec!['1']);

        registry.fire(Event::OnIdle);
        assert_eq!(*order.lock().unwrap(), vec!['1', '2', '1']);
    }
}
