// Not all helpers are used by every e2e test.
#![allow(dead_code)]

use reactium::{Reactor, Runtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    })
}

/// Drives `reactor.run_once()` on the calling thread until `done` reports
/// true or `timeout` elapses, returning whether `done` fired in time. Lets
/// these tests exercise the real six-step loop (spec.md §4.F) against real
/// sockets instead of reaching into `Runtime` internals.
pub fn drive_until(reactor: &Reactor, done: &AtomicBool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done.load(Ordering::Acquire) {
            return true;
        }
        let _ = reactor.run_once();
    }
    done.load(Ordering::Acquire)
}

/// As [`drive_until`], but spins a background thread that keeps calling
/// `run_once` until `stop` is set, for tests that need to block the main
/// thread on ordinary blocking I/O (e.g. `TcpStream::read`) while the
/// reactor keeps servicing events concurrently.
pub fn spawn_driver(runtime: Arc<Runtime>, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let reactor = Reactor::new(runtime);
        while !stop.load(Ordering::Acquire) {
            let _ = reactor.run_once();
        }
    })
}
