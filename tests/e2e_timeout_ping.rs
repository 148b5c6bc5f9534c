//! E2 Timeout ping (spec.md §8): once a connection's idle timeout
//! elapses, `ping` fires once per swept interval until `touch` resets it.

mod util;

use reactium::{Connection, Protocol, ReactorConfig, Runtime, Uuid};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Silent {
    pings: Arc<AtomicUsize>,
}

impl Protocol for Silent {
    fn ping(&self, _conn: &Connection) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn ping_fires_once_per_idle_interval_until_touched() {
    util::init();

    let runtime = Runtime::init(ReactorConfig::new()).unwrap();
    let pings = Arc::new(AtomicUsize::new(0));
    let pings_for_factory = pings.clone();
    let opened_uuid: Arc<Mutex<Option<Uuid>>> = Arc::new(Mutex::new(None));
    let opened_uuid_for_open = opened_uuid.clone();

    let listener = runtime
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            move || {
                Arc::new(Silent {
                    pings: pings_for_factory.clone(),
                }) as Arc<dyn Protocol>
            },
            move |conn: &Connection| {
                conn.set_timeout(1).unwrap();
                *opened_uuid_for_open.lock().unwrap() = Some(conn.uuid());
            },
        )
        .unwrap();
    let addr = runtime.listener_local_addr(listener).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let driver = util::spawn_driver(runtime.clone(), stop.clone());

    let client = TcpStream::connect(addr).unwrap();

    // Two of Reactor's 1-second sweeps plus slack: the idle timeout is 1
    // second, so this should observe at least two pings.
    std::thread::sleep(Duration::from_millis(2500));
    let after_idle = pings.load(Ordering::SeqCst);
    assert!(after_idle >= 2, "expected at least 2 pings while idle, got {after_idle}");

    let uuid = opened_uuid.lock().unwrap().expect("on_open ran");
    runtime.fd_table().touch(uuid).unwrap();

    // Immediately after touch, idle time resets below the 1-second
    // threshold, so a sweep landing right away should not add a ping.
    std::thread::sleep(Duration::from_millis(300));
    let just_after_touch = pings.load(Ordering::SeqCst);
    assert_eq!(just_after_touch, after_idle, "touch should suppress the next imminent sweep");

    stop.store(true, Ordering::Release);
    driver.join().unwrap();
    drop(client);
}
