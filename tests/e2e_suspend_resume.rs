//! E6 Suspend/resume (spec.md §8): `suspend` inside `on_data` stops
//! further readable events from scheduling `on_data`, until
//! `force_event(ON_DATA)` forces one through regardless.

mod util;

use reactium::{Connection, ForcedEvent, Protocol, ReactorConfig, Runtime, Uuid};
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct SuspendOnFirstByte {
    calls: Arc<AtomicUsize>,
    last_byte: Arc<Mutex<Option<u8>>>,
}

impl Protocol for SuspendOnFirstByte {
    fn on_data(&self, conn: &Connection) {
        let mut buf = [0u8; 16];
        if let Ok(n) = conn.read(&mut buf) {
            if n > 0 {
                *self.last_byte.lock().unwrap() = Some(buf[0]);
                let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if count == 1 {
                    conn.suspend().unwrap();
                }
            }
        }
    }
}

fn wait_for(predicate: impl Fn() -> bool, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn suspended_connection_ignores_readable_until_forced() {
    util::init();

    let runtime = Runtime::init(ReactorConfig::new()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let last_byte = Arc::new(Mutex::new(None));
    let calls_for_factory = calls.clone();
    let last_byte_for_factory = last_byte.clone();
    let opened: Arc<Mutex<Option<Uuid>>> = Arc::new(Mutex::new(None));
    let opened_for_open = opened.clone();

    let listener = runtime
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            move || {
                Arc::new(SuspendOnFirstByte {
                    calls: calls_for_factory.clone(),
                    last_byte: last_byte_for_factory.clone(),
                }) as Arc<dyn Protocol>
            },
            move |conn: &Connection| {
                *opened_for_open.lock().unwrap() = Some(conn.uuid());
            },
        )
        .unwrap();
    let addr = runtime.listener_local_addr(listener).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let driver = util::spawn_driver(runtime.clone(), stop.clone());

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"A").unwrap();

    wait_for(|| calls.load(Ordering::SeqCst) == 1, Duration::from_secs(5), "first on_data");
    assert_eq!(*last_byte.lock().unwrap(), Some(b'A'));

    let uuid = opened.lock().unwrap().expect("on_open ran");

    client.write_all(b"B").unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "suspended connection must not auto-schedule on_data");

    runtime.force_event(uuid, ForcedEvent::OnData).unwrap();
    wait_for(|| calls.load(Ordering::SeqCst) == 2, Duration::from_secs(5), "forced on_data");
    assert_eq!(*last_byte.lock().unwrap(), Some(b'B'));

    stop.store(true, Ordering::Release);
    driver.join().unwrap();
    drop(client);
}
