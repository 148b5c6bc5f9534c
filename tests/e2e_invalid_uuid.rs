//! E5 Invalid UUID (spec.md §8): once a uuid is closed, `write2` against
//! it returns an error and the packet's `dealloc` still runs exactly once.

mod util;

use reactium::packet::Packet;
use reactium::{Connection, Protocol, ReactorConfig, Runtime, Uuid};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Silent;
impl Protocol for Silent {}

#[test]
fn write2_after_close_fails_and_runs_dealloc_once() {
    util::init();

    let runtime = Runtime::init(ReactorConfig::new()).unwrap();
    let opened: Arc<Mutex<Option<Uuid>>> = Arc::new(Mutex::new(None));
    let opened_for_open = opened.clone();

    let listener = runtime
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            || Arc::new(Silent) as Arc<dyn Protocol>,
            move |conn: &Connection| {
                *opened_for_open.lock().unwrap() = Some(conn.uuid());
            },
        )
        .unwrap();
    let addr = runtime.listener_local_addr(listener).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let driver = util::spawn_driver(runtime.clone(), stop.clone());

    let client = TcpStream::connect(addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let uuid = loop {
        if let Some(uuid) = *opened.lock().unwrap() {
            break uuid;
        }
        assert!(Instant::now() < deadline, "connection never reached on_open");
        std::thread::sleep(Duration::from_millis(5));
    };

    // Cooperative close with nothing queued drains immediately.
    runtime.fd_table().close(uuid).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while runtime.fd_table().validate(uuid).is_ok() {
        assert!(Instant::now() < deadline, "close(u) never completed");
        std::thread::sleep(Duration::from_millis(5));
    }

    let dealloc_ran = Arc::new(AtomicUsize::new(0));
    let dealloc_ran2 = dealloc_ran.clone();
    let packet = Packet::memory_with_dealloc(vec![1, 2, 3], move || {
        dealloc_ran2.fetch_add(1, Ordering::SeqCst);
    });
    let result = runtime.write2(uuid, packet, false);
    assert!(result.is_err());
    assert_eq!(dealloc_ran.load(Ordering::SeqCst), 1);

    stop.store(true, Ordering::Release);
    driver.join().unwrap();
    drop(client);
}
