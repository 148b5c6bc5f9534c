//! E3 Shutdown drain (spec.md §8): 10 MB queued before shutdown must be
//! fully delivered, within the drain budget, before the socket closes.

mod util;

use reactium::packet::Packet;
use reactium::{Connection, Protocol, ReactorConfig, Runtime, Uuid};
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const PAYLOAD_LEN: usize = 10 * 1024 * 1024;

struct Silent {
    closes: Arc<AtomicUsize>,
}

impl Protocol for Silent {
    fn on_close(&self, _uuid: Uuid) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn ten_megabytes_drain_fully_before_close() {
    util::init();

    let runtime = Runtime::init(ReactorConfig::new()).unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    let closes_for_factory = closes.clone();
    let opened: Arc<Mutex<Option<Uuid>>> = Arc::new(Mutex::new(None));
    let opened_for_open = opened.clone();

    let listener = runtime
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            move || {
                Arc::new(Silent {
                    closes: closes_for_factory.clone(),
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
    client.set_read_timeout(Some(Duration::from_secs(15))).unwrap();

    let reader = std::thread::spawn(move || {
        let mut total = 0usize;
        let mut buf = [0u8; 64 * 1024];
        loop {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => break,
            }
        }
        total
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let uuid = loop {
        if let Some(uuid) = *opened.lock().unwrap() {
            break uuid;
        }
        assert!(Instant::now() < deadline, "connection never reached on_open");
        std::thread::sleep(Duration::from_millis(5));
    };

    runtime
        .write2(uuid, Packet::memory(vec![0u8; PAYLOAD_LEN]), false)
        .unwrap();

    runtime.shutdown();

    stop.store(true, Ordering::Release);
    driver.join().unwrap();

    let total_received = reader.join().unwrap();
    assert_eq!(total_received, PAYLOAD_LEN);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
