//! E1 Echo (spec.md §8): listen on a port, echo back whatever `on_data`
//! reads, and fire `on_close` exactly once when the client disconnects.

mod util;

use reactium::{Connection, Protocol, ReactorConfig, Runtime, Uuid};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Echo {
    closes: Arc<AtomicUsize>,
}

impl Protocol for Echo {
    fn on_data(&self, conn: &Connection) {
        let mut buf = [0u8; 1024];
        match conn.read(&mut buf) {
            Ok(0) => {
                let _ = conn.close();
            }
            Ok(n) => {
                let _ = conn.write(buf[..n].to_vec());
            }
            Err(err) if err.is_would_block() => {}
            Err(_) => {
                let _ = conn.force_close();
            }
        }
    }

    fn on_close(&self, _uuid: Uuid) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn echo_roundtrip_and_single_close() {
    util::init();

    let runtime = Runtime::init(ReactorConfig::new()).unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    let closes_for_factory = closes.clone();
    let listener = runtime
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            move || {
                Arc::new(Echo {
                    closes: closes_for_factory.clone(),
                }) as Arc<dyn Protocol>
            },
            |_conn| {},
        )
        .unwrap();
    let addr = runtime.listener_local_addr(listener).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let driver = util::spawn_driver(runtime.clone(), stop.clone());

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(b"HELLO").unwrap();

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"HELLO");

    drop(client);
    // Give the reactor a few iterations to notice EOF/hangup and fire
    // `on_close` before we check the counter.
    std::thread::sleep(Duration::from_millis(200));

    stop.store(true, Ordering::Release);
    driver.join().unwrap();

    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
