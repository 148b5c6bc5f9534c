//! E4 Cluster publish (spec.md §8): with 2 workers, a subscription in
//! worker 1 to channel `"x"` receives a worker-2 publish made with
//! `engine=Cluster`; worker 2 has no local subscriber of its own, so its
//! own publish never loops back to it.
//!
//! Run with `cargo test --features cluster`. Rather than forking real
//! child processes (which `WorkerPool::run_clustered` does in
//! production), this drives the same [`reactium::cluster::ClusterRelay`]
//! in-process over a pair of [`reactium::cluster::Link`]s, so the test
//! stays deterministic.
#![cfg(feature = "cluster")]

mod util;

use reactium::cluster::{ClusterRelay, Link};
use reactium::{Engine, ReactorConfig, Runtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn wait_for(predicate: impl Fn() -> bool, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn cluster_publish_reaches_only_the_subscribed_worker() {
    util::init();

    let runtime1 = Runtime::init(ReactorConfig::new()).unwrap();
    let runtime2 = Runtime::init(ReactorConfig::new()).unwrap();

    let (parent_link1, worker_link1) = Link::pair().unwrap();
    let (parent_link2, worker_link2) = Link::pair().unwrap();
    runtime1.attach_cluster_parent(Arc::new(worker_link1)).unwrap();
    runtime2.attach_cluster_parent(Arc::new(worker_link2)).unwrap();
    let relay = Arc::new(ClusterRelay::new(vec![Arc::new(parent_link1), Arc::new(parent_link2)]));

    let stop = Arc::new(AtomicBool::new(false));
    let driver1 = util::spawn_driver(runtime1.clone(), stop.clone());
    let driver2 = util::spawn_driver(runtime2.clone(), stop.clone());
    let relay_for_thread = relay.clone();
    let stop_for_relay = stop.clone();
    let relay_thread = std::thread::spawn(move || {
        while !stop_for_relay.load(Ordering::Acquire) {
            relay_for_thread.tick();
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    let worker1_received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let worker1_received_for_cb = worker1_received.clone();
    runtime1.subscribe(b"x", move |msg| {
        worker1_received_for_cb.lock().unwrap().push(msg.payload().to_vec());
    });

    // Give the relay time to learn worker 1's interest in "x" before
    // worker 2 publishes - it only finds out via the Subscribe frame
    // worker 1's own `subscribe` call just sent up its link.
    std::thread::sleep(Duration::from_millis(200));

    runtime2
        .publish(0, b"x", b"hello from worker 2".to_vec(), false, Engine::Cluster)
        .unwrap();

    wait_for(
        || !worker1_received.lock().unwrap().is_empty(),
        Duration::from_secs(5),
        "worker 1 to receive the cluster publish",
    );
    assert_eq!(worker1_received.lock().unwrap()[0], b"hello from worker 2");

    stop.store(true, Ordering::Release);
    driver1.join().unwrap();
    driver2.join().unwrap();
    relay_thread.join().unwrap();
}
