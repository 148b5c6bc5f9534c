//! Component G: cluster IPC (spec.md §4.G).
//!
//! A worker talks to its parent (and, transitively, its siblings) over a
//! pair of non-blocking pipes set up at fork time, exchanging the framed
//! messages of [`frame`]. This mirrors the pack's `mayastor`/`io-engine`
//! reactor-to-reactor messaging in spirit (an mpmc hand-off queue per
//! peer) while using the pipe/frame transport spec.md's Non-goals require
//! (no shared-memory IPC).

mod frame;

pub use frame::{Frame, FrameFlags, FrameType, MAX_PAYLOAD};

use crate::error::{Error, ErrorKind, Result};
use crate::sys::unix::io;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which side of a parent/worker pipe pair this link represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Worker,
}

/// One non-blocking pipe pair plus the partial-frame reassembly buffer for
/// it. Owned by [`crate::Runtime`] when `cluster` mode is active.
pub struct Link {
    role: Role,
    read_fd: RawFd,
    write_fd: RawFd,
    recv_buf: Mutex<Vec<u8>>,
    reassembling: Mutex<Option<Frame>>,
    closed: AtomicBool,
}

impl Link {
    /// Creates a connected parent/worker pipe pair (spec.md §4.G: "set up
    /// at fork time"). Returns `(parent_link, worker_link)`; the caller is
    /// expected to `fork` between constructing this pair and using either
    /// half, handing the worker half to the child.
    pub fn pair() -> Result<(Link, Link)> {
        // `io::pipe` already returns a non-blocking, close-on-exec pipe.
        let (parent_read, worker_write) = io::pipe()?;
        let (worker_read, parent_write) = io::pipe()?;
        Ok((
            Link {
                role: Role::Parent,
                read_fd: parent_read,
                write_fd: parent_write,
                recv_buf: Mutex::new(Vec::new()),
                reassembling: Mutex::new(None),
                closed: AtomicBool::new(false),
            },
            Link {
                role: Role::Worker,
                read_fd: worker_read,
                write_fd: worker_write,
                recv_buf: Mutex::new(Vec::new()),
                reassembling: Mutex::new(None),
                closed: AtomicBool::new(false),
            },
        ))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Sends `frame`, splitting oversized publishes into continuation
    /// frames internally via [`Frame::split_publish`] before calling this
    /// (a plain `send` here writes exactly one wire frame).
    pub fn send(&self, frame: &Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::ClusterIpcFailure));
        }
        let bytes = frame.encode();
        let mut written = 0;
        while written < bytes.len() {
            match io::write(self.write_fd, &bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.is_would_block() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads whatever is available from the pipe, decodes every complete
    /// wire frame it now holds, and reassembles `CONTINUATION`-chunked
    /// publishes (spec.md §6) back into the single logical [`Frame`]
    /// [`Frame::split_publish`] fragmented on the sending side. Returns an
    /// empty vec (not an error) on `WouldBlock` - the poller is expected
    /// to have signalled readability already.
    pub fn recv_available(&self) -> Result<Vec<Frame>> {
        let mut chunk = [0u8; 64 * 1024];
        let mut buf = self.recv_buf.lock();
        loop {
            match io::read(self.read_fd, &mut chunk) {
                Ok(0) => {
                    self.closed.store(true, Ordering::Release);
                    break;
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.is_would_block() => break,
                Err(e) => return Err(e),
            }
        }
        let mut raw = Vec::new();
        let mut offset = 0;
        while let Some((frame, consumed)) = Frame::decode(&buf[offset..])? {
            raw.push(frame);
            offset += consumed;
        }
        buf.drain(..offset);
        drop(buf);

        let mut out = Vec::with_capacity(raw.len());
        let mut pending = self.reassembling.lock();
        for frame in raw {
            if frame.flags.contains(FrameFlags::CONTINUATION) {
                match pending.as_mut() {
                    Some(acc) => acc.payload.extend_from_slice(&frame.payload),
                    None => *pending = Some(frame),
                }
            } else if let Some(mut acc) = pending.take() {
                acc.payload.extend_from_slice(&frame.payload);
                out.push(acc);
            } else {
                out.push(frame);
            }
        }
        Ok(out)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            io::close(self.read_fd);
            io::close(self.write_fd);
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

/// The set of peer links a worker process holds: one to its parent, and
/// (in a flat cluster topology) one to each sibling it has been introduced
/// to. [`crate::Runtime`] fans a local publish out across all of these
/// when the publish [`crate::pubsub::Engine`] requests cluster delivery.
#[derive(Default)]
pub struct Cluster {
    parent: Mutex<Option<Arc<Link>>>,
    siblings: Mutex<Vec<Arc<Link>>>,
}

impl Cluster {
    pub fn new() -> Cluster {
        Cluster::default()
    }

    pub fn set_parent(&self, link: Arc<Link>) {
        *self.parent.lock() = Some(link);
    }

    pub fn add_sibling(&self, link: Arc<Link>) {
        self.siblings.lock().push(link);
    }

    pub fn parent(&self) -> Option<Arc<Link>> {
        self.parent.lock().clone()
    }

    pub fn siblings(&self) -> Vec<Arc<Link>> {
        self.siblings.lock().clone()
    }

    /// Broadcasts `frame` to the parent (if any) and to every sibling,
    /// dropping links whose peer has gone away rather than failing the
    /// whole broadcast (spec.md §4.G: a dead peer does not stall a
    /// publish to the rest of the cluster).
    pub fn broadcast(&self, frame: &Frame) {
        if let Some(parent) = self.parent() {
            if parent.send(frame).is_err() {
                parent.close();
            }
        }
        let mut siblings = self.siblings.lock();
        siblings.retain(|link| match link.send(frame) {
            Ok(()) => true,
            Err(_) => {
                link.close();
                false
            }
        });
    }

    /// Sends a `Shutdown` frame to every peer, then closes the links. Part
    /// of the reactor shutdown sequence (spec.md §4.F step d).
    pub fn shutdown(&self) {
        let shutdown_frame = Frame {
            frame_type: FrameType::Shutdown,
            flags: FrameFlags::empty(),
            filter: 0,
            is_json: false,
            channel: Vec::new(),
            payload: Vec::new(),
        };
        self.broadcast(&shutdown_frame);
        if let Some(parent) = self.parent() {
            parent.close();
        }
        for sibling in self.siblings.lock().drain(..) {
            sibling.close();
        }
    }
}

/// Runs in the parent process (which has no [`crate::Runtime`] of its own)
/// to fan publishes out across workers: a mirror subscription table,
/// populated from `Subscribe`/`Unsubscribe`/`PSubscribe`/`PUnsubscribe`
/// frames each worker sends up over its link, used only to decide which
/// other workers a given `Publish` should be forwarded to (spec.md §4.G).
///
/// `ROOT_ONLY`-flagged publishes (spec.md §4.H's `Engine::Root`) are
/// consumed here and never forwarded further - this crate's parent process
/// runs no pub/sub registry of its own, so a root-scoped publish has
/// nowhere further to go once it reaches the relay.
pub struct ClusterRelay {
    links: Vec<Arc<Link>>,
    channels: Mutex<std::collections::HashMap<Box<[u8]>, std::collections::HashSet<usize>>>,
    patterns: Mutex<Vec<(usize, Box<[u8]>)>>,
}

impl ClusterRelay {
    pub fn new(links: Vec<Arc<Link>>) -> ClusterRelay {
        ClusterRelay {
            links,
            channels: Mutex::new(std::collections::HashMap::new()),
            patterns: Mutex::new(Vec::new()),
        }
    }

    /// Drains every still-open child link once. Cheap to call on a tight
    /// loop; each link only yields frames once its pipe has data.
    pub fn tick(&self) {
        for idx in 0..self.links.len() {
            let link = self.links[idx].clone();
            if link.is_closed() {
                continue;
            }
            let frames = match link.recv_available() {
                Ok(frames) => frames,
                Err(err) => {
                    log::warn!("cluster relay: reading worker {idx}'s link failed: {err}");
                    continue;
                }
            };
            for frame in frames {
                self.handle(idx, frame);
            }
        }
    }

    fn handle(&self, idx: usize, frame: Frame) {
        match frame.frame_type {
            FrameType::Subscribe => {
                self.channels
                    .lock()
                    .entry(frame.channel.clone().into_boxed_slice())
                    .or_default()
                    .insert(idx);
            }
            FrameType::Unsubscribe => {
                if let Some(set) = self.channels.lock().get_mut(frame.channel.as_slice()) {
                    set.remove(&idx);
                }
            }
            FrameType::PSubscribe => {
                self.patterns.lock().push((idx, frame.channel.clone().into_boxed_slice()));
            }
            FrameType::PUnsubscribe => {
                self.patterns
                    .lock()
                    .retain(|(worker, pattern)| !(*worker == idx && pattern.as_ref() == frame.channel.as_slice()));
            }
            FrameType::Publish => self.forward_publish(idx, frame),
            FrameType::Shutdown | FrameType::Ping => {}
        }
    }

    fn forward_publish(&self, from: usize, frame: Frame) {
        if frame.flags.contains(FrameFlags::ROOT_ONLY) {
            log::debug!("cluster relay: dropping root-scoped publish from worker {from}, no root handler");
            return;
        }
        let mut targets: std::collections::HashSet<usize> = std::collections::HashSet::new();
        if let Some(set) = self.channels.lock().get(frame.channel.as_slice()) {
            targets.extend(set.iter().copied());
        }
        for (worker, pattern) in self.patterns.lock().iter() {
            if crate::pubsub::pattern::glob_match(pattern, &frame.channel).unwrap_or(false) {
                targets.insert(*worker);
            }
        }
        targets.remove(&from);
        for target in targets {
            if let Some(link) = self.links.get(target) {
                if link.send(&frame).is_err() {
                    link.close();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_round_trips_a_ping_frame() {
        let (parent, worker) = Link::pair().unwrap();
        let frame = Frame {
            frame_type: FrameType::Ping,
            flags: FrameFlags::empty(),
            filter: 0,
            is_json: false,
            channel: Vec::new(),
            payload: Vec::new(),
        };
        worker.send(&frame).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let received = parent.recv_available().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].frame_type, FrameType::Ping);
    }

    #[test]
    fn closing_one_end_is_observed_as_eof_on_the_other() {
        let (parent, worker) = Link::pair().unwrap();
        drop(worker);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let _ = parent.recv_available().unwrap();
        assert!(parent.is_closed());
    }

    #[test]
    fn recv_available_reassembles_continuation_chunked_publishes() {
        let (parent, worker) = Link::pair().unwrap();
        let payload = vec![9u8; (MAX_PAYLOAD as usize) * 2 + 10];
        for frame in Frame::split_publish(0, b"big".to_vec(), payload.clone(), false, false, false) {
            worker.send(&frame).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        let received = parent.recv_available().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].channel, b"big");
        assert_eq!(received[0].payload, payload);
    }

    #[test]
    fn relay_forwards_publish_to_subscribed_worker_but_not_back_to_sender() {
        let (relay_side_a, worker_a) = Link::pair().unwrap();
        let (relay_side_b, worker_b) = Link::pair().unwrap();
        let relay = ClusterRelay::new(vec![Arc::new(relay_side_a), Arc::new(relay_side_b)]);

        let subscribe = Frame {
            frame_type: FrameType::Subscribe,
            flags: FrameFlags::empty(),
            filter: 0,
            is_json: false,
            channel: b"news".to_vec(),
            payload: Vec::new(),
        };
        worker_b.send(&subscribe).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        relay.tick();

        let publish = Frame {
            frame_type: FrameType::Publish,
            flags: FrameFlags::empty(),
            filter: 0,
            is_json: false,
            channel: b"news".to_vec(),
            payload: b"hi".to_vec(),
        };
        worker_a.send(&publish).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        relay.tick();

        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(worker_a.recv_available().unwrap().is_empty());
        let received = worker_b.recv_available().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, b"hi");
    }
}
