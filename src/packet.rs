//! The per-fd outbound packet queue (Component B, spec.md §4.B).

use crate::error::{Error, ErrorKind, Result};
use crate::protocol::RwHooks;
use crate::uuid::Uuid;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;

/// One outbound unit: either an in-memory slice or a range of another fd
/// (e.g. a file, for a zero-copy `sendfile`-style send).
pub enum PacketBody {
    Memory { data: Box<[u8]>, offset: usize },
    Fd { fd: RawFd, offset: u64, len: u64, close_when_done: bool },
}

/// A single queued outbound packet.
///
/// `dealloc`, if present, runs exactly once: either when the packet
/// finishes sending, or when the owning slot is torn down with the packet
/// still queued (spec.md §3 invariant 3).
pub struct Packet {
    body: PacketBody,
    dealloc: Option<Box<dyn FnOnce() + Send>>,
}

impl Packet {
    pub fn memory(data: Vec<u8>) -> Packet {
        Packet {
            body: PacketBody::Memory {
                data: data.into_boxed_slice(),
                offset: 0,
            },
            dealloc: None,
        }
    }

    pub fn memory_with_dealloc(data: Vec<u8>, dealloc: impl FnOnce() + Send + 'static) -> Packet {
        Packet {
            body: PacketBody::Memory {
                data: data.into_boxed_slice(),
                offset: 0,
            },
            dealloc: Some(Box::new(dealloc)),
        }
    }

    pub fn from_fd(fd: RawFd, offset: u64, len: u64, close_when_done: bool) -> Packet {
        Packet {
            body: PacketBody::Fd {
                fd,
                offset,
                len,
                close_when_done,
            },
            dealloc: None,
        }
    }

    fn remaining(&self) -> bool {
        match &self.body {
            PacketBody::Memory { data, offset } => *offset < data.len(),
            PacketBody::Fd { len, .. } => *len > 0,
        }
    }

    fn run_dealloc(mut self) {
        if let Some(d) = self.dealloc.take() {
            d();
        }
        if let PacketBody::Fd {
            fd, close_when_done, ..
        } = self.body
        {
            if close_when_done {
                crate::sys::unix::io::close(fd);
            }
        }
    }
}

/// The FIFO of packets pending for one connection.
///
/// Callers are required to hold the slot's WRITE lock across both
/// `push`/`push_urgent` and `flush` - this type performs no internal
/// locking of its own, matching spec.md §4.B's "the head is atomic with
/// respect to the write-lock."
#[derive(Default)]
pub struct Queue {
    packets: VecDeque<Packet>,
}

impl Queue {
    pub fn push(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    /// Urgent packets jump to the front of the queue, but never ahead of a
    /// packet that is already partway through transmission (spec.md
    /// §4.B).
    pub fn push_urgent(&mut self, packet: Packet) {
        let insert_at = match self.packets.front() {
            Some(head) if head.remaining() && head_in_flight(head) => 1,
            _ => 0,
        };
        self.packets.insert(insert_at, packet);
    }

    pub fn pending(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Drains every packet, running each one's `dealloc` without sending
    /// anything further - used when a slot is force-closed with packets
    /// still queued (spec.md §3 invariant 3).
    pub fn abandon_all(&mut self) {
        for packet in self.packets.drain(..) {
            packet.run_dealloc();
        }
    }

    /// Attempts to drain the queue through `hooks`, looping each packet
    /// until it is fully sent or the hook reports `WouldBlock`.
    ///
    /// Returns `Ok(n)` where `n` is the number of packets still pending
    /// (`0` means fully drained), or an `Err` with kind
    /// [`ErrorKind::ConnectionClosed`]/[`ErrorKind::PollerFailure`] on a
    /// fatal write error - matching spec.md §4.B's "`>0` if data remains,
    /// `0` if drained, `-1` on fatal error" contract, expressed as a
    /// `Result` instead of a sentinel integer.
    pub fn flush(&mut self, uuid: Uuid, hooks: &dyn RwHooks) -> Result<usize> {
        while let Some(packet) = self.packets.front_mut() {
            match send_one(uuid, packet, hooks) {
                Ok(true) => {
                    let packet = self.packets.pop_front().unwrap();
                    packet.run_dealloc();
                }
                Ok(false) => return Ok(self.packets.len()),
                Err(err) if err.is_would_block() => return Ok(self.packets.len()),
                Err(err) => return Err(err),
            }
        }
        Ok(0)
    }
}

fn head_in_flight(head: &Packet) -> bool {
    match &head.body {
        PacketBody::Memory { offset, .. } => *offset > 0,
        PacketBody::Fd { .. } => false,
    }
}

/// Sends as much of one packet as the hook will currently accept.
/// Returns `Ok(true)` once the packet is fully sent.
fn send_one(uuid: Uuid, packet: &mut Packet, hooks: &dyn RwHooks) -> Result<bool> {
    match &mut packet.body {
        PacketBody::Memory { data, offset } => {
            while *offset < data.len() {
                let n = hooks.write(uuid, &data[*offset..])?;
                if n == 0 {
                    return Err(Error::new(ErrorKind::ConnectionClosed));
                }
                *offset += n;
            }
            Ok(true)
        }
        PacketBody::Fd {
            fd,
            offset,
            len,
            ..
        } => {
            if *len == 0 {
                return Ok(true);
            }
            if hooks.is_default() {
                send_file_fast_path(uuid, *fd, offset, len)
            } else {
                send_file_via_hook(uuid, *fd, offset, len, hooks)
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn send_file_fast_path(uuid: Uuid, fd: RawFd, offset: &mut u64, len: &mut u64) -> Result<bool> {
    let mut off = *offset as libc::off_t;
    loop {
        if *len == 0 {
            return Ok(true);
        }
        let chunk = (*len).min(i32::MAX as u64) as usize;
        let n = unsafe { libc::sendfile(uuid.fd(), fd, &mut off, chunk) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                *offset = off as u64;
                return Err(Error::with_io(ErrorKind::WouldBlock, err));
            }
            return Err(Error::with_io(ErrorKind::PollerFailure, err));
        }
        if n == 0 {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }
        *len -= n as u64;
        *offset = off as u64;
    }
}

#[cfg(not(target_os = "linux"))]
fn send_file_fast_path(uuid: Uuid, fd: RawFd, offset: &mut u64, len: &mut u64) -> Result<bool> {
    send_file_via_hook(uuid, fd, offset, len, &crate::protocol::SystemHooks)
}

/// Bounded chunk-buffer fallback used when the hook set isn't the default
/// system transport (e.g. a TLS-terminating hook can't accept a raw
/// `sendfile`). Reads at most `CHUNK` bytes from the source fd into a
/// stack buffer and writes them through the hook.
///
/// Resolves the overflow open question of spec.md §9: if the bounded copy
/// would overflow its chunk buffer, this returns an error and rolls the
/// source/offset back to where the caller can safely retry rather than
/// leaving `offset`/`len` in a partially-advanced state.
fn send_file_via_hook(
    uuid: Uuid,
    fd: RawFd,
    offset: &mut u64,
    len: &mut u64,
    hooks: &dyn RwHooks,
) -> Result<bool> {
    const CHUNK: usize = 64 * 1024;
    let mut buf = [0u8; CHUNK];
    while *len > 0 {
        let want = (*len as usize).min(CHUNK);
        if want > buf.len() {
            // Overflow guard: never hand the kernel more than the buffer
            // can hold; roll back nothing since we haven't advanced yet.
            return Err(Error::new(ErrorKind::BufferFull));
        }
        let n = pread(fd, &mut buf[..want], *offset)?;
        if n == 0 {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }
        let mut written = 0;
        while written < n {
            match hooks.write(uuid, &buf[written..n]) {
                Ok(w) => written += w,
                Err(err) if err.is_would_block() && written > 0 => {
                    // Partial write: roll offset/len back to only what we
                    // actually flushed, then surface would-block so the
                    // caller retries the remainder.
                    *offset += written as u64;
                    *len -= written as u64;
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        *offset += n as u64;
        *len -= n as u64;
    }
    Ok(true)
}

fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize> {
    let n = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return Err(Error::with_io(
            ErrorKind::PollerFailure,
            std::io::Error::last_os_error(),
        ));
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn dealloc_runs_exactly_once_when_abandoned() {
        let ran = Rc::new(Cell::new(0));
        let ran2 = ran.clone();
        let mut queue = Queue::default();
        queue.push(Packet::memory_with_dealloc(vec![1, 2, 3], move || {
            ran2.set(ran2.get() + 1);
        }));
        queue.abandon_all();
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn urgent_packet_goes_to_head_when_nothing_in_flight() {
        let mut queue = Queue::default();
        queue.push(Packet::memory(vec![1]));
        queue.push_urgent(Packet::memory(vec![2]));
        assert_eq!(queue.pending(), 2);
    }
}
