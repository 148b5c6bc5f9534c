//! The cluster IPC wire format (spec.md §6): little-endian, length-prefixed
//! frames carrying pub/sub and control traffic between a worker and its
//! parent.

use crate::error::{Error, ErrorKind, Result};

pub(crate) const MAX_PAYLOAD: u32 = 1024 * 1024; // spec.md's "≥1 MiB" floor
const HEADER_LEN: usize = 4 + 2 + 2 + 2 + 4 + 4 + 1 + 1;

/// A tiny inline `bitflags`-alike so this module doesn't need to pull in
/// the `bitflags` crate for two bits. Kept private to this module.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($ty);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub fn bits(self) -> $ty {
                self.0
            }

            pub fn from_bits_truncate(bits: $ty) -> Self {
                let mut known = 0;
                $(known |= $value;)*
                $name(bits & known)
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    Publish = 0,
    Subscribe = 1,
    Unsubscribe = 2,
    PSubscribe = 3,
    PUnsubscribe = 4,
    Shutdown = 5,
    Ping = 6,
}

impl FrameType {
    fn from_u16(v: u16) -> Result<FrameType> {
        Ok(match v {
            0 => FrameType::Publish,
            1 => FrameType::Subscribe,
            2 => FrameType::Unsubscribe,
            3 => FrameType::PSubscribe,
            4 => FrameType::PUnsubscribe,
            5 => FrameType::Shutdown,
            6 => FrameType::Ping,
            _ => return Err(Error::new(ErrorKind::ClusterIpcFailure)),
        })
    }
}

bitflags_lite! {
    /// `CONTINUATION` marks a frame as a follow-on chunk of a payload that
    /// exceeded [`MAX_PAYLOAD`] and had to be split (spec.md §6).
    /// `SIBLINGS_ONLY` and `ROOT_ONLY` are this crate's own
    /// (implementation-defined) bits distinguishing which
    /// [`crate::pubsub::Engine`] a publish frame originated from, since the
    /// parent-side relay needs that to decide whether to forward a
    /// publish on to other workers (`SIBLINGS`/`CLUSTER`) or keep it to
    /// itself (`ROOT`).
    pub struct FrameFlags: u16 {
        const CONTINUATION = 0b0000_0001;
        const SIBLINGS_ONLY = 0b0000_0010;
        const ROOT_ONLY = 0b0000_0100;
    }
}

/// One length-prefixed cluster IPC frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub filter: i32,
    pub is_json: bool,
    pub channel: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let channel_len = self.channel.len() as u16;
        let msg_len = self.payload.len() as u32;
        let payload_len = (HEADER_LEN - 4) as u32 + channel_len as u32 + msg_len;
        let mut buf = Vec::with_capacity(4 + payload_len as usize);
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&(self.frame_type as u16).to_le_bytes());
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        buf.extend_from_slice(&channel_len.to_le_bytes());
        buf.extend_from_slice(&msg_len.to_le_bytes());
        buf.extend_from_slice(&self.filter.to_le_bytes());
        buf.push(self.is_json as u8);
        buf.push(0); // pad
        buf.extend_from_slice(&self.channel);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses one frame out of `buf`, returning it along with the number
    /// of bytes consumed, or `Ok(None)` if `buf` does not yet hold a full
    /// frame.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let payload_len = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if payload_len > MAX_PAYLOAD + HEADER_LEN as u32 {
            return Err(Error::new(ErrorKind::BufferFull));
        }
        let total = 4 + payload_len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let rest = &buf[4..total];
        if rest.len() < HEADER_LEN - 4 {
            return Err(Error::new(ErrorKind::ClusterIpcFailure));
        }
        let frame_type = FrameType::from_u16(u16::from_le_bytes(rest[0..2].try_into().unwrap()))?;
        let flags = FrameFlags::from_bits_truncate(u16::from_le_bytes(rest[2..4].try_into().unwrap()));
        let channel_len = u16::from_le_bytes(rest[4..6].try_into().unwrap()) as usize;
        let msg_len = u32::from_le_bytes(rest[6..10].try_into().unwrap()) as usize;
        let filter = i32::from_le_bytes(rest[10..14].try_into().unwrap());
        let is_json = rest[14] != 0;
        let body = &rest[16..];
        if body.len() < channel_len + msg_len {
            return Err(Error::new(ErrorKind::ClusterIpcFailure));
        }
        let channel = body[..channel_len].to_vec();
        let payload = body[channel_len..channel_len + msg_len].to_vec();
        Ok(Some((
            Frame {
                frame_type,
                flags,
                filter,
                is_json,
                channel,
                payload,
            },
            total,
        )))
    }

    /// Splits an oversized publish into `MAX_PAYLOAD`-sized continuation
    /// frames, each flagged `CONTINUATION` except the first.
    pub fn split_publish(
        filter: i32,
        channel: Vec<u8>,
        payload: Vec<u8>,
        is_json: bool,
        siblings_only: bool,
        root_only: bool,
    ) -> Vec<Frame> {
        let mut base_flags = FrameFlags::empty();
        if siblings_only {
            base_flags |= FrameFlags::SIBLINGS_ONLY;
        }
        if root_only {
            base_flags |= FrameFlags::ROOT_ONLY;
        }
        if channel.len() as u32 + payload.len() as u32 <= MAX_PAYLOAD {
            return vec![Frame {
                frame_type: FrameType::Publish,
                flags: base_flags,
                filter,
                is_json,
                channel,
                payload,
            }];
        }
        let mut frames = Vec::new();
        let mut offset = 0usize;
        let chunk_budget = MAX_PAYLOAD as usize - channel.len();
        while offset < payload.len() {
            let end = (offset + chunk_budget).min(payload.len());
            let mut flags = base_flags;
            if offset + (end - offset) < payload.len() {
                flags |= FrameFlags::CONTINUATION;
            }
            frames.push(Frame {
                frame_type: FrameType::Publish,
                flags,
                filter,
                is_json,
                channel: if offset == 0 { channel.clone() } else { Vec::new() },
                payload: payload[offset..end].to_vec(),
            });
            offset = end;
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrips() {
        let frame = Frame {
            frame_type: FrameType::Publish,
            flags: FrameFlags::empty(),
            filter: 0,
            is_json: true,
            channel: b"news.weather".to_vec(),
            payload: b"{\"temp\":72}".to_vec(),
        };
        let bytes = frame.encode();
        let (decoded, consumed) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.channel, frame.channel);
        assert_eq!(decoded.payload, frame.payload);
        assert!(decoded.is_json);
    }

    #[test]
    fn decode_returns_none_on_partial_buffer() {
        let frame = Frame {
            frame_type: FrameType::Ping,
            flags: FrameFlags::empty(),
            filter: 0,
            is_json: false,
            channel: Vec::new(),
            payload: Vec::new(),
        };
        let bytes = frame.encode();
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn oversized_publish_splits_into_continuation_frames() {
        let payload = vec![7u8; (MAX_PAYLOAD as usize) * 2 + 10];
        let frames = Frame::split_publish(0, b"big".to_vec(), payload.clone(), false, false, false);
        assert!(frames.len() > 1);
        assert!(frames[1].flags.contains(FrameFlags::CONTINUATION) || frames.last().unwrap().payload.len() < payload.len());
        let total: usize = frames.iter().map(|f| f.payload.len()).sum();
        assert_eq!(total, payload.len());
    }
}
