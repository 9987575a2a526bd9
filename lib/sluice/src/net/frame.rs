//! Frame codec for kernel-to-kernel streams. Every frame is a fixed
//! big-endian header optionally followed by an `ENQUEUE` payload of
//! `count * num_channels` bytes, channel-major:
//!
//! ```text
//! offset  size  field
//! 0       1     kind
//! 1       8     dst endpoint key
//! 9       8     src endpoint key
//! 17      4     count
//! 21      4     num_channels
//! 25      8     detector tag: block count
//! 33      8     detector tag: node key
//! 41      ...   payload
//! ```
//!
//! Control frames reuse `count` for their scalar argument (released bytes,
//! requested threshold); `GROW` carries the new capacity in `count` and the
//! new max threshold in `num_channels`.

use crate::d4r::Tag;
use crate::error::{RuntimeError, RuntimeResult};
use byteorder::{BigEndian, ByteOrder};

pub const HEADER_SIZE: usize = 41;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameKind {
    Enqueue = 1,
    Dequeue = 2,
    ReadBlock = 3,
    WriteBlock = 4,
    EndOfWrite = 5,
    EndOfRead = 6,
    Grow = 7,
    IdReader = 8,
    IdWriter = 9,
}

impl FrameKind {
    pub fn from_u8(raw: u8) -> Option<FrameKind> {
        match raw {
            1 => Some(FrameKind::Enqueue),
            2 => Some(FrameKind::Dequeue),
            3 => Some(FrameKind::ReadBlock),
            4 => Some(FrameKind::WriteBlock),
            5 => Some(FrameKind::EndOfWrite),
            6 => Some(FrameKind::EndOfRead),
            7 => Some(FrameKind::Grow),
            8 => Some(FrameKind::IdReader),
            9 => Some(FrameKind::IdWriter),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub dst: u64,
    pub src: u64,
    pub count: u32,
    pub channels: u32,
    /// Detector tag; only `(count, node)` cross the wire.
    pub tag: Tag,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, dst: u64, src: u64, count: u32, channels: u32, tag: Tag) -> FrameHeader {
        FrameHeader {
            kind,
            dst,
            src,
            count,
            channels,
            tag,
        }
    }

    /// Payload bytes following this header.
    #[inline]
    pub fn payload_len(&self) -> usize {
        match self.kind {
            FrameKind::Enqueue => self.count as usize * (self.channels.max(1)) as usize,
            _ => 0,
        }
    }

    /// Serialize into a fixed header block.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0] = self.kind as u8;
        BigEndian::write_u64(&mut buf[1..9], self.dst);
        BigEndian::write_u64(&mut buf[9..17], self.src);
        BigEndian::write_u32(&mut buf[17..21], self.count);
        BigEndian::write_u32(&mut buf[21..25], self.channels);
        BigEndian::write_u64(&mut buf[25..33], self.tag.count);
        BigEndian::write_u64(&mut buf[33..41], self.tag.node);

        buf
    }

    /// Parse a header off the front of `buf`; needs `HEADER_SIZE` bytes.
    pub fn decode(buf: &[u8]) -> RuntimeResult<FrameHeader> {
        if buf.len() < HEADER_SIZE {
            return Err(RuntimeError::Protocol(format!(
                "truncated frame header: {} bytes",
                buf.len()
            )));
        }

        let kind = FrameKind::from_u8(buf[0])
            .ok_or_else(|| RuntimeError::Protocol(format!("unknown frame kind {}", buf[0])))?;

        Ok(FrameHeader {
            kind,
            dst: BigEndian::read_u64(&buf[1..9]),
            src: BigEndian::read_u64(&buf[9..17]),
            count: BigEndian::read_u32(&buf[17..21]),
            channels: BigEndian::read_u32(&buf[21..25]),
            tag: Tag {
                count: BigEndian::read_u64(&buf[25..33]),
                node: BigEndian::read_u64(&buf[33..41]),
                queue_size: 0,
                queue: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(
            FrameKind::Enqueue,
            77,
            78,
            1024,
            2,
            Tag {
                count: 5,
                node: 9,
                queue_size: 0,
                queue: 0,
            },
        );

        let encoded = header.encode();
        let decoded = FrameHeader::decode(&encoded).unwrap();

        assert_eq!(decoded.kind, FrameKind::Enqueue);
        assert_eq!(decoded.dst, 77);
        assert_eq!(decoded.src, 78);
        assert_eq!(decoded.count, 1024);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.tag.count, 5);
        assert_eq!(decoded.tag.node, 9);
        assert_eq!(decoded.payload_len(), 2048);
    }

    #[test]
    fn test_control_frames_have_no_payload() {
        let header = FrameHeader::new(FrameKind::Dequeue, 1, 2, 4096, 0, Tag::NONE);
        assert_eq!(header.payload_len(), 0);

        let header = FrameHeader::new(FrameKind::Grow, 1, 2, 65536, 1024, Tag::NONE);
        assert_eq!(header.payload_len(), 0);
    }

    #[test]
    fn test_reject_unknown_kind() {
        let mut encoded = FrameHeader::new(FrameKind::Enqueue, 1, 2, 0, 1, Tag::NONE).encode();
        encoded[0] = 200;

        assert!(FrameHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_reject_truncated() {
        let encoded = FrameHeader::new(FrameKind::Enqueue, 1, 2, 0, 1, Tag::NONE).encode();
        assert!(FrameHeader::decode(&encoded[..HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn test_kind_codes_match_wire_numbering() {
        for (code, kind) in [
            (1u8, FrameKind::Enqueue),
            (2, FrameKind::Dequeue),
            (3, FrameKind::ReadBlock),
            (4, FrameKind::WriteBlock),
            (5, FrameKind::EndOfWrite),
            (6, FrameKind::EndOfRead),
            (7, FrameKind::Grow),
            (8, FrameKind::IdReader),
            (9, FrameKind::IdWriter),
        ]
        .iter()
        {
            assert_eq!(FrameKind::from_u8(*code), Some(*kind));
            assert_eq!(*kind as u8, *code);
        }
    }
}
