//! # Outbound Packet Framing
//!
//! Images travel to the server as a sequence of packets on one TCP
//! connection. Each packet is a fixed 13-byte header immediately followed by
//! `chunk_size` payload bytes. All integers are big-endian.
//!
//! ## Header Format
//!
//! ```text
//! ┌───────┬────────────┬──────────┬────────────┬─────────┐
//! │ Magic │ total_size │  offset  │ chunk_size │ is_last │
//! │ "PH"  │   u32 BE   │  u32 BE  │   u16 BE   │   u8    │
//! │  2 B  │    4 B     │   4 B    │    2 B     │   1 B   │
//! └───────┴────────────┴──────────┴────────────┴─────────┘
//! ```
//!
//! There is no acknowledgment and no checksum; TCP provides both. The
//! receiver checks sequencing with [`TransferTracker`].

use crate::chunk::Chunk;

/// Magic bytes at the start of every packet header
pub const PACKET_MAGIC: [u8; 2] = *b"PH";

/// Encoded header length
pub const HEADER_LEN: usize = 13;

/// Errors while decoding or sequencing inbound packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketError {
    #[error("header too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic {0:02X?}")]
    BadMagic([u8; 2]),
    #[error("invalid is_last flag {0:#04x}")]
    InvalidFlag(u8),
    #[error("empty chunk at offset {0}")]
    EmptyChunk(u32),
    #[error("chunk {offset}+{chunk_size} exceeds total {total}")]
    OutOfBounds {
        offset: u32,
        chunk_size: u16,
        total: u32,
    },
    #[error("total size {total} exceeds limit {max}")]
    TooLarge { total: u32, max: u32 },
    #[error("offset gap: expected {expected}, got {actual}")]
    OffsetGap { expected: u32, actual: u32 },
    #[error("total size changed mid-transfer: {expected} -> {actual}")]
    TotalChanged { expected: u32, actual: u32 },
    #[error("is_last flag misplaced at offset {offset}")]
    LastMismatch { offset: u32 },
}

/// Header of one outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketHeader {
    pub total_size: u32,
    pub offset: u32,
    pub chunk_size: u16,
    pub is_last: bool,
}

impl PacketHeader {
    /// Header announcing `chunk` of a `total_size` byte image
    pub fn for_chunk(total_size: u32, chunk: &Chunk) -> Self {
        Self {
            total_size,
            offset: chunk.offset,
            chunk_size: chunk.len,
            is_last: chunk.is_last,
        }
    }

    /// Encode into the 13-byte wire layout
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&PACKET_MAGIC);
        out[2..6].copy_from_slice(&self.total_size.to_be_bytes());
        out[6..10].copy_from_slice(&self.offset.to_be_bytes());
        out[10..12].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[12] = u8::from(self.is_last);
        out
    }

    /// Decode a header from the first [`HEADER_LEN`] bytes of `data`
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_LEN {
            return Err(PacketError::TooShort(data.len()));
        }
        if data[0..2] != PACKET_MAGIC {
            return Err(PacketError::BadMagic([data[0], data[1]]));
        }
        let is_last = match data[12] {
            0 => false,
            1 => true,
            other => return Err(PacketError::InvalidFlag(other)),
        };
        Ok(Self {
            total_size: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            offset: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
            chunk_size: u16::from_be_bytes([data[10], data[11]]),
            is_last,
        })
    }

    /// Offset one past this packet's payload
    pub fn end(&self) -> u32 {
        self.offset.saturating_add(u32::from(self.chunk_size))
    }
}

/// Outcome of accepting one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    /// More packets belong to this image
    Continue,
    /// The packet carried `is_last`; the image of `total` bytes is complete
    Complete { total: u32 },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    total: u32,
    next: u32,
}

/// Receiver-side sequence check for one connection
///
/// Packets of an image must arrive with contiguous offsets starting at zero,
/// the same `total_size`, and `is_last` exactly on the packet that reaches
/// the total. After a completed image the tracker accepts the next one.
#[derive(Debug, Clone)]
pub struct TransferTracker {
    max_total: u32,
    current: Option<InFlight>,
}

impl TransferTracker {
    pub fn new(max_total: u32) -> Self {
        Self {
            max_total,
            current: None,
        }
    }

    /// True while an image has started but not completed
    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Bytes of the current image received so far
    pub fn received(&self) -> u32 {
        self.current.map_or(0, |t| t.next)
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Check `header` against the transfer in progress and advance
    ///
    /// Any error abandons the transfer in progress.
    pub fn accept(&mut self, header: &PacketHeader) -> Result<TransferStep, PacketError> {
        let result = self.check(header);
        if result.is_err() {
            self.current = None;
        }
        result
    }

    fn check(&mut self, header: &PacketHeader) -> Result<TransferStep, PacketError> {
        let total = header.total_size;
        if total > self.max_total {
            return Err(PacketError::TooLarge {
                total,
                max: self.max_total,
            });
        }
        if header.chunk_size == 0 {
            return Err(PacketError::EmptyChunk(header.offset));
        }
        let end = header.end();
        if end > total {
            return Err(PacketError::OutOfBounds {
                offset: header.offset,
                chunk_size: header.chunk_size,
                total,
            });
        }

        let expected = match self.current {
            Some(t) if t.total != total => {
                return Err(PacketError::TotalChanged {
                    expected: t.total,
                    actual: total,
                })
            }
            Some(t) => t.next,
            None => 0,
        };
        if header.offset != expected {
            return Err(PacketError::OffsetGap {
                expected,
                actual: header.offset,
            });
        }
        if header.is_last != (end == total) {
            return Err(PacketError::LastMismatch {
                offset: header.offset,
            });
        }

        if header.is_last {
            self.current = None;
            Ok(TransferStep::Complete { total })
        } else {
            self.current = Some(InFlight { total, next: end });
            Ok(TransferStep::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunks;

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = PacketHeader {
            total_size: 0x0000_0258,
            offset: 0x0000_0100,
            chunk_size: 0x0100,
            is_last: false,
        };
        assert_eq!(
            header.encode(),
            [b'P', b'H', 0x00, 0x00, 0x02, 0x58, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(PacketHeader::decode(&header.encode()), Ok(header));
    }

    #[test]
    fn test_decode_rejects_bad_headers() {
        let mut raw = PacketHeader {
            total_size: 10,
            offset: 0,
            chunk_size: 10,
            is_last: true,
        }
        .encode();

        assert_eq!(
            PacketHeader::decode(&raw[..12]),
            Err(PacketError::TooShort(12))
        );

        raw[12] = 2;
        assert_eq!(PacketHeader::decode(&raw), Err(PacketError::InvalidFlag(2)));

        raw[0] = b'X';
        assert_eq!(
            PacketHeader::decode(&raw),
            Err(PacketError::BadMagic([b'X', b'H']))
        );
    }

    #[test]
    fn test_tracker_accepts_sender_sequence() {
        let mut tracker = TransferTracker::new(60 * 1024);
        for total in [1u32, 255, 256, 600, 4096] {
            let mut steps = std::vec::Vec::new();
            for chunk in chunks(total, 256) {
                let header = PacketHeader::for_chunk(total, &chunk);
                steps.push(tracker.accept(&header).unwrap());
            }
            assert_eq!(steps.last(), Some(&TransferStep::Complete { total }));
            assert_eq!(
                steps.iter().filter(|s| **s != TransferStep::Continue).count(),
                1
            );
            assert!(!tracker.in_progress());
        }
    }

    #[test]
    fn test_tracker_rejects_gap() {
        let mut tracker = TransferTracker::new(1024);
        let first = PacketHeader {
            total_size: 600,
            offset: 0,
            chunk_size: 256,
            is_last: false,
        };
        assert_eq!(tracker.accept(&first), Ok(TransferStep::Continue));
        assert_eq!(tracker.received(), 256);

        let skipped = PacketHeader { offset: 512, chunk_size: 88, is_last: true, ..first };
        assert_eq!(
            tracker.accept(&skipped),
            Err(PacketError::OffsetGap {
                expected: 256,
                actual: 512
            })
        );
        assert!(!tracker.in_progress());
    }

    #[test]
    fn test_tracker_rejects_inconsistent_packets() {
        let mut tracker = TransferTracker::new(1024);
        let first = PacketHeader {
            total_size: 600,
            offset: 0,
            chunk_size: 256,
            is_last: false,
        };

        tracker.accept(&first).unwrap();
        let resized = PacketHeader { total_size: 700, offset: 256, ..first };
        assert_eq!(
            tracker.accept(&resized),
            Err(PacketError::TotalChanged {
                expected: 600,
                actual: 700
            })
        );

        let early_last = PacketHeader { is_last: true, ..first };
        assert_eq!(
            tracker.accept(&early_last),
            Err(PacketError::LastMismatch { offset: 0 })
        );

        let missing_last = PacketHeader { total_size: 256, ..first };
        assert_eq!(
            tracker.accept(&missing_last),
            Err(PacketError::LastMismatch { offset: 0 })
        );

        let overrun = PacketHeader { total_size: 100, ..first };
        assert!(matches!(
            tracker.accept(&overrun),
            Err(PacketError::OutOfBounds { .. })
        ));

        let huge = PacketHeader { total_size: 4096, ..first };
        assert_eq!(
            tracker.accept(&huge),
            Err(PacketError::TooLarge {
                total: 4096,
                max: 1024
            })
        );

        let empty = PacketHeader { chunk_size: 0, ..first };
        assert_eq!(tracker.accept(&empty), Err(PacketError::EmptyChunk(0)));
    }
}
