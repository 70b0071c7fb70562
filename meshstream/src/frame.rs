//! Wire frame codec.
//!
//! Binary layout (all integers little-endian):
//!
//! ```text
//! offset size field
//!   0    4   stream_id   u32
//!   4    4   seq         u32
//!   8    4   ack         u32
//!  12    1   flags       u8   (SYN 0x01 | FIN 0x02 | RST 0x04 | ACK 0x08 | NACK 0x10)
//!  13    2   payload_len u16  (0..=MTU_PAYLOAD)
//!  15    N   payload
//! 15+N   4   crc32       u32  over bytes [0 .. 15+N)
//! ```
//!
//! The CRC is IEEE 802.3 CRC-32 (reflected, polynomial 0xEDB88320). A frame
//! always fits within one radio datagram; the radio never fragments.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, StreamError};

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 15;
/// CRC trailer length in bytes.
pub const TRAILER_LEN: usize = 4;
/// Total framing overhead per datagram.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;
/// Maximum payload bytes per frame: radio datagram MTU minus framing.
pub const MTU_PAYLOAD: usize = 180;

/// Frame flag bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const NONE: Self = Self(0x00);
    pub const SYN: Self = Self(0x01);
    pub const FIN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const ACK: Self = Self(0x08);
    pub const NACK: Self = Self(0x10);

    pub fn contains(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A single wire frame: the unit carried by one radio datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Owning stream; 0 is reserved and never valid for stream frames.
    pub stream_id: u32,
    /// Per-stream, per-direction sequence number. SYN and FIN each consume
    /// one sequence number, like TCP.
    pub seq: u32,
    /// Cumulative acknowledgment: all seq strictly below this value have
    /// been delivered. Meaningful only when the ACK flag is set.
    pub ack: u32,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Build a control-only frame (empty payload).
    pub fn control(stream_id: u32, seq: u32, ack: u32, flags: FrameFlags) -> Self {
        Self {
            stream_id,
            seq,
            ack,
            flags,
            payload: Bytes::new(),
        }
    }

    /// Build a data frame carrying a cumulative ACK.
    pub fn data(stream_id: u32, seq: u32, ack: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            seq,
            ack,
            flags: FrameFlags::ACK,
            payload,
        }
    }

    /// Build a NACK frame whose payload enumerates missing sequence numbers.
    ///
    /// The list is truncated to what fits in `MTU_PAYLOAD`.
    pub fn nack(stream_id: u32, ack: u32, missing: &[u32]) -> Self {
        let cap = MTU_PAYLOAD / 4;
        let mut payload = BytesMut::with_capacity(missing.len().min(cap) * 4);
        for &seq in missing.iter().take(cap) {
            payload.put_u32_le(seq);
        }
        Self {
            stream_id,
            seq: 0,
            ack,
            flags: FrameFlags::NACK | FrameFlags::ACK,
            payload: payload.freeze(),
        }
    }

    /// Parse the missing-sequence list out of a NACK payload.
    pub fn nack_seqs(&self) -> Vec<u32> {
        self.payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// A control-only frame carries no payload.
    pub fn is_control_only(&self) -> bool {
        self.payload.is_empty()
    }

    /// The total number of bytes this frame occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Encode this frame into a byte buffer.
    ///
    /// Rejects payloads larger than `MTU_PAYLOAD`; oversize frames would be
    /// truncated by the radio, so they must never reach it.
    pub fn encode(&self) -> Result<Bytes, StreamError> {
        if self.payload.len() > MTU_PAYLOAD {
            return Err(StreamError::PayloadTooLarge {
                size: self.payload.len(),
                max: MTU_PAYLOAD,
            });
        }
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        Ok(buf.freeze())
    }

    /// Encode into a pre-allocated `BytesMut`. The caller has already
    /// checked the payload bound.
    fn encode_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32_le(self.stream_id);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.ack);
        buf.put_u8(self.flags.0);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        let crc = crc32fast::hash(&buf[start..]);
        buf.put_u32_le(crc);
    }

    /// Decode a frame from one radio datagram.
    ///
    /// The buffer must contain exactly one frame; a length mismatch in
    /// either direction is `BadLength` rather than silent truncation.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(DecodeError::TooShort {
                expected: FRAME_OVERHEAD,
                actual: data.len(),
            });
        }

        let mut hdr = &data[..HEADER_LEN];
        let stream_id = hdr.get_u32_le();
        let seq = hdr.get_u32_le();
        let ack = hdr.get_u32_le();
        let flags = FrameFlags(hdr.get_u8());
        let payload_len = hdr.get_u16_le() as usize;

        if data.len() != HEADER_LEN + payload_len + TRAILER_LEN {
            return Err(DecodeError::BadLength {
                declared: payload_len,
                actual: data.len(),
            });
        }

        let crc_at = HEADER_LEN + payload_len;
        let computed = crc32fast::hash(&data[..crc_at]);
        let stored = u32::from_le_bytes([
            data[crc_at],
            data[crc_at + 1],
            data[crc_at + 2],
            data[crc_at + 3],
        ]);
        if stored != computed {
            return Err(DecodeError::BadCrc { stored, computed });
        }

        let payload = Bytes::copy_from_slice(&data[HEADER_LEN..crc_at]);
        Ok(Self {
            stream_id,
            seq,
            ack,
            flags,
            payload,
        })
    }
}
