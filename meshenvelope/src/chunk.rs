//! Addressed-datagram chunk codec.
//!
//! When envelopes do not ride a stream they are split into chunks, each
//! carried by one radio datagram with a fixed 16-byte header:
//!
//! ```text
//! offset size field
//!   0    2   magic     'M','B'
//!   2    1   version   1
//!   3    1   flags     (ACK 0x01 | NACK 0x02 | PARITY 0x04)
//!   4    8   id_prefix first 8 bytes of the envelope id, zero-padded
//!  12    2   sequence  u16 LE, 1-based
//!  14    2   total     u16 LE
//!  16    N   payload
//! ```
//!
//! Data chunks have `1 <= sequence <= total`. ACK chunks echo how many
//! chunks the receiver holds in `sequence`. NACK payloads list missing
//! sequence numbers as u16 LE. Parity chunks carry the XOR of one window
//! of data chunks, with `sequence` naming the 1-based window index.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use meshstream::error::DecodeError;

pub const CHUNK_MAGIC: [u8; 2] = *b"MB";
pub const CHUNK_VERSION: u8 = 1;
pub const CHUNK_HEADER_LEN: usize = 16;

/// Chunk flag bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkFlags(pub u8);

impl ChunkFlags {
    pub const NONE: Self = Self(0x00);
    pub const ACK: Self = Self(0x01);
    pub const NACK: Self = Self(0x02);
    pub const PARITY: Self = Self(0x04);

    pub fn contains(self, flag: ChunkFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

/// One envelope chunk, data or control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub flags: ChunkFlags,
    pub id_prefix: [u8; 8],
    /// 1-based for data chunks; overloaded by control chunks (received
    /// count for ACK, window index for parity).
    pub sequence: u16,
    pub total: u16,
    pub payload: Bytes,
}

impl Chunk {
    pub fn data(id_prefix: [u8; 8], sequence: u16, total: u16, payload: Bytes) -> Self {
        Self {
            flags: ChunkFlags::NONE,
            id_prefix,
            sequence,
            total,
            payload,
        }
    }

    /// Acknowledge `received` chunks of an envelope.
    pub fn ack(id_prefix: [u8; 8], received: u16, total: u16) -> Self {
        Self {
            flags: ChunkFlags::ACK,
            id_prefix,
            sequence: received,
            total,
            payload: Bytes::new(),
        }
    }

    /// Request retransmission of the listed sequences.
    pub fn nack(id_prefix: [u8; 8], missing: &[u16], total: u16) -> Self {
        let mut payload = BytesMut::with_capacity(missing.len() * 2);
        for &seq in missing {
            payload.put_u16_le(seq);
        }
        Self {
            flags: ChunkFlags::NACK,
            id_prefix,
            sequence: 0,
            total,
            payload: payload.freeze(),
        }
    }

    /// Parity chunk for the 1-based window `index`.
    pub fn parity(id_prefix: [u8; 8], index: u16, total: u16, payload: Bytes) -> Self {
        Self {
            flags: ChunkFlags::PARITY,
            id_prefix,
            sequence: index,
            total,
            payload,
        }
    }

    pub fn is_data(&self) -> bool {
        self.flags.0 & (ChunkFlags::ACK.0 | ChunkFlags::NACK.0 | ChunkFlags::PARITY.0) == 0
    }

    /// Parse the missing-sequence list out of a NACK payload.
    pub fn nack_seqs(&self) -> Vec<u16> {
        self.payload
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&CHUNK_MAGIC);
        buf.put_u8(CHUNK_VERSION);
        buf.put_u8(self.flags.0);
        buf.put_slice(&self.id_prefix);
        buf.put_u16_le(self.sequence);
        buf.put_u16_le(self.total);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < CHUNK_HEADER_LEN {
            return Err(DecodeError::TooShort {
                expected: CHUNK_HEADER_LEN,
                actual: data.len(),
            });
        }
        if data[0..2] != CHUNK_MAGIC {
            return Err(DecodeError::BadMagic(data[0], data[1]));
        }
        if data[2] != CHUNK_VERSION {
            return Err(DecodeError::BadVersion(data[2]));
        }
        let flags = ChunkFlags(data[3]);
        let mut id_prefix = [0u8; 8];
        id_prefix.copy_from_slice(&data[4..12]);
        let mut rest = &data[12..16];
        let sequence = rest.get_u16_le();
        let total = rest.get_u16_le();
        Ok(Self {
            flags,
            id_prefix,
            sequence,
            total,
            payload: Bytes::copy_from_slice(&data[CHUNK_HEADER_LEN..]),
        })
    }

    /// Split an encoded envelope into data chunks of at most
    /// `chunk_payload_size` bytes each, sequences `1..=total`.
    pub fn split(
        id_prefix: [u8; 8],
        payload: &Bytes,
        chunk_payload_size: usize,
    ) -> Option<Vec<Chunk>> {
        let count = payload.len().div_ceil(chunk_payload_size).max(1);
        if count > u16::MAX as usize {
            return None;
        }
        let total = count as u16;
        let mut chunks = Vec::with_capacity(count);
        if payload.is_empty() {
            chunks.push(Chunk::data(id_prefix, 1, total, Bytes::new()));
            return Some(chunks);
        }
        for (i, piece) in payload.chunks(chunk_payload_size).enumerate() {
            chunks.push(Chunk::data(
                id_prefix,
                (i + 1) as u16,
                total,
                payload.slice_ref(piece),
            ));
        }
        Some(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> [u8; 8] {
        *b"abcdef01"
    }

    #[test]
    fn roundtrip_data_chunk() {
        let chunk = Chunk::data(prefix(), 3, 9, Bytes::from_static(b"piece"));
        let decoded = Chunk::decode(&chunk.encode()).unwrap();
        assert_eq!(decoded, chunk);
        assert!(decoded.is_data());
    }

    #[test]
    fn roundtrip_control_chunks() {
        let ack = Chunk::ack(prefix(), 5, 9);
        let decoded = Chunk::decode(&ack.encode()).unwrap();
        assert!(decoded.flags.contains(ChunkFlags::ACK));
        assert_eq!(decoded.sequence, 5);

        let nack = Chunk::nack(prefix(), &[2, 7, 8], 9);
        let decoded = Chunk::decode(&nack.encode()).unwrap();
        assert!(decoded.flags.contains(ChunkFlags::NACK));
        assert_eq!(decoded.nack_seqs(), vec![2, 7, 8]);

        let parity = Chunk::parity(prefix(), 2, 9, Bytes::from_static(b"xor"));
        let decoded = Chunk::decode(&parity.encode()).unwrap();
        assert!(decoded.flags.contains(ChunkFlags::PARITY));
        assert!(!decoded.is_data());
    }

    #[test]
    fn bad_magic_and_version() {
        let chunk = Chunk::data(prefix(), 1, 1, Bytes::new());
        let mut wire = chunk.encode().to_vec();
        wire[0] = b'X';
        assert!(matches!(
            Chunk::decode(&wire),
            Err(DecodeError::BadMagic(b'X', b'B'))
        ));

        let mut wire = chunk.encode().to_vec();
        wire[2] = 9;
        assert!(matches!(Chunk::decode(&wire), Err(DecodeError::BadVersion(9))));
    }

    #[test]
    fn short_datagram_rejected() {
        assert!(matches!(
            Chunk::decode(&[0u8; CHUNK_HEADER_LEN - 1]),
            Err(DecodeError::TooShort { .. })
        ));
    }

    #[test]
    fn split_assigns_one_based_sequences() {
        let payload = Bytes::from(vec![7u8; 450]);
        let chunks = Chunk::split(prefix(), &payload, 180).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].sequence, 1);
        assert_eq!(chunks[2].sequence, 3);
        assert!(chunks.iter().all(|c| c.total == 3));
        assert_eq!(chunks[2].payload.len(), 90);
    }

    #[test]
    fn split_empty_payload_is_one_chunk() {
        let chunks = Chunk::split(prefix(), &Bytes::new(), 180).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence, 1);
        assert_eq!(chunks[0].total, 1);
    }
}
