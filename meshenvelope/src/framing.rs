//! Length-prefix framing for envelopes riding a byte stream.
//!
//! A deployment may carry envelopes over one `meshstream` stream instead
//! of raw datagrams. The stream delivers an ordered byte sequence with no
//! record boundaries, so each encoded envelope is prefixed with its
//! length as u32 LE. The splitter buffers stream bytes and yields one
//! complete record at a time.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::envelope::MAX_RECORD_SIZE;
use crate::error::{EnvelopeError, Result};

/// Prefix one encoded envelope for stream transport.
pub fn frame_record(record: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + record.len());
    buf.put_u32_le(record.len() as u32);
    buf.put_slice(record);
    buf.freeze()
}

/// Incremental splitter for the receiving end of the stream.
#[derive(Default)]
pub struct RecordSplitter {
    buf: BytesMut,
}

impl RecordSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes as they arrive from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete record, if one is buffered.
    pub fn next_record(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_RECORD_SIZE {
            return Err(EnvelopeError::TooLarge {
                size: len,
                max: MAX_RECORD_SIZE,
            });
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    #[test]
    fn records_split_across_arbitrary_chunks() {
        let a = Envelope::request("echo", Bytes::from_static(b"one")).encode().unwrap();
        let b = Envelope::request("echo", Bytes::from_static(b"two")).encode().unwrap();

        let mut wire = Vec::new();
        wire.extend_from_slice(&frame_record(&a));
        wire.extend_from_slice(&frame_record(&b));

        // Feed in awkward 3-byte slices.
        let mut splitter = RecordSplitter::new();
        let mut records = Vec::new();
        for piece in wire.chunks(3) {
            splitter.push(piece);
            while let Some(record) = splitter.next_record().unwrap() {
                records.push(record);
            }
        }

        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][..], &a[..]);
        assert_eq!(&records[1][..], &b[..]);
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn oversize_length_rejected() {
        let mut splitter = RecordSplitter::new();
        splitter.push(&u32::MAX.to_le_bytes());
        assert!(matches!(
            splitter.next_record(),
            Err(EnvelopeError::TooLarge { .. })
        ));
    }

    #[test]
    fn partial_record_waits() {
        let record = frame_record(b"hello");
        let mut splitter = RecordSplitter::new();
        splitter.push(&record[..6]);
        assert!(splitter.next_record().unwrap().is_none());
        splitter.push(&record[6..]);
        assert_eq!(&splitter.next_record().unwrap().unwrap()[..], b"hello");
    }
}
