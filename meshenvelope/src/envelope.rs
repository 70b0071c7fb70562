//! Envelope record codec.
//!
//! An envelope is the semantic unit of the command gateway: a request,
//! response, or error with a command name, opaque data, and optional
//! metadata. On the wire it is a compact tagged key-value record --
//! `tag(u8) | len(u16 LE) | value` per field -- compressed as one zlib
//! stream. Unknown tags are skipped on decode so older peers tolerate
//! newer fields.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use meshstream::radio::NodeId;

use crate::error::{EnvelopeError, Result};

/// Decompressed record size cap; anything bigger is a zip bomb or a bug.
pub const MAX_RECORD_SIZE: usize = 256 * 1024;

const TAG_ID: u8 = 0x01;
const TAG_KIND: u8 = 0x02;
const TAG_COMMAND: u8 = 0x03;
const TAG_CORRELATION: u8 = 0x04;
const TAG_DATA: u8 = 0x05;
const TAG_META: u8 = 0x06;

/// Envelope role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    Request = 1,
    Response = 2,
    Error = 3,
}

impl EnvelopeKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(EnvelopeKind::Request),
            2 => Ok(EnvelopeKind::Response),
            3 => Ok(EnvelopeKind::Error),
            _ => Err(EnvelopeError::BadRecord("unknown envelope kind")),
        }
    }
}

/// Key a completed envelope is deduplicated by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Caller-supplied override via `meta["dedupe_key"]`.
    Explicit { sender: NodeId, key: String },
    /// Default derivation.
    Derived {
        sender: NodeId,
        command: String,
        id: String,
    },
}

/// A request/response record carried over the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub kind: EnvelopeKind,
    pub command: String,
    pub correlation_id: Option<String>,
    pub data: Bytes,
    pub meta: BTreeMap<String, String>,
}

impl Envelope {
    /// Build a request with a fresh random id.
    pub fn request(command: impl Into<String>, data: Bytes) -> Self {
        Self {
            id: format!("{:016x}", rand::random::<u64>()),
            kind: EnvelopeKind::Request,
            command: command.into(),
            correlation_id: None,
            data,
            meta: BTreeMap::new(),
        }
    }

    /// Build the response to a request, correlated by the request id.
    pub fn response(request: &Envelope, data: Bytes) -> Self {
        Self {
            id: format!("{:016x}", rand::random::<u64>()),
            kind: EnvelopeKind::Response,
            command: request.command.clone(),
            correlation_id: Some(request.id.clone()),
            data,
            meta: BTreeMap::new(),
        }
    }

    /// Build an error reply to a request.
    pub fn error_reply(request: &Envelope, message: impl Into<String>) -> Self {
        Self {
            id: format!("{:016x}", rand::random::<u64>()),
            kind: EnvelopeKind::Error,
            command: request.command.clone(),
            correlation_id: Some(request.id.clone()),
            data: Bytes::from(message.into().into_bytes()),
            meta: BTreeMap::new(),
        }
    }

    /// First 8 bytes of the id, zero-padded: the chunk-header index.
    pub fn id_prefix(&self) -> [u8; 8] {
        let mut prefix = [0u8; 8];
        let bytes = self.id.as_bytes();
        let n = bytes.len().min(8);
        prefix[..n].copy_from_slice(&bytes[..n]);
        prefix
    }

    /// Derive the dedup key: `meta["dedupe_key"]` wins, otherwise
    /// `(sender, command, id)`.
    pub fn dedupe_key(&self, sender: NodeId) -> DedupKey {
        match self.meta.get("dedupe_key") {
            Some(key) => DedupKey::Explicit {
                sender,
                key: key.clone(),
            },
            None => DedupKey::Derived {
                sender,
                command: self.command.clone(),
                id: self.id.clone(),
            },
        }
    }

    fn put_field(buf: &mut BytesMut, tag: u8, value: &[u8]) -> Result<()> {
        if value.len() > u16::MAX as usize {
            return Err(EnvelopeError::TooLarge {
                size: value.len(),
                max: u16::MAX as usize,
            });
        }
        buf.put_u8(tag);
        buf.put_u16_le(value.len() as u16);
        buf.put_slice(value);
        Ok(())
    }

    fn record_bytes(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(64 + self.data.len());
        Self::put_field(&mut buf, TAG_ID, self.id.as_bytes())?;
        Self::put_field(&mut buf, TAG_KIND, &[self.kind as u8])?;
        Self::put_field(&mut buf, TAG_COMMAND, self.command.as_bytes())?;
        if let Some(corr) = &self.correlation_id {
            Self::put_field(&mut buf, TAG_CORRELATION, corr.as_bytes())?;
        }
        Self::put_field(&mut buf, TAG_DATA, &self.data)?;
        if !self.meta.is_empty() {
            let mut meta = BytesMut::new();
            meta.put_u8(self.meta.len().min(u8::MAX as usize) as u8);
            for (key, value) in self.meta.iter().take(u8::MAX as usize) {
                meta.put_u16_le(key.len() as u16);
                meta.put_slice(key.as_bytes());
                meta.put_u16_le(value.len() as u16);
                meta.put_slice(value.as_bytes());
            }
            Self::put_field(&mut buf, TAG_META, &meta)?;
        }
        Ok(buf)
    }

    /// Serialize and compress into the over-the-air representation.
    pub fn encode(&self) -> Result<Bytes> {
        let record = self.record_bytes()?;
        if record.len() > MAX_RECORD_SIZE {
            return Err(EnvelopeError::TooLarge {
                size: record.len(),
                max: MAX_RECORD_SIZE,
            });
        }
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(record.len() / 2), Compression::default());
        encoder.write_all(&record)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Inflate and parse an over-the-air envelope.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut record = Vec::new();
        ZlibDecoder::new(data)
            .take(MAX_RECORD_SIZE as u64 + 1)
            .read_to_end(&mut record)?;
        if record.len() > MAX_RECORD_SIZE {
            return Err(EnvelopeError::TooLarge {
                size: record.len(),
                max: MAX_RECORD_SIZE,
            });
        }
        Self::parse_record(&record)
    }

    fn parse_record(mut buf: &[u8]) -> Result<Self> {
        let mut id = None;
        let mut kind = None;
        let mut command = None;
        let mut correlation_id = None;
        let mut data = Bytes::new();
        let mut meta = BTreeMap::new();

        while buf.has_remaining() {
            if buf.remaining() < 3 {
                return Err(EnvelopeError::BadRecord("truncated field header"));
            }
            let tag = buf.get_u8();
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return Err(EnvelopeError::BadRecord("field length overruns record"));
            }
            let value = &buf[..len];
            match tag {
                TAG_ID => id = Some(str_value(value, "id")?),
                TAG_KIND => {
                    if len != 1 {
                        return Err(EnvelopeError::BadRecord("kind must be one byte"));
                    }
                    kind = Some(EnvelopeKind::from_u8(value[0])?);
                }
                TAG_COMMAND => command = Some(str_value(value, "command")?),
                TAG_CORRELATION => correlation_id = Some(str_value(value, "correlation_id")?),
                TAG_DATA => data = Bytes::copy_from_slice(value),
                TAG_META => meta = parse_meta(value)?,
                _ => {} // forward compatibility: skip unknown fields
            }
            buf.advance(len);
        }

        Ok(Self {
            id: id.ok_or(EnvelopeError::BadRecord("missing id"))?,
            kind: kind.ok_or(EnvelopeError::BadRecord("missing kind"))?,
            command: command.ok_or(EnvelopeError::BadRecord("missing command"))?,
            correlation_id,
            data,
            meta,
        })
    }
}

fn str_value(value: &[u8], field: &'static str) -> Result<String> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| EnvelopeError::BadRecord(field))
}

fn parse_meta(mut buf: &[u8]) -> Result<BTreeMap<String, String>> {
    if buf.is_empty() {
        return Err(EnvelopeError::BadRecord("empty meta field"));
    }
    let count = buf.get_u8();
    let mut meta = BTreeMap::new();
    for _ in 0..count {
        let key = take_str(&mut buf)?;
        let value = take_str(&mut buf)?;
        meta.insert(key, value);
    }
    Ok(meta)
}

fn take_str(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(EnvelopeError::BadRecord("truncated meta entry"));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(EnvelopeError::BadRecord("meta entry overruns field"));
    }
    let s = str_value(&buf[..len], "meta entry")?;
    buf.advance(len);
    Ok(s)
}
