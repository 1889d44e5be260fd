//! The record type - the unit of data in a Strand partition.
//!
//! A record is an opaque byte value stamped by the primary with a
//! monotonic, gap-free index and a wall-clock timestamp at append time.
//!
//! # Body Format
//!
//! Records are encoded as `varint index | varint timestamp_ms | value`.
//! The value carries no length prefix: the enclosing frame length bounds
//! it (see `strand-journal`). Varints are unsigned LEB128, low 7 bits
//! first, at most 10 bytes for a u64.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::LogIndex;

/// A single record in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Index in the partition log (assigned by the primary).
    pub index: LogIndex,
    /// Primary wall-clock time at append, in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    /// The opaque record payload.
    pub value: Bytes,
}

impl Record {
    /// Creates a new record.
    #[must_use]
    pub const fn new(index: LogIndex, timestamp_ms: u64, value: Bytes) -> Self {
        Self {
            index,
            timestamp_ms,
            value,
        }
    }

    /// Returns the encoded body size in bytes.
    #[must_use]
    pub fn body_size(&self) -> usize {
        varint_size(self.index.get()) + varint_size(self.timestamp_ms) + self.value.len()
    }

    /// Encodes the record body (no frame header) into `buf`.
    pub fn encode_body(&self, buf: &mut BytesMut) {
        put_varint(buf, self.index.get());
        put_varint(buf, self.timestamp_ms);
        buf.put_slice(&self.value);
    }

    /// Decodes a record body from `buf`, consuming all remaining bytes
    /// as the value.
    ///
    /// Returns `None` if either varint is malformed.
    pub fn decode_body(buf: &mut impl Buf) -> Option<Self> {
        let index = get_varint(buf)?;
        let timestamp_ms = get_varint(buf)?;
        let value = buf.copy_to_bytes(buf.remaining());
        Some(Self {
            index: LogIndex::new(index),
            timestamp_ms,
            value,
        })
    }
}

/// Returns the encoded size of `value` as a varint.
#[must_use]
pub(crate) const fn varint_size(value: u64) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x001f_ffff => 3,
        0x0020_0000..=0x0fff_ffff => 4,
        0x1000_0000..=0x0007_ffff_ffff => 5,
        0x0008_0000_0000..=0x03ff_ffff_ffff => 6,
        0x0400_0000_0000..=0x0001_ffff_ffff_ffff => 7,
        0x0002_0000_0000_0000..=0x00ff_ffff_ffff_ffff => 8,
        0x0100_0000_0000_0000..=0x7fff_ffff_ffff_ffff => 9,
        _ => 10,
    }
}

/// Writes `value` as an unsigned LEB128 varint.
pub(crate) fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint, or `None` if the buffer ends or the
/// encoding exceeds 10 bytes.
pub(crate) fn get_varint(buf: &mut impl Buf) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() || shift >= 70 {
            return None;
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_size(value));
            assert_eq!(get_varint(&mut buf.freeze()), Some(value));
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 300);
        buf.truncate(1);
        assert_eq!(get_varint(&mut buf.freeze()), None);
    }

    #[test]
    fn test_record_body_roundtrip() {
        let record = Record::new(LogIndex::new(42), 1_700_000_000_123, Bytes::from("payload"));

        let mut buf = BytesMut::with_capacity(record.body_size());
        record.encode_body(&mut buf);
        assert_eq!(buf.len(), record.body_size());

        let decoded = Record::decode_body(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_empty_value() {
        let record = Record::new(LogIndex::new(1), 0, Bytes::new());

        let mut buf = BytesMut::new();
        record.encode_body(&mut buf);

        let decoded = Record::decode_body(&mut buf.freeze()).unwrap();
        assert!(decoded.value.is_empty());
        assert_eq!(decoded.index, LogIndex::new(1));
    }
}
