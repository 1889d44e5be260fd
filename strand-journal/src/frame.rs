//! Record framing.
//!
//! Each record is stored as one frame:
//!
//! ```text
//! +----------+----------+------------------------------+
//! |  Length  |  crc32c  |  Body                        |
//! | (4 bytes)| (4 bytes)| (varint index | varint ts    |
//! |          |          |  | value bytes)              |
//! +----------+----------+------------------------------+
//! ```
//!
//! - Length: body length in bytes (not including this header)
//! - crc32c: checksum of the body only
//!
//! Integers are little-endian. A frame whose body runs past the end of
//! the buffer is a torn write; decoding reports it distinctly from
//! checksum corruption so recovery can truncate silently vs. warn.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use strand_core::{Limits, Record};

use crate::error::{JournalError, JournalResult};

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8; // 4 + 4

/// Largest legal frame body: a maximum-size value plus two 10-byte varints.
const FRAME_BODY_MAX: u32 = Limits::RECORD_VALUE_BYTES_MAX + 20;

/// Returns the total on-disk size of the frame for `record`.
#[must_use]
pub fn frame_size(record: &Record) -> u64 {
    FRAME_HEADER_SIZE as u64 + record.body_size() as u64
}

/// Encodes `record` as a frame into `buf`.
///
/// # Errors
/// Returns `RecordTooLarge` if the value exceeds the limit.
#[allow(clippy::cast_possible_truncation)] // Body size checked against FRAME_BODY_MAX.
pub fn encode_frame(record: &Record, buf: &mut BytesMut) -> JournalResult<()> {
    if record.value.len() > Limits::RECORD_VALUE_BYTES_MAX as usize {
        return Err(JournalError::RecordTooLarge {
            size: record.value.len() as u32,
            max: Limits::RECORD_VALUE_BYTES_MAX,
        });
    }

    let mut body = BytesMut::with_capacity(record.body_size());
    record.encode_body(&mut body);

    buf.put_u32_le(body.len() as u32);
    buf.put_u32_le(crc32c::crc32c(&body));
    buf.put_slice(&body);
    Ok(())
}

/// Decodes one frame from `buf` at byte `offset` (used for diagnostics).
///
/// # Errors
/// - `TruncatedFrame` if the header or body runs past the buffer end
/// - `InvalidHeader` if the length field is implausible
/// - `ChecksumMismatch` if the body fails crc32c verification
#[allow(clippy::cast_possible_truncation)] // remaining() bounded by FRAME_BODY_MAX here.
pub fn decode_frame(buf: &mut Bytes, offset: u64) -> JournalResult<Record> {
    if buf.remaining() < FRAME_HEADER_SIZE {
        return Err(JournalError::TruncatedFrame {
            offset,
            expected: FRAME_HEADER_SIZE as u32,
            found: buf.remaining() as u32,
        });
    }

    let length = buf.get_u32_le();
    let expected_crc = buf.get_u32_le();

    if length == 0 || length > FRAME_BODY_MAX {
        return Err(JournalError::InvalidHeader {
            offset,
            reason: "frame length out of range",
        });
    }

    if buf.remaining() < length as usize {
        return Err(JournalError::TruncatedFrame {
            offset,
            expected: length,
            found: buf.remaining() as u32,
        });
    }

    let body = buf.copy_to_bytes(length as usize);
    let actual_crc = crc32c::crc32c(&body);
    if actual_crc != expected_crc {
        return Err(JournalError::ChecksumMismatch {
            offset,
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    Record::decode_body(&mut body.clone()).ok_or(JournalError::InvalidHeader {
        offset,
        reason: "malformed record body",
    })
}
