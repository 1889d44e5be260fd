//! Journal segment management.
//!
//! A segment is a single file holding a contiguous slice of records.
//! While a segment is the tail of the journal it is mutable (the
//! "active" segment); all earlier segments are sealed and immutable.
//!
//! # Segment File Format
//!
//! ```text
//! +-------------------+
//! | Segment Header    |  (40 bytes)
//! +-------------------+
//! | Frame 1           |
//! +-------------------+
//! | Frame 2           |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! ```
//!
//! Segment header:
//! - Magic (8 bytes): "STRNDSEG"
//! - Version (4 bytes): Format version
//! - First Index (8 bytes): First log index in this segment
//! - Max Bytes (8 bytes): Seal threshold the segment was created with
//! - Created At (8 bytes): Creation wall-clock, ms since Unix epoch
//! - Reserved (4 bytes): For future use

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use strand_core::{Limits, LogIndex, Record};

use crate::error::{JournalError, JournalResult};
use crate::frame::{decode_frame, encode_frame, frame_size};

/// Segment header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 40;

/// Magic bytes identifying a Strand journal segment.
const SEGMENT_MAGIC: &[u8; 8] = b"STRNDSEG";

/// Current segment format version.
const SEGMENT_VERSION: u32 = 1;

/// Segment header stored at the beginning of each segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u32,
    /// First log index in this segment.
    pub first_index: LogIndex,
    /// Seal threshold in bytes the segment was created with.
    pub max_bytes: u64,
    /// Creation time, milliseconds since Unix epoch.
    pub created_at_ms: u64,
}

impl SegmentHeader {
    /// Creates a new segment header.
    #[must_use]
    pub const fn new(first_index: LogIndex, max_bytes: u64, created_at_ms: u64) -> Self {
        Self {
            version: SEGMENT_VERSION,
            first_index,
            max_bytes,
            created_at_ms,
        }
    }

    /// Encodes the header to bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(SEGMENT_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.first_index.get());
        buf.put_u64_le(self.max_bytes);
        buf.put_u64_le(self.created_at_ms);
        buf.put_u32_le(0); // Reserved
    }

    /// Decodes a header from bytes.
    ///
    /// # Errors
    /// Returns an error if the data is invalid.
    pub fn decode(buf: &mut impl Buf) -> JournalResult<Self> {
        if buf.remaining() < SEGMENT_HEADER_SIZE {
            return Err(JournalError::InvalidHeader {
                offset: 0,
                reason: "segment header too small",
            });
        }

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if &magic != SEGMENT_MAGIC {
            return Err(JournalError::InvalidHeader {
                offset: 0,
                reason: "invalid segment magic",
            });
        }

        let version = buf.get_u32_le();
        if version != SEGMENT_VERSION {
            return Err(JournalError::InvalidHeader {
                offset: 0,
                reason: "unsupported segment version",
            });
        }

        let first_index = LogIndex::new(buf.get_u64_le());
        let max_bytes = buf.get_u64_le();
        let created_at_ms = buf.get_u64_le();
        let _reserved = buf.get_u32_le();

        Ok(Self {
            version,
            first_index,
            max_bytes,
            created_at_ms,
        })
    }
}

/// Introspection data for one segment, for operators and tests.
#[derive(Debug, Clone, Copy)]
pub struct SegmentInfo {
    /// First log index in this segment.
    pub first_index: LogIndex,
    /// Last log index in this segment (None if empty).
    pub last_index: Option<LogIndex>,
    /// Total size in bytes (header + frames).
    pub size_bytes: u64,
    /// Creation time, milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Whether the segment is sealed.
    pub sealed: bool,
}

/// An in-memory journal segment, mirrored to one on-disk file.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Segment header.
    header: SegmentHeader,
    /// Records in this segment.
    records: Vec<Record>,
    /// Current size in bytes (header + frames).
    size_bytes: u64,
    /// Whether the segment is sealed (no more writes).
    sealed: bool,
}

impl Segment {
    /// Creates a new empty segment.
    #[must_use]
    pub const fn new(first_index: LogIndex, max_bytes: u64, created_at_ms: u64) -> Self {
        Self {
            header: SegmentHeader::new(first_index, max_bytes, created_at_ms),
            records: Vec::new(),
            size_bytes: SEGMENT_HEADER_SIZE as u64,
            sealed: false,
        }
    }

    /// Returns the first index in this segment.
    #[must_use]
    pub const fn first_index(&self) -> LogIndex {
        self.header.first_index
    }

    /// Returns the last index in this segment, or None if empty.
    #[must_use]
    pub fn last_index(&self) -> Option<LogIndex> {
        self.records.last().map(|r| r.index)
    }

    /// Returns the creation timestamp in milliseconds since Unix epoch.
    #[must_use]
    pub const fn created_at_ms(&self) -> u64 {
        self.header.created_at_ms
    }

    /// Returns the number of records in this segment.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.records.len() as u64
    }

    /// Returns the current size in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Returns true if the segment is sealed (no more writes allowed).
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns true if the segment has room for a frame of the given size.
    #[must_use]
    pub fn has_space_for(&self, frame_bytes: u64) -> bool {
        if self.sealed {
            return false;
        }
        // An empty segment accepts any record, even one larger than the
        // seal threshold, so oversized values still land somewhere.
        if self.records.is_empty() {
            return self.record_count() < Limits::RECORDS_PER_SEGMENT_MAX;
        }
        self.size_bytes + frame_bytes <= self.header.max_bytes
            && self.record_count() < Limits::RECORDS_PER_SEGMENT_MAX
    }

    /// Appends a record to the segment.
    ///
    /// # Panics
    /// Panics if the segment is sealed or if the record index is not
    /// sequential.
    ///
    /// # Errors
    /// Returns an error if the segment is full.
    pub fn append(&mut self, record: Record) -> JournalResult<u64> {
        assert!(!self.sealed, "cannot append to sealed segment");

        let bytes = frame_size(&record);
        if !self.has_space_for(bytes) {
            return Err(JournalError::SegmentFull {
                reason: "size or record count limit reached",
            });
        }

        let expected = self
            .records
            .last()
            .map_or(self.header.first_index, |r| r.index.next());
        assert_eq!(record.index, expected, "record index must be sequential");

        self.size_bytes += bytes;
        self.records.push(record);
        Ok(bytes)
    }

    /// Reads a record by index.
    ///
    /// # Errors
    /// Returns an error if the index is out of bounds.
    pub fn read(&self, index: LogIndex) -> JournalResult<&Record> {
        let first = self.header.first_index;
        let last = self.last_index().unwrap_or(first.prev());

        if self.records.is_empty() || index < first || index > last {
            return Err(JournalError::IndexOutOfBounds { index, first, last });
        }

        #[allow(clippy::cast_possible_truncation)] // Record count bounded by limits.
        let offset = (index.get() - first.get()) as usize;
        Ok(&self.records[offset])
    }

    /// Returns the records with index >= `from`, clamped to this segment.
    #[must_use]
    pub fn records_from(&self, from: LogIndex) -> &[Record] {
        let first = self.header.first_index;
        if from <= first {
            return &self.records;
        }
        #[allow(clippy::cast_possible_truncation)] // Record count bounded by limits.
        let skip = (from.get() - first.get()) as usize;
        if skip >= self.records.len() {
            return &[];
        }
        &self.records[skip..]
    }

    /// Truncates records after the given index, keeping entries up to and
    /// including `last_index_to_keep`. Works on sealed and unsealed
    /// segments; the caller is responsible for rewriting the file.
    pub fn truncate_after(&mut self, last_index_to_keep: LogIndex) {
        if self.records.is_empty() {
            return;
        }

        let first = self.header.first_index;

        if last_index_to_keep < first {
            let removed: u64 = self.records.iter().map(frame_size).sum();
            self.size_bytes -= removed;
            self.records.clear();
            return;
        }

        #[allow(clippy::cast_possible_truncation)] // Record count bounded by limits.
        let keep = (last_index_to_keep.get() - first.get() + 1) as usize;
        if keep >= self.records.len() {
            return;
        }

        let removed: u64 = self.records[keep..].iter().map(frame_size).sum();
        self.records.truncate(keep);
        self.size_bytes -= removed;
    }

    /// Seals the segment, preventing further writes.
    pub const fn seal(&mut self) {
        self.sealed = true;
    }

    /// Reopens a sealed segment for writes. Used when a truncation makes
    /// a previously sealed segment the tail again.
    pub const fn unseal(&mut self) {
        self.sealed = false;
    }

    /// Returns introspection data for this segment.
    #[must_use]
    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            first_index: self.first_index(),
            last_index: self.last_index(),
            size_bytes: self.size_bytes,
            created_at_ms: self.header.created_at_ms,
            sealed: self.sealed,
        }
    }

    /// Encodes the entire segment (header plus frames) to bytes.
    ///
    /// # Panics
    /// Panics if a stored record fails to encode; records are size-checked
    /// on append, so this indicates an invariant violation.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Size bounded by config.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_bytes as usize);
        self.header.encode(&mut buf);
        for record in &self.records {
            encode_frame(record, &mut buf).expect("stored record must encode");
        }
        buf.freeze()
    }

    /// Decodes a segment from bytes.
    ///
    /// A torn frame at the tail ends the scan silently; a checksum or
    /// body failure ends the scan with a warning. Either way the segment
    /// holds exactly the frames up to the last good one, and
    /// `size_bytes()` reflects where the file should be truncated.
    ///
    /// # Errors
    /// Returns an error only if the segment header itself is invalid.
    pub fn decode(mut data: Bytes, sealed: bool) -> JournalResult<Self> {
        let header = SegmentHeader::decode(&mut data)?;

        let mut records = Vec::new();
        let mut offset = SEGMENT_HEADER_SIZE as u64;

        while data.has_remaining() {
            match decode_frame(&mut data, offset) {
                Ok(record) => {
                    offset += frame_size(&record);
                    records.push(record);
                }
                Err(e) if e.is_torn_write() => break,
                Err(e) => {
                    warn!(offset, error = %e, "discarding segment tail after bad frame");
                    break;
                }
            }
        }

        let size_bytes = SEGMENT_HEADER_SIZE as u64 + records.iter().map(frame_size).sum::<u64>();

        Ok(Self {
            header,
            records,
            size_bytes,
            sealed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FRAME_HEADER_SIZE;

    fn make_record(index: u64, value: &str) -> Record {
        Record::new(LogIndex::new(index), 1_000, Bytes::from(value.to_string()))
    }

    fn make_segment(first: u64) -> Segment {
        Segment::new(LogIndex::new(first), 1024 * 1024, 0)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = SegmentHeader::new(LogIndex::new(100), 8192, 1_700_000_000_000);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), SEGMENT_HEADER_SIZE);

        let decoded = SegmentHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_append_and_read() {
        let mut segment = make_segment(1);

        for i in 1..=5 {
            segment.append(make_record(i, &format!("record-{i}"))).unwrap();
        }

        assert_eq!(segment.record_count(), 5);
        assert_eq!(segment.first_index(), LogIndex::new(1));
        assert_eq!(segment.last_index(), Some(LogIndex::new(5)));

        for i in 1..=5 {
            let record = segment.read(LogIndex::new(i)).unwrap();
            assert_eq!(record.index, LogIndex::new(i));
        }
        assert!(segment.read(LogIndex::new(6)).is_err());
    }

    #[test]
    fn test_records_from() {
        let mut segment = make_segment(10);
        for i in 10..=14 {
            segment.append(make_record(i, "x")).unwrap();
        }

        assert_eq!(segment.records_from(LogIndex::new(1)).len(), 5);
        assert_eq!(segment.records_from(LogIndex::new(13)).len(), 2);
        assert!(segment.records_from(LogIndex::new(15)).is_empty());
    }

    #[test]
    fn test_segment_roundtrip() {
        let mut segment = make_segment(1);
        for i in 1..=3 {
            segment.append(make_record(i, &format!("data-{i}"))).unwrap();
        }

        let encoded = segment.encode();
        let decoded = Segment::decode(encoded, false).unwrap();

        assert_eq!(decoded.first_index(), segment.first_index());
        assert_eq!(decoded.record_count(), 3);
        assert_eq!(decoded.size_bytes(), segment.size_bytes());
        for i in 1..=3 {
            assert_eq!(
                decoded.read(LogIndex::new(i)).unwrap(),
                segment.read(LogIndex::new(i)).unwrap()
            );
        }
    }

    #[test]
    fn test_decode_stops_at_torn_tail() {
        let mut segment = make_segment(1);
        for i in 1..=3 {
            segment.append(make_record(i, "payload")).unwrap();
        }

        let encoded = segment.encode();
        // Cut into the middle of the last frame.
        let cut = encoded.len() - 4;
        let decoded = Segment::decode(encoded.slice(..cut), false).unwrap();

        assert_eq!(decoded.record_count(), 2);
        assert_eq!(decoded.last_index(), Some(LogIndex::new(2)));
    }

    #[test]
    fn test_decode_stops_at_corrupt_frame() {
        let mut segment = make_segment(1);
        for i in 1..=3 {
            segment.append(make_record(i, "payload")).unwrap();
        }

        let mut encoded = BytesMut::from(&segment.encode()[..]);
        // Flip a byte in the second frame's body.
        let second_frame_body =
            SEGMENT_HEADER_SIZE + (segment.size_bytes() as usize - SEGMENT_HEADER_SIZE) / 3
                + FRAME_HEADER_SIZE
                + 1;
        encoded[second_frame_body] ^= 0xFF;

        let decoded = Segment::decode(encoded.freeze(), false).unwrap();
        assert_eq!(decoded.record_count(), 1);
    }

    #[test]
    fn test_truncate_after() {
        let mut segment = make_segment(1);
        for i in 1..=5 {
            segment.append(make_record(i, "x")).unwrap();
        }
        let full_size = segment.size_bytes();

        segment.truncate_after(LogIndex::new(3));
        assert_eq!(segment.record_count(), 3);
        assert_eq!(segment.last_index(), Some(LogIndex::new(3)));
        assert!(segment.size_bytes() < full_size);

        segment.truncate_after(LogIndex::ZERO);
        assert_eq!(segment.record_count(), 0);
        assert_eq!(segment.size_bytes(), SEGMENT_HEADER_SIZE as u64);
    }

    #[test]
    fn test_sealed_rejects_space() {
        let mut segment = make_segment(1);
        segment.append(make_record(1, "x")).unwrap();
        segment.seal();
        assert!(!segment.has_space_for(1));
    }

    #[test]
    fn test_seal_threshold() {
        let mut segment = Segment::new(LogIndex::new(1), 128, 0);
        // First record always fits.
        segment.append(make_record(1, "0123456789")).unwrap();
        // Fill until the threshold rejects.
        let mut index = 2;
        loop {
            let record = make_record(index, "0123456789");
            if !segment.has_space_for(frame_size(&record)) {
                break;
            }
            segment.append(record).unwrap();
            index += 1;
        }
        assert!(segment.size_bytes() <= 128);
    }
}
