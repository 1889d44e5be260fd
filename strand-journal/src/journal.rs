//! Journal management.
//!
//! The [`Journal`] owns the ordered sequence of segments for one
//! partition, handling:
//! - Active segment rotation when the seal threshold is reached
//! - Recovery from crashes (torn tail frames, leftover active files)
//! - Suffix truncation for replication repair
//! - Compaction of sealed segments by total size and by age
//!
//! # File Layout
//!
//! ```text
//! /<data_dir>/<partition>/
//!   segment-1.log          # Sealed segment
//!   segment-829.log        # Sealed segment
//!   segment-1205.active    # Active segment (current writes)
//!   meta                   # {first_index, last_index, commit_index}
//! ```
//!
//! Sealing is the `.active` -> `.log` rename. The `meta` sidecar is
//! rewritten and fsynced on every durable commit advance, on truncation,
//! and on compaction.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use strand_core::{LogConfig, LogIndex, Record};

use crate::error::{JournalError, JournalResult};
use crate::frame::encode_frame;
use crate::segment::{Segment, SegmentInfo, SEGMENT_HEADER_SIZE};
use crate::storage::{Storage, StorageFile};

/// Size of the encoded meta sidecar: three u64 fields plus a crc32c.
const META_SIZE: usize = 28;

/// Journal configuration.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory for segment files and the meta sidecar.
    pub dir: PathBuf,
    /// Seal threshold for the active segment.
    pub max_segment_bytes: u64,
    /// Total size cap; size-based compaction deletes oldest-first until
    /// the journal fits.
    pub max_log_bytes: u64,
    /// Sealed segments older than this are removed by age-based
    /// compaction.
    pub max_log_age: Duration,
    /// Fsync the active segment on every append.
    pub flush_on_append: bool,
}

impl JournalConfig {
    /// Creates a journal configuration with defaults.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let defaults = LogConfig::default();
        Self {
            dir: dir.into(),
            max_segment_bytes: defaults.max_segment_bytes,
            max_log_bytes: defaults.max_log_bytes,
            max_log_age: defaults.max_log_age,
            flush_on_append: defaults.flush_on_append,
        }
    }

    /// Creates a journal configuration from a partition config.
    #[must_use]
    pub fn from_log_config(dir: impl Into<PathBuf>, config: &LogConfig) -> Self {
        Self {
            dir: dir.into(),
            max_segment_bytes: config.max_segment_bytes,
            max_log_bytes: config.max_log_bytes,
            max_log_age: config.max_log_age,
            flush_on_append: config.flush_on_append,
        }
    }

    /// Sets the seal threshold.
    #[must_use]
    pub fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets the total size cap.
    #[must_use]
    pub fn with_max_log_bytes(mut self, bytes: u64) -> Self {
        self.max_log_bytes = bytes;
        self
    }

    /// Sets the age cap.
    #[must_use]
    pub fn with_max_log_age(mut self, age: Duration) -> Self {
        self.max_log_age = age;
        self
    }
}

/// A sealed (read-only) segment and its file path.
struct SealedSegment {
    segment: Segment,
    path: PathBuf,
}

/// The active segment being written to.
struct ActiveSegment {
    segment: Segment,
    file: Box<dyn StorageFile>,
    path: PathBuf,
}

/// Segmented journal for one partition.
///
/// Generic over the storage backend `S` (`tokio::fs` in production,
/// in-memory with fault injection in tests).
pub struct Journal<S: Storage> {
    storage: Arc<S>,
    config: JournalConfig,
    /// Sealed segments keyed by first index.
    sealed: BTreeMap<u64, SealedSegment>,
    active: Option<ActiveSegment>,
    meta_file: Box<dyn StorageFile>,
    /// Compaction floor: lowest index still present.
    first_index: LogIndex,
    /// Highest index present; `LogIndex::ZERO` when empty.
    last_index: LogIndex,
    /// Durability floor; never regresses.
    commit_index: LogIndex,
    /// Set on the first storage failure; all mutations refused after.
    poisoned: bool,
}

impl<S: Storage> Journal<S> {
    /// Opens or creates a journal in the configured directory.
    ///
    /// Existing segments are recovered in filename order; torn tail
    /// frames are dropped and the file truncated to the last good frame.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be prepared or a segment
    /// header is unreadable.
    pub async fn open(storage: S, config: JournalConfig) -> JournalResult<Self> {
        let storage = Arc::new(storage);
        storage.create_dir_all(&config.dir).await?;

        let meta_file = storage.open(&config.dir.join("meta")).await?;
        let meta = decode_meta(&meta_file.read_all().await?);

        // Leftover `.active` files beyond the newest are crash debris
        // from a seal that never completed; seal them now.
        let mut active_paths = storage.list_files(&config.dir, "active").await?;
        active_paths.sort_by_key(|p| first_index_from_path(p));
        while active_paths.len() > 1 {
            let stale = active_paths.remove(0);
            let sealed_path = stale.with_extension("log");
            warn!(path = %stale.display(), "sealing leftover active segment");
            storage.rename(&stale, &sealed_path).await?;
        }

        let mut segments: Vec<(Segment, PathBuf, bool)> = Vec::new();
        for path in storage.list_files(&config.dir, "log").await? {
            let data = storage.open(&path).await?.read_all().await?;
            match Segment::decode(data, true) {
                Ok(segment) => segments.push((segment, path, true)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable segment");
                }
            }
        }
        if let Some(path) = active_paths.pop() {
            let data = storage.open(&path).await?.read_all().await?;
            match Segment::decode(data, false) {
                Ok(segment) => segments.push((segment, path, false)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable active segment");
                }
            }
        }
        segments.sort_by_key(|(segment, _, _)| segment.first_index().get());

        let mut journal = Self {
            storage,
            config,
            sealed: BTreeMap::new(),
            active: None,
            meta_file,
            first_index: LogIndex::new(1),
            last_index: LogIndex::ZERO,
            commit_index: LogIndex::ZERO,
            poisoned: false,
        };

        let mut expected_first: Option<LogIndex> = None;
        for (segment, path, sealed) in segments {
            if let Some(expected) = expected_first {
                if segment.first_index() != expected {
                    warn!(
                        first_index = %segment.first_index(),
                        expected = %expected,
                        "gap in segment sequence, dropping remainder"
                    );
                    break;
                }
            } else {
                journal.first_index = segment.first_index();
            }
            expected_first = Some(
                segment
                    .last_index()
                    .map_or(segment.first_index(), LogIndex::next),
            );

            if let Some(last) = segment.last_index() {
                journal.last_index = last;
            }

            debug!(
                first_index = %segment.first_index(),
                records = segment.record_count(),
                sealed,
                "recovered segment"
            );

            if sealed {
                journal
                    .sealed
                    .insert(segment.first_index().get(), SealedSegment { segment, path });
            } else {
                // Drop any torn tail from the file itself.
                let file = journal.storage.open(&path).await?;
                let valid = segment.size_bytes();
                if file.size().await? > valid {
                    warn!(path = %path.display(), valid, "truncating torn segment tail");
                    file.truncate(valid).await?;
                    file.sync().await?;
                }
                journal.active = Some(ActiveSegment { segment, file, path });
            }
        }

        if let Some((meta_first, _meta_last, meta_commit)) = meta {
            if journal.sealed.is_empty() && journal.active.is_none() {
                journal.first_index = LogIndex::new(meta_first.max(1));
            }
            let commit = LogIndex::new(meta_commit);
            if commit > journal.last_index {
                warn!(
                    commit = %commit,
                    last_index = %journal.last_index,
                    "meta commit index beyond recovered tail, clamping"
                );
            }
            journal.commit_index = commit.min(journal.last_index);
        }

        info!(
            segments = journal.sealed.len() + usize::from(journal.active.is_some()),
            first_index = %journal.first_index,
            last_index = %journal.last_index,
            commit_index = %journal.commit_index,
            "journal recovery complete"
        );

        Ok(journal)
    }

    /// Returns the lowest index still present.
    #[must_use]
    pub const fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Returns the highest index present, or `LogIndex::ZERO` when empty.
    #[must_use]
    pub const fn last_index(&self) -> LogIndex {
        self.last_index
    }

    /// Returns the commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Returns true if the journal is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.last_index.get() == 0
    }

    /// Returns true if a storage failure has poisoned the journal.
    #[must_use]
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Returns total bytes across all segments.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        let sealed: u64 = self.sealed.values().map(|s| s.segment.size_bytes()).sum();
        sealed + self.active.as_ref().map_or(0, |a| a.segment.size_bytes())
    }

    /// Returns introspection data for all segments, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentInfo> {
        let mut infos: Vec<SegmentInfo> =
            self.sealed.values().map(|s| s.segment.info()).collect();
        if let Some(active) = &self.active {
            infos.push(active.segment.info());
        }
        infos
    }

    /// Appends a value as the next record.
    ///
    /// Allocates the next index, stamps the primary's wall clock, writes
    /// a frame to the active segment (rotating first if the seal
    /// threshold would be exceeded), and returns the assigned index.
    ///
    /// # Errors
    /// Returns `Poisoned` after an earlier failure, `RecordTooLarge` for
    /// oversized values, or the storage error that poisoned the journal.
    pub async fn append(&mut self, value: Bytes) -> JournalResult<LogIndex> {
        let record = Record::new(self.next_index(), now_ms(), value);
        self.append_record(record).await
    }

    /// Appends a record that already carries its index and timestamp.
    ///
    /// Backups use this to store records exactly as stamped by the
    /// primary, byte-for-byte.
    ///
    /// # Panics
    /// Panics if the record's index is not the next expected index.
    ///
    /// # Errors
    /// Same failure modes as [`Journal::append`].
    pub async fn append_record(&mut self, record: Record) -> JournalResult<LogIndex> {
        self.check_poisoned()?;

        let index = record.index;
        assert_eq!(index, self.next_index(), "record index must be sequential");

        let mut frame = BytesMut::with_capacity(record.body_size() + 8);
        encode_frame(&record, &mut frame)?;
        let frame = frame.freeze();

        let result = self.append_frame(record, &frame).await;
        if result.is_err() {
            self.poison("append");
        }
        result?;

        self.last_index = index;
        debug!(index = %index, bytes = frame.len(), "appended record");
        Ok(index)
    }

    /// Returns the index the next appended record will receive.
    #[must_use]
    pub const fn next_index(&self) -> LogIndex {
        if self.is_empty() {
            self.first_index
        } else {
            self.last_index.next()
        }
    }

    async fn append_frame(&mut self, record: Record, frame: &Bytes) -> JournalResult<()> {
        self.ensure_active_segment(frame.len() as u64).await?;

        let active = self
            .active
            .as_mut()
            .expect("active segment exists after ensure_active_segment");

        active.file.append(frame).await?;
        active.segment.append(record)?;

        if self.config.flush_on_append {
            active.file.sync().await?;
        }
        Ok(())
    }

    /// Reads records starting at `max(from, first_index)`, bounded by
    /// `max_bytes` of record values (at least one record is returned when
    /// any is available). Returns the records and the next index to read.
    #[must_use]
    pub fn read(&self, from: LogIndex, max_bytes: u32) -> (Vec<Record>, LogIndex) {
        if self.is_empty() || from > self.last_index {
            return (Vec::new(), from);
        }

        let start = from.max(self.first_index);
        let mut records = Vec::new();
        let mut bytes = 0u64;

        'outer: for segment in self.segments_containing(start) {
            for record in segment.records_from(start) {
                bytes += record.value.len() as u64;
                if !records.is_empty() && bytes > u64::from(max_bytes) {
                    break 'outer;
                }
                records.push(record.clone());
                if bytes >= u64::from(max_bytes) {
                    break 'outer;
                }
            }
        }

        let next = records.last().map_or(start, |r| r.index.next());
        (records, next)
    }

    /// Returns the record at `index`, if present.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&Record> {
        if index < self.first_index || index > self.last_index || self.is_empty() {
            return None;
        }
        for segment in self.segments_containing(index) {
            if let Ok(record) = segment.read(index) {
                return Some(record);
            }
        }
        None
    }

    /// Removes all records with index greater than `through`.
    ///
    /// Used by backups when a newly elected primary rejects their tail.
    /// Reseals or reopens the active segment as needed.
    ///
    /// # Errors
    /// Returns `TruncateBelowCommit` if `through` would drop committed
    /// records, or a storage error (which poisons the journal).
    pub async fn truncate_suffix(&mut self, through: LogIndex) -> JournalResult<()> {
        self.check_poisoned()?;

        if through < self.commit_index {
            return Err(JournalError::TruncateBelowCommit {
                through,
                commit: self.commit_index,
            });
        }
        if through >= self.last_index {
            return Ok(());
        }

        let result = self.truncate_inner(through).await;
        if result.is_err() {
            self.poison("truncate_suffix");
        }
        result?;

        self.last_index = if through < self.first_index {
            LogIndex::ZERO
        } else {
            through
        };
        self.persist_meta().await?;
        info!(through = %through, "truncated journal suffix");
        Ok(())
    }

    async fn truncate_inner(&mut self, through: LogIndex) -> JournalResult<()> {
        // Drop sealed segments that lie entirely above the cut.
        let doomed: Vec<u64> = self
            .sealed
            .range((through.get() + 1)..)
            .map(|(&k, _)| k)
            .collect();
        for key in doomed {
            if let Some(sealed) = self.sealed.remove(&key) {
                self.storage.remove(&sealed.path).await?;
                debug!(first_index = key, "removed sealed segment above truncation");
            }
        }

        // Handle the active segment.
        let drop_active = self
            .active
            .as_ref()
            .is_some_and(|a| a.segment.first_index() > through);
        if drop_active {
            let active = self.active.take().expect("checked above");
            self.storage.remove(&active.path).await?;
        } else if let Some(active) = &mut self.active {
            active.segment.truncate_after(through);
            let data = active.segment.encode();
            active.file.truncate(0).await?;
            active.file.append(&data).await?;
            active.file.sync().await?;
            return Ok(());
        }

        // The cut may land inside the newest remaining sealed segment;
        // it becomes the active tail again.
        if let Some((&key, _)) = self.sealed.iter().next_back() {
            let covers_cut = self.sealed[&key]
                .segment
                .last_index()
                .is_some_and(|last| last > through);
            if covers_cut {
                let mut sealed = self.sealed.remove(&key).expect("key from iteration");
                sealed.segment.truncate_after(through);
                sealed.segment.unseal();

                let active_path = sealed.path.with_extension("active");
                self.storage.rename(&sealed.path, &active_path).await?;

                let file = self.storage.open(&active_path).await?;
                let data = sealed.segment.encode();
                file.truncate(0).await?;
                file.append(&data).await?;
                file.sync().await?;

                self.active = Some(ActiveSegment {
                    segment: sealed.segment,
                    file,
                    path: active_path,
                });
            }
        }
        Ok(())
    }

    /// Advances the commit index to `max(commit_index, min(index,
    /// last_index))` and makes the advance durable. Never regresses.
    ///
    /// # Errors
    /// Returns a storage error if the fsync or meta write fails (which
    /// poisons the journal).
    pub async fn commit(&mut self, index: LogIndex) -> JournalResult<()> {
        self.check_poisoned()?;

        let target = index.min(self.last_index);
        if target <= self.commit_index {
            return Ok(());
        }

        let result: JournalResult<()> = async {
            if let Some(active) = &self.active {
                active.file.sync().await?;
            }
            Ok(())
        }
        .await;
        if result.is_err() {
            self.poison("commit");
        }
        result?;

        self.commit_index = target;
        self.persist_meta().await?;
        debug!(commit_index = %target, "advanced commit index");
        Ok(())
    }

    /// Removes sealed segments that are wholly committed and satisfy at
    /// least one compaction policy.
    ///
    /// Size-based deletions are evaluated first (oldest-first until the
    /// journal fits under `max_log_bytes`), then age-based on whatever
    /// remains. The active segment is never deleted. After compaction
    /// `first_index` is `1 + last_index` of the newest deleted segment.
    ///
    /// # Errors
    /// Returns a storage error if the meta update fails.
    pub async fn compact(&mut self) -> JournalResult<()> {
        self.check_poisoned()?;
        let now = now_ms();

        // Only sealed segments wholly below the commit index qualify.
        let candidates: Vec<u64> = self
            .sealed
            .iter()
            .filter(|(_, s)| {
                s.segment
                    .last_index()
                    .is_some_and(|last| last < self.commit_index)
            })
            .map(|(&k, _)| k)
            .collect();

        let mut deleted_through: Option<LogIndex> = None;
        let mut total = self.total_bytes();

        for &key in &candidates {
            let over_size = total > self.config.max_log_bytes;
            let over_age = {
                let age_ms = now.saturating_sub(self.sealed[&key].segment.created_at_ms());
                u128::from(age_ms) > self.config.max_log_age.as_millis()
            };
            if !over_size && !over_age {
                // Size policy deletes oldest-first; once the journal fits
                // and this segment is young enough, later ones are too
                // young as well only for the size policy, so keep
                // scanning for age alone.
                continue;
            }

            let sealed = self.sealed.remove(&key).expect("candidate key present");
            total = total.saturating_sub(sealed.segment.size_bytes());
            let last = sealed.segment.last_index().expect("non-empty candidate");

            if let Err(e) = self.storage.remove(&sealed.path).await {
                warn!(path = %sealed.path.display(), error = %e, "failed to remove compacted segment");
            }
            info!(
                first_index = %sealed.segment.first_index(),
                last_index = %last,
                reason = if over_size { "size" } else { "age" },
                "compacted segment"
            );
            deleted_through = Some(deleted_through.map_or(last, |d| d.max(last)));
        }

        if let Some(through) = deleted_through {
            self.first_index = through.next();
            self.persist_meta().await?;
        }
        Ok(())
    }

    /// Fsyncs the active segment and the meta sidecar.
    ///
    /// # Errors
    /// Returns a storage error on failure (which poisons the journal).
    pub async fn sync(&mut self) -> JournalResult<()> {
        self.check_poisoned()?;
        let result: JournalResult<()> = async {
            if let Some(active) = &self.active {
                active.file.sync().await?;
            }
            Ok(())
        }
        .await;
        if result.is_err() {
            self.poison("sync");
        }
        result?;
        self.persist_meta().await
    }

    /// Iterates segments that may contain indices >= `start`, oldest
    /// first.
    fn segments_containing(&self, start: LogIndex) -> impl Iterator<Item = &Segment> {
        let sealed = self
            .sealed
            .values()
            .filter(move |s| s.segment.last_index().is_some_and(|last| last >= start))
            .map(|s| &s.segment);
        sealed.chain(self.active.as_ref().map(|a| &a.segment))
    }

    /// Ensures there is an active segment with room for `frame_bytes`.
    async fn ensure_active_segment(&mut self, frame_bytes: u64) -> JournalResult<()> {
        if let Some(active) = &self.active {
            if active.segment.has_space_for(frame_bytes) {
                return Ok(());
            }
            self.seal_active().await?;
        }

        let first_index = if self.is_empty() {
            self.first_index
        } else {
            self.last_index.next()
        };
        let path = self
            .config
            .dir
            .join(format!("segment-{}.active", first_index.get()));

        let segment = Segment::new(first_index, self.config.max_segment_bytes, now_ms());
        let file = self.storage.open(&path).await?;

        let mut header = BytesMut::with_capacity(SEGMENT_HEADER_SIZE);
        segment_header_bytes(&segment, &mut header);
        file.append(&header).await?;

        info!(first_index = %first_index, path = %path.display(), "opened new active segment");
        self.active = Some(ActiveSegment { segment, file, path });
        Ok(())
    }

    /// Seals the current active segment: fsync, mark sealed, rename to
    /// `.log`.
    async fn seal_active(&mut self) -> JournalResult<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };

        active.file.sync().await?;
        active.segment.seal();

        let sealed_path = active.path.with_extension("log");
        self.storage.rename(&active.path, &sealed_path).await?;

        info!(
            first_index = %active.segment.first_index(),
            records = active.segment.record_count(),
            "sealed segment"
        );
        self.sealed.insert(
            active.segment.first_index().get(),
            SealedSegment {
                segment: active.segment,
                path: sealed_path,
            },
        );
        Ok(())
    }

    /// Rewrites and fsyncs the meta sidecar.
    async fn persist_meta(&mut self) -> JournalResult<()> {
        let mut buf = BytesMut::with_capacity(META_SIZE);
        buf.put_u64_le(self.first_index.get());
        buf.put_u64_le(self.last_index.get());
        buf.put_u64_le(self.commit_index.get());
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);

        let result: JournalResult<()> = async {
            self.meta_file.truncate(0).await?;
            self.meta_file.append(&buf).await?;
            self.meta_file.sync().await
        }
        .await;
        if result.is_err() {
            self.poison("persist_meta");
        }
        result
    }

    const fn check_poisoned(&self) -> JournalResult<()> {
        if self.poisoned {
            return Err(JournalError::Poisoned);
        }
        Ok(())
    }

    fn poison(&mut self, operation: &'static str) {
        if !self.poisoned {
            warn!(operation, "storage failure poisoned the journal");
            self.poisoned = true;
        }
    }
}

/// Encodes the header of `segment` into `buf`.
fn segment_header_bytes(segment: &Segment, buf: &mut BytesMut) {
    // Re-encode just the header portion via the full encoding; the
    // segment is empty at creation so this is exactly the header.
    debug_assert_eq!(segment.record_count(), 0);
    buf.put_slice(&segment.encode()[..SEGMENT_HEADER_SIZE]);
}

/// Decodes the meta sidecar; `None` if missing or corrupt.
fn decode_meta(data: &Bytes) -> Option<(u64, u64, u64)> {
    use bytes::Buf;

    if data.len() < META_SIZE {
        return None;
    }
    let body = &data[..24];
    let mut crc_buf = &data[24..28];
    if crc32c::crc32c(body) != crc_buf.get_u32_le() {
        warn!("meta sidecar failed checksum, falling back to segment scan");
        return None;
    }
    let mut buf = body;
    Some((buf.get_u64_le(), buf.get_u64_le(), buf.get_u64_le()))
}

/// Extracts the first index from a segment file name for sorting.
fn first_index_from_path(path: &std::path::Path) -> u64 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("segment-"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Current wall clock in milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)] // Fits u64 for the foreseeable future.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FaultConfig, SimStorage, TokioStorage};

    fn small_config(dir: impl Into<PathBuf>) -> JournalConfig {
        JournalConfig::new(dir).with_max_segment_bytes(1024)
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(TokioStorage::new(), JournalConfig::new(dir.path()))
            .await
            .unwrap();

        assert!(journal.is_empty());
        for i in 1..=5u64 {
            let index = journal.append(Bytes::from(format!("value-{i}"))).await.unwrap();
            assert_eq!(index, LogIndex::new(i));
        }

        let (records, next) = journal.read(LogIndex::new(1), 64 * 1024);
        assert_eq!(records.len(), 5);
        assert_eq!(next, LogIndex::new(6));
        assert_eq!(records[2].value, Bytes::from("value-3"));

        let (records, next) = journal.read(LogIndex::new(4), 64 * 1024);
        assert_eq!(records.len(), 2);
        assert_eq!(next, LogIndex::new(6));

        // Past the tail: empty, cursor unchanged.
        let (records, next) = journal.read(LogIndex::new(9), 64 * 1024);
        assert!(records.is_empty());
        assert_eq!(next, LogIndex::new(9));
    }

    #[tokio::test]
    async fn test_read_bounded_by_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(TokioStorage::new(), JournalConfig::new(dir.path()))
            .await
            .unwrap();

        for _ in 0..10 {
            journal.append(Bytes::from(vec![0u8; 100])).await.unwrap();
        }

        let (records, next) = journal.read(LogIndex::new(1), 250);
        assert_eq!(records.len(), 2);
        assert_eq!(next, LogIndex::new(3));

        // A tiny budget still returns one record.
        let (records, _) = journal.read(LogIndex::new(1), 1);
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_on_seal_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(TokioStorage::new(), small_config(dir.path()))
            .await
            .unwrap();

        // ~36-byte values force several rotations under a 1 KiB cap.
        for _ in 0..100 {
            journal.append(Bytes::from(vec![7u8; 36])).await.unwrap();
        }

        let segments = journal.segments();
        assert!(segments.len() > 2, "expected rotation, got {segments:?}");
        assert!(segments.iter().rev().skip(1).all(|s| s.sealed));
        assert!(!segments.last().unwrap().sealed);

        // Gap-free chain across segments.
        for pair in segments.windows(2) {
            assert_eq!(pair[0].last_index.unwrap().next(), pair[1].first_index);
        }
    }

    #[tokio::test]
    async fn test_recovery_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());

        {
            let mut journal = Journal::open(TokioStorage::new(), config.clone()).await.unwrap();
            for i in 1..=50u64 {
                journal.append(Bytes::from(format!("r{i}"))).await.unwrap();
            }
            journal.commit(LogIndex::new(37)).await.unwrap();
        }

        let journal = Journal::open(TokioStorage::new(), config).await.unwrap();
        assert_eq!(journal.first_index(), LogIndex::new(1));
        assert_eq!(journal.last_index(), LogIndex::new(50));
        assert_eq!(journal.commit_index(), LogIndex::new(37));

        let (records, _) = journal.read(LogIndex::new(1), u32::MAX);
        assert_eq!(records.len(), 50);
        assert_eq!(records[36].value, Bytes::from("r37"));
    }

    #[tokio::test]
    async fn test_recovery_truncates_torn_tail() {
        let storage = SimStorage::new();
        let config = JournalConfig::new("/p1");

        {
            let mut journal = Journal::open(storage.clone(), config.clone()).await.unwrap();
            for i in 1..=3u64 {
                journal.append(Bytes::from(format!("value-{i}"))).await.unwrap();
            }
            journal.sync().await.unwrap();

            // The fourth frame tears mid-write: only its first ten
            // bytes reach the file before the "crash".
            storage.fault_config().force_torn_write_at = Some(10);
            assert!(journal.append(Bytes::from("value-4")).await.is_err());
            assert!(journal.is_poisoned());
        }

        let journal = Journal::open(storage, config).await.unwrap();
        assert_eq!(journal.last_index(), LogIndex::new(3));
        let (records, _) = journal.read(LogIndex::new(1), u32::MAX);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].value, Bytes::from("value-3"));
    }

    #[tokio::test]
    async fn test_crash_loses_only_unsynced_tail() {
        let storage = SimStorage::new();
        let config = JournalConfig::new("/p1");

        {
            let mut journal = Journal::open(storage.clone(), config.clone()).await.unwrap();
            for i in 1..=5u64 {
                journal.append(Bytes::from(format!("value-{i}"))).await.unwrap();
            }
            // Commit fsyncs; everything up to 5 is durable.
            journal.commit(LogIndex::new(5)).await.unwrap();

            journal.append(Bytes::from("value-6")).await.unwrap();
            journal.append(Bytes::from("value-7")).await.unwrap();
            assert_eq!(journal.last_index(), LogIndex::new(7));
        }

        storage.simulate_crash();

        let journal = Journal::open(storage, config).await.unwrap();
        assert_eq!(journal.last_index(), LogIndex::new(5));
        assert_eq!(journal.commit_index(), LogIndex::new(5));
    }

    #[tokio::test]
    async fn test_recovery_discards_corrupt_tail_frame() {
        let storage = SimStorage::new();
        let config = JournalConfig::new("/p1");

        {
            let mut journal = Journal::open(storage.clone(), config.clone()).await.unwrap();
            for i in 1..=4u64 {
                journal.append(Bytes::from(format!("value-{i}"))).await.unwrap();
            }
            journal.sync().await.unwrap();
        }

        // Flip a byte inside the last frame's body; the checksum scan
        // rolls the segment back to the prior good frame.
        let path = std::path::Path::new("/p1/segment-1.active");
        let len = storage.raw_content(path).unwrap().len();
        storage.corrupt_bytes(path, len - 2, 1);

        let journal = Journal::open(storage, config).await.unwrap();
        assert_eq!(journal.last_index(), LogIndex::new(3));
    }

    #[tokio::test]
    async fn test_truncate_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(TokioStorage::new(), small_config(dir.path()))
            .await
            .unwrap();

        for _ in 0..60 {
            journal.append(Bytes::from(vec![1u8; 36])).await.unwrap();
        }
        assert!(journal.segments().len() > 1);
        journal.commit(LogIndex::new(10)).await.unwrap();

        journal.truncate_suffix(LogIndex::new(20)).await.unwrap();
        assert_eq!(journal.last_index(), LogIndex::new(20));
        let (records, _) = journal.read(LogIndex::new(1), u32::MAX);
        assert_eq!(records.len(), 20);

        // New appends continue from the cut.
        let index = journal.append(Bytes::from("tail")).await.unwrap();
        assert_eq!(index, LogIndex::new(21));

        // Below the commit index is refused.
        let result = journal.truncate_suffix(LogIndex::new(5)).await;
        assert!(matches!(result, Err(JournalError::TruncateBelowCommit { .. })));
    }

    #[tokio::test]
    async fn test_truncate_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());

        {
            let mut journal = Journal::open(TokioStorage::new(), config.clone()).await.unwrap();
            for _ in 0..60 {
                journal.append(Bytes::from(vec![1u8; 36])).await.unwrap();
            }
            journal.truncate_suffix(LogIndex::new(25)).await.unwrap();
        }

        let journal = Journal::open(TokioStorage::new(), config).await.unwrap();
        assert_eq!(journal.last_index(), LogIndex::new(25));
    }

    #[tokio::test]
    async fn test_commit_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(TokioStorage::new(), JournalConfig::new(dir.path()))
            .await
            .unwrap();

        for _ in 0..5 {
            journal.append(Bytes::from("x")).await.unwrap();
        }

        journal.commit(LogIndex::new(4)).await.unwrap();
        assert_eq!(journal.commit_index(), LogIndex::new(4));

        // Never regresses.
        journal.commit(LogIndex::new(2)).await.unwrap();
        assert_eq!(journal.commit_index(), LogIndex::new(4));

        // Clamped to the tail.
        journal.commit(LogIndex::new(99)).await.unwrap();
        assert_eq!(journal.commit_index(), LogIndex::new(5));
    }

    #[tokio::test]
    async fn test_size_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path()).with_max_log_bytes(1024);
        let mut journal = Journal::open(TokioStorage::new(), config).await.unwrap();

        let mut last = LogIndex::ZERO;
        while journal.segments().len() <= 2 {
            last = journal.append(Bytes::from(vec![9u8; 36])).await.unwrap();
        }
        journal.commit(last).await.unwrap();

        journal.compact().await.unwrap();

        assert!(journal.first_index() > LogIndex::new(1));
        assert!(journal.total_bytes() <= 1024 + SEGMENT_HEADER_SIZE as u64 * 2);
        // Still gap-free from the new floor.
        let (records, _) = journal.read(LogIndex::new(1), u32::MAX);
        assert_eq!(records.first().unwrap().index, journal.first_index());
    }

    #[tokio::test]
    async fn test_age_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path()).with_max_log_age(Duration::from_millis(10));
        let mut journal = Journal::open(TokioStorage::new(), config).await.unwrap();

        let mut last = LogIndex::ZERO;
        while journal.segments().len() <= 1 {
            last = journal.append(Bytes::from(vec![9u8; 36])).await.unwrap();
        }
        journal.commit(last).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        journal.compact().await.unwrap();

        assert!(journal.first_index() > LogIndex::new(1));
    }

    #[tokio::test]
    async fn test_compaction_never_removes_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path())
            .with_max_log_bytes(64)
            .with_max_log_age(Duration::from_millis(0));
        let mut journal = Journal::open(TokioStorage::new(), config).await.unwrap();

        while journal.segments().len() <= 2 {
            journal.append(Bytes::from(vec![9u8; 36])).await.unwrap();
        }

        // Nothing committed: nothing may be deleted.
        journal.compact().await.unwrap();
        assert_eq!(journal.first_index(), LogIndex::new(1));
    }

    #[tokio::test]
    async fn test_write_failure_poisons() {
        let storage =
            SimStorage::with_faults(42, FaultConfig::none().with_fail_writes_after(6));
        let mut journal = Journal::open(storage, JournalConfig::new("/p1")).await.unwrap();

        let mut poisoned = false;
        for _ in 0..16 {
            if journal.append(Bytes::from("x")).await.is_err() {
                poisoned = true;
                break;
            }
        }
        assert!(poisoned);
        assert!(journal.is_poisoned());

        // Every mutation now fails fast.
        assert!(matches!(
            journal.append(Bytes::from("y")).await,
            Err(JournalError::Poisoned)
        ));
        assert!(matches!(
            journal.commit(LogIndex::new(1)).await,
            Err(JournalError::Poisoned)
        ));

        // Reads keep serving recovered in-memory state.
        let (records, _) = journal.read(LogIndex::new(1), u32::MAX);
        assert!(!records.is_empty());
    }

    #[tokio::test]
    async fn test_sim_storage_recovery() {
        let storage = SimStorage::new();
        {
            let mut journal = Journal::open(storage.clone(), JournalConfig::new("/p1"))
                .await
                .unwrap();
            for i in 1..=4u64 {
                journal.append(Bytes::from(format!("v{i}"))).await.unwrap();
            }
            journal.commit(LogIndex::new(4)).await.unwrap();
        }

        let journal = Journal::open(storage, JournalConfig::new("/p1")).await.unwrap();
        assert_eq!(journal.last_index(), LogIndex::new(4));
        assert_eq!(journal.commit_index(), LogIndex::new(4));
    }
}
