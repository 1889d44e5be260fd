//! Storage abstraction for journal files.
//!
//! The journal's file access pattern is narrow: segments and the meta
//! sidecar are only ever appended to, read back whole, truncated, and
//! fsynced. The [`StorageFile`] trait exposes exactly that, with no
//! positional writes. Two backends exist: [`TokioStorage`] over
//! `tokio::fs` for production, and [`SimStorage`], an in-memory
//! implementation with deterministic fault injection for crash and
//! durability tests.
//!
//! # Fault Model
//!
//! `SimStorage` keeps two copies of every file: the dirty bytes (what a
//! running process sees) and the synced bytes (what survives a crash).
//! `sync` promotes dirty to synced; [`SimStorage::simulate_crash`]
//! throws away everything unsynced. On top of that, [`FaultConfig`]
//! can fail or tear writes and fail fsyncs, either probabilistically
//! (seeded, deterministic per seed) or as a one-shot forced fault.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{JournalError, JournalResult};

/// Storage backend trait for journal files.
///
/// Implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Opens or creates a file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or created.
    async fn open(&self, path: &Path) -> JournalResult<Box<dyn StorageFile>>;

    /// Lists files in a directory with the given extension. Order is
    /// unspecified; the journal orders segments by the index in their
    /// name, not by listing order.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    async fn list_files(&self, dir: &Path, extension: &str) -> JournalResult<Vec<PathBuf>>;

    /// Renames a file. Used to seal the active segment.
    ///
    /// # Errors
    /// Returns an error if the rename fails.
    async fn rename(&self, from: &Path, to: &Path) -> JournalResult<()>;

    /// Removes a file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be removed.
    async fn remove(&self, path: &Path) -> JournalResult<()>;

    /// Creates a directory and all parent directories.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    async fn create_dir_all(&self, path: &Path) -> JournalResult<()>;
}

/// A handle to one journal file. Writes always go to the end.
#[async_trait]
pub trait StorageFile: Send + Sync {
    /// Appends data at the end of the file.
    ///
    /// # Errors
    /// Returns an error if the write fails; the file may then hold a
    /// prefix of `data` (torn write).
    async fn append(&self, data: &[u8]) -> JournalResult<()>;

    /// Reads the entire file contents.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    async fn read_all(&self) -> JournalResult<Bytes>;

    /// Syncs all buffered data to disk (fsync). Data appended before a
    /// successful `sync` survives a crash.
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    async fn sync(&self) -> JournalResult<()>;

    /// Returns the current file size in bytes.
    ///
    /// # Errors
    /// Returns an error if the size cannot be determined.
    async fn size(&self) -> JournalResult<u64>;

    /// Truncates the file to the specified length. Subsequent appends
    /// continue from the new end.
    ///
    /// # Errors
    /// Returns an error if the truncation fails.
    async fn truncate(&self, len: u64) -> JournalResult<()>;
}

/// Production storage over `tokio::fs`.
///
/// Files are opened in append mode, which matches the journal's
/// write pattern exactly: the kernel pins every write to the end of
/// the file, so no seek bookkeeping is needed, and a rewrite is just
/// `truncate(0)` followed by appends.
#[derive(Debug, Clone)]
pub struct TokioStorage;

impl TokioStorage {
    /// Creates a new Tokio storage instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for TokioStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for TokioStorage {
    async fn open(&self, path: &Path) -> JournalResult<Box<dyn StorageFile>> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| JournalError::io("open", e))?;
        Ok(Box::new(TokioFile {
            file: tokio::sync::Mutex::new(file),
        }))
    }

    async fn list_files(&self, dir: &Path, extension: &str) -> JournalResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| JournalError::io("read_dir", e))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JournalError::io("read_dir_entry", e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == extension) {
                files.push(path);
            }
        }
        Ok(files)
    }

    async fn rename(&self, from: &Path, to: &Path) -> JournalResult<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| JournalError::io("rename", e))
    }

    async fn remove(&self, path: &Path) -> JournalResult<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| JournalError::io("remove", e))
    }

    async fn create_dir_all(&self, path: &Path) -> JournalResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| JournalError::io("create_dir_all", e))
    }
}

/// An append-mode file handle over `tokio::fs`.
struct TokioFile {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

#[allow(clippy::significant_drop_tightening)] // Lock held for the full operation.
#[async_trait]
impl StorageFile for TokioFile {
    async fn append(&self, data: &[u8]) -> JournalResult<()> {
        use tokio::io::AsyncWriteExt;

        let mut file = self.file.lock().await;
        file.write_all(data)
            .await
            .map_err(|e| JournalError::io("append", e))
    }

    async fn read_all(&self) -> JournalResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| JournalError::io("seek", e))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| JournalError::io("read", e))?;
        Ok(Bytes::from(buf))
    }

    async fn sync(&self) -> JournalResult<()> {
        let file = self.file.lock().await;
        file.sync_all().await.map_err(|e| JournalError::io("sync", e))
    }

    async fn size(&self) -> JournalResult<u64> {
        let file = self.file.lock().await;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| JournalError::io("metadata", e))?;
        Ok(metadata.len())
    }

    async fn truncate(&self, len: u64) -> JournalResult<()> {
        let file = self.file.lock().await;
        file.set_len(len)
            .await
            .map_err(|e| JournalError::io("truncate", e))
    }
}

/// Fault injection configuration for [`SimStorage`].
///
/// Rates are probabilities in `0.0..=1.0`, evaluated with a
/// deterministic seeded hash so a given seed reproduces the same fault
/// schedule. The `force_*` fields fire exactly once, on the next
/// matching operation.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of an append failing outright.
    pub write_fail_rate: f64,
    /// Probability of an append being torn at a pseudo-random offset.
    pub torn_write_rate: f64,
    /// Probability of an fsync failing.
    pub fsync_fail_rate: f64,
    /// Fail every append after this many have gone through.
    pub fail_writes_after: Option<u64>,
    /// Tear the next append after this many bytes, then clear.
    pub force_torn_write_at: Option<usize>,
    /// Fail the next fsync, then clear.
    pub force_fsync_fail: bool,
}

impl FaultConfig {
    /// A configuration that injects nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Sets the append failure rate.
    #[must_use]
    pub const fn with_write_fail_rate(mut self, rate: f64) -> Self {
        self.write_fail_rate = rate;
        self
    }

    /// Sets the torn-append rate.
    #[must_use]
    pub const fn with_torn_write_rate(mut self, rate: f64) -> Self {
        self.torn_write_rate = rate;
        self
    }

    /// Sets the fsync failure rate.
    #[must_use]
    pub const fn with_fsync_fail_rate(mut self, rate: f64) -> Self {
        self.fsync_fail_rate = rate;
        self
    }

    /// Fails every append after `count` have gone through.
    #[must_use]
    pub const fn with_fail_writes_after(mut self, count: u64) -> Self {
        self.fail_writes_after = Some(count);
        self
    }

    /// Tears the next append after `bytes` bytes.
    #[must_use]
    pub const fn with_force_torn_write_at(mut self, bytes: usize) -> Self {
        self.force_torn_write_at = Some(bytes);
        self
    }

    /// Fails the next fsync.
    #[must_use]
    pub const fn with_force_fsync_fail(mut self) -> Self {
        self.force_fsync_fail = true;
        self
    }
}

/// Deterministic fault roll: same seed, counter, and salt always give
/// the same answer. Distinct salts decorrelate fault types sharing a
/// counter stream.
#[allow(clippy::cast_precision_loss)]
fn roll(seed: u64, counter: u64, salt: u64, rate: f64) -> bool {
    if rate <= 0.0 {
        return false;
    }
    if rate >= 1.0 {
        return true;
    }
    let multiplier = match salt {
        0 => 0x5851_f42d_4c95_7f2d_u64,
        1 => 0x9e37_79b9_7f4a_7c15,
        _ => 0xc6a4_a793_5bd1_e995,
    };
    let hash = seed.wrapping_add(counter).wrapping_mul(multiplier);
    (hash as f64) / (u64::MAX as f64) < rate
}

/// Shared in-memory state of a [`SimStorage`] and its files.
#[derive(Debug, Default)]
struct SimState {
    /// Dirty file contents: what a running process observes.
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    /// Synced contents: what survives a crash.
    synced: Mutex<HashMap<PathBuf, Vec<u8>>>,
    faults: Mutex<FaultConfig>,
    writes: AtomicU64,
    syncs: AtomicU64,
}

/// In-memory storage with deterministic fault injection.
///
/// Clones share state, so a "restarted" journal opened on a clone
/// observes earlier writes; [`SimStorage::simulate_crash`] first drops
/// whatever was never fsynced.
#[derive(Debug, Clone, Default)]
pub struct SimStorage {
    state: Arc<SimState>,
    seed: u64,
}

impl SimStorage {
    /// Creates an in-memory storage with no faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an in-memory storage with the given seed and fault
    /// configuration.
    #[must_use]
    pub fn with_faults(seed: u64, config: FaultConfig) -> Self {
        let storage = Self {
            state: Arc::new(SimState::default()),
            seed,
        };
        *storage.state.faults.lock().expect("lock poisoned") = config;
        storage
    }

    /// Returns the fault configuration for live modification.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn fault_config(&self) -> MutexGuard<'_, FaultConfig> {
        self.state.faults.lock().expect("lock poisoned")
    }

    /// Reverts every file to its last synced contents. Unsynced data
    /// is lost, exactly as in a process crash.
    ///
    /// # Panics
    /// Panics if a lock is poisoned.
    pub fn simulate_crash(&self) {
        let synced = self.state.synced.lock().expect("lock poisoned");
        let mut files = self.state.files.lock().expect("lock poisoned");
        files.clone_from(&synced);
    }

    /// Flips `len` bytes starting at `offset` in a file's dirty
    /// contents, for corruption-recovery tests.
    ///
    /// # Panics
    /// Panics if a lock is poisoned.
    pub fn corrupt_bytes(&self, path: &Path, offset: usize, len: usize) {
        let mut files = self.state.files.lock().expect("lock poisoned");
        if let Some(content) = files.get_mut(path) {
            let end = (offset + len).min(content.len());
            for byte in &mut content[offset..end] {
                *byte ^= 0xFF;
            }
        }
    }

    /// Returns a file's dirty contents for inspection in tests.
    ///
    /// # Panics
    /// Panics if a lock is poisoned.
    #[must_use]
    pub fn raw_content(&self, path: &Path) -> Option<Vec<u8>> {
        self.state
            .files
            .lock()
            .expect("lock poisoned")
            .get(path)
            .cloned()
    }

    /// Returns a file's synced (crash-durable) contents.
    ///
    /// # Panics
    /// Panics if a lock is poisoned.
    #[must_use]
    pub fn synced_content(&self, path: &Path) -> Option<Vec<u8>> {
        self.state
            .synced
            .lock()
            .expect("lock poisoned")
            .get(path)
            .cloned()
    }
}

#[async_trait]
impl Storage for SimStorage {
    async fn open(&self, path: &Path) -> JournalResult<Box<dyn StorageFile>> {
        self.state
            .files
            .lock()
            .expect("lock poisoned")
            .entry(path.to_path_buf())
            .or_default();
        Ok(Box::new(SimFile {
            path: path.to_path_buf(),
            state: Arc::clone(&self.state),
            seed: self.seed,
        }))
    }

    async fn list_files(&self, dir: &Path, extension: &str) -> JournalResult<Vec<PathBuf>> {
        let files = self.state.files.lock().expect("lock poisoned");
        Ok(files
            .keys()
            .filter(|p| {
                p.parent() == Some(dir) && p.extension().is_some_and(|ext| ext == extension)
            })
            .cloned()
            .collect())
    }

    async fn rename(&self, from: &Path, to: &Path) -> JournalResult<()> {
        // The rename is atomic across both the dirty and durable views.
        let mut files = self.state.files.lock().expect("lock poisoned");
        let content = files
            .remove(from)
            .ok_or_else(|| JournalError::io("rename", "no such file"))?;
        files.insert(to.to_path_buf(), content);
        drop(files);

        let mut synced = self.state.synced.lock().expect("lock poisoned");
        if let Some(content) = synced.remove(from) {
            synced.insert(to.to_path_buf(), content);
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> JournalResult<()> {
        let mut files = self.state.files.lock().expect("lock poisoned");
        files
            .remove(path)
            .ok_or_else(|| JournalError::io("remove", "no such file"))?;
        drop(files);

        self.state
            .synced
            .lock()
            .expect("lock poisoned")
            .remove(path);
        Ok(())
    }

    async fn create_dir_all(&self, _path: &Path) -> JournalResult<()> {
        // Directories are implicit in simulated storage.
        Ok(())
    }
}

/// A handle to one simulated file.
struct SimFile {
    path: PathBuf,
    state: Arc<SimState>,
    seed: u64,
}

#[allow(clippy::significant_drop_tightening)]
#[async_trait]
impl StorageFile for SimFile {
    async fn append(&self, data: &[u8]) -> JournalResult<()> {
        let counter = self.state.writes.fetch_add(1, Ordering::Relaxed);

        // Decide the fault before touching file contents.
        let torn_at = {
            let mut faults = self.state.faults.lock().expect("lock poisoned");
            if faults.fail_writes_after.is_some_and(|limit| counter >= limit) {
                return Err(JournalError::io("append", "injected write failure"));
            }
            if roll(self.seed, counter, 0, faults.write_fail_rate) {
                return Err(JournalError::io("append", "write failed (simulated)"));
            }
            if let Some(at) = faults.force_torn_write_at.take() {
                Some(at)
            } else if roll(self.seed, counter, 2, faults.torn_write_rate) {
                let hash = self.seed.wrapping_add(counter).wrapping_mul(0x9e37_79b9_7f4a_7c15);
                #[allow(clippy::cast_possible_truncation)]
                Some(hash as usize % data.len().max(1))
            } else {
                None
            }
        };

        let mut files = self.state.files.lock().expect("lock poisoned");
        let content = files.entry(self.path.clone()).or_default();

        if let Some(at) = torn_at {
            // A prefix lands, then the "process" dies mid-write.
            content.extend_from_slice(&data[..at.min(data.len())]);
            return Err(JournalError::io(
                "append",
                "torn write (simulated crash during write)",
            ));
        }

        content.extend_from_slice(data);
        Ok(())
    }

    async fn read_all(&self) -> JournalResult<Bytes> {
        // Reads serve the dirty view uncorrupted; corruption tests
        // flip bytes explicitly via `corrupt_bytes`.
        let files = self.state.files.lock().expect("lock poisoned");
        let content = files
            .get(&self.path)
            .ok_or_else(|| JournalError::io("read", "no such file"))?;
        Ok(Bytes::from(content.clone()))
    }

    async fn sync(&self) -> JournalResult<()> {
        let counter = self.state.syncs.fetch_add(1, Ordering::Relaxed);
        {
            let mut faults = self.state.faults.lock().expect("lock poisoned");
            if faults.force_fsync_fail {
                faults.force_fsync_fail = false;
                return Err(JournalError::io("sync", "fsync failed (simulated)"));
            }
            if roll(self.seed, counter, 1, faults.fsync_fail_rate) {
                return Err(JournalError::io("sync", "fsync failed (simulated)"));
            }
        }

        // Promote the dirty bytes to crash-durable.
        let files = self.state.files.lock().expect("lock poisoned");
        if let Some(content) = files.get(&self.path) {
            self.state
                .synced
                .lock()
                .expect("lock poisoned")
                .insert(self.path.clone(), content.clone());
        }
        Ok(())
    }

    async fn size(&self) -> JournalResult<u64> {
        let files = self.state.files.lock().expect("lock poisoned");
        let content = files
            .get(&self.path)
            .ok_or_else(|| JournalError::io("size", "no such file"))?;
        Ok(content.len() as u64)
    }

    async fn truncate(&self, len: u64) -> JournalResult<()> {
        let mut files = self.state.files.lock().expect("lock poisoned");
        let content = files
            .get_mut(&self.path)
            .ok_or_else(|| JournalError::io("truncate", "no such file"))?;
        #[allow(clippy::cast_possible_truncation)]
        content.truncate(len as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_storage_append_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.log");

        let storage = TokioStorage::new();
        let file = storage.open(&path).await.unwrap();

        file.append(b"hello, ").await.unwrap();
        file.append(b"world!").await.unwrap();
        file.sync().await.unwrap();

        assert_eq!(&file.read_all().await.unwrap()[..], b"hello, world!");
        assert_eq!(file.size().await.unwrap(), 13);
    }

    #[tokio::test]
    async fn test_tokio_storage_truncate_then_append() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.log");

        let storage = TokioStorage::new();
        let file = storage.open(&path).await.unwrap();

        file.append(b"0123456789").await.unwrap();
        file.truncate(4).await.unwrap();
        // Append mode: the next write continues from the new end.
        file.append(b"xy").await.unwrap();

        assert_eq!(&file.read_all().await.unwrap()[..], b"0123xy");
    }

    #[tokio::test]
    async fn test_tokio_storage_rename_and_list() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = TokioStorage::new();

        let active = temp_dir.path().join("segment-1.active");
        let sealed = temp_dir.path().join("segment-1.log");
        let file = storage.open(&active).await.unwrap();
        file.append(b"x").await.unwrap();
        drop(file);

        storage.rename(&active, &sealed).await.unwrap();

        assert!(storage.list_files(temp_dir.path(), "active").await.unwrap().is_empty());
        let logs = storage.list_files(temp_dir.path(), "log").await.unwrap();
        assert_eq!(logs, vec![sealed]);
    }

    #[tokio::test]
    async fn test_sim_storage_roundtrip() {
        let storage = SimStorage::new();
        let path = Path::new("/p1/segment-1.active");

        let file = storage.open(path).await.unwrap();
        file.append(b"abc").await.unwrap();
        file.append(b"def").await.unwrap();

        assert_eq!(&file.read_all().await.unwrap()[..], b"abcdef");

        // A second open sees the same bytes.
        let again = storage.open(path).await.unwrap();
        assert_eq!(again.size().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_sim_storage_forced_torn_write() {
        let storage =
            SimStorage::with_faults(42, FaultConfig::none().with_force_torn_write_at(5));
        let file = storage.open(Path::new("/torn")).await.unwrap();

        // Ten bytes go in, five land, the write "crashes".
        let result = file.append(b"0123456789").await;
        assert!(result.is_err());
        assert_eq!(storage.raw_content(Path::new("/torn")).unwrap(), b"01234");

        // The force flag is one-shot.
        file.append(b"rest").await.unwrap();
        assert_eq!(storage.raw_content(Path::new("/torn")).unwrap(), b"01234rest");
    }

    #[tokio::test]
    async fn test_sim_storage_fail_writes_after() {
        let storage = SimStorage::with_faults(7, FaultConfig::none().with_fail_writes_after(2));
        let file = storage.open(Path::new("/f")).await.unwrap();

        file.append(b"a").await.unwrap();
        file.append(b"b").await.unwrap();
        assert!(file.append(b"c").await.is_err());
    }

    #[tokio::test]
    async fn test_sim_storage_forced_fsync_fail_is_one_shot() {
        let storage = SimStorage::with_faults(7, FaultConfig::none().with_force_fsync_fail());
        let file = storage.open(Path::new("/f")).await.unwrap();

        file.append(b"data").await.unwrap();
        assert!(file.sync().await.is_err());
        assert!(file.sync().await.is_ok());
    }

    #[tokio::test]
    async fn test_sim_storage_crash_drops_unsynced() {
        let storage = SimStorage::new();
        let path = Path::new("/f");
        let file = storage.open(path).await.unwrap();

        file.append(b"durable").await.unwrap();
        file.sync().await.unwrap();
        file.append(b"-lost").await.unwrap();

        assert_eq!(storage.raw_content(path).unwrap(), b"durable-lost");
        assert_eq!(storage.synced_content(path).unwrap(), b"durable");

        storage.simulate_crash();
        assert_eq!(storage.raw_content(path).unwrap(), b"durable");
    }

    #[tokio::test]
    async fn test_sim_storage_rename_preserves_durability() {
        let storage = SimStorage::new();
        let from = Path::new("/seg.active");
        let to = Path::new("/seg.log");

        let file = storage.open(from).await.unwrap();
        file.append(b"sealed bytes").await.unwrap();
        file.sync().await.unwrap();

        storage.rename(from, to).await.unwrap();
        storage.simulate_crash();

        assert_eq!(storage.raw_content(to).unwrap(), b"sealed bytes");
        assert!(storage.raw_content(from).is_none());
    }

    #[tokio::test]
    async fn test_sim_storage_corrupt_bytes() {
        let storage = SimStorage::new();
        let path = Path::new("/c");
        let file = storage.open(path).await.unwrap();
        file.append(b"hello").await.unwrap();

        storage.corrupt_bytes(path, 2, 1);

        let content = storage.raw_content(path).unwrap();
        assert_eq!(content[0], b'h');
        assert_ne!(content[2], b'l');
    }

    #[tokio::test]
    async fn test_sim_storage_fault_rates_are_deterministic() {
        // The same seed gives the same fault schedule.
        let schedule = |seed: u64| async move {
            let storage =
                SimStorage::with_faults(seed, FaultConfig::none().with_write_fail_rate(0.3));
            let file = storage.open(Path::new("/d")).await.unwrap();
            let mut outcomes = Vec::new();
            for _ in 0..32 {
                outcomes.push(file.append(b"x").await.is_ok());
            }
            outcomes
        };

        // Same seed, same schedule.
        assert_eq!(schedule(11).await, schedule(11).await);

        // And across a sweep of seeds the rate actually injects.
        let mut saw_failure = false;
        for seed in 0..20 {
            if schedule(seed).await.contains(&false) {
                saw_failure = true;
                break;
            }
        }
        assert!(saw_failure, "no write failure injected across 20 seeds");
    }
}
