//! Persistent sample store with a byte quota.
//!
//! Records are appended to `samples.log`, one JSON object per line, and
//! indexed in memory. The store size is the total length of the encoded lines,
//! so the quota is checked before anything touches the disk. Removals rewrite
//! the log through a temporary file and an atomic rename.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::sample::Sample;

/// File name of the record log inside the store directory.
const LOG_FILE_NAME: &str = "samples.log";

/// Byte quota of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreQuota {
    pub max_bytes: u64,
}

impl StoreQuota {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

/// Order in which records are selected for removal or transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingPolicy {
    /// Oldest timestamp first
    OldestFirst,
    /// Lowest priority first, oldest first within a priority
    LowestPriorityFirst,
    /// Highest priority first, oldest first within a priority
    HighestPriorityFirst,
}

/// Errors raised by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The insert would exceed the quota, or the device ran out of space
    #[error("store is full: {required} bytes required, {available} bytes available")]
    Full { required: u64, available: u64 },

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_full(&self) -> bool {
        matches!(self, StoreError::Full { .. })
    }
}

/// A record as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    /// Store-assigned record id, increasing with insertion order
    pub id: u64,
    /// Encoded size in bytes, counted against the quota
    pub size: u64,
    pub sample: Sample,
}

#[derive(Serialize)]
struct RecordRef<'a> {
    id: u64,
    sample: &'a Sample,
}

#[derive(Deserialize)]
struct RecordOwned {
    id: u64,
    sample: Sample,
}

struct Entry {
    size: u64,
    sample: Sample,
}

/// Append-only, quota-bounded record store.
pub struct SampleStore {
    log_path: Option<PathBuf>,
    log: Option<File>,
    records: BTreeMap<u64, Entry>,
    next_id: u64,
    size_bytes: u64,
    quota: StoreQuota,
}

impl SampleStore {
    /// Open (or create) a store in `dir`, replaying any existing log.
    pub fn open(dir: impl AsRef<Path>, quota: StoreQuota) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let log_path = dir.join(LOG_FILE_NAME);

        let mut store = Self {
            log_path: Some(log_path.clone()),
            log: None,
            records: BTreeMap::new(),
            next_id: 1,
            size_bytes: 0,
            quota,
        };

        if log_path.exists() {
            store.replay(&log_path)?;
            // Drops corrupt lines and normalizes the file to the index.
            store.rewrite_log(|_| true)?;
            store.recount();
        }
        store.log = Some(open_append(&log_path)?);

        info!(
            path = %log_path.display(),
            records = store.records.len(),
            size_bytes = store.size_bytes,
            max_bytes = quota.max_bytes,
            "Sample store opened"
        );

        Ok(store)
    }

    /// A store that keeps everything in memory.
    pub fn in_memory(quota: StoreQuota) -> Self {
        Self {
            log_path: None,
            log: None,
            records: BTreeMap::new(),
            next_id: 1,
            size_bytes: 0,
            quota,
        }
    }

    fn replay(&mut self, path: &Path) -> Result<(), StoreError> {
        let reader = BufReader::new(File::open(path)?);
        let mut skipped = 0usize;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RecordOwned>(&line) {
                Ok(record) => {
                    let size = line.len() as u64 + 1;
                    self.next_id = self.next_id.max(record.id + 1);
                    if let Some(old) = self.records.insert(
                        record.id,
                        Entry {
                            size,
                            sample: record.sample,
                        },
                    ) {
                        self.size_bytes -= old.size;
                    }
                    self.size_bytes += size;
                }
                Err(e) => {
                    skipped += 1;
                    debug!(error = %e, "Skipping unreadable record");
                }
            }
        }

        if skipped > 0 {
            warn!(skipped, path = %path.display(), "Dropped corrupt records while replaying store");
        }
        Ok(())
    }

    /// Insert a batch, all or nothing.
    pub fn insert(&mut self, samples: &[Sample]) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        let mut sizes = Vec::with_capacity(samples.len());
        let mut id = self.next_id;
        for sample in samples {
            let start = buf.len();
            serde_json::to_writer(&mut buf, &RecordRef { id, sample })?;
            buf.push(b'\n');
            sizes.push((buf.len() - start) as u64);
            id += 1;
        }

        let required = buf.len() as u64;
        let available = self.available_bytes();
        if required > available {
            return Err(StoreError::Full {
                required,
                available,
            });
        }

        if let Some(path) = &self.log_path {
            if self.log.is_none() {
                self.log = Some(open_append(path)?);
                debug!(path = %path.display(), "Reopened store log");
            }
        }

        if let Some(log) = self.log.as_mut() {
            let previous_len = log.metadata()?.len();
            if let Err(e) = log.write_all(&buf).and_then(|_| log.flush()) {
                // Roll back a partially written batch.
                if let Err(trunc) = log.set_len(previous_len) {
                    warn!(error = %trunc, "Failed to roll back partial insert");
                }
                if e.kind() == io::ErrorKind::StorageFull {
                    return Err(StoreError::Full {
                        required,
                        available: 0,
                    });
                }
                return Err(e.into());
            }
        }

        for (sample, size) in samples.iter().zip(sizes) {
            self.records.insert(
                self.next_id,
                Entry {
                    size,
                    sample: sample.clone(),
                },
            );
            self.next_id += 1;
        }
        self.size_bytes += required;

        debug!(
            count = samples.len(),
            bytes = required,
            size_bytes = self.size_bytes,
            "Inserted samples"
        );
        Ok(())
    }

    /// Encoded size a sample would occupy in the store.
    pub fn encoded_size(&self, sample: &Sample) -> Result<u64, StoreError> {
        let line = serde_json::to_vec(&RecordRef {
            id: self.next_id,
            sample,
        })?;
        Ok(line.len() as u64 + 1)
    }

    pub fn record_count(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn quota(&self) -> StoreQuota {
        self.quota
    }

    pub fn available_bytes(&self) -> u64 {
        self.quota.max_bytes.saturating_sub(self.size_bytes)
    }

    /// Fraction of the quota in use.
    pub fn fill_ratio(&self) -> f64 {
        if self.quota.max_bytes == 0 {
            return 1.0;
        }
        self.size_bytes as f64 / self.quota.max_bytes as f64
    }

    /// Replace the quota, returning the previous one.
    ///
    /// Lowering the quota below the current size does not evict anything; the
    /// next insert runs into the overflow handling instead.
    pub fn set_quota(&mut self, max_bytes: u64) -> StoreQuota {
        let previous = self.quota;
        self.quota = StoreQuota::new(max_bytes);
        if previous != self.quota {
            info!(
                previous = previous.max_bytes,
                max_bytes, "Store quota changed"
            );
        }
        previous
    }

    fn ordered_ids(&self, count: usize, policy: OrderingPolicy) -> Vec<u64> {
        let mut keys: Vec<(u8, i64, u64)> = self
            .records
            .iter()
            .map(|(id, e)| (e.sample.priority, e.sample.timestamp, *id))
            .collect();

        match policy {
            OrderingPolicy::OldestFirst => keys.sort_by_key(|&(_, ts, id)| (ts, id)),
            OrderingPolicy::LowestPriorityFirst => keys.sort_by_key(|&(p, ts, id)| (p, ts, id)),
            OrderingPolicy::HighestPriorityFirst => {
                keys.sort_by_key(|&(p, ts, id)| (std::cmp::Reverse(p), ts, id))
            }
        }

        keys.into_iter().take(count).map(|(_, _, id)| id).collect()
    }

    /// Copy up to `count` records in the given order without removing them.
    pub fn peek_ordered(&self, count: usize, policy: OrderingPolicy) -> Vec<StoredSample> {
        self.ordered_ids(count, policy)
            .into_iter()
            .filter_map(|id| {
                self.records.get(&id).map(|e| StoredSample {
                    id,
                    size: e.size,
                    sample: e.sample.clone(),
                })
            })
            .collect()
    }

    /// Remove up to `count` records in the given order.
    pub fn remove_ordered(
        &mut self,
        count: usize,
        policy: OrderingPolicy,
    ) -> Result<Vec<Sample>, StoreError> {
        let ids = self.ordered_ids(count, policy);
        self.take_ids(&ids)
    }

    /// Remove the records with the given ids; unknown ids are ignored.
    pub fn remove_ids(&mut self, ids: &[u64]) -> Result<usize, StoreError> {
        Ok(self.take_ids(ids)?.len())
    }

    /// Remove every record.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.rewrite_log(|_| false)?;
        self.records.clear();
        self.size_bytes = 0;
        Ok(())
    }

    /// The log is rewritten before the index changes; on error both still
    /// hold the records.
    fn take_ids(&mut self, ids: &[u64]) -> Result<Vec<Sample>, StoreError> {
        let doomed: BTreeSet<u64> = ids
            .iter()
            .copied()
            .filter(|id| self.records.contains_key(id))
            .collect();
        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        self.rewrite_log(|id| !doomed.contains(&id))?;

        let mut removed = Vec::with_capacity(doomed.len());
        for id in ids {
            if let Some(entry) = self.records.remove(id) {
                removed.push(entry.sample);
            }
        }
        self.recount();
        Ok(removed)
    }

    fn recount(&mut self) {
        self.size_bytes = self.records.values().map(|e| e.size).sum();
    }

    /// Replace the log with the records `keep` accepts.
    ///
    /// The previous log and its append handle stay in place until the new
    /// file has been renamed over it.
    fn rewrite_log(&mut self, keep: impl Fn(u64) -> bool) -> Result<(), StoreError> {
        let Some(path) = self.log_path.clone() else {
            return Ok(());
        };

        let tmp_path = path.with_extension("log.tmp");
        let sizes = match self.write_snapshot(&tmp_path, &keep) {
            Ok(sizes) => sizes,
            Err(e) => {
                discard(&tmp_path);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&tmp_path, &path) {
            warn!(path = %path.display(), error = %e, "Failed to replace store log");
            discard(&tmp_path);
            return Err(e.into());
        }

        for (id, size) in sizes {
            if let Some(entry) = self.records.get_mut(&id) {
                entry.size = size;
            }
        }

        // The old handle points at the replaced file.
        self.log = match open_append(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to reopen store log");
                None
            }
        };
        Ok(())
    }

    fn write_snapshot(
        &self,
        tmp_path: &Path,
        keep: &impl Fn(u64) -> bool,
    ) -> Result<Vec<(u64, u64)>, StoreError> {
        let mut tmp = io::BufWriter::new(File::create(tmp_path)?);
        let mut sizes = Vec::with_capacity(self.records.len());
        for (id, entry) in self.records.iter().filter(|(id, _)| keep(**id)) {
            let mut line = serde_json::to_vec(&RecordRef {
                id: *id,
                sample: &entry.sample,
            })?;
            line.push(b'\n');
            tmp.write_all(&line)?;
            sizes.push((*id, line.len() as u64));
        }
        tmp.flush()?;
        tmp.get_ref().sync_all()?;
        Ok(sizes)
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary store log");
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample(priority: u8, ts: i64) -> Sample {
        Sample::new("dev-1", priority, json!({"v": ts})).at(ts)
    }

    #[test]
    fn test_insert_and_count() {
        let mut store = SampleStore::in_memory(StoreQuota::new(1_000_000));
        store.insert(&[sample(0, 1), sample(1, 2)]).unwrap();

        assert_eq!(store.record_count(), 2);
        assert!(store.size_bytes() > 0);
    }

    #[test]
    fn test_insert_is_all_or_nothing() {
        let mut store = SampleStore::in_memory(StoreQuota::new(0));
        let one = store.encoded_size(&sample(0, 1)).unwrap();
        store.set_quota(one * 2);

        let err = store
            .insert(&[sample(0, 1), sample(0, 2), sample(0, 3)])
            .unwrap_err();
        assert!(err.is_full());
        assert_eq!(store.record_count(), 0);
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_quota_invariant_over_many_inserts() {
        let mut store = SampleStore::in_memory(StoreQuota::new(2_000));
        for i in 0..200 {
            let batch: Vec<Sample> = (0..(i % 4 + 1)).map(|j| sample(0, i * 10 + j)).collect();
            if store.insert(&batch).is_ok() {
                assert!(store.size_bytes() <= 2_000);
            }
        }
        assert!(store.size_bytes() <= 2_000);
        assert!(store.record_count() > 0);
    }

    #[test]
    fn test_full_error_reports_sizes() {
        let mut store = SampleStore::in_memory(StoreQuota::new(10));
        match store.insert(&[sample(0, 1)]) {
            Err(StoreError::Full {
                required,
                available,
            }) => {
                assert!(required > 10);
                assert_eq!(available, 10);
            }
            other => panic!("expected Full, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_remove_oldest_first() {
        let mut store = SampleStore::in_memory(StoreQuota::new(1_000_000));
        store
            .insert(&[sample(5, 30), sample(0, 10), sample(3, 20)])
            .unwrap();

        let removed = store.remove_ordered(2, OrderingPolicy::OldestFirst).unwrap();
        let ts: Vec<i64> = removed.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![10, 20]);
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_remove_lowest_priority_first() {
        let mut store = SampleStore::in_memory(StoreQuota::new(1_000_000));
        store
            .insert(&[
                sample(2, 1),
                sample(0, 50),
                sample(1, 5),
                sample(0, 40),
                sample(2, 0),
            ])
            .unwrap();

        let removed = store
            .remove_ordered(3, OrderingPolicy::LowestPriorityFirst)
            .unwrap();
        let keys: Vec<(u8, i64)> = removed.iter().map(|s| (s.priority, s.timestamp)).collect();
        assert_eq!(keys, vec![(0, 40), (0, 50), (1, 5)]);
    }

    #[test]
    fn test_eviction_never_skips_lower_priority() {
        let mut store = SampleStore::in_memory(StoreQuota::new(10_000_000));
        let batch: Vec<Sample> = (0..60)
            .map(|i| sample(((i * 7) % 4) as u8, ((i * 13) % 17) as i64))
            .collect();
        store.insert(&batch).unwrap();

        for n in [1usize, 5, 9, 20] {
            let removed = store
                .remove_ordered(n, OrderingPolicy::LowestPriorityFirst)
                .unwrap();
            let remaining = store.peek_ordered(usize::MAX, OrderingPolicy::OldestFirst);
            for r in &removed {
                assert!(!remaining.iter().any(|s| {
                    s.sample.priority < r.priority && s.sample.timestamp >= r.timestamp
                }));
            }
        }
    }

    #[test]
    fn test_peek_highest_priority_first() {
        let mut store = SampleStore::in_memory(StoreQuota::new(1_000_000));
        store
            .insert(&[sample(0, 1), sample(3, 9), sample(3, 4), sample(1, 2)])
            .unwrap();

        let picked = store.peek_ordered(3, OrderingPolicy::HighestPriorityFirst);
        let keys: Vec<(u8, i64)> = picked
            .iter()
            .map(|s| (s.sample.priority, s.sample.timestamp))
            .collect();
        assert_eq!(keys, vec![(3, 4), (3, 9), (1, 2)]);
        // Peeking leaves the store untouched.
        assert_eq!(store.record_count(), 4);
    }

    #[test]
    fn test_remove_ids() {
        let mut store = SampleStore::in_memory(StoreQuota::new(1_000_000));
        store.insert(&[sample(0, 1), sample(0, 2), sample(0, 3)]).unwrap();
        let size_before = store.size_bytes();

        let picked = store.peek_ordered(2, OrderingPolicy::OldestFirst);
        let ids: Vec<u64> = picked.iter().map(|s| s.id).collect();
        let freed: u64 = picked.iter().map(|s| s.size).sum();

        assert_eq!(store.remove_ids(&ids).unwrap(), 2);
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.size_bytes(), size_before - freed);

        // Already removed ids are ignored.
        assert_eq!(store.remove_ids(&ids).unwrap(), 0);
    }

    #[test]
    fn test_set_quota_returns_previous() {
        let mut store = SampleStore::in_memory(StoreQuota::new(100));
        let previous = store.set_quota(500);
        assert_eq!(previous.max_bytes, 100);
        assert_eq!(store.quota().max_bytes, 500);
    }

    #[test]
    fn test_fill_ratio() {
        let mut store = SampleStore::in_memory(StoreQuota::new(1_000));
        assert_eq!(store.fill_ratio(), 0.0);
        store.insert(&[sample(0, 1)]).unwrap();
        let expected = store.size_bytes() as f64 / 1_000.0;
        assert!((store.fill_ratio() - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let quota = StoreQuota::new(1_000_000);

        {
            let mut store = SampleStore::open(dir.path(), quota).unwrap();
            store
                .insert(&[sample(0, 1), sample(2, 2), sample(1, 3)])
                .unwrap();
            store.remove_ordered(1, OrderingPolicy::OldestFirst).unwrap();
            store.insert(&[sample(0, 4)]).unwrap();
        }

        let store = SampleStore::open(dir.path(), quota).unwrap();
        assert_eq!(store.record_count(), 3);
        let ts: Vec<i64> = store
            .peek_ordered(10, OrderingPolicy::OldestFirst)
            .iter()
            .map(|s| s.sample.timestamp)
            .collect();
        assert_eq!(ts, vec![2, 3, 4]);

        let on_disk = fs::metadata(dir.path().join(LOG_FILE_NAME)).unwrap().len();
        assert_eq!(on_disk, store.size_bytes());
    }

    #[test]
    fn test_reopen_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let quota = StoreQuota::new(1_000_000);
        {
            let mut store = SampleStore::open(dir.path(), quota).unwrap();
            store.insert(&[sample(0, 1)]).unwrap();
        }

        let mut log = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE_NAME))
            .unwrap();
        log.write_all(b"{not json\n").unwrap();
        drop(log);

        let mut store = SampleStore::open(dir.path(), quota).unwrap();
        assert_eq!(store.record_count(), 1);

        // New ids never collide with replayed ones.
        store.insert(&[sample(0, 2)]).unwrap();
        assert_eq!(store.record_count(), 2);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let mut store = SampleStore::open(dir.path(), StoreQuota::new(1_000_000)).unwrap();
        store.insert(&[sample(0, 1), sample(0, 2)]).unwrap();
        store.clear().unwrap();

        assert_eq!(store.record_count(), 0);
        assert_eq!(store.size_bytes(), 0);
        assert_eq!(
            fs::metadata(dir.path().join(LOG_FILE_NAME)).unwrap().len(),
            0
        );
    }

    #[test]
    fn test_failed_log_rewrite_keeps_records() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join(LOG_FILE_NAME);
        let mut store = SampleStore::open(dir.path(), StoreQuota::new(1_000_000)).unwrap();
        store.insert(&[sample(0, 1), sample(0, 2)]).unwrap();
        let size = store.size_bytes();

        // The rewritten log cannot be renamed over a directory.
        let contents = fs::read(&log_path).unwrap();
        fs::remove_file(&log_path).unwrap();
        fs::create_dir(&log_path).unwrap();

        let result = store.remove_ordered(1, OrderingPolicy::OldestFirst);
        assert!(matches!(result, Err(StoreError::Io(_))));
        assert_eq!(store.record_count(), 2);
        assert_eq!(store.size_bytes(), size);
        assert!(!log_path.with_extension("log.tmp").exists());

        fs::remove_dir(&log_path).unwrap();
        fs::write(&log_path, contents).unwrap();
        let removed = store.remove_ordered(1, OrderingPolicy::OldestFirst).unwrap();
        assert_eq!(removed[0].timestamp, 1);
        store.insert(&[sample(0, 3)]).unwrap();
        drop(store);

        let reopened = SampleStore::open(dir.path(), StoreQuota::new(1_000_000)).unwrap();
        let timestamps: Vec<i64> = reopened
            .peek_ordered(10, OrderingPolicy::OldestFirst)
            .into_iter()
            .map(|s| s.sample.timestamp)
            .collect();
        assert_eq!(timestamps, vec![2, 3]);
    }

    #[test]
    fn test_insert_reopens_log_handle() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join(LOG_FILE_NAME);
        let mut store = SampleStore::open(dir.path(), StoreQuota::new(1_000_000)).unwrap();

        store.log = None;
        store.insert(&[sample(0, 1)]).unwrap();
        assert!(store.log.is_some());
        drop(store);

        let mut store = SampleStore::open(dir.path(), StoreQuota::new(1_000_000)).unwrap();
        assert_eq!(store.record_count(), 1);

        // Without a writable log the insert fails instead of going memory-only.
        store.log = None;
        fs::remove_file(&log_path).unwrap();
        fs::create_dir(&log_path).unwrap();
        assert!(matches!(store.insert(&[sample(0, 2)]), Err(StoreError::Io(_))));
        assert_eq!(store.record_count(), 1);
    }
}
