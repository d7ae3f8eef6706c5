//! L3 Cache - Persisted Disk Tier
//!
//! Serialized payloads on a [`StorageBackend`], one file per key, with an
//! in-memory index of expiry and length.
//!
//! # Design
//!
//! - The index is a `DashMap`; no index guard is ever held across backend I/O
//! - An index entry is only created after its file is fully written
//! - The size bound is soft: writes never evict, the disk sweep does, ordering
//!   files by their filesystem access time so the order survives restarts
//! - Files from a previous process are adopted lazily on index miss

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::backend::{FileStat, StorageBackend};
use super::entry::{expiry_from_ttl, CacheKey, DiskEntry, EntryMetadata, TierHit, Timestamp};
use super::{DEFAULT_L3_MAX_ITEM_SIZE, DEFAULT_L3_MAX_TOTAL_BYTES};
use crate::error::{Error, Result};

/// L3 limits and sweep settings
#[derive(Debug, Clone, PartialEq)]
pub struct L3Config {
    /// Largest payload accepted, in bytes
    pub max_item_size: u64,
    /// Soft bound on total bytes on disk
    pub max_total_bytes: u64,
    /// Fraction of `max_total_bytes` a sweep evicts down to
    pub eviction_target_ratio: f64,
    /// Unindexed files idle for longer than this are orphans
    pub orphan_grace: Duration,
    /// Adopt unindexed files on lookup
    pub adopt_existing_files: bool,
    /// TTL given to adopted files, measured from their modification time
    pub adopted_ttl: Option<Duration>,
}

impl Default for L3Config {
    fn default() -> Self {
        Self {
            max_item_size: DEFAULT_L3_MAX_ITEM_SIZE,
            max_total_bytes: DEFAULT_L3_MAX_TOTAL_BYTES,
            eviction_target_ratio: 0.8,
            orphan_grace: Duration::from_secs(3600),
            adopt_existing_files: true,
            adopted_ttl: None,
        }
    }
}

impl L3Config {
    /// Byte total a sweep evicts down to
    pub fn eviction_target(&self) -> u64 {
        (self.max_total_bytes as f64 * self.eviction_target_ratio) as u64
    }
}

/// Outcome of an L3 put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Put {
    /// Written and indexed
    Stored,
    /// Payload larger than the per-item limit
    Rejected { size: u64, limit: u64 },
}

/// Result of one disk-bound sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskSweepReport {
    /// Cache files found on disk
    pub files_scanned: usize,
    /// Bytes on disk before the sweep
    pub bytes_before: u64,
    /// Bytes on disk after the sweep
    pub bytes_after: u64,
    /// Unindexed files deleted after their grace window
    pub orphans_removed: usize,
    /// Index entries whose file had disappeared
    pub stale_entries_dropped: usize,
    /// Indexed keys evicted to meet the size bound, oldest access first
    pub evicted: Vec<CacheKey>,
    /// Unindexed (still adoptable) files evicted to meet the size bound
    pub unindexed_evicted: usize,
}

impl DiskSweepReport {
    /// Whether the sweep had to evict anything for size
    pub fn over_budget(&self) -> bool {
        !self.evicted.is_empty() || self.unindexed_evicted > 0
    }
}

/// L3 Cache - disk tier
pub struct L3Cache {
    backend: Arc<dyn StorageBackend>,
    index: DashMap<CacheKey, DiskEntry>,
    config: RwLock<L3Config>,
}

impl L3Cache {
    /// Create a disk tier over a backend
    pub fn new(backend: Arc<dyn StorageBackend>, config: L3Config) -> Self {
        debug!(location = %backend.location(), "Creating L3 cache");
        Self {
            backend,
            index: DashMap::new(),
            config: RwLock::new(config),
        }
    }

    /// Current limits
    pub fn config(&self) -> L3Config {
        self.config.read().clone()
    }

    /// Replace limits. Takes effect on the next put or sweep.
    pub fn reconfigure(&self, config: L3Config) {
        *self.config.write() = config;
    }

    /// Backend location, for logs
    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Write `data` for `key`
    pub async fn put(
        &self,
        key: CacheKey,
        data: Bytes,
        expires_at: Option<Timestamp>,
    ) -> Result<L3Put> {
        self.put_with_cancel(key, data, expires_at, &CancellationToken::new())
            .await
    }

    /// Write `data` for `key`, abandoning the write if `cancel` fires.
    ///
    /// A cancelled write indexes nothing and best-effort deletes the target,
    /// so the key reads as a miss afterwards.
    #[instrument(skip(self, data, cancel), fields(key = %key, len = data.len()))]
    pub async fn put_with_cancel(
        &self,
        key: CacheKey,
        data: Bytes,
        expires_at: Option<Timestamp>,
        cancel: &CancellationToken,
    ) -> Result<L3Put> {
        let length = data.len() as u64;
        let limit = self.config.read().max_item_size;

        if length > limit {
            // The previous value must not outlive a rejected overwrite
            if let Some((_, old)) = self.index.remove(&key) {
                self.delete_logged(&old.file_name).await;
            }
            debug!(size = length, limit, "L3 rejected oversized item");
            return Ok(L3Put::Rejected {
                size: length,
                limit,
            });
        }

        let file_name = key.file_name();
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.backend.write(&file_name, data) => Some(result),
        };

        // A failed or cancelled overwrite must not leave the previous value
        // readable under this key
        let failure = match written {
            Some(Ok(())) => None,
            Some(Err(e)) => Some(e),
            None => Some(Error::Cancelled(format!("L3 write of {}", key))),
        };
        if let Some(e) = failure {
            self.index.remove(&key);
            self.delete_logged(&file_name).await;
            return Err(e);
        }

        let entry = DiskEntry {
            metadata: EntryMetadata::new(expires_at),
            length,
            file_name,
        };
        self.index.insert(key, entry);
        Ok(L3Put::Stored)
    }

    /// Read the payload for `key`.
    ///
    /// Expired entries and entries whose file vanished are removed and
    /// reported as misses. I/O errors are returned to the caller.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &CacheKey) -> Result<Option<TierHit<Bytes>>> {
        let now = Utc::now();

        // Clone out so no shard guard lives across the awaits below
        let indexed = self.index.get(key).map(|e| e.value().clone());
        let entry = match indexed {
            Some(entry) => entry,
            None => match self.adopt(key).await? {
                Some(entry) => entry,
                None => return Ok(None),
            },
        };

        if entry.metadata.is_expired_at(now) {
            if self.remove_if_same(key, &entry) {
                self.delete_logged(&entry.file_name).await;
            }
            debug!("L3 entry expired on read");
            return Ok(None);
        }

        let Some(data) = self.backend.read(&entry.file_name).await? else {
            self.remove_if_same(key, &entry);
            debug!("L3 file missing, dropped stale index entry");
            return Ok(None);
        };

        if let Err(e) = self.backend.touch(&entry.file_name, SystemTime::now()).await {
            debug!(error = %e, "Failed to update L3 access time");
        }
        if let Some(mut indexed) = self.index.get_mut(key) {
            indexed.metadata.record_access(now);
        }

        let size = data.len();
        Ok(Some(TierHit {
            value: data,
            expires_at: entry.metadata.expires_at,
            size,
        }))
    }

    /// Index a file left behind by a previous process
    async fn adopt(&self, key: &CacheKey) -> Result<Option<DiskEntry>> {
        let (adopt, ttl) = {
            let config = self.config.read();
            (config.adopt_existing_files, config.adopted_ttl)
        };
        if !adopt {
            return Ok(None);
        }

        let file_name = key.file_name();
        let Some(stat) = self.backend.stat(&file_name).await? else {
            return Ok(None);
        };

        let modified: Timestamp = stat.modified.into();
        let candidate = DiskEntry {
            metadata: EntryMetadata::created_at(modified, expiry_from_ttl(modified, ttl)),
            length: stat.len,
            file_name,
        };

        // A put that raced us wins
        let entry = self.index.entry(key.clone()).or_insert(candidate).clone();
        debug!(key = %key, len = entry.length, "Adopted existing L3 file");
        Ok(Some(entry))
    }

    /// Remove `key` and its file. Returns whether a file was deleted.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let file_name = match self.index.remove(key) {
            Some((_, entry)) => entry.file_name,
            // Unindexed but possibly adoptable
            None => key.file_name(),
        };
        self.backend.delete(&file_name).await
    }

    /// Delete every indexed file and any other cache file in the directory.
    ///
    /// Best-effort: failures are logged and skipped. Returns the number of
    /// files deleted.
    pub async fn clear_all(&self) -> usize {
        let names: Vec<String> = self.index.iter().map(|e| e.file_name.clone()).collect();
        self.index.clear();

        let mut deleted = 0;
        for name in &names {
            if self.delete_logged(name).await {
                deleted += 1;
            }
        }

        match self.backend.list().await {
            Ok(leftovers) => {
                for file in leftovers {
                    if self.delete_logged(&file.name).await {
                        deleted += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list L3 directory during clear"),
        }

        debug!(deleted, "Cleared L3 cache");
        deleted
    }

    /// Remove expired entries and their files, returning the removed keys
    pub async fn purge_expired(&self) -> Vec<CacheKey> {
        let now = Utc::now();
        let expired: Vec<(CacheKey, DiskEntry)> = self
            .index
            .iter()
            .filter(|e| e.metadata.is_expired_at(now))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for (key, entry) in expired {
            if self.remove_if_same(&key, &entry) {
                self.delete_logged(&entry.file_name).await;
                removed.push(key);
            }
        }
        removed
    }

    /// Enforce the size bound and clean up orphans and stale index entries
    pub async fn sweep_disk(&self) -> Result<DiskSweepReport> {
        self.run_disk_sweep(true).await
    }

    /// Compute what [`sweep_disk`](Self::sweep_disk) would do without
    /// deleting anything
    pub async fn plan_disk_sweep(&self) -> Result<DiskSweepReport> {
        self.run_disk_sweep(false).await
    }

    #[instrument(skip(self), fields(location = %self.backend.location()))]
    async fn run_disk_sweep(&self, apply: bool) -> Result<DiskSweepReport> {
        let config = self.config();

        // Snapshot before listing: every snapshotted file was fully written
        // before the listing started.
        let snapshot: HashMap<String, (CacheKey, DiskEntry)> = self
            .index
            .iter()
            .map(|e| (e.file_name.clone(), (e.key().clone(), e.value().clone())))
            .collect();

        let files = self.backend.list().await?;
        let now = SystemTime::now();

        let mut report = DiskSweepReport {
            files_scanned: files.len(),
            bytes_before: files.iter().map(|f| f.len).sum(),
            ..Default::default()
        };
        let mut total = report.bytes_before;

        let on_disk: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
        for (name, (key, entry)) in &snapshot {
            if !on_disk.contains(name.as_str()) && (!apply || self.remove_if_same(key, entry)) {
                report.stale_entries_dropped += 1;
            }
        }

        let mut candidates: Vec<FileStat> = Vec::with_capacity(files.len());
        for file in files {
            if snapshot.contains_key(&file.name) {
                candidates.push(file);
                continue;
            }
            let idle = now
                .duration_since(file.last_touched())
                .unwrap_or(Duration::ZERO);
            if idle <= config.orphan_grace {
                candidates.push(file);
                continue;
            }
            if !apply || self.delete_logged(&file.name).await {
                report.orphans_removed += 1;
                total = total.saturating_sub(file.len);
            }
        }

        if total > config.max_total_bytes {
            let target = config.eviction_target();
            candidates.sort_by_key(|f| f.accessed);

            for file in candidates {
                if total <= target {
                    break;
                }
                if apply && !self.delete_logged(&file.name).await {
                    continue;
                }
                total = total.saturating_sub(file.len);
                match snapshot.get(&file.name) {
                    Some((key, entry)) => {
                        if apply {
                            self.remove_if_same(key, entry);
                        }
                        report.evicted.push(key.clone());
                    }
                    None => report.unindexed_evicted += 1,
                }
            }
        }

        report.bytes_after = total;
        debug!(
            files = report.files_scanned,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            orphans = report.orphans_removed,
            evicted = report.evicted.len(),
            apply,
            "L3 disk sweep complete"
        );
        Ok(report)
    }

    /// Drop the index entry only if it is still the one we looked at
    fn remove_if_same(&self, key: &CacheKey, seen: &DiskEntry) -> bool {
        self.index
            .remove_if(key, |_, current| {
                current.metadata.created_at == seen.metadata.created_at
                    && current.length == seen.length
            })
            .is_some()
    }

    async fn delete_logged(&self, name: &str) -> bool {
        match self.backend.delete(name).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(file = name, error = %e, "Failed to delete L3 file");
                false
            }
        }
    }

    /// Check if a key is indexed
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    /// Index record for a key
    pub fn entry(&self, key: &CacheKey) -> Option<DiskEntry> {
        self.index.get(key).map(|e| e.value().clone())
    }

    /// Number of indexed entries
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Sum of indexed payload lengths
    pub fn total_indexed_bytes(&self) -> u64 {
        self.index.iter().map(|e| e.length).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::InMemoryBackend;
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    fn key(k: &str) -> CacheKey {
        CacheKey::new(k).unwrap()
    }

    fn cache_with(config: L3Config) -> (Arc<InMemoryBackend>, L3Cache) {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = L3Cache::new(backend.clone(), config);
        (backend, cache)
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let (backend, cache) = cache_with(L3Config::default());
        let k = key("doc");

        let outcome = cache
            .put(k.clone(), Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
        assert_eq!(outcome, L3Put::Stored);
        assert!(backend.contains(&k.file_name()));

        let hit = cache.get(&k).await.unwrap().unwrap();
        assert_eq!(&hit.value[..], b"{}");
        assert_eq!(hit.size, 2);
        assert_eq!(cache.entry(&k).unwrap().metadata.access_count, 1);

        assert!(cache.remove(&k).await.unwrap());
        assert!(cache.get(&k).await.unwrap().is_none());
        assert!(!backend.contains(&k.file_name()));
    }

    #[tokio::test]
    async fn test_oversized_put_rejected_and_old_value_dropped() {
        let (backend, cache) = cache_with(L3Config {
            max_item_size: 4,
            max_total_bytes: 100,
            ..Default::default()
        });
        let k = key("k");

        cache
            .put(k.clone(), Bytes::from_static(b"1234"), None)
            .await
            .unwrap();
        let outcome = cache
            .put(k.clone(), Bytes::from_static(b"12345"), None)
            .await
            .unwrap();

        assert_eq!(outcome, L3Put::Rejected { size: 5, limit: 4 });
        assert!(!cache.contains(&k));
        assert_eq!(backend.file_count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_indexes_nothing() {
        let (backend, cache) = cache_with(L3Config::default());
        backend.set_fail_writes(true);

        let result = cache.put(key("k"), Bytes::from_static(b"x"), None).await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failed_overwrite_drops_old_value() {
        let (backend, cache) = cache_with(L3Config::default());
        let k = key("k");
        cache
            .put(k.clone(), Bytes::from_static(b"old"), None)
            .await
            .unwrap();

        backend.set_fail_writes(true);
        let result = cache.put(k.clone(), Bytes::from_static(b"new"), None).await;
        assert!(result.is_err());

        assert!(!cache.contains(&k));
        assert!(!backend.contains(&k.file_name()));
        assert!(cache.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed_on_read() {
        let (backend, cache) = cache_with(L3Config::default());
        let k = key("k");
        let past = Utc::now() - chrono::Duration::seconds(1);

        cache
            .put(k.clone(), Bytes::from_static(b"x"), Some(past))
            .await
            .unwrap();
        assert!(cache.get(&k).await.unwrap().is_none());
        assert!(!cache.contains(&k));
        assert_eq!(backend.file_count(), 0);
    }

    #[tokio::test]
    async fn test_externally_deleted_file_is_a_miss() {
        let (backend, cache) = cache_with(L3Config::default());
        let k = key("k");
        cache
            .put(k.clone(), Bytes::from_static(b"x"), None)
            .await
            .unwrap();

        backend.delete(&k.file_name()).await.unwrap();

        assert!(cache.get(&k).await.unwrap().is_none());
        assert!(!cache.contains(&k));
    }

    #[tokio::test]
    async fn test_read_touches_access_time() {
        let (backend, cache) = cache_with(L3Config::default());
        let k = key("k");
        cache
            .put(k.clone(), Bytes::from_static(b"x"), None)
            .await
            .unwrap();
        backend.set_accessed(&k.file_name(), at(0));

        cache.get(&k).await.unwrap().unwrap();

        let stat = backend.stat(&k.file_name()).await.unwrap().unwrap();
        assert!(stat.accessed > at(0));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (backend, cache) = cache_with(L3Config::default());
        let past = Utc::now() - chrono::Duration::seconds(1);

        cache
            .put(key("old"), Bytes::from_static(b"x"), Some(past))
            .await
            .unwrap();
        cache
            .put(key("new"), Bytes::from_static(b"y"), None)
            .await
            .unwrap();

        assert_eq!(cache.purge_expired().await, vec![key("old")]);
        assert_eq!(cache.len(), 1);
        assert_eq!(backend.file_count(), 1);
    }

    #[tokio::test]
    async fn test_disk_sweep_evicts_least_recently_accessed() {
        let (backend, cache) = cache_with(L3Config {
            max_item_size: 1000,
            max_total_bytes: 1000,
            eviction_target_ratio: 0.8,
            ..Default::default()
        });

        for (i, name) in ["x", "y", "z"].iter().enumerate() {
            let k = key(name);
            cache
                .put(k.clone(), Bytes::from(vec![b'a'; 400]), None)
                .await
                .unwrap();
            backend.set_accessed(&k.file_name(), at(i as u64));
        }

        let report = cache.sweep_disk().await.unwrap();

        assert_eq!(report.files_scanned, 3);
        assert_eq!(report.bytes_before, 1200);
        assert_eq!(report.bytes_after, 800);
        assert_eq!(report.evicted, vec![key("x")]);
        assert!(!cache.contains(&key("x")));
        assert!(cache.contains(&key("y")) && cache.contains(&key("z")));
        assert_eq!(backend.total_bytes(), 800);
    }

    #[tokio::test]
    async fn test_disk_sweep_within_budget_is_noop() {
        let (backend, cache) = cache_with(L3Config {
            max_item_size: 100,
            max_total_bytes: 1000,
            ..Default::default()
        });
        cache
            .put(key("a"), Bytes::from(vec![0; 100]), None)
            .await
            .unwrap();

        let report = cache.sweep_disk().await.unwrap();
        assert!(!report.over_budget());
        assert_eq!(report.bytes_after, 100);
        assert_eq!(backend.file_count(), 1);
    }

    #[tokio::test]
    async fn test_plan_does_not_delete() {
        let (backend, cache) = cache_with(L3Config {
            max_item_size: 600,
            max_total_bytes: 1000,
            ..Default::default()
        });
        cache
            .put(key("a"), Bytes::from(vec![0; 600]), None)
            .await
            .unwrap();
        cache
            .put(key("b"), Bytes::from(vec![0; 600]), None)
            .await
            .unwrap();

        let report = cache.plan_disk_sweep().await.unwrap();
        // Dropping one 600-byte file already reaches the 800-byte target
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.bytes_after, 600);
        assert_eq!(backend.file_count(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_disk_sweep_orphans_and_stale_entries() {
        let (backend, cache) = cache_with(L3Config {
            orphan_grace: Duration::from_secs(60),
            adopt_existing_files: false,
            ..Default::default()
        });

        // Indexed, file deleted behind our back
        cache
            .put(key("stale"), Bytes::from_static(b"s"), None)
            .await
            .unwrap();
        backend.delete(&key("stale").file_name()).await.unwrap();

        // Unindexed and idle for a long time
        backend
            .write("cache_old.dat", Bytes::from_static(b"o"))
            .await
            .unwrap();
        backend.set_times("cache_old.dat", at(0));

        // Unindexed but recent: inside the grace window
        backend
            .write("cache_fresh.dat", Bytes::from_static(b"f"))
            .await
            .unwrap();

        let report = cache.sweep_disk().await.unwrap();

        assert_eq!(report.stale_entries_dropped, 1);
        assert_eq!(report.orphans_removed, 1);
        assert!(!cache.contains(&key("stale")));
        assert!(!backend.contains("cache_old.dat"));
        assert!(backend.contains("cache_fresh.dat"));
    }

    #[tokio::test]
    async fn test_adopts_existing_file() {
        let (backend, cache) = cache_with(L3Config::default());
        let k = key("survivor");
        backend
            .write(&k.file_name(), Bytes::from_static(b"42"))
            .await
            .unwrap();

        let hit = cache.get(&k).await.unwrap().unwrap();
        assert_eq!(&hit.value[..], b"42");
        assert_eq!(hit.expires_at, None);
        assert!(cache.contains(&k));
    }

    #[tokio::test]
    async fn test_adopted_file_past_ttl_is_deleted() {
        let (backend, cache) = cache_with(L3Config {
            adopted_ttl: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let k = key("expired");
        backend
            .write(&k.file_name(), Bytes::from_static(b"1"))
            .await
            .unwrap();
        backend.set_times(&k.file_name(), at(0));

        assert!(cache.get(&k).await.unwrap().is_none());
        assert!(!backend.contains(&k.file_name()));
    }

    #[tokio::test]
    async fn test_adoption_disabled() {
        let (backend, cache) = cache_with(L3Config {
            adopt_existing_files: false,
            ..Default::default()
        });
        let k = key("k");
        backend
            .write(&k.file_name(), Bytes::from_static(b"1"))
            .await
            .unwrap();

        assert!(cache.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_all_removes_unindexed_files_too() {
        let (backend, cache) = cache_with(L3Config::default());
        cache
            .put(key("a"), Bytes::from_static(b"a"), None)
            .await
            .unwrap();
        backend
            .write("cache_left.dat", Bytes::from_static(b"l"))
            .await
            .unwrap();
        backend
            .write("other.bin", Bytes::from_static(b"keep"))
            .await
            .unwrap();

        assert_eq!(cache.clear_all().await, 2);
        assert!(cache.is_empty());
        assert!(backend.contains("other.bin"));
        assert_eq!(backend.file_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_write() {
        let (backend, cache) = cache_with(L3Config::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = cache
            .put_with_cancel(key("k"), Bytes::from_static(b"x"), None, &cancel)
            .await;

        assert_matches!(result, Err(Error::Cancelled(_)));
        assert!(cache.is_empty());
        assert_eq!(backend.file_count(), 0);
    }

    /// Backend whose writes take a while, to cancel mid-flight
    struct SlowBackend(InMemoryBackend);

    #[async_trait]
    impl StorageBackend for SlowBackend {
        async fn write(&self, name: &str, data: Bytes) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.write(name, data).await
        }
        async fn read(&self, name: &str) -> Result<Option<Bytes>> {
            self.0.read(name).await
        }
        async fn delete(&self, name: &str) -> Result<bool> {
            self.0.delete(name).await
        }
        async fn stat(&self, name: &str) -> Result<Option<FileStat>> {
            self.0.stat(name).await
        }
        async fn touch(&self, name: &str, at: SystemTime) -> Result<()> {
            self.0.touch(name, at).await
        }
        async fn list(&self) -> Result<Vec<FileStat>> {
            self.0.list().await
        }
        fn location(&self) -> String {
            "slow".to_string()
        }
    }

    #[tokio::test]
    async fn test_cancelled_mid_write() {
        let backend = Arc::new(SlowBackend(InMemoryBackend::new()));
        let cache = L3Cache::new(backend.clone(), L3Config::default());
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let result = cache
            .put_with_cancel(key("k"), Bytes::from_static(b"x"), None, &cancel)
            .await;
        canceller.await.unwrap();

        assert_matches!(result, Err(Error::Cancelled(_)));
        assert!(!cache.contains(&key("k")));
        assert_eq!(backend.0.file_count(), 0);
        assert!(cache.get(&key("k")).await.unwrap().is_none());
    }
}
