//! Maintenance Scheduler
//!
//! Background sweeps that keep the tiers within their invariants:
//!
//! 1. Expiration sweep (short interval): drops expired L1/L2/L3 entries and
//!    reclaimed L2 handles
//! 2. Disk sweep (long interval): enforces the L3 byte budget and removes
//!    orphaned files and stale index entries
//!
//! The scheduler owns handles to the tiers, so tests drive sweeps directly
//! with [`MaintenanceScheduler::tick`] instead of waiting on timers.
//! [`MaintenanceScheduler::spawn`] runs the same sweeps from one task.
//!
//! Sweeps only hold a tier's lock for the in-memory part of their work; disk
//! I/O runs with no lock held.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::codec::CacheValue;
use super::config::CacheConfig;
use super::entry::{CacheKey, CacheTier};
use super::events::{EventBus, EvictionReason};
use super::l1::L1Cache;
use super::l2::{L2Cache, L2Removal};
use super::l3::{DiskSweepReport, L3Cache};
use super::manager::{CacheManager, SharedConfig};
use super::metrics::CacheMetrics;
use crate::error::{Error, Result};

/// What one expiration sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirationReport {
    pub l1_expired: usize,
    pub l2_expired: usize,
    pub l2_reclaimed: usize,
    pub l3_expired: usize,
}

impl ExpirationReport {
    /// Total entries removed
    pub fn total(&self) -> usize {
        self.l1_expired + self.l2_expired + self.l2_reclaimed + self.l3_expired
    }
}

/// Result of one manual [`tick`](MaintenanceScheduler::tick)
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub expiration: ExpirationReport,
    /// `None` if the disk sweep failed or L3 is disabled
    pub disk: Option<DiskSweepReport>,
}

/// Drives expiration and disk-bound sweeps over a cache's tiers
pub struct MaintenanceScheduler<V> {
    l1: Arc<L1Cache<V>>,
    l2: Arc<L2Cache<V>>,
    l3: Arc<L3Cache>,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
    config: SharedConfig,
}

impl<V: CacheValue> MaintenanceScheduler<V> {
    /// Create a scheduler over a manager's tiers
    pub fn new(manager: &CacheManager<V>) -> Self {
        Self {
            l1: Arc::clone(manager.l1()),
            l2: Arc::clone(manager.l2()),
            l3: Arc::clone(manager.l3()),
            metrics: Arc::clone(manager.metrics()),
            events: manager.events().clone(),
            config: manager.shared_config(),
        }
    }

    fn config(&self) -> Arc<CacheConfig> {
        Arc::clone(&self.config.read())
    }

    fn record_removal(&self, key: &CacheKey, tier: CacheTier, reason: EvictionReason) {
        if reason.is_eviction() {
            debug!(key = %key, tier = %tier, reason = %reason, "Evicted cache entry");
        }
        self.metrics.record_removal(tier, reason);
        self.events.eviction(key, tier, reason);
    }

    /// Remove expired entries from every enabled tier and reclaimed L2 handles
    #[instrument(skip(self))]
    pub async fn run_expiration_sweep(&self) -> ExpirationReport {
        let config = self.config();
        let mut report = ExpirationReport::default();

        if config.memory.enabled {
            for key in self.l1.purge_expired() {
                self.record_removal(&key, CacheTier::L1, EvictionReason::Expired);
                report.l1_expired += 1;
            }
        }

        if config.weak.enabled {
            for (key, removal) in self.l2.purge() {
                let reason = match removal {
                    L2Removal::Expired => {
                        report.l2_expired += 1;
                        EvictionReason::Expired
                    }
                    L2Removal::Reclaimed => {
                        report.l2_reclaimed += 1;
                        EvictionReason::Reclaimed
                    }
                };
                self.record_removal(&key, CacheTier::L2, reason);
            }
        }

        if config.disk.enabled {
            for key in self.l3.purge_expired().await {
                self.record_removal(&key, CacheTier::L3, EvictionReason::Expired);
                report.l3_expired += 1;
            }
        }

        if report.total() > 0 {
            debug!(
                l1 = report.l1_expired,
                l2_expired = report.l2_expired,
                l2_reclaimed = report.l2_reclaimed,
                l3 = report.l3_expired,
                "Expiration sweep removed entries"
            );
        }
        report
    }

    /// Enforce the L3 byte budget and clean up orphans.
    ///
    /// Returns an empty report when L3 is disabled.
    #[instrument(skip(self))]
    pub async fn run_disk_sweep(&self) -> Result<DiskSweepReport> {
        if !self.config().disk.enabled {
            return Ok(DiskSweepReport::default());
        }

        let report = self.l3.sweep_disk().await?;
        for key in &report.evicted {
            self.record_removal(key, CacheTier::L3, EvictionReason::DiskLimit);
        }

        if report.over_budget() || report.orphans_removed > 0 {
            info!(
                bytes_before = report.bytes_before,
                bytes_after = report.bytes_after,
                evicted = report.evicted.len(),
                unindexed_evicted = report.unindexed_evicted,
                orphans = report.orphans_removed,
                "Disk sweep reclaimed space"
            );
        }
        Ok(report)
    }

    /// Run both sweeps once
    pub async fn tick(&self) -> MaintenanceReport {
        let expiration = self.run_expiration_sweep().await;
        let disk = match self.run_disk_sweep().await {
            Ok(report) if self.config().disk.enabled => Some(report),
            Ok(_) => None,
            Err(e) => {
                error!(error = %e, "Disk sweep failed");
                None
            }
        };
        MaintenanceReport { expiration, disk }
    }

    /// Run the sweeps on their configured intervals until shut down
    pub fn spawn(self) -> MaintenanceHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        MaintenanceHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        let config = self.config();
        info!(
            expiration_interval = ?config.maintenance.expiration_interval,
            disk_interval = ?config.maintenance.disk_interval,
            "Starting cache maintenance"
        );

        let start = Instant::now();
        let mut next_expiration = start + config.maintenance.expiration_interval;
        let mut next_disk = start + config.maintenance.disk_interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cache maintenance shutting down");
                    break;
                }

                _ = sleep_until(next_expiration) => {
                    // A panicking sweep must not take the schedule down with it
                    if AssertUnwindSafe(self.run_expiration_sweep())
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        error!("Expiration sweep panicked");
                    }
                    // Intervals are re-read so config updates apply to the next cycle
                    next_expiration =
                        Instant::now() + self.config().maintenance.expiration_interval;
                }

                _ = sleep_until(next_disk) => {
                    match AssertUnwindSafe(self.run_disk_sweep()).catch_unwind().await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(error = %e, "Disk sweep failed"),
                        Err(_) => error!("Disk sweep panicked"),
                    }
                    next_disk = Instant::now() + self.config().maintenance.disk_interval;
                }
            }
        }
    }
}

/// Handle to a running maintenance task
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the task and wait for it to finish its current sweep
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| Error::Internal(format!("maintenance task failed: {}", e)))
    }

    /// Whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::InMemoryBackend;
    use crate::cache::events::CacheEvent;
    use std::time::{Duration, SystemTime};

    fn key(k: &str) -> CacheKey {
        CacheKey::new(k).unwrap()
    }

    #[tokio::test]
    async fn test_expiration_sweep_all_tiers() {
        let cache: CacheManager<String> = CacheManager::in_memory(CacheConfig::default()).unwrap();
        let scheduler = MaintenanceScheduler::new(&cache);

        cache
            .store(
                &key("short"),
                "x".to_string(),
                Some(Duration::from_millis(5)),
            )
            .await;
        cache.store(&key("long"), "y".to_string(), None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = scheduler.run_expiration_sweep().await;

        assert_eq!(report.l1_expired, 1);
        assert_eq!(report.l2_expired, 1);
        assert_eq!(report.l3_expired, 1);
        assert!(!cache.l3().contains(&key("short")));
        assert!(cache.l1().contains(&key("long")));

        let snapshot = cache.metrics_snapshot();
        assert_eq!(snapshot.l1.expirations, 1);
        assert_eq!(snapshot.l3.expirations, 1);
        assert_eq!(snapshot.l1.evictions, 0);
    }

    #[tokio::test]
    async fn test_expiration_sweep_reclaims_weak_handles() {
        let mut config = CacheConfig::default();
        config.memory.enabled = false;
        config.disk.enabled = false;
        let cache: CacheManager<Vec<u8>> = CacheManager::in_memory(config).unwrap();
        let scheduler = MaintenanceScheduler::new(&cache);

        let value = Arc::new(vec![1u8, 2, 3]);
        cache.store(&key("k"), Arc::clone(&value), None).await;
        drop(value);

        let report = scheduler.run_expiration_sweep().await;
        assert_eq!(report.l2_reclaimed, 1);
        assert!(cache.l2().is_empty());
    }

    #[tokio::test]
    async fn test_disk_sweep_records_evictions() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut config = CacheConfig::default();
        config.disk.max_total_bytes = 1000;
        config.disk.max_item_size = 1000;
        let cache: CacheManager<String> =
            CacheManager::with_backend(config, backend.clone()).unwrap();
        let scheduler = MaintenanceScheduler::new(&cache);
        let mut events = cache.subscribe();

        for (i, name) in ["x", "y", "z"].iter().enumerate() {
            // 398 chars + 2 quotes = 400 bytes
            cache.store(&key(name), "a".repeat(398), None).await;
            backend.set_accessed(
                &key(name).file_name(),
                SystemTime::UNIX_EPOCH + Duration::from_secs(1_000 + i as u64),
            );
        }

        let report = scheduler.run_disk_sweep().await.unwrap();
        assert_eq!(report.evicted, vec![key("x")]);
        assert_eq!(cache.metrics_snapshot().l3.evictions, 1);

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            CacheEvent::Eviction {
                tier: CacheTier::L3,
                reason: EvictionReason::DiskLimit,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_disabled_tiers_are_skipped() {
        let mut config = CacheConfig::default();
        config.disk.enabled = false;
        let cache: CacheManager<u8> = CacheManager::in_memory(config).unwrap();
        let scheduler = MaintenanceScheduler::new(&cache);

        let report = scheduler.tick().await;
        assert!(report.disk.is_none());
        assert_eq!(report.expiration.total(), 0);
    }

    #[tokio::test]
    async fn test_disk_sweep_failure_does_not_stop_tick() {
        let backend = Arc::new(FailingList);
        let cache: CacheManager<u8> =
            CacheManager::with_backend(CacheConfig::default(), backend).unwrap();
        let scheduler = MaintenanceScheduler::new(&cache);

        assert!(scheduler.run_disk_sweep().await.is_err());
        let report = scheduler.tick().await;
        assert!(report.disk.is_none());
    }

    #[tokio::test]
    async fn test_spawned_scheduler_sweeps_and_shuts_down() {
        let mut config = CacheConfig::default();
        config.maintenance.expiration_interval = Duration::from_millis(10);
        config.maintenance.disk_interval = Duration::from_millis(10);
        let cache: CacheManager<String> = CacheManager::in_memory(config).unwrap();

        cache
            .store(&key("k"), "v".to_string(), Some(Duration::from_millis(1)))
            .await;

        let handle = MaintenanceScheduler::new(&cache).spawn();

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.total_cached_entries() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.total_cached_entries(), 0);

        handle.shutdown().await.unwrap();
    }

    /// Backend whose directory listing always fails
    struct FailingList;

    #[async_trait::async_trait]
    impl crate::cache::backend::StorageBackend for FailingList {
        async fn write(&self, _: &str, _: bytes::Bytes) -> Result<()> {
            Ok(())
        }
        async fn read(&self, _: &str) -> Result<Option<bytes::Bytes>> {
            Ok(None)
        }
        async fn delete(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn stat(&self, _: &str) -> Result<Option<crate::cache::backend::FileStat>> {
            Ok(None)
        }
        async fn touch(&self, _: &str, _: SystemTime) -> Result<()> {
            Ok(())
        }
        async fn list(&self) -> Result<Vec<crate::cache::backend::FileStat>> {
            Err(Error::Internal("listing unavailable".to_string()))
        }
        fn location(&self) -> String {
            "failing".to_string()
        }
    }
}
