//! Cache Manager - Unified Three-Tier Cache
//!
//! Orchestrates L1 (bounded memory), L2 (weak references) and L3 (disk).
//!
//! - `store` fans out to every enabled tier; a failing tier never fails the
//!   others
//! - `retrieve` checks L1, then L2, then L3, stopping at the first hit and
//!   promoting the value into the faster tiers it missed
//! - Tier errors are logged and counted, never returned: reads degrade to
//!   misses and writes to no-ops
//!
//! There is no cross-tier ledger. Each tier is independently consistent and
//! a key may live in any subset of them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backend::{InMemoryBackend, LocalFsBackend, StorageBackend};
use super::codec::{self, CacheValue};
use super::config::CacheConfig;
use super::entry::{expiry_from_ttl, CacheKey, CacheTier, Timestamp};
use super::events::{CacheEvent, CacheOperation, EventBus, EvictionReason};
use super::l1::{L1Cache, L1Put};
use super::l2::L2Cache;
use super::l3::{L3Cache, L3Put};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use crate::error::{Error, Result};

/// Configuration shared between the manager and its scheduler
pub(crate) type SharedConfig = Arc<RwLock<Arc<CacheConfig>>>;

/// Cache lookup result
#[derive(Debug)]
pub struct CacheResult<V> {
    /// The cached value
    pub value: Arc<V>,
    /// Which tier the value was found in
    pub tier: CacheTier,
    /// Lookup latency
    pub latency: Duration,
}

/// Unified cache manager
pub struct CacheManager<V> {
    /// L1 (bounded memory) cache
    l1: Arc<L1Cache<V>>,
    /// L2 (weak reference) cache
    l2: Arc<L2Cache<V>>,
    /// L3 (disk) cache
    l3: Arc<L3Cache>,
    /// Live configuration, swapped whole on update
    config: SharedConfig,
    /// Metrics collector
    metrics: Arc<CacheMetrics>,
    events: EventBus,
}

impl<V: CacheValue> CacheManager<V> {
    /// Open a cache whose L3 lives in `config.cache_directory()`
    pub fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let backend = LocalFsBackend::open(config.cache_directory())?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// Create a cache over an explicit L3 backend
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;
        info!(
            location = %backend.location(),
            l1 = config.memory.enabled,
            l2 = config.weak.enabled,
            l3 = config.disk.enabled,
            "Creating tiered cache"
        );

        Ok(Self {
            l1: Arc::new(L1Cache::with_config(config.l1_config())),
            l2: Arc::new(L2Cache::new()),
            l3: Arc::new(L3Cache::new(backend, config.l3_config())),
            events: EventBus::new(config.event_buffer),
            config: Arc::new(RwLock::new(Arc::new(config))),
            metrics: Arc::new(CacheMetrics::new()),
        })
    }

    /// Create with in-memory L3 backend (for testing)
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        Self::with_backend(config, Arc::new(InMemoryBackend::new()))
    }

    // =========================================================================
    // Store
    // =========================================================================

    /// Store a value in every enabled tier.
    ///
    /// `ttl` falls back to the configured default and is clamped to the
    /// configured maximum. Tiers that reject or fail the write are skipped.
    pub async fn store(&self, key: &CacheKey, value: impl Into<Arc<V>>, ttl: Option<Duration>) {
        self.store_with_cancel(key, value, ttl, &CancellationToken::new())
            .await
    }

    /// [`store`](Self::store), abandoning the L3 write if `cancel` fires.
    ///
    /// A cancelled L3 write leaves the key absent from L3; the memory tiers
    /// are written before the disk write starts and are unaffected.
    #[instrument(level = "debug", skip(self, value, cancel), fields(key = %key))]
    pub async fn store_with_cancel(
        &self,
        key: &CacheKey,
        value: impl Into<Arc<V>>,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) {
        let tracker = LatencyTracker::start();
        let value: Arc<V> = value.into();
        let config = self.config();
        let expires_at = expiry_from_ttl(Utc::now(), config.resolve_ttl(ttl));

        let encoded = match codec::encode(&*value) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize value, skipping L3");
                if config.disk.enabled {
                    self.metrics.record_store_failure(CacheTier::L3);
                }
                None
            }
        };
        let size = encoded
            .as_ref()
            .map_or_else(|| codec::fallback_size(&*value), Bytes::len);

        if config.memory.enabled {
            self.put_l1(key, Arc::clone(&value), size, expires_at);
        }
        if config.weak.enabled {
            self.l2.put(key.clone(), &value, size, expires_at);
        }
        if config.disk.enabled {
            match encoded {
                Some(data) => self.put_l3(key, data, expires_at, cancel).await,
                // The previous value must not resurface once memory lets go
                None => {
                    if let Err(e) = self.l3.remove(key).await {
                        warn!(key = %key, tier = %CacheTier::L3, error = %e, "Tier remove failed");
                    }
                }
            }
        }

        self.observe(CacheOperation::Store, tracker.elapsed(), &config);
    }

    fn put_l1(
        &self,
        key: &CacheKey,
        value: Arc<V>,
        size: usize,
        expires_at: Option<Timestamp>,
    ) -> bool {
        match self.l1.put(key.clone(), value, size, expires_at) {
            L1Put::Stored { evicted } => {
                if let Some(victim) = evicted {
                    self.record_removal(&victim, CacheTier::L1, EvictionReason::Capacity);
                }
                true
            }
            L1Put::Rejected { .. } => false,
        }
    }

    async fn put_l3(
        &self,
        key: &CacheKey,
        data: Bytes,
        expires_at: Option<Timestamp>,
        cancel: &CancellationToken,
    ) {
        match self
            .l3
            .put_with_cancel(key.clone(), data, expires_at, cancel)
            .await
        {
            Ok(L3Put::Stored) | Ok(L3Put::Rejected { .. }) => {}
            Err(Error::Cancelled(what)) => debug!(key = %key, "{} cancelled", what),
            Err(e) => {
                warn!(key = %key, tier = %CacheTier::L3, error = %e, "Tier write failed");
                self.metrics.record_store_failure(CacheTier::L3);
            }
        }
    }

    // =========================================================================
    // Retrieve
    // =========================================================================

    /// Retrieve a value, probing L1, L2 then L3
    pub async fn retrieve(&self, key: &CacheKey) -> Option<Arc<V>> {
        self.retrieve_with_tier(key).await.map(|r| r.value)
    }

    /// Retrieve a value along with the tier that served it
    #[instrument(level = "debug", skip(self), fields(key = %key))]
    pub async fn retrieve_with_tier(&self, key: &CacheKey) -> Option<CacheResult<V>> {
        let tracker = LatencyTracker::start();
        let config = self.config();

        let found = self.lookup(key, &config).await;
        if found.is_none() {
            self.metrics.record_final_miss();
        }

        let latency = tracker.elapsed();
        self.observe(CacheOperation::Retrieve, latency, &config);

        found.map(|(value, tier)| CacheResult {
            value,
            tier,
            latency,
        })
    }

    async fn lookup(&self, key: &CacheKey, config: &CacheConfig) -> Option<(Arc<V>, CacheTier)> {
        // Try L1 first
        if config.memory.enabled {
            if let Some(value) = self.l1.get(key) {
                self.record_hit(key, CacheTier::L1);
                return Some((value, CacheTier::L1));
            }
            self.record_miss(key, CacheTier::L1);
        }

        // Try L2
        if config.weak.enabled {
            if let Some(hit) = self.l2.get(key) {
                self.record_hit(key, CacheTier::L2);
                if config.memory.enabled
                    && config.promotion.should_promote(CacheTier::L1, hit.size)
                    && self.put_l1(key, Arc::clone(&hit.value), hit.size, hit.expires_at)
                {
                    self.metrics.record_promotion(CacheTier::L2, CacheTier::L1);
                }
                return Some((hit.value, CacheTier::L2));
            }
            self.record_miss(key, CacheTier::L2);
        }

        // Try L3
        if config.disk.enabled {
            match self.l3.get(key).await {
                Ok(Some(hit)) => match codec::decode::<V>(&hit.value) {
                    Ok(value) => {
                        self.record_hit(key, CacheTier::L3);
                        let value = Arc::new(value);
                        self.promote_from_l3(key, &value, hit.size, hit.expires_at, config);
                        return Some((value, CacheTier::L3));
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Undecodable L3 payload, removing");
                        if let Err(e) = self.l3.remove(key).await {
                            warn!(key = %key, error = %e, "Failed to remove undecodable L3 entry");
                        }
                    }
                },
                Ok(None) => {}
                Err(e) => warn!(key = %key, tier = %CacheTier::L3, error = %e, "Tier read failed"),
            }
            self.record_miss(key, CacheTier::L3);
        }

        None
    }

    fn promote_from_l3(
        &self,
        key: &CacheKey,
        value: &Arc<V>,
        size: usize,
        expires_at: Option<Timestamp>,
        config: &CacheConfig,
    ) {
        if config.memory.enabled
            && config.promotion.should_promote(CacheTier::L1, size)
            && self.put_l1(key, Arc::clone(value), size, expires_at)
        {
            self.metrics.record_promotion(CacheTier::L3, CacheTier::L1);
        }
        if config.weak.enabled && config.promotion.should_promote(CacheTier::L2, size) {
            self.l2.put(key.clone(), value, size, expires_at);
            self.metrics.record_promotion(CacheTier::L3, CacheTier::L2);
        }
    }

    // =========================================================================
    // Remove / clear
    // =========================================================================

    /// Remove a key from every tier. Returns whether any tier held it.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let in_l1 = self.l1.remove(key);
        let in_l2 = self.l2.remove(key);
        let in_l3 = match self.l3.remove(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = %key, tier = %CacheTier::L3, error = %e, "Tier remove failed");
                false
            }
        };
        in_l1 || in_l2 || in_l3
    }

    /// Clear all tiers
    pub async fn clear_all(&self) {
        self.l1.clear();
        self.l2.clear();
        let deleted = self.l3.clear_all().await;
        info!(l3_files_deleted = deleted, "Cleared all cache tiers");
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Current configuration
    pub fn config(&self) -> Arc<CacheConfig> {
        Arc::clone(&self.config.read())
    }

    /// Replace the configuration.
    ///
    /// An invalid configuration is rejected and the current one stays in
    /// effect. Disabled tiers are cleared; a smaller L1 evicts down to the
    /// new capacity.
    pub async fn update_config(&self, next: CacheConfig) -> Result<()> {
        let previous = self.config();
        previous.check_update(&next)?;

        let next = Arc::new(next);
        *self.config.write() = Arc::clone(&next);

        for victim in self.l1.reconfigure(next.l1_config()) {
            self.record_removal(&victim, CacheTier::L1, EvictionReason::Capacity);
        }
        self.l3.reconfigure(next.l3_config());

        if previous.memory.enabled && !next.memory.enabled {
            self.l1.clear();
        }
        if previous.weak.enabled && !next.weak.enabled {
            self.l2.clear();
        }
        if previous.disk.enabled && !next.disk.enabled {
            self.l3.clear_all().await;
        }

        info!(
            l1 = next.memory.enabled,
            l2 = next.weak.enabled,
            l3 = next.disk.enabled,
            max_entries = next.memory.max_entries,
            "Cache configuration updated"
        );
        Ok(())
    }

    pub(crate) fn shared_config(&self) -> SharedConfig {
        Arc::clone(&self.config)
    }
}

impl<V> CacheManager<V> {
    // =========================================================================
    // Observability
    // =========================================================================

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Refresh size gauges and take a metrics snapshot
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.update_tier_stats(
            CacheTier::L1,
            self.l1.len() as u64,
            self.l1.size() as u64,
        );
        // L2 owns no bytes; only its entry count is meaningful
        self.metrics
            .update_tier_stats(CacheTier::L2, self.l2.live_count() as u64, 0);
        self.metrics.update_tier_stats(
            CacheTier::L3,
            self.l3.len() as u64,
            self.l3.total_indexed_bytes(),
        );
        self.metrics.snapshot()
    }

    /// Entries indexed across all tiers (a key in two tiers counts twice)
    pub fn total_cached_entries(&self) -> usize {
        self.l1.len() + self.l2.len() + self.l3.len()
    }

    pub fn l1(&self) -> &Arc<L1Cache<V>> {
        &self.l1
    }

    pub fn l2(&self) -> &Arc<L2Cache<V>> {
        &self.l2
    }

    pub fn l3(&self) -> &Arc<L3Cache> {
        &self.l3
    }

    fn record_hit(&self, key: &CacheKey, tier: CacheTier) {
        self.metrics.record_hit(tier);
        self.events.hit(key, tier);
    }

    fn record_miss(&self, key: &CacheKey, tier: CacheTier) {
        self.metrics.record_miss(tier);
        self.events.miss(key, tier);
    }

    fn record_removal(&self, key: &CacheKey, tier: CacheTier, reason: EvictionReason) {
        if reason.is_eviction() {
            debug!(key = %key, tier = %tier, reason = %reason, "Evicted cache entry");
        }
        self.metrics.record_removal(tier, reason);
        self.events.eviction(key, tier, reason);
    }

    fn observe(&self, operation: CacheOperation, latency: Duration, config: &CacheConfig) {
        let Some(slow) =
            self.metrics
                .record_operation(operation, latency, config.performance_warning_threshold)
        else {
            return;
        };

        let cached_entries = self.total_cached_entries();
        let hit_ratio = self.metrics.overall_hit_ratio();
        warn!(
            operation = %operation,
            latency_us = slow.latency_us,
            average_us = slow.average_us,
            cached_entries,
            hit_ratio,
            "Cache operation exceeded latency threshold"
        );
        self.events.publish_with(|| CacheEvent::PerformanceWarning {
            operation,
            latency_us: slow.latency_us,
            average_us: slow.average_us,
            cached_entries,
            hit_ratio,
            timestamp: Utc::now(),
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
