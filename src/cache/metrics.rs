//! Cache Metrics Collection
//!
//! Per-tier counters, promotion tracking and latency averages for monitoring
//! cache health, plus a Prometheus text exporter.
//!
//! Counters are plain atomics updated on the hot path; nothing here takes a
//! lock or blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

use super::entry::CacheTier;
use super::events::{CacheOperation, EvictionReason};
use crate::error::{Error, Result};

/// EMA smoothing factor for latency averages
const LATENCY_EMA_ALPHA: f64 = 0.1;

/// Counters for one tier
#[derive(Debug, Default)]
pub struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    reclaimed: AtomicU64,
    store_failures: AtomicU64,
    entries: AtomicU64,
    size_bytes: AtomicU64,
}

impl TierCounters {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        ratio(self.hits(), self.misses())
    }

    fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
            expirations: self.expirations(),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            store_failures: self.store_failures(),
            entries: self.entries.load(Ordering::Relaxed),
            size_bytes: self.size_bytes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.evictions,
            &self.expirations,
            &self.reclaimed,
            &self.store_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// An operation that crossed the latency threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowOperation {
    pub latency_us: u64,
    pub average_us: u64,
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    l1: TierCounters,
    l2: TierCounters,
    l3: TierCounters,

    // Promotions
    promotions_l2_to_l1: AtomicU64,
    promotions_l3_to_l1: AtomicU64,
    promotions_l3_to_l2: AtomicU64,

    /// Retrieves that missed every enabled tier
    final_misses: AtomicU64,

    // Operation latencies (microseconds, using exponential moving average)
    store_latency_us: AtomicU64,
    retrieve_latency_us: AtomicU64,

    slow_operations: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one tier
    pub fn tier(&self, tier: CacheTier) -> &TierCounters {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
            CacheTier::L3 => &self.l3,
        }
    }

    pub fn record_hit(&self, tier: CacheTier) {
        self.tier(tier).hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, tier: CacheTier) {
        self.tier(tier).misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_final_miss(&self) {
        self.final_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a removal that was not an explicit remove
    pub fn record_removal(&self, tier: CacheTier, reason: EvictionReason) {
        let counters = self.tier(tier);
        let counter = match reason {
            EvictionReason::Capacity | EvictionReason::DiskLimit => &counters.evictions,
            EvictionReason::Expired => &counters.expirations,
            EvictionReason::Reclaimed => &counters.reclaimed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self, tier: CacheTier) {
        self.tier(tier)
            .store_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a value copied from `from` into the faster tier `to`
    pub fn record_promotion(&self, from: CacheTier, to: CacheTier) {
        let counter = match (from, to) {
            (CacheTier::L2, CacheTier::L1) => &self.promotions_l2_to_l1,
            (CacheTier::L3, CacheTier::L1) => &self.promotions_l3_to_l1,
            (CacheTier::L3, CacheTier::L2) => &self.promotions_l3_to_l2,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Refresh a tier's size gauges
    pub fn update_tier_stats(&self, tier: CacheTier, entries: u64, size_bytes: u64) {
        let counters = self.tier(tier);
        counters.entries.store(entries, Ordering::Relaxed);
        counters.size_bytes.store(size_bytes, Ordering::Relaxed);
    }

    /// Fold one operation's latency into its average.
    ///
    /// Returns the measurement when it exceeds `threshold`.
    pub fn record_operation(
        &self,
        operation: CacheOperation,
        latency: Duration,
        threshold: Duration,
    ) -> Option<SlowOperation> {
        let target = match operation {
            CacheOperation::Store => &self.store_latency_us,
            CacheOperation::Retrieve => &self.retrieve_latency_us,
        };
        let average_us = update_latency_ema(target, latency);

        if latency > threshold {
            self.slow_operations.fetch_add(1, Ordering::Relaxed);
            Some(SlowOperation {
                latency_us: latency.as_micros() as u64,
                average_us,
            })
        } else {
            None
        }
    }

    pub fn store_latency(&self) -> Duration {
        Duration::from_micros(self.store_latency_us.load(Ordering::Relaxed))
    }

    pub fn retrieve_latency(&self) -> Duration {
        Duration::from_micros(self.retrieve_latency_us.load(Ordering::Relaxed))
    }

    pub fn final_misses(&self) -> u64 {
        self.final_misses.load(Ordering::Relaxed)
    }

    /// Get overall cache hit ratio
    pub fn overall_hit_ratio(&self) -> f64 {
        let total_hits = self.l1.hits() + self.l2.hits() + self.l3.hits();
        // Only count final misses
        ratio(total_hits, self.final_misses())
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            l1: self.l1.snapshot(),
            l2: self.l2.snapshot(),
            l3: self.l3.snapshot(),

            promotions_l2_to_l1: self.promotions_l2_to_l1.load(Ordering::Relaxed),
            promotions_l3_to_l1: self.promotions_l3_to_l1.load(Ordering::Relaxed),
            promotions_l3_to_l2: self.promotions_l3_to_l2.load(Ordering::Relaxed),

            final_misses: self.final_misses(),
            overall_hit_ratio: self.overall_hit_ratio(),
            store_latency_us: self.store_latency_us.load(Ordering::Relaxed),
            retrieve_latency_us: self.retrieve_latency_us.load(Ordering::Relaxed),
            slow_operations: self.slow_operations.load(Ordering::Relaxed),
        }
    }

    /// Reset counters and averages. Size gauges are left alone.
    pub fn reset(&self) {
        self.l1.reset();
        self.l2.reset();
        self.l3.reset();
        for counter in [
            &self.promotions_l2_to_l1,
            &self.promotions_l3_to_l1,
            &self.promotions_l3_to_l2,
            &self.final_misses,
            &self.store_latency_us,
            &self.retrieve_latency_us,
            &self.slow_operations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) -> u64 {
    let new_us = duration.as_micros() as u64;

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - LATENCY_EMA_ALPHA) * current as f64 + LATENCY_EMA_ALPHA * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return updated;
        }
    }
}

/// Snapshot of one tier's metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub reclaimed: u64,
    pub store_failures: u64,
    pub entries: u64,
    pub size_bytes: u64,
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub l1: TierSnapshot,
    pub l2: TierSnapshot,
    pub l3: TierSnapshot,

    // Tier movement
    pub promotions_l2_to_l1: u64,
    pub promotions_l3_to_l1: u64,
    pub promotions_l3_to_l2: u64,

    // Overall
    pub final_misses: u64,
    pub overall_hit_ratio: f64,
    pub store_latency_us: u64,
    pub retrieve_latency_us: u64,
    pub slow_operations: u64,
}

impl MetricsSnapshot {
    /// Snapshot of one tier
    pub fn tier(&self, tier: CacheTier) -> &TierSnapshot {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
            CacheTier::L3 => &self.l3,
        }
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Prometheus export
// =============================================================================

/// Renders [`MetricsSnapshot`]s in Prometheus text exposition format.
///
/// Uses a private registry so several caches in one process do not collide.
pub struct PrometheusExporter {
    registry: Registry,
    hits: IntCounterVec,
    misses: IntCounterVec,
    evictions: IntCounterVec,
    expirations: IntCounterVec,
    reclaimed: IntCounterVec,
    store_failures: IntCounterVec,
    promotions: IntCounterVec,
    final_misses: IntCounter,
    slow_operations: IntCounter,
    entries: IntGaugeVec,
    size_bytes: IntGaugeVec,
    hit_ratio: GaugeVec,
    latency: GaugeVec,
}

impl PrometheusExporter {
    /// Create an exporter whose metric names start with `namespace_`
    pub fn new(namespace: &str) -> Result<Self> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(namespace);

        let counter_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec> {
            let c = IntCounterVec::new(opts(name, help), labels)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let hits = counter_vec("hits_total", "Cache hits per tier", &["tier"])?;
        let misses = counter_vec("misses_total", "Cache misses per tier", &["tier"])?;
        let evictions = counter_vec(
            "evictions_total",
            "Entries evicted by capacity or disk limit",
            &["tier"],
        )?;
        let expirations = counter_vec(
            "expirations_total",
            "Entries removed after expiry",
            &["tier"],
        )?;
        let reclaimed = counter_vec(
            "reclaimed_total",
            "Weak entries whose value was dropped",
            &["tier"],
        )?;
        let store_failures =
            counter_vec("store_failures_total", "Failed tier writes", &["tier"])?;
        let promotions = counter_vec(
            "promotions_total",
            "Values copied into a faster tier on read",
            &["from", "to"],
        )?;

        let final_misses = IntCounter::with_opts(opts(
            "final_misses_total",
            "Retrieves that missed every enabled tier",
        ))?;
        registry.register(Box::new(final_misses.clone()))?;
        let slow_operations = IntCounter::with_opts(opts(
            "slow_operations_total",
            "Operations above the performance warning threshold",
        ))?;
        registry.register(Box::new(slow_operations.clone()))?;

        let entries = IntGaugeVec::new(opts("entries", "Entries per tier"), &["tier"])?;
        registry.register(Box::new(entries.clone()))?;
        let size_bytes = IntGaugeVec::new(opts("size_bytes", "Bytes held per tier"), &["tier"])?;
        registry.register(Box::new(size_bytes.clone()))?;
        let hit_ratio = GaugeVec::new(
            opts("hit_ratio", "Hit ratio per tier and overall"),
            &["tier"],
        )?;
        registry.register(Box::new(hit_ratio.clone()))?;
        let latency = GaugeVec::new(
            opts(
                "operation_latency_seconds",
                "Moving average latency per operation",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            evictions,
            expirations,
            reclaimed,
            store_failures,
            promotions,
            final_misses,
            slow_operations,
            entries,
            size_bytes,
            hit_ratio,
            latency,
        })
    }

    /// The registry backing this exporter
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bring every collector up to date with `snapshot`
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        for tier in CacheTier::ALL {
            let s = snapshot.tier(tier);
            let label = [tier.label()];
            advance(&self.hits.with_label_values(&label), s.hits);
            advance(&self.misses.with_label_values(&label), s.misses);
            advance(&self.evictions.with_label_values(&label), s.evictions);
            advance(&self.expirations.with_label_values(&label), s.expirations);
            advance(&self.reclaimed.with_label_values(&label), s.reclaimed);
            advance(
                &self.store_failures.with_label_values(&label),
                s.store_failures,
            );
            self.entries.with_label_values(&label).set(s.entries as i64);
            self.size_bytes
                .with_label_values(&label)
                .set(s.size_bytes as i64);
            self.hit_ratio.with_label_values(&label).set(s.hit_ratio);
        }
        self.hit_ratio
            .with_label_values(&["overall"])
            .set(snapshot.overall_hit_ratio);

        for (from, to, value) in [
            (CacheTier::L2, CacheTier::L1, snapshot.promotions_l2_to_l1),
            (CacheTier::L3, CacheTier::L1, snapshot.promotions_l3_to_l1),
            (CacheTier::L3, CacheTier::L2, snapshot.promotions_l3_to_l2),
        ] {
            advance(
                &self.promotions.with_label_values(&[from.label(), to.label()]),
                value,
            );
        }

        advance(&self.final_misses, snapshot.final_misses);
        advance(&self.slow_operations, snapshot.slow_operations);

        self.latency
            .with_label_values(&[CacheOperation::Store.label()])
            .set(snapshot.store_latency_us as f64 / 1e6);
        self.latency
            .with_label_values(&[CacheOperation::Retrieve.label()])
            .set(snapshot.retrieve_latency_us as f64 / 1e6);
    }

    /// Update from `snapshot` and render the text exposition
    pub fn render(&self, snapshot: &MetricsSnapshot) -> Result<String> {
        self.update(snapshot);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
    }
}

/// Move a monotonic counter up to `value`. Counters never go backwards, so a
/// `reset()` on the collector is absorbed rather than exported.
fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = CacheMetrics::new();
        for tier in CacheTier::ALL {
            assert_eq!(metrics.tier(tier).hits(), 0);
        }
        assert_eq!(metrics.overall_hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_hit(CacheTier::L1);
        metrics.record_hit(CacheTier::L1);
        metrics.record_miss(CacheTier::L1);

        assert_eq!(metrics.tier(CacheTier::L1).hits(), 2);
        assert_eq!(metrics.tier(CacheTier::L1).misses(), 1);
        let ratio = metrics.tier(CacheTier::L1).hit_ratio();
        assert!((ratio - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_overall_hit_ratio_uses_final_misses() {
        let metrics = CacheMetrics::new();

        // One retrieve served by L3 after missing L1 and L2
        metrics.record_miss(CacheTier::L1);
        metrics.record_miss(CacheTier::L2);
        metrics.record_hit(CacheTier::L3);
        // One retrieve that missed everywhere
        metrics.record_miss(CacheTier::L1);
        metrics.record_miss(CacheTier::L2);
        metrics.record_miss(CacheTier::L3);
        metrics.record_final_miss();

        assert!((metrics.overall_hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_removal_classification() {
        let metrics = CacheMetrics::new();
        metrics.record_removal(CacheTier::L1, EvictionReason::Capacity);
        metrics.record_removal(CacheTier::L3, EvictionReason::DiskLimit);
        metrics.record_removal(CacheTier::L1, EvictionReason::Expired);
        metrics.record_removal(CacheTier::L2, EvictionReason::Reclaimed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.l1.evictions, 1);
        assert_eq!(snapshot.l1.expirations, 1);
        assert_eq!(snapshot.l3.evictions, 1);
        assert_eq!(snapshot.l2.evictions, 0);
        assert_eq!(snapshot.l2.reclaimed, 1);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();
        let threshold = Duration::from_secs(1);

        metrics.record_operation(
            CacheOperation::Retrieve,
            Duration::from_micros(100),
            threshold,
        );
        assert_eq!(metrics.retrieve_latency(), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_operation(
            CacheOperation::Retrieve,
            Duration::from_micros(200),
            threshold,
        );
        let latency = metrics.retrieve_latency().as_micros();
        assert!(latency > 100 && latency < 200);
        assert_eq!(metrics.store_latency(), Duration::ZERO);
    }

    #[test]
    fn test_slow_operation_detection() {
        let metrics = CacheMetrics::new();
        let threshold = Duration::from_millis(10);

        assert!(metrics
            .record_operation(CacheOperation::Store, Duration::from_millis(1), threshold)
            .is_none());

        let slow = metrics
            .record_operation(CacheOperation::Store, Duration::from_millis(50), threshold)
            .unwrap();
        assert_eq!(slow.latency_us, 50_000);
        assert!(slow.average_us > 1_000 && slow.average_us < 50_000);
        assert_eq!(metrics.snapshot().slow_operations, 1);
    }

    #[test]
    fn test_promotion_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_promotion(CacheTier::L2, CacheTier::L1);
        metrics.record_promotion(CacheTier::L3, CacheTier::L1);
        metrics.record_promotion(CacheTier::L3, CacheTier::L2);
        // Not a promotion
        metrics.record_promotion(CacheTier::L1, CacheTier::L3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.promotions_l2_to_l1, 1);
        assert_eq!(snapshot.promotions_l3_to_l1, 1);
        assert_eq!(snapshot.promotions_l3_to_l2, 1);
    }

    #[test]
    fn test_reset_keeps_gauges() {
        let metrics = CacheMetrics::new();
        metrics.record_hit(CacheTier::L2);
        metrics.update_tier_stats(CacheTier::L2, 3, 300);

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.l2.hits, 0);
        assert_eq!(snapshot.l2.entries, 3);
        assert_eq!(snapshot.l2.size_bytes, 300);
    }

    #[test]
    fn test_prometheus_render() {
        let metrics = CacheMetrics::new();
        metrics.record_hit(CacheTier::L1);
        metrics.record_hit(CacheTier::L1);
        metrics.record_promotion(CacheTier::L3, CacheTier::L1);
        metrics.update_tier_stats(CacheTier::L3, 4, 4096);

        let exporter = PrometheusExporter::new("tiered_cache").unwrap();
        let text = exporter.render(&metrics.snapshot()).unwrap();

        assert!(text.contains("tiered_cache_hits_total{tier=\"l1\"} 2"));
        assert!(text.contains("tiered_cache_promotions_total{from=\"l3\",to=\"l1\"} 1"));
        assert!(text.contains("tiered_cache_size_bytes{tier=\"l3\"} 4096"));
        assert!(text.contains("tiered_cache_hit_ratio{tier=\"overall\"}"));

        // Rendering again does not double count
        metrics.record_hit(CacheTier::L1);
        let text = exporter.render(&metrics.snapshot()).unwrap();
        assert!(text.contains("tiered_cache_hits_total{tier=\"l1\"} 3"));
    }

    #[test]
    fn test_exporters_do_not_collide() {
        let a = PrometheusExporter::new("cache_a").unwrap();
        let b = PrometheusExporter::new("cache_a").unwrap();
        a.update(&MetricsSnapshot::default());
        b.update(&MetricsSnapshot::default());
        assert!(!a.registry().gather().is_empty());
    }
}
