//! Cache Events
//!
//! Observability notifications: hits, misses, evictions and performance
//! warnings. Delivered over a `tokio::sync::broadcast` channel; publishing
//! never blocks the engine and slow subscribers lose events.
//!
//! # Example
//!
//! ```ignore
//! let mut events = manager.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", serde_json::to_string(&event)?);
//!     }
//! });
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::entry::{CacheKey, CacheTier};

/// Why an entry left a tier without an explicit remove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// L1 was full
    Capacity,
    /// L3 exceeded its byte budget
    DiskLimit,
    /// `expires_at` passed
    Expired,
    /// L2 referent was dropped
    Reclaimed,
}

impl EvictionReason {
    /// Whether this removal counts as an eviction (a bound was enforced)
    pub fn is_eviction(&self) -> bool {
        matches!(self, EvictionReason::Capacity | EvictionReason::DiskLimit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Capacity => "capacity",
            EvictionReason::DiskLimit => "disk_limit",
            EvictionReason::Expired => "expired",
            EvictionReason::Reclaimed => "reclaimed",
        }
    }
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timed public operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOperation {
    Store,
    Retrieve,
}

impl CacheOperation {
    pub fn label(&self) -> &'static str {
        match self {
            CacheOperation::Store => "store",
            CacheOperation::Retrieve => "retrieve",
        }
    }
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Event emitted by the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// A tier served the key
    Hit {
        key: CacheKey,
        tier: CacheTier,
        timestamp: DateTime<Utc>,
    },

    /// A tier was searched and did not have the key
    Miss {
        key: CacheKey,
        tier: CacheTier,
        timestamp: DateTime<Utc>,
    },

    /// An entry was removed by a bound, an expiry or a reclaim
    Eviction {
        key: CacheKey,
        tier: CacheTier,
        reason: EvictionReason,
        timestamp: DateTime<Utc>,
    },

    /// An operation exceeded the latency threshold
    PerformanceWarning {
        operation: CacheOperation,
        latency_us: u64,
        /// Rolling (EMA) latency of this operation
        average_us: u64,
        cached_entries: usize,
        hit_ratio: f64,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Hit { .. } => "Hit",
            CacheEvent::Miss { .. } => "Miss",
            CacheEvent::Eviction { .. } => "Eviction",
            CacheEvent::PerformanceWarning { .. } => "PerformanceWarning",
        }
    }

    /// Get the key this event is about, if any
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            CacheEvent::Hit { key, .. }
            | CacheEvent::Miss { key, .. }
            | CacheEvent::Eviction { key, .. } => Some(key),
            CacheEvent::PerformanceWarning { .. } => None,
        }
    }

    /// Get the event timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CacheEvent::Hit { timestamp, .. }
            | CacheEvent::Miss { timestamp, .. }
            | CacheEvent::Eviction { timestamp, .. }
            | CacheEvent::PerformanceWarning { timestamp, .. } => *timestamp,
        }
    }
}

/// Fan-out of cache events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Whether anyone is listening
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Publish an event built lazily, only if anyone is listening
    pub fn publish_with(&self, build: impl FnOnce() -> CacheEvent) {
        if self.has_subscribers() {
            // Err only means every receiver dropped in between
            let _ = self.sender.send(build());
        }
    }

    pub fn hit(&self, key: &CacheKey, tier: CacheTier) {
        self.publish_with(|| CacheEvent::Hit {
            key: key.clone(),
            tier,
            timestamp: Utc::now(),
        });
    }

    pub fn miss(&self, key: &CacheKey, tier: CacheTier) {
        self.publish_with(|| CacheEvent::Miss {
            key: key.clone(),
            tier,
            timestamp: Utc::now(),
        });
    }

    pub fn eviction(&self, key: &CacheKey, tier: CacheTier, reason: EvictionReason) {
        self.publish_with(|| CacheEvent::Eviction {
            key: key.clone(),
            tier,
            reason,
            timestamp: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn key(k: &str) -> CacheKey {
        CacheKey::new(k).unwrap()
    }

    #[test]
    fn test_event_serialization() {
        let event = CacheEvent::Eviction {
            key: key("a"),
            tier: CacheTier::L1,
            reason: EvictionReason::Capacity,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Eviction");
        assert_eq!(json["key"], "a");
        assert_eq!(json["tier"], "l1");
        assert_eq!(json["reason"], "capacity");

        let back: CacheEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_accessors() {
        let event = CacheEvent::PerformanceWarning {
            operation: CacheOperation::Retrieve,
            latency_us: 250_000,
            average_us: 1_000,
            cached_entries: 3,
            hit_ratio: 0.5,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "PerformanceWarning");
        assert!(event.key().is_none());
    }

    #[test]
    fn test_eviction_reason_classification() {
        assert!(EvictionReason::Capacity.is_eviction());
        assert!(EvictionReason::DiskLimit.is_eviction());
        assert!(!EvictionReason::Expired.is_eviction());
        assert!(!EvictionReason::Reclaimed.is_eviction());
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.hit(&key("a"), CacheTier::L2);
        bus.miss(&key("b"), CacheTier::L3);

        assert_matches!(rx.recv().await.unwrap(), CacheEvent::Hit { tier: CacheTier::L2, .. });
        assert_matches!(rx.recv().await.unwrap(), CacheEvent::Miss { tier: CacheTier::L3, .. });
    }

    #[test]
    fn test_bus_skips_building_without_subscribers() {
        let bus = EventBus::new(8);
        let mut built = false;
        bus.publish_with(|| {
            built = true;
            CacheEvent::Hit {
                key: key("a"),
                tier: CacheTier::L1,
                timestamp: Utc::now(),
            }
        });
        assert!(!built);
        assert!(!bus.has_subscribers());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_loses_events() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.hit(&key(&format!("k{}", i)), CacheTier::L1);
        }

        assert_matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        );
        assert_matches!(rx.recv().await, Ok(CacheEvent::Hit { .. }));
    }
}
