//! Three-Tiered Cache Engine
//!
//! Caching with L1 (bounded memory), L2 (weak references) and L3 (disk) tiers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        Cache Manager                                     │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 Cache (Memory)    │ L2 Cache (Weak)     │ L3 Cache (Disk)            │
//! │  ┌────────────────┐   │ ┌────────────────┐  │ ┌────────────────────┐     │
//! │  │ HashMap + LRU  │   │ │ DashMap of     │  │ │ Index + one file   │     │
//! │  │ list, owns Arc │   │ │ Weak handles   │  │ │ per key on a       │     │
//! │  │ bounded count  │   │ │ never owns     │  │ │ StorageBackend     │     │
//! │  └────────────────┘   │ └────────────────┘  │ └────────────────────┘     │
//! │         │             │         │           │           │                │
//! │         └─────────────┴─────────┴───────────┴───────────┘                │
//! │                              │                                           │
//! │              Promotion on read (L3 → L2 → L1)                            │
//! └──────────────────────────────────────────────────────────────────────────┘
//!              ▲                                   ▲
//!              │ expiration / reclaim sweep        │ disk-bound sweep
//!              └──────── Maintenance Scheduler ────┘
//! ```
//!
//! # Design Principles
//!
//! - Tiers are independent; the manager composes them and owns no ledger
//! - Tier failures degrade to misses and no-ops, never to caller errors
//! - No lock is held across disk I/O
//! - L3 eviction follows filesystem access times, so it survives restarts
//!
//! # Example
//!
//! ```ignore
//! let cache: CacheManager<Row> = CacheManager::open(CacheConfig::from_file("cache.yaml")?)?;
//! let maintenance = MaintenanceScheduler::new(&cache).spawn();
//!
//! let key = CacheKey::new("grid/row/42")?;
//! cache.store(&key, row, Some(Duration::from_secs(300))).await;
//! let row = cache.retrieve(&key).await;
//!
//! maintenance.shutdown().await?;
//! ```

mod backend;
mod codec;
mod config;
mod entry;
mod events;
mod l1;
mod l2;
mod l3;
mod maintenance;
mod manager;
mod metrics;
mod policy;
mod proptest;

pub use backend::{FileStat, InMemoryBackend, LocalFsBackend, StorageBackend};
pub use codec::{decode, encode, CacheValue};
pub use config::{
    format_duration, parse_duration, CacheConfig, DiskTierConfig, MaintenanceConfig,
    MemoryTierConfig, WeakTierConfig,
};
pub use entry::{
    CacheKey, CacheTier, DiskEntry, EntryMetadata, Timestamp, FILE_EXTENSION, FILE_PREFIX,
};
pub use events::{CacheEvent, CacheOperation, EventBus, EvictionReason};
pub use l1::{L1Cache, L1Config, L1Put};
pub use l2::{L2Cache, L2Removal};
pub use l3::{DiskSweepReport, L3Cache, L3Config, L3Put};
pub use maintenance::{ExpirationReport, MaintenanceHandle, MaintenanceReport, MaintenanceScheduler};
pub use manager::{CacheManager, CacheResult};
pub use metrics::{CacheMetrics, MetricsSnapshot, PrometheusExporter, TierSnapshot};
pub use policy::PromotionPolicy;

use std::time::Duration;

/// Default L1 capacity in entries
pub const DEFAULT_L1_MAX_ENTRIES: usize = 10_000;

/// Default L1 per-item limit (1MB)
pub const DEFAULT_L1_MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Default L3 per-item limit (16MB)
pub const DEFAULT_L3_MAX_ITEM_SIZE: u64 = 16 * 1024 * 1024;

/// Default L3 byte budget (512MB)
pub const DEFAULT_L3_MAX_TOTAL_BYTES: u64 = 512 * 1024 * 1024;

/// Default expiration sweep interval
pub const DEFAULT_EXPIRATION_INTERVAL: Duration = Duration::from_secs(30);

/// Default disk sweep interval
pub const DEFAULT_DISK_INTERVAL: Duration = Duration::from_secs(300);

// =============================================================================
// Tests
// =============================================================================
