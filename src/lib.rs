//! Tiered Cache - Multi-Tier Caching and Eviction Engine
//!
//! An in-process cache with three cooperating tiers:
//!
//! - L1: bounded, strongly-owned memory with exact LRU eviction
//! - L2: weak references that re-serve values still alive elsewhere
//! - L3: serialized values on disk, bounded by a background LRU sweep
//!   over filesystem access times
//!
//! Reads check L1 → L2 → L3 and promote hits into the faster tiers.
//! A maintenance scheduler expires entries and enforces the disk budget.
//!
//! # Modules
//!
//! - [`cache`] - Tiers, manager, maintenance scheduler, metrics and events
//! - [`error`] - Error types

pub mod cache;
pub mod error;

pub use cache::{CacheConfig, CacheKey, CacheManager, CacheTier, MaintenanceScheduler};
pub use error::{Error, Result};
