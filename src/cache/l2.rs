//! L2 Cache - Weak References
//!
//! Re-serves values that are still alive elsewhere in the process without
//! holding a second strong copy. The tier never keeps a value alive: once
//! the last `Arc` is dropped, the entry reads as a miss and is cleaned up.
//!
//! There is no capacity bound; what survives is bounded by the owners.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::trace;

use super::entry::{CacheKey, EntryMetadata, TierHit, Timestamp, WeakEntry};

/// Why a sweep removed an L2 entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Removal {
    /// `expires_at` passed
    Expired,
    /// The referent was dropped
    Reclaimed,
}

/// L2 Cache - weak-reference tier
pub struct L2Cache<V> {
    entries: DashMap<CacheKey, WeakEntry<V>>,
}

impl<V> L2Cache<V> {
    /// Create an empty weak tier
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store a non-owning handle to `value`
    pub fn put(&self, key: CacheKey, value: &Arc<V>, size: usize, expires_at: Option<Timestamp>) {
        let entry = WeakEntry {
            metadata: EntryMetadata::new(expires_at),
            handle: Arc::downgrade(value),
            size,
        };
        self.entries.insert(key, entry);
    }

    /// Resolve the handle.
    ///
    /// A reclaimed or expired entry is removed and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<TierHit<Arc<V>>> {
        let now = Utc::now();

        {
            let mut entry = self.entries.get_mut(key)?;
            if !entry.metadata.is_expired_at(now) {
                if let Some(value) = entry.handle.upgrade() {
                    entry.metadata.record_access(now);
                    return Some(TierHit {
                        value,
                        expires_at: entry.metadata.expires_at,
                        size: entry.size,
                    });
                }
            }
        }

        // Only drop the entry if it is still dead; a concurrent put may have
        // replaced it since the guard was released.
        self.entries
            .remove_if(key, |_, e| e.metadata.is_expired_at(now) || e.is_reclaimed());
        trace!(key = %key, "L2 entry expired or reclaimed on read");
        None
    }

    /// Remove an entry
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Check if a key is indexed (live or not)
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Clear the tier
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop expired and reclaimed entries, returning what was removed
    pub fn purge(&self) -> Vec<(CacheKey, L2Removal)> {
        let now = Utc::now();
        let mut removed = Vec::new();

        self.entries.retain(|key, entry| {
            let reason = if entry.metadata.is_expired_at(now) {
                L2Removal::Expired
            } else if entry.is_reclaimed() {
                L2Removal::Reclaimed
            } else {
                return true;
            };
            removed.push((key.clone(), reason));
            false
        });

        removed
    }

    /// Number of indexed entries, including ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries whose referent is still alive
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_reclaimed()).count()
    }
}

impl<V> Default for L2Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
