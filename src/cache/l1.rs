//! L1 Cache - Bounded Strongly-Owned Memory
//!
//! Fixed-capacity map with exact LRU ordering.
//!
//! # Design
//!
//! - HashMap from key to a slot index in an arena of list nodes
//! - Doubly-linked recency list threaded through the arena (head = MRU,
//!   tail = LRU), so a touch is a relink rather than a scan
//! - One `parking_lot::Mutex` serializes touch/insert/evict; every
//!   operation under it is O(1) except the maintenance purge
//! - Items larger than the per-item limit are rejected, never stored

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::entry::{CacheKey, EntryMetadata, MemoryEntry, Timestamp};
use super::{DEFAULT_L1_MAX_ENTRIES, DEFAULT_L1_MAX_ITEM_SIZE};

/// L1 Cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L1Config {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum estimated size of a single item in bytes
    pub max_item_size: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_L1_MAX_ENTRIES,
            max_item_size: DEFAULT_L1_MAX_ITEM_SIZE,
        }
    }
}

/// Outcome of [`L1Cache::put`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L1Put {
    /// Stored; `evicted` is the LRU key displaced to make room
    Stored { evicted: Option<CacheKey> },
    /// Item exceeded the per-item size limit
    Rejected { size: usize, limit: usize },
}

impl L1Put {
    /// True if the value landed in the cache
    pub fn is_stored(&self) -> bool {
        matches!(self, L1Put::Stored { .. })
    }
}

struct Node<V> {
    key: CacheKey,
    entry: MemoryEntry<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena-backed LRU list. Not thread-safe on its own.
struct LruList<V> {
    map: HashMap<CacheKey, usize>,
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    total_size: usize,
}

impl<V> LruList<V> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            total_size: 0,
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn node(&self, idx: usize) -> &Node<V> {
        self.slots[idx]
            .as_ref()
            .unwrap_or_else(|| unreachable!("LRU slot {idx} is linked but empty"))
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<V> {
        self.slots[idx]
            .as_mut()
            .unwrap_or_else(|| unreachable!("LRU slot {idx} is linked but empty"))
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn insert_front(&mut self, key: CacheKey, entry: MemoryEntry<V>) {
        self.total_size += entry.size;
        let node = Node {
            key: key.clone(),
            entry,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.map.insert(key, idx);
    }

    fn remove_slot(&mut self, idx: usize) -> Node<V> {
        self.unlink(idx);
        let node = self.slots[idx]
            .take()
            .unwrap_or_else(|| unreachable!("LRU slot {idx} is linked but empty"));
        self.free.push(idx);
        self.map.remove(&node.key);
        self.total_size -= node.entry.size;
        node
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Node<V>> {
        let idx = *self.map.get(key)?;
        Some(self.remove_slot(idx))
    }

    fn pop_back(&mut self) -> Option<Node<V>> {
        let idx = self.tail?;
        Some(self.remove_slot(idx))
    }

    fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.total_size = 0;
    }

    /// Keys from most- to least-recently used
    fn keys_mru(&self) -> Vec<CacheKey> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = self.node(idx);
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }
}

/// L1 Cache - bounded strongly-owned memory tier
pub struct L1Cache<V> {
    /// Map + recency list, relinked under one lock
    inner: Mutex<LruList<V>>,
    /// Configuration
    config: RwLock<L1Config>,
}

impl<V> L1Cache<V> {
    /// Create a new L1 cache with default configuration
    pub fn new() -> Self {
        Self::with_config(L1Config::default())
    }

    /// Create a new L1 cache with custom configuration
    pub fn with_config(config: L1Config) -> Self {
        Self {
            inner: Mutex::new(LruList::new()),
            config: RwLock::new(config),
        }
    }

    /// Get a value, marking it most-recently-used.
    ///
    /// Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        let now = Utc::now();
        let mut list = self.inner.lock();
        let idx = *list.map.get(key)?;

        if list.node(idx).entry.metadata.is_expired_at(now) {
            list.remove_slot(idx);
            debug!(key = %key, "L1 entry expired on read");
            return None;
        }

        list.touch(idx);
        let node = list.node_mut(idx);
        node.entry.metadata.record_access(now);
        Some(Arc::clone(&node.entry.value))
    }

    /// Insert or overwrite a value, marking it most-recently-used.
    ///
    /// At capacity, the least-recently-used key is evicted first. An
    /// oversized item is rejected and any older value under the same key is
    /// dropped so it cannot be served stale.
    pub fn put(
        &self,
        key: CacheKey,
        value: Arc<V>,
        size: usize,
        expires_at: Option<Timestamp>,
    ) -> L1Put {
        let config = *self.config.read();

        if size > config.max_item_size {
            let mut list = self.inner.lock();
            list.remove(&key);
            debug!(
                key = %key,
                size,
                limit = config.max_item_size,
                "L1 rejected oversized item"
            );
            return L1Put::Rejected {
                size,
                limit: config.max_item_size,
            };
        }

        let entry = MemoryEntry {
            metadata: EntryMetadata::new(expires_at),
            value,
            size,
        };

        let mut list = self.inner.lock();
        let mut evicted = None;

        if list.remove(&key).is_none() && list.len() >= config.max_entries {
            if let Some(node) = list.pop_back() {
                debug!(key = %node.key, "L1 evicted least-recently-used entry");
                evicted = Some(node.key);
            }
        }

        list.insert_front(key, entry);
        L1Put::Stored { evicted }
    }

    /// Remove an entry
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Check if a key is present without touching recency or expiry
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    /// Clear the cache
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Remove every expired entry, returning their keys
    pub fn purge_expired(&self) -> Vec<CacheKey> {
        let now = Utc::now();
        let mut list = self.inner.lock();

        let expired: Vec<usize> = list
            .map
            .values()
            .copied()
            .filter(|&idx| list.node(idx).entry.metadata.is_expired_at(now))
            .collect();

        expired
            .into_iter()
            .map(|idx| list.remove_slot(idx).key)
            .collect()
    }

    /// Apply a new configuration, evicting LRU entries down to the new capacity
    pub fn reconfigure(&self, config: L1Config) -> Vec<CacheKey> {
        *self.config.write() = config;

        let mut list = self.inner.lock();
        let mut evicted = Vec::new();
        while list.len() > config.max_entries {
            match list.pop_back() {
                Some(node) => evicted.push(node.key),
                None => break,
            }
        }
        evicted
    }

    /// Keys ordered from most- to least-recently used
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.lock().keys_mru()
    }

    /// Access metadata for a key, without touching it
    pub fn metadata(&self, key: &CacheKey) -> Option<EntryMetadata> {
        let list = self.inner.lock();
        let idx = *list.map.get(key)?;
        Some(list.node(idx).entry.metadata.clone())
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of estimated entry sizes in bytes
    pub fn size(&self) -> usize {
        self.inner.lock().total_size
    }

    /// Get capacity
    pub fn capacity(&self) -> usize {
        self.config.read().max_entries
    }

    /// Current configuration
    pub fn config(&self) -> L1Config {
        *self.config.read()
    }
}

impl<V> Default for L1Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
