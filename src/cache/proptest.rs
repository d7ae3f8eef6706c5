//! Property-Based Tests for the Cache Tiers
//!
//! # Test Properties
//!
//! 1. **Capacity**: L1 never holds more than `max_entries`
//! 2. **LRU victim**: the key L1 evicts is always the least recently touched
//! 3. **Disk bound**: after a disk sweep L3 is within budget, and every
//!    surviving file was accessed more recently than every evicted one

#![cfg(test)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use proptest::prelude::*;

use super::backend::InMemoryBackend;
use super::entry::CacheKey;
use super::l1::{L1Cache, L1Config, L1Put};
use super::l3::{L3Cache, L3Config};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(u8),
    Get(u8),
    Remove(u8),
}

/// Operations over a small key space so hits, overwrites and evictions mix
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..8).prop_map(Op::Put),
        3 => (0u8..8).prop_map(Op::Get),
        1 => (0u8..8).prop_map(Op::Remove),
    ]
}

fn key(i: u8) -> CacheKey {
    CacheKey::new(format!("k{}", i)).unwrap()
}

/// Reference model: keys in recency order, most recent first
struct LruModel {
    order: VecDeque<u8>,
    capacity: usize,
}

impl LruModel {
    fn touch(&mut self, k: u8) -> bool {
        match self.order.iter().position(|&x| x == k) {
            Some(pos) => {
                self.order.remove(pos);
                self.order.push_front(k);
                true
            }
            None => false,
        }
    }

    /// Returns the evicted key, if any
    fn put(&mut self, k: u8) -> Option<u8> {
        if self.touch(k) {
            return None;
        }
        let evicted = if self.order.len() >= self.capacity {
            self.order.pop_back()
        } else {
            None
        };
        self.order.push_front(k);
        evicted
    }

    fn remove(&mut self, k: u8) {
        self.order.retain(|&x| x != k);
    }
}

// =============================================================================
// L1 Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// L1 matches an LRU reference model step for step
    #[test]
    fn prop_l1_capacity_and_lru_victim(
        capacity in 1usize..=5,
        ops in prop::collection::vec(op_strategy(), 1..80)
    ) {
        let cache: L1Cache<u8> = L1Cache::with_config(L1Config {
            max_entries: capacity,
            max_item_size: 1024,
        });
        let mut model = LruModel {
            order: VecDeque::new(),
            capacity,
        };

        for op in ops {
            match op {
                Op::Put(k) => {
                    let expected = model.put(k).map(key);
                    let outcome = cache.put(key(k), Arc::new(k), 1, None);
                    prop_assert_eq!(outcome, L1Put::Stored { evicted: expected });
                }
                Op::Get(k) => {
                    let hit = cache.get(&key(k));
                    prop_assert_eq!(hit.is_some(), model.touch(k));
                    if let Some(v) = hit {
                        prop_assert_eq!(*v, k);
                    }
                }
                Op::Remove(k) => {
                    model.remove(k);
                    cache.remove(&key(k));
                }
            }

            prop_assert!(cache.len() <= capacity);
            prop_assert_eq!(cache.len(), model.order.len());
        }

        let expected: Vec<CacheKey> = model.order.iter().copied().map(key).collect();
        prop_assert_eq!(cache.keys(), expected);
    }
}

// =============================================================================
// L3 Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// A disk sweep brings L3 within budget and keeps the most recently
    /// accessed files
    #[test]
    fn prop_disk_sweep_bound(
        sizes in prop::collection::vec(1usize..=200, 1..16),
        access_order in any::<u64>(),
        ratio in 0.5f64..=1.0
    ) {
        const MAX_TOTAL: u64 = 1000;

        tokio_test::block_on(async {
            let backend = Arc::new(InMemoryBackend::new());
            let cache = L3Cache::new(backend.clone(), L3Config {
                max_item_size: 200,
                max_total_bytes: MAX_TOTAL,
                eviction_target_ratio: ratio,
                ..Default::default()
            });

            // Distinct access times in a seed-dependent order
            let mut accessed = Vec::with_capacity(sizes.len());
            for (i, size) in sizes.iter().enumerate() {
                let k = CacheKey::new(format!("file-{}", i)).unwrap();
                cache
                    .put(k.clone(), Bytes::from(vec![0u8; *size]), None)
                    .await
                    .unwrap();
                let rank = (i as u64)
                    .wrapping_mul(2_654_435_761)
                    .wrapping_add(access_order)
                    % 1_000_003;
                let offset = 1_000_000 + rank * 16 + i as u64;
                let at = SystemTime::UNIX_EPOCH + Duration::from_secs(offset);
                backend.set_accessed(&k.file_name(), at);
                accessed.push((k, at));
            }

            let before: u64 = sizes.iter().map(|s| *s as u64).sum();
            let report = cache.sweep_disk().await.unwrap();

            prop_assert_eq!(report.bytes_before, before);
            prop_assert!(report.bytes_after <= MAX_TOTAL);
            prop_assert_eq!(report.bytes_after, backend.total_bytes());
            if before <= MAX_TOTAL {
                prop_assert!(report.evicted.is_empty());
            } else {
                prop_assert!(report.bytes_after <= (MAX_TOTAL as f64 * ratio) as u64);
            }

            let newest_evicted = accessed
                .iter()
                .filter(|(k, _)| report.evicted.contains(k))
                .map(|(_, at)| *at)
                .max();
            let oldest_kept = accessed
                .iter()
                .filter(|(k, _)| cache.contains(k))
                .map(|(_, at)| *at)
                .min();
            if let (Some(evicted), Some(kept)) = (newest_evicted, oldest_kept) {
                prop_assert!(evicted < kept);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
