//! Cache Promotion Policy
//!
//! Decides whether a value found in a lower tier is copied into faster tiers.

use serde::{Deserialize, Serialize};

use super::entry::CacheTier;

/// Promotion policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionPolicy {
    /// Enable write-through-on-read promotion
    pub enabled: bool,
    /// Largest value (estimated bytes) promoted into L1; `None` = no limit
    pub max_promotion_size: Option<usize>,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_promotion_size: None,
        }
    }
}

impl PromotionPolicy {
    /// Never promote
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_promotion_size: None,
        }
    }

    /// Promote everything except values above `max_size` into L1
    pub fn size_capped(max_size: usize) -> Self {
        Self {
            enabled: true,
            max_promotion_size: Some(max_size),
        }
    }

    /// Whether a value of `size` bytes found below `target` should be copied into it.
    ///
    /// L2 holds no strong copy, so promotion into it is always cheap; the size
    /// cap only guards L1 against thrashing on very large values.
    pub fn should_promote(&self, target: CacheTier, size: usize) -> bool {
        if !self.enabled {
            return false;
        }
        match target {
            CacheTier::L1 => self.max_promotion_size.map_or(true, |max| size <= max),
            CacheTier::L2 => true,
            CacheTier::L3 => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
