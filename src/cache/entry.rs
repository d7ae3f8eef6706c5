//! Cache Entry Types
//!
//! Keys, tier identifiers, and the per-tier entry records. Entries are plain
//! data; all locking lives in the tier that owns them.

use std::borrow::Borrow;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Wall-clock timestamp used for entry metadata
pub type Timestamp = DateTime<Utc>;

/// Prefix of every Tier3 file name
pub const FILE_PREFIX: &str = "cache_";

/// Extension of every Tier3 file name
pub const FILE_EXTENSION: &str = "dat";

/// Cache tier enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// L1 - bounded strongly-owned memory
    L1,
    /// L2 - weak references
    L2,
    /// L3 - persisted on disk
    L3,
}

impl CacheTier {
    /// All tiers in lookup order
    pub const ALL: [CacheTier; 3] = [CacheTier::L1, CacheTier::L2, CacheTier::L3];

    /// Short label used in logs and metric labels
    pub fn label(&self) -> &'static str {
        match self {
            CacheTier::L1 => "l1",
            CacheTier::L2 => "l2",
            CacheTier::L3 => "l3",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "L1 (Memory)"),
            CacheTier::L2 => write!(f, "L2 (Weak)"),
            CacheTier::L3 => write!(f, "L3 (Disk)"),
        }
    }
}

/// Opaque, immutable cache key.
///
/// Used verbatim as the map key in L1/L2. L3 derives a file name from its
/// SHA-256 digest so arbitrary key text never reaches the filesystem.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Create a new cache key. Empty keys are rejected.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::InvalidKey("key must not be empty".to_string()));
        }
        Ok(Self(Arc::from(key)))
    }

    /// Key text
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase hex SHA-256 digest of the key
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Deterministic, filesystem-safe file name for this key
    pub fn file_name(&self) -> String {
        format!("{}{}.{}", FILE_PREFIX, self.digest(), FILE_EXTENSION)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for CacheKey {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0.to_string()
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:?})", &*self.0)
    }
}

/// Compute an absolute expiry from a TTL, measured from `now`.
///
/// TTLs too large to represent saturate to "never expires".
pub fn expiry_from_ttl(now: Timestamp, ttl: Option<Duration>) -> Option<Timestamp> {
    let ttl = ttl?;
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    now.checked_add_signed(ttl)
}

/// Lifecycle metadata shared by every tier's entry record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Creation time
    pub created_at: Timestamp,
    /// Last successful read (or creation)
    pub last_access_at: Timestamp,
    /// Absolute expiry, `None` = never
    pub expires_at: Option<Timestamp>,
    /// Number of successful reads
    pub access_count: u64,
}

impl EntryMetadata {
    /// Create metadata stamped with the current time
    pub fn new(expires_at: Option<Timestamp>) -> Self {
        Self::created_at(Utc::now(), expires_at)
    }

    /// Create metadata with an explicit creation time
    pub fn created_at(now: Timestamp, expires_at: Option<Timestamp>) -> Self {
        Self {
            created_at: now,
            last_access_at: now,
            expires_at,
            access_count: 0,
        }
    }

    /// Check expiry against a given instant
    #[inline]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    /// Check expiry against the current time
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Record a read
    #[inline]
    pub fn record_access(&mut self, now: Timestamp) {
        self.last_access_at = now;
        self.access_count += 1;
    }
}

/// L1 entry: owns the value
#[derive(Debug)]
pub struct MemoryEntry<V> {
    pub metadata: EntryMetadata,
    pub value: Arc<V>,
    /// Estimated size in bytes
    pub size: usize,
}

/// L2 entry: non-owning handle to the value
#[derive(Debug)]
pub struct WeakEntry<V> {
    pub metadata: EntryMetadata,
    pub handle: Weak<V>,
    /// Size estimate carried along for promotion into L1
    pub size: usize,
}

impl<V> WeakEntry<V> {
    /// True once the referent has been dropped everywhere else
    #[inline]
    pub fn is_reclaimed(&self) -> bool {
        self.handle.strong_count() == 0
    }
}

/// L3 index record: where the bytes live and how many there are
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub metadata: EntryMetadata,
    /// Payload length in bytes
    pub length: u64,
    /// File name inside the cache directory
    pub file_name: String,
}

/// A hit from a lower tier, carrying what promotion needs
#[derive(Debug, Clone)]
pub struct TierHit<T> {
    pub value: T,
    pub expires_at: Option<Timestamp>,
    pub size: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_rejects_empty() {
        assert!(CacheKey::new("").is_err());
        assert!(CacheKey::try_from("").is_err());
        assert_eq!(CacheKey::new("a").unwrap().as_str(), "a");
    }

    #[test]
    fn test_cache_key_equality_and_hashing() {
        use std::collections::HashSet;

        let a1 = CacheKey::new("grid/row/1").unwrap();
        let a2 = CacheKey::new("grid/row/1").unwrap();
        let b = CacheKey::new("grid/row/2").unwrap();

        assert_eq!(a1, a2);
        assert_ne!(a1, b);

        let set: HashSet<_> = [a1, a2, b].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains("grid/row/2"));
    }

    #[test]
    fn test_file_name_is_deterministic_and_safe() {
        let key = CacheKey::new("../../etc/passwd").unwrap();
        let name = key.file_name();

        assert_eq!(name, key.file_name());
        assert!(name.starts_with(FILE_PREFIX));
        assert!(name.ends_with(".dat"));
        // 64 hex chars of SHA-256
        assert_eq!(name.len(), FILE_PREFIX.len() + 64 + 4);
        assert!(!name.contains('/'));

        let other = CacheKey::new("../../etc/shadow").unwrap();
        assert_ne!(name, other.file_name());
    }

    #[test]
    fn test_known_digest() {
        let key = CacheKey::new("abc").unwrap();
        assert_eq!(
            key.digest(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_key_serde_roundtrip_rejects_empty() {
        let key = CacheKey::new("k").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"k\"");
        assert!(serde_json::from_str::<CacheKey>("\"\"").is_err());
    }

    #[test]
    fn test_expiry_from_ttl() {
        let now = Utc::now();
        assert_eq!(expiry_from_ttl(now, None), None);

        let at = expiry_from_ttl(now, Some(Duration::from_secs(60))).unwrap();
        assert_eq!((at - now).num_seconds(), 60);

        // Saturates to "never" instead of overflowing
        assert_eq!(expiry_from_ttl(now, Some(Duration::MAX)), None);
    }

    #[test]
    fn test_metadata_expiry() {
        let now = Utc::now();
        let meta = EntryMetadata::created_at(now, Some(now + chrono::Duration::seconds(10)));

        assert!(!meta.is_expired_at(now));
        assert!(meta.is_expired_at(now + chrono::Duration::seconds(10)));
        assert!(!EntryMetadata::new(None).is_expired());
    }

    #[test]
    fn test_metadata_access_tracking() {
        let now = Utc::now();
        let mut meta = EntryMetadata::created_at(now, None);
        assert_eq!(meta.access_count, 0);

        let later = now + chrono::Duration::seconds(5);
        meta.record_access(later);
        meta.record_access(later);

        assert_eq!(meta.access_count, 2);
        assert_eq!(meta.last_access_at, later);
        assert_eq!(meta.created_at, now);
    }

    #[test]
    fn test_weak_entry_reclaim_detection() {
        let value = Arc::new(7u32);
        let entry = WeakEntry {
            metadata: EntryMetadata::new(None),
            handle: Arc::downgrade(&value),
            size: 4,
        };
        assert!(!entry.is_reclaimed());

        drop(value);
        assert!(entry.is_reclaimed());
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(format!("{}", CacheTier::L1), "L1 (Memory)");
        assert_eq!(format!("{}", CacheTier::L2), "L2 (Weak)");
        assert_eq!(format!("{}", CacheTier::L3), "L3 (Disk)");
        assert_eq!(CacheTier::L3.label(), "l3");
    }
}
