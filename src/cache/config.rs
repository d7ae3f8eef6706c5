//! Cache Configuration
//!
//! The full configuration surface of the engine: tier switches and limits,
//! TTL defaults, maintenance intervals, promotion policy, and the latency
//! threshold for performance warnings.
//!
//! Loadable from YAML; durations are written as human strings such as
//! `"500ms"`, `"30s"`, `"5m"`, `"1h30m"` or `"7d"`.
//!
//! ```yaml
//! memory:
//!   max_entries: 2048
//! disk:
//!   directory: /var/cache/myapp
//!   instance: worker-1
//!   max_total_bytes: 1073741824
//! default_ttl: 10m
//! maintenance:
//!   expiration_interval: 15s
//!   disk_interval: 5m
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::l1::L1Config;
use super::l3::L3Config;
use super::policy::PromotionPolicy;
use super::{
    DEFAULT_DISK_INTERVAL, DEFAULT_EXPIRATION_INTERVAL, DEFAULT_L1_MAX_ENTRIES,
    DEFAULT_L1_MAX_ITEM_SIZE, DEFAULT_L3_MAX_ITEM_SIZE, DEFAULT_L3_MAX_TOTAL_BYTES,
};
use crate::error::{Error, Result};

// =============================================================================
// Tier sections
// =============================================================================

/// L1 (bounded memory) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    pub enabled: bool,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum estimated size of one item in bytes
    pub max_item_size: usize,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_L1_MAX_ENTRIES,
            max_item_size: DEFAULT_L1_MAX_ITEM_SIZE,
        }
    }
}

/// L2 (weak reference) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeakTierConfig {
    pub enabled: bool,
}

impl Default for WeakTierConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// L3 (disk) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskTierConfig {
    pub enabled: bool,
    /// Base directory
    pub directory: PathBuf,
    /// Instance subdirectory under `directory`, exclusive to one cache
    pub instance: String,
    /// Maximum payload size of one item in bytes
    pub max_item_size: u64,
    /// Soft bound on total bytes on disk, enforced by the disk sweep
    pub max_total_bytes: u64,
    /// Fraction of `max_total_bytes` the disk sweep evicts down to
    pub eviction_target_ratio: f64,
    /// Unindexed files untouched for longer than this are deleted
    #[serde(with = "human_duration")]
    pub orphan_grace: Duration,
    /// Adopt files left by a previous process on index miss
    pub adopt_existing_files: bool,
}

impl Default for DiskTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: std::env::temp_dir().join("tiered-cache"),
            instance: "default".to_string(),
            max_item_size: DEFAULT_L3_MAX_ITEM_SIZE,
            max_total_bytes: DEFAULT_L3_MAX_TOTAL_BYTES,
            eviction_target_ratio: 0.8,
            orphan_grace: Duration::from_secs(3600),
            adopt_existing_files: true,
        }
    }
}

/// Background sweep intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Expiration / reclaim sweep interval
    #[serde(with = "human_duration")]
    pub expiration_interval: Duration,
    /// Disk-bound sweep interval
    #[serde(with = "human_duration")]
    pub disk_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            expiration_interval: DEFAULT_EXPIRATION_INTERVAL,
            disk_interval: DEFAULT_DISK_INTERVAL,
        }
    }
}

// =============================================================================
// Top-level config
// =============================================================================

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory: MemoryTierConfig,
    pub weak: WeakTierConfig,
    pub disk: DiskTierConfig,
    /// TTL applied when `store` is called without one
    #[serde(with = "option_human_duration")]
    pub default_ttl: Option<Duration>,
    /// Upper bound on any TTL
    #[serde(with = "option_human_duration")]
    pub max_ttl: Option<Duration>,
    pub maintenance: MaintenanceConfig,
    pub promotion: PromotionPolicy,
    /// Operations slower than this raise a performance warning
    #[serde(with = "human_duration")]
    pub performance_warning_threshold: Duration,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryTierConfig::default(),
            weak: WeakTierConfig::default(),
            disk: DiskTierConfig::default(),
            default_ttl: None,
            max_ttl: None,
            maintenance: MaintenanceConfig::default(),
            promotion: PromotionPolicy::default(),
            performance_warning_threshold: Duration::from_millis(100),
            event_buffer: 1024,
        }
    }
}

impl CacheConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::file_io(path, e))?;
        Self::from_yaml_str(&text)
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check every invariant the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.memory.max_entries == 0 {
            return Err(Error::Config(
                "memory.max_entries must be at least 1".into(),
            ));
        }
        if self.memory.max_item_size == 0 {
            return Err(Error::Config(
                "memory.max_item_size must be positive".into(),
            ));
        }
        if self.disk.max_item_size == 0 || self.disk.max_total_bytes == 0 {
            return Err(Error::Config(
                "disk.max_item_size and disk.max_total_bytes must be positive".into(),
            ));
        }
        if self.disk.max_item_size > self.disk.max_total_bytes {
            return Err(Error::Config(format!(
                "disk.max_item_size ({}) exceeds disk.max_total_bytes ({})",
                self.disk.max_item_size, self.disk.max_total_bytes
            )));
        }
        let ratio = self.disk.eviction_target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(Error::Config(format!(
                "disk.eviction_target_ratio must be in (0, 1], got {}",
                ratio
            )));
        }
        let instance = &self.disk.instance;
        if instance.is_empty()
            || instance == "."
            || instance == ".."
            || instance.contains(['/', '\\'])
        {
            return Err(Error::Config(format!(
                "disk.instance must be a single path component, got {:?}",
                instance
            )));
        }
        if self.maintenance.expiration_interval.is_zero()
            || self.maintenance.disk_interval.is_zero()
        {
            return Err(Error::Config(
                "maintenance intervals must be positive".into(),
            ));
        }
        if let (Some(default_ttl), Some(max_ttl)) = (self.default_ttl, self.max_ttl) {
            if default_ttl > max_ttl {
                return Err(Error::Config(format!(
                    "default_ttl ({}) exceeds max_ttl ({})",
                    format_duration(default_ttl),
                    format_duration(max_ttl)
                )));
            }
        }
        if self.default_ttl.is_some_and(|t| t.is_zero())
            || self.max_ttl.is_some_and(|t| t.is_zero())
        {
            return Err(Error::Config("TTLs must be positive".into()));
        }
        if self.event_buffer == 0 {
            return Err(Error::Config("event_buffer must be at least 1".into()));
        }
        Ok(())
    }

    /// Validate `next` as a live replacement for `self`
    pub fn check_update(&self, next: &CacheConfig) -> Result<()> {
        next.validate()?;
        if self.cache_directory() != next.cache_directory() {
            return Err(Error::Config(format!(
                "disk directory cannot change while the cache is open ({} -> {})",
                self.cache_directory().display(),
                next.cache_directory().display()
            )));
        }
        Ok(())
    }

    /// Directory holding this instance's L3 files
    pub fn cache_directory(&self) -> PathBuf {
        self.disk.directory.join(&self.disk.instance)
    }

    /// Effective TTL: explicit, else default, clamped to `max_ttl`
    pub fn resolve_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        match (ttl.or(self.default_ttl), self.max_ttl) {
            (Some(ttl), Some(max)) => Some(ttl.min(max)),
            (None, Some(max)) => Some(max),
            (ttl, None) => ttl,
        }
    }

    /// L1 limits
    pub fn l1_config(&self) -> L1Config {
        L1Config {
            max_entries: self.memory.max_entries,
            max_item_size: self.memory.max_item_size,
        }
    }

    /// L3 limits
    pub fn l3_config(&self) -> L3Config {
        L3Config {
            max_item_size: self.disk.max_item_size,
            max_total_bytes: self.disk.max_total_bytes,
            eviction_target_ratio: self.disk.eviction_target_ratio,
            orphan_grace: self.disk.orphan_grace,
            adopt_existing_files: self.disk.adopt_existing_files,
            adopted_ttl: self.resolve_ttl(None),
        }
    }
}

// =============================================================================
// Durations
// =============================================================================

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Parse a duration string like "30s", "5m", "1h30m", "500ms" or "7d".
/// Sub-millisecond units ("250us", "µs", "ns") are accepted too.
/// A trailing bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ns: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    let take_number = |buf: &mut String| -> Result<u64> {
        let num = buf
            .parse::<u64>()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        buf.clear();
        Ok(num)
    };
    let overflow = || Error::DurationParse(format!("duration overflows: {}", s));

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }
        if c.is_whitespace() {
            continue;
        }

        let num = take_number(&mut num_buf)?;
        let unit = c.to_ascii_lowercase();
        let sub_second = matches!(unit, 'm' | 'u' | 'µ' | 'n')
            && chars.peek().is_some_and(|n| n.eq_ignore_ascii_case(&'s'));
        if sub_second {
            chars.next();
        }

        let multiplier = match (unit, sub_second) {
            ('m', true) => NANOS_PER_MILLI,
            ('u' | 'µ', true) => NANOS_PER_MICRO,
            ('n', true) => 1,
            ('d', _) => 86_400 * NANOS_PER_SEC,
            ('h', _) => 3_600 * NANOS_PER_SEC,
            ('m', false) => 60 * NANOS_PER_SEC,
            ('s', _) => NANOS_PER_SEC,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ns = num
            .checked_mul(multiplier)
            .and_then(|v| total_ns.checked_add(v))
            .ok_or_else(overflow)?;
    }

    if !num_buf.is_empty() {
        let secs = take_number(&mut num_buf)?;
        total_ns = secs
            .checked_mul(NANOS_PER_SEC)
            .and_then(|v| total_ns.checked_add(v))
            .ok_or_else(overflow)?;
    }

    Ok(Duration::from_nanos(total_ns))
}

/// Render a duration in the largest unit that represents it exactly
pub fn format_duration(d: Duration) -> String {
    let ns = d.as_nanos();
    if ns % u128::from(NANOS_PER_MICRO) != 0 {
        return format!("{}ns", ns);
    }
    if ns % u128::from(NANOS_PER_MILLI) != 0 {
        return format!("{}us", ns / u128::from(NANOS_PER_MICRO));
    }
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = ms / 1000;
    if secs == 0 {
        "0s".to_string()
    } else if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

mod human_duration {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        RawDuration::deserialize(d)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

mod option_human_duration {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        Option::<RawDuration>::deserialize(d)?
            .map(RawDuration::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
