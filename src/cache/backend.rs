//! L3 Storage Backends
//!
//! All Tier3 file I/O goes through [`StorageBackend`], so tests can swap the
//! real filesystem for an in-memory one.
//!
//! # Design
//!
//! - Flat namespace of file names inside one directory
//! - Writes are atomic: temp file + rename, so a failed or cancelled write
//!   never leaves a truncated `cache_*.dat` behind
//! - Access times are set explicitly on read; `relatime`/`noatime` mounts
//!   do not maintain them reliably

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::entry::FILE_PREFIX;
use crate::error::{Error, Result};

/// Filesystem metadata for one cache file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// File name inside the cache directory
    pub name: String,
    /// Length in bytes
    pub len: u64,
    /// Last access time (falls back to modification time)
    pub accessed: SystemTime,
    /// Last modification time
    pub modified: SystemTime,
}

impl FileStat {
    /// Most recent of access and modification time
    pub fn last_touched(&self) -> SystemTime {
        self.accessed.max(self.modified)
    }
}

/// Persisted storage for L3 payloads
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Atomically replace the contents of `name`
    async fn write(&self, name: &str, data: Bytes) -> Result<()>;

    /// Read `name`; `None` if it does not exist
    async fn read(&self, name: &str) -> Result<Option<Bytes>>;

    /// Delete `name`; `false` if it did not exist
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Stat `name`; `None` if it does not exist
    async fn stat(&self, name: &str) -> Result<Option<FileStat>>;

    /// Set the access time of `name`
    async fn touch(&self, name: &str, at: SystemTime) -> Result<()>;

    /// List every cache file (names starting with the cache prefix)
    async fn list(&self) -> Result<Vec<FileStat>>;

    /// Human-readable location for logs
    fn location(&self) -> String;
}

// =============================================================================
// Local filesystem
// =============================================================================

/// Backend storing one regular file per entry under a directory
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    /// Open (creating if needed) the cache directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::file_io(&root, e))?;
        debug!(path = %root.display(), "Opened cache directory");
        Ok(Self { root })
    }

    /// Directory this backend writes into
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn stat_from(name: String, meta: &std::fs::Metadata) -> FileStat {
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        FileStat {
            name,
            len: meta.len(),
            accessed: meta.accessed().unwrap_or(modified),
            modified,
        }
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        let target = self.path(name);
        let temp = self.path(&format!("{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));

        if let Err(e) = tokio::fs::write(&temp, &data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::file_io(temp, e));
        }

        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::file_io(target, e));
        }

        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Option<Bytes>> {
        let path = self.path(name);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::file_io(path, e)),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::file_io(path, e)),
        }
    }

    async fn stat(&self, name: &str) -> Result<Option<FileStat>> {
        let path = self.path(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(Self::stat_from(name.to_string(), &meta))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::file_io(path, e)),
        }
    }

    async fn touch(&self, name: &str, at: SystemTime) -> Result<()> {
        let path = self.path(name);
        let result = tokio::task::spawn_blocking({
            let path = path.clone();
            move || {
                let file = std::fs::OpenOptions::new().append(true).open(&path)?;
                file.set_times(FileTimes::new().set_accessed(at))
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("touch task failed: {}", e)))?;

        result.map_err(|e| Error::file_io(path, e))
    }

    async fn list(&self) -> Result<Vec<FileStat>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::file_io(&self.root, e))?;

        let mut files = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Error::file_io(&self.root, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(FILE_PREFIX) {
                continue;
            }
            // Vanished between readdir and stat: deleted concurrently, skip it
            if let Ok(meta) = entry.metadata().await {
                if meta.is_file() {
                    files.push(Self::stat_from(name, &meta));
                }
            }
        }

        Ok(files)
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Clone)]
struct MemFile {
    data: Bytes,
    accessed: SystemTime,
    modified: SystemTime,
}

/// In-memory backend for testing.
/// Uses DashMap for lock-free concurrent access instead of single RwLock
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    files: DashMap<String, MemFile>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent read fail with an I/O error
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Override a file's access time
    pub fn set_accessed(&self, name: &str, at: SystemTime) -> bool {
        match self.files.get_mut(name) {
            Some(mut file) => {
                file.accessed = at;
                true
            }
            None => false,
        }
    }

    /// Override a file's access and modification times
    pub fn set_times(&self, name: &str, at: SystemTime) -> bool {
        match self.files.get_mut(name) {
            Some(mut file) => {
                file.accessed = at;
                file.modified = at;
                true
            }
            None => false,
        }
    }

    /// Check whether a file exists
    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// Number of stored files
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Sum of stored file lengths
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.data.len() as u64).sum()
    }

    /// Read operations served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Write operations accepted
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Delete operations that removed a file
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    fn injected(kind: &str) -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected {} failure", kind),
        ))
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Self::injected("write"));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now();
        self.files.insert(
            name.to_string(),
            MemFile {
                data,
                accessed: now,
                modified: now,
            },
        );
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Option<Bytes>> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Self::injected("read"));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.files.get(name).map(|f| f.data.clone()))
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let removed = self.files.remove(name).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn stat(&self, name: &str) -> Result<Option<FileStat>> {
        Ok(self.files.get(name).map(|f| FileStat {
            name: name.to_string(),
            len: f.data.len() as u64,
            accessed: f.accessed,
            modified: f.modified,
        }))
    }

    async fn touch(&self, name: &str, at: SystemTime) -> Result<()> {
        if self.set_accessed(name, at) {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", name),
            )))
        }
    }

    async fn list(&self) -> Result<Vec<FileStat>> {
        Ok(self
            .files
            .iter()
            .filter(|f| f.key().starts_with(FILE_PREFIX))
            .map(|f| FileStat {
                name: f.key().clone(),
                len: f.data.len() as u64,
                accessed: f.accessed,
                modified: f.modified,
            })
            .collect())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
