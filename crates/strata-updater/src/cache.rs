//! Disk-backed expiring key/value cache.
//!
//! Entries live in two layers:
//!
//! - an in-memory map that answers reads without touching the disk
//! - one JSON file per key under the cache root, the durable copy
//!
//! Reads check memory first and fall through to disk, re-populating
//! memory on a valid disk hit. Disk writes are serialized by a single
//! lock. Before a write lands the on-disk total is checked against the
//! byte ceiling and the least recently accessed entries are evicted until
//! usage is back under 80% of it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::UpdateError;

const ENTRY_EXTENSION: &str = "cache";

/// Fraction of the ceiling that eviction brings usage back down to.
const EVICTION_TARGET: f64 = 0.8;

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_accessed: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
}

impl CacheEntry {
    fn new(key: &str, value: serde_json::Value, ttl: Duration) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key: key.to_string(),
            value,
            created_at: now,
            last_accessed: now,
            expires_at,
            access_count: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn touch(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }
}

/// Snapshot of cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub disk_size_bytes: u64,
    pub total_access_count: u64,
}

/// Generic expiring cache with a memory layer over a disk layer.
pub struct ContentCache {
    root: PathBuf,
    memory: DashMap<String, CacheEntry>,
    disk_lock: Mutex<()>,
    max_size_bytes: u64,
    default_ttl: Duration,
}

impl ContentCache {
    /// Open (or create) a cache rooted at `root`, warming memory with up to
    /// `warm_load_limit` entries from disk.
    pub async fn open(
        root: impl Into<PathBuf>,
        max_size_bytes: u64,
        default_ttl: Duration,
        warm_load_limit: usize,
    ) -> Result<Self, UpdateError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let cache = Self {
            root,
            memory: DashMap::new(),
            disk_lock: Mutex::new(()),
            max_size_bytes,
            default_ttl,
        };
        let loaded = cache.warm_load(warm_load_limit).await;
        debug!(root = %cache.root.display(), loaded, "Opened content cache");
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn warm_load(&self, limit: usize) -> usize {
        let files = match list_entry_files(&self.root).await {
            Ok(files) => files,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Cache warm load skipped");
                return 0;
            }
        };

        let mut loaded = 0;
        for (path, _) in files.into_iter().take(limit) {
            match read_entry(&path).await {
                Ok(entry) if !entry.is_expired() => {
                    self.memory.insert(entry.key.clone(), entry);
                    loaded += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry");
                }
            }
        }
        loaded
    }

    /// Look up `key`, returning `None` when absent, expired or not a `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, UpdateError> {
        let hot = match self.memory.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.touch();
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => None,
        };
        let value = match hot {
            Some(value) => Some(value),
            None => {
                self.memory.remove_if(key, |_, entry| entry.is_expired());
                self.load_from_disk(key).await?
            }
        };

        match value {
            Some(value) => match serde_json::from_value(value) {
                Ok(typed) => Ok(Some(typed)),
                Err(e) => {
                    debug!(key, error = %e, "Cached value has a different shape");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn load_from_disk(&self, key: &str) -> Result<Option<serde_json::Value>, UpdateError> {
        let path = self.entry_path(key);
        let _guard = self.disk_lock.lock().await;

        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        match read_entry(&path).await {
            // Keys that sanitize to the same file name share it.
            Ok(entry) if entry.key != key => {
                debug!(key, stored = %entry.key, "Cache file belongs to another key");
                Ok(None)
            }
            Ok(mut entry) if !entry.is_expired() => {
                entry.touch();
                let value = entry.value.clone();
                self.memory.insert(key.to_string(), entry);
                Ok(Some(value))
            }
            Ok(_) => {
                debug!(key, "Purging expired cache entry");
                remove_file_if_exists(&path).await?;
                Ok(None)
            }
            Err(e) => {
                warn!(key, path = %path.display(), error = %e, "Discarding corrupt cache entry");
                remove_file_if_exists(&path).await?;
                Ok(None)
            }
        }
    }

    /// Store `value` under `key` for `ttl` (default TTL when `None`).
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), UpdateError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry::new(key, serde_json::to_value(value)?, ttl);
        let bytes = serde_json::to_vec_pretty(&entry)?;
        self.memory.insert(key.to_string(), entry);

        let path = self.entry_path(key);
        let _guard = self.disk_lock.lock().await;

        let incoming = bytes.len() as u64;
        if incoming > self.max_size_bytes {
            warn!(
                key,
                size = incoming,
                ceiling = self.max_size_bytes,
                "Entry exceeds cache ceiling, keeping it in memory only"
            );
            remove_file_if_exists(&path).await?;
            return Ok(());
        }
        self.enforce_size_limit(&path, incoming).await?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Evict least recently accessed entries so that `incoming` more bytes fit.
    ///
    /// Must be called with the disk lock held.
    async fn enforce_size_limit(&self, replacing: &Path, incoming: u64) -> Result<(), UpdateError> {
        let files = list_entry_files(&self.root).await?;
        let mut current: u64 = files
            .iter()
            .filter(|(path, _)| path != replacing)
            .map(|(_, size)| size)
            .sum();
        if current + incoming <= self.max_size_bytes {
            return Ok(());
        }

        let target = (self.max_size_bytes as f64 * EVICTION_TARGET) as u64;
        let hot_access: HashMap<PathBuf, DateTime<Utc>> = self
            .memory
            .iter()
            .map(|e| (self.entry_path(e.key()), e.value().last_accessed))
            .collect();

        let mut candidates = Vec::new();
        for (path, size) in files {
            if path == replacing {
                continue;
            }
            let last_accessed = match hot_access.get(&path) {
                Some(at) => *at,
                None => match read_entry(&path).await {
                    Ok(entry) => entry.last_accessed,
                    Err(_) => DateTime::<Utc>::MIN_UTC,
                },
            };
            candidates.push((last_accessed, path, size));
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut evicted = 0usize;
        for (_, path, size) in candidates {
            if current + incoming <= target {
                break;
            }
            if let Some(key) = self.key_for_path(&path).await {
                self.memory.remove(&key);
            }
            remove_file_if_exists(&path).await?;
            current = current.saturating_sub(size);
            evicted += 1;
        }

        info!(evicted, remaining_bytes = current, "Evicted cache entries");
        Ok(())
    }

    async fn key_for_path(&self, path: &Path) -> Option<String> {
        self.memory
            .iter()
            .find(|e| self.entry_path(e.key()) == path)
            .map(|e| e.key().clone())
    }

    /// Whether a live entry exists for `key`.
    pub async fn exists(&self, key: &str) -> bool {
        if let Some(entry) = self.memory.get(key) {
            if !entry.is_expired() {
                return true;
            }
        }
        match read_entry(&self.entry_path(key)).await {
            Ok(entry) => entry.key == key && !entry.is_expired(),
            Err(_) => false,
        }
    }

    pub async fn remove(&self, key: &str) -> Result<(), UpdateError> {
        self.memory.remove(key);
        let path = self.entry_path(key);
        let _guard = self.disk_lock.lock().await;
        match read_entry(&path).await {
            Ok(entry) if entry.key != key => Ok(()),
            _ => remove_file_if_exists(&path).await,
        }
    }

    /// Drop every entry from both layers.
    pub async fn clear(&self) -> Result<(), UpdateError> {
        self.memory.clear();
        let _guard = self.disk_lock.lock().await;
        for (path, _) in list_entry_files(&self.root).await? {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete cache entry");
            }
        }
        info!(root = %self.root.display(), "Cleared content cache");
        Ok(())
    }

    pub async fn stats(&self) -> Result<CacheStats, UpdateError> {
        let _guard = self.disk_lock.lock().await;
        let files = list_entry_files(&self.root).await?;
        Ok(CacheStats {
            memory_entries: self.memory.len(),
            disk_entries: files.len(),
            disk_size_bytes: files.iter().map(|(_, size)| size).sum(),
            total_access_count: self.memory.iter().map(|e| e.access_count).sum(),
        })
    }

    /// Remove expired entries from both layers, returning how many disk
    /// entries were deleted.
    pub async fn evict_expired(&self) -> Result<usize, UpdateError> {
        let now = Utc::now();
        self.memory.retain(|_, entry| !entry.is_expired_at(now));

        let _guard = self.disk_lock.lock().await;
        let mut removed = 0;
        for (path, _) in list_entry_files(&self.root).await? {
            match read_entry(&path).await {
                Ok(entry) if entry.is_expired_at(now) => {
                    remove_file_if_exists(&path).await?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable cache entry left in place");
                }
            }
        }
        if removed > 0 {
            debug!(removed, "Evicted expired cache entries");
        }
        Ok(removed)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", sanitize_key(key), ENTRY_EXTENSION))
    }
}

/// Strip characters that are not valid in file names on any supported platform.
pub fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .filter(|c| !c.is_control())
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Entry files under `root` with their sizes, sorted by file name.
async fn list_entry_files(root: &Path) -> std::io::Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    let mut dir = tokio::fs::read_dir(root).await?;
    while let Some(item) = dir.next_entry().await? {
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
            continue;
        }
        let metadata = item.metadata().await?;
        if metadata.is_file() {
            files.push((path, metadata.len()));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

async fn read_entry(path: &Path) -> Result<CacheEntry, UpdateError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn remove_file_if_exists(path: &Path) -> Result<(), UpdateError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    async fn open(dir: &Path, max_size_bytes: u64) -> ContentCache {
        ContentCache::open(dir, max_size_bytes, DAY, 100).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), 1 << 20).await;

        cache.set("version_abc", &vec![1u32, 2, 3], None).await.unwrap();
        let value: Option<Vec<u32>> = cache.get("version_abc").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
        assert!(temp_dir.path().join("version_abc.cache").exists());
    }

    #[tokio::test]
    async fn test_disk_layer_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let cache = open(temp_dir.path(), 1 << 20).await;
            cache.set("k", &"durable".to_string(), None).await.unwrap();
        }

        let cache = ContentCache::open(temp_dir.path(), 1 << 20, DAY, 0).await.unwrap();
        assert_eq!(cache.stats().await.unwrap().memory_entries, 0);
        let value: Option<String> = cache.get("k").await.unwrap();
        assert_eq!(value.as_deref(), Some("durable"));
        assert_eq!(cache.stats().await.unwrap().memory_entries, 1);
    }

    #[tokio::test]
    async fn test_colliding_keys_do_not_share_values() {
        let temp_dir = TempDir::new().unwrap();
        {
            let cache = open(temp_dir.path(), 1 << 20).await;
            cache.set("version_ab", &"AB".to_string(), None).await.unwrap();
        }
        assert_eq!(sanitize_key("version_a/b"), sanitize_key("version_ab"));

        let cache = ContentCache::open(temp_dir.path(), 1 << 20, DAY, 0).await.unwrap();
        let other: Option<String> = cache.get("version_a/b").await.unwrap();
        assert_eq!(other, None);
        assert!(!cache.exists("version_a/b").await);

        cache.remove("version_a/b").await.unwrap();
        let value: Option<String> = cache.get("version_ab").await.unwrap();
        assert_eq!(value.as_deref(), Some("AB"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_absent_and_purged() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), 1 << 20).await;

        cache.set("short", &1u8, Some(Duration::ZERO)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(!cache.exists("short").await);
        let value: Option<u8> = cache.get("short").await.unwrap();
        assert!(value.is_none());
        assert!(!temp_dir.path().join("short.cache").exists());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), 1 << 20).await;

        cache.set("old", &1u8, Some(Duration::ZERO)).await.unwrap();
        cache.set("fresh", &2u8, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(cache.evict_expired().await.unwrap(), 1);
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.disk_entries, 1);
        assert!(cache.exists("fresh").await);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("broken.cache"), b"{not json").unwrap();

        let cache = open(temp_dir.path(), 1 << 20).await;
        let value: Option<String> = cache.get("broken").await.unwrap();
        assert!(value.is_none());
        assert!(!temp_dir.path().join("broken.cache").exists());
    }

    #[tokio::test]
    async fn test_eviction_removes_least_recently_accessed() {
        // Measure the on-disk size of one entry of the shape used below.
        let sizing_dir = TempDir::new().unwrap();
        let sizing = open(sizing_dir.path(), 1 << 20).await;
        sizing.set("p", &"x".repeat(40), None).await.unwrap();
        let entry_size = sizing.stats().await.unwrap().disk_size_bytes;

        // Room for two entries, not three.
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), entry_size * 3 - 1).await;

        cache.set("a", &"x".repeat(40), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set("b", &"x".repeat(40), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _: Option<String> = cache.get("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set("c", &"x".repeat(40), None).await.unwrap();

        assert!(cache.exists("a").await);
        assert!(!cache.exists("b").await);
        assert!(cache.exists("c").await);

        let stats = cache.stats().await.unwrap();
        assert!(stats.disk_size_bytes <= entry_size * 3 - 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), 1 << 20).await;

        cache.set("one", &1u8, None).await.unwrap();
        cache.set("two", &2u8, None).await.unwrap();
        cache.remove("one").await.unwrap();
        assert!(!cache.exists("one").await);
        assert!(cache.exists("two").await);

        cache.clear().await.unwrap();
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats, CacheStats::default());
    }

    #[tokio::test]
    async fn test_stats_counts_accesses() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), 1 << 20).await;

        cache.set("k", &"v", None).await.unwrap();
        for _ in 0..3 {
            let _: Option<String> = cache.get("k").await.unwrap();
        }
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.disk_entries, 1);
        assert_eq!(stats.total_access_count, 3);
        assert!(stats.disk_size_bytes > 0);
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("latest_version_live"), "latest_version_live");
        assert_eq!(sanitize_key("a/b\\c:d*e?f"), "abcdef");
        assert_eq!(sanitize_key("<>|"), "_");
    }
}
