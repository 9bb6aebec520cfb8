//! Capture result cache keyed on (URL, selector)
//!
//! Entries live in a concurrent map; when a cache directory is configured each
//! entry is also written through as `<key>.json` so results survive a restart.
//! Expiry is checked on every read, and the entry count is bounded by evicting
//! the oldest writes first.

use crate::{bytes_to_mb, millis_to_iso, now_millis, CacheSettings, CaptureError, CaptureResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Derives the cache key: the SHA-256 of each component, hex encoded and joined.
///
/// Fixed length regardless of input, so it is always a valid file name.
pub fn cache_key(url: &str, selector: &str) -> String {
    format!(
        "{:x}_{:x}",
        Sha256::digest(url.as_bytes()),
        Sha256::digest(selector.as_bytes())
    )
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub url: String,
    pub selector: String,
    pub result: CaptureResult,
    /// Epoch milliseconds of the write.
    pub timestamp: u64,

    #[serde(skip)]
    size_bytes: usize,

    /// Write order, breaks timestamp ties during eviction.
    #[serde(skip)]
    seq: u64,
}

impl CacheEntry {
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub count: usize,
    pub total_size_bytes: u64,
    #[serde(rename = "totalSizeMB")]
    pub total_size_mb: f64,
    pub oldest_entry: Option<String>,
    pub newest_entry: Option<String>,
    pub max_cache_size: usize,
    #[serde(rename = "cacheTTLHours")]
    pub cache_ttl_hours: f64,
}

pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    dir: Option<PathBuf>,
    max_entries: usize,
    ttl: Duration,
    next_seq: AtomicU64,
    eviction: std::sync::Mutex<()>,
}

impl CacheStore {
    /// Memory-only store with the given bounds.
    pub fn in_memory(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            dir: None,
            max_entries,
            ttl,
            next_seq: AtomicU64::new(0),
            eviction: std::sync::Mutex::new(()),
        }
    }

    /// Opens the store described by `settings`, reloading persisted entries
    /// that have not yet expired.
    pub async fn open(settings: &CacheSettings) -> Result<Self, CaptureError> {
        let mut store = Self::in_memory(settings.max_entries, settings.ttl);

        if let Some(dir) = &settings.dir {
            tokio::fs::create_dir_all(dir).await?;
            store.dir = Some(dir.clone());
            let loaded = store.load_from_disk(dir).await?;
            info!("Cache directory {} initialized with {} entries", dir.display(), loaded);
        }

        Ok(store)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn get(&self, url: &str, selector: &str) -> Option<CacheEntry> {
        self.get_at(url, selector, now_millis()).await
    }

    pub(crate) async fn get_at(&self, url: &str, selector: &str, now: u64) -> Option<CacheEntry> {
        let key = cache_key(url, selector);

        {
            let entry = self.entries.get(&key)?;
            if !self.is_expired(&entry, now) {
                return Some(entry.clone());
            }
        }

        // A concurrent write may have replaced the stale entry since the check.
        if self
            .entries
            .remove_if(&key, |_, entry| self.is_expired(entry, now))
            .is_some()
        {
            debug!("Cache entry {} expired", key);
            self.remove_file(&key).await;
        }

        None
    }

    /// Stores `result` under (url, selector), replacing any previous entry,
    /// then evicts the oldest entries beyond the size bound.
    pub async fn set(&self, url: &str, selector: &str, result: CaptureResult) -> CacheEntry {
        self.set_at(url, selector, result, now_millis()).await
    }

    pub(crate) async fn set_at(
        &self,
        url: &str,
        selector: &str,
        result: CaptureResult,
        now: u64,
    ) -> CacheEntry {
        let key = cache_key(url, selector);
        let mut entry = CacheEntry {
            key: key.clone(),
            url: url.to_string(),
            selector: selector.to_string(),
            result,
            timestamp: now,
            size_bytes: 0,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };

        let encoded = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode cache entry {}: {}", key, e);
                Vec::new()
            }
        };
        entry.size_bytes = encoded.len();

        self.entries.insert(key.clone(), entry.clone());

        if let Some(path) = self.file_path(&key) {
            if !encoded.is_empty() {
                if let Err(e) = tokio::fs::write(&path, &encoded).await {
                    warn!("Failed to persist cache entry {}: {}", path.display(), e);
                }
            }
        }

        let evicted = self.evict_oldest();
        for key in &evicted {
            if !self.entries.contains_key(key) {
                self.remove_file(key).await;
            }
        }
        if !evicted.is_empty() {
            info!("Evicted {} old cache entries", evicted.len());
        }

        entry
    }

    pub async fn delete(&self, url: &str, selector: &str) {
        let key = cache_key(url, selector);
        if self.entries.remove(&key).is_some() {
            self.remove_file(&key).await;
        }
    }

    pub async fn clear(&self) {
        self.entries.clear();

        let Some(dir) = &self.dir else {
            info!("Cache cleared");
            return;
        };

        match tokio::fs::read_dir(dir).await {
            Ok(mut files) => {
                while let Ok(Some(file)) = files.next_entry().await {
                    let path = file.path();
                    if is_entry_file(&path) {
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            warn!("Failed to remove {}: {}", path.display(), e);
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to read cache directory {}: {}", dir.display(), e),
        }

        info!("Cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let mut total_size_bytes = 0u64;
        let mut oldest: Option<u64> = None;
        let mut newest: Option<u64> = None;

        for entry in self.entries.iter() {
            total_size_bytes += entry.size_bytes as u64;
            oldest = Some(oldest.map_or(entry.timestamp, |t| t.min(entry.timestamp)));
            newest = Some(newest.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
        }

        CacheStats {
            count: self.entries.len(),
            total_size_bytes,
            total_size_mb: bytes_to_mb(total_size_bytes),
            oldest_entry: oldest.map(millis_to_iso),
            newest_entry: newest.map(millis_to_iso),
            max_cache_size: self.max_entries,
            cache_ttl_hours: self.ttl.as_secs_f64() / 3600.0,
        }
    }

    /// Drops every expired entry. Reads never depend on this having run.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(now_millis()).await
    }

    pub(crate) async fn purge_expired_at(&self, now: u64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| self.is_expired(entry, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self
                .entries
                .remove_if(&key, |_, entry| self.is_expired(entry, now))
                .is_some()
            {
                self.remove_file(&key).await;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Purged {} expired cache entries", removed);
        }
        removed
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        now.saturating_sub(entry.timestamp) > self.ttl.as_millis() as u64
    }

    /// Removes the oldest entries until the count is back at the bound and
    /// returns their keys.
    fn evict_oldest(&self) -> Vec<String> {
        let _guard = match self.eviction.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let excess = self.entries.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return Vec::new();
        }

        let mut by_age: Vec<(u64, u64, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.timestamp, entry.seq, entry.key().clone()))
            .collect();
        by_age.sort_unstable();

        let mut evicted = Vec::with_capacity(excess);
        for (_, seq, key) in by_age {
            if evicted.len() == excess {
                break;
            }
            // Skip keys rewritten by a concurrent set since the snapshot.
            if self
                .entries
                .remove_if(&key, |_, entry| entry.seq == seq)
                .is_some()
            {
                evicted.push(key);
            }
        }
        evicted
    }

    fn file_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{key}.json")))
    }

    async fn remove_file(&self, key: &str) {
        let Some(path) = self.file_path(key) else {
            return;
        };

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove cache file {}: {}", path.display(), e),
        }
    }

    async fn load_from_disk(&self, dir: &Path) -> Result<usize, CaptureError> {
        let now = now_millis();
        let mut loaded: Vec<CacheEntry> = Vec::new();
        let mut files = tokio::fs::read_dir(dir).await?;

        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if !is_entry_file(&path) {
                continue;
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping unreadable cache file {}: {}", path.display(), e);
                    continue;
                }
            };

            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(mut entry) => {
                    entry.size_bytes = bytes.len();
                    if self.is_expired(&entry, now) {
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            warn!("Failed to remove expired cache file {}: {}", path.display(), e);
                        }
                    } else {
                        loaded.push(entry);
                    }
                }
                Err(e) => warn!("Skipping corrupt cache file {}: {}", path.display(), e),
            }
        }

        loaded.sort_by_key(|entry| entry.timestamp);
        for mut entry in loaded {
            entry.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.entries.insert(entry.key.clone(), entry);
        }

        for key in self.evict_oldest() {
            self.remove_file(&key).await;
        }

        Ok(self.entries.len())
    }
}

fn is_entry_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("json")
}
