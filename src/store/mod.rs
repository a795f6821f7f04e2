//! Two-tier image byte store.
//!
//! The [`Store`] keeps a bounded in-memory LRU tier in front of an optional
//! durable disk tier. Lookups never touch the network and never fail: disk
//! errors are logged and reported as misses, and a failed disk write leaves
//! the entry in memory only.
//!
//! | Operation                            | Memory tier | Disk tier |
//! |--------------------------------------|-------------|-----------|
//! | [`get`](Store::get) / [`load`](Store::load) | read, touch | read, promote to memory |
//! | [`put`](Store::put) / [`save`](Store::save) | write       | write     |
//! | [`clear_in_memory`](Store::clear_in_memory) | cleared | untouched |
//! | [`truncate`](Store::truncate)        | cleared     | cleared   |

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::key::CacheKey;

mod disk;

use disk::DiskTier;

/// A cached payload and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: CacheKey,
    bytes: Bytes,
    last_access: Instant,
}

impl CacheEntry {
    fn new(key: CacheKey, bytes: Bytes) -> Self {
        Self {
            key,
            bytes,
            last_access: Instant::now(),
        }
    }

    /// Returns the entry's key.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Returns the payload.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Returns when the entry was last written or read.
    pub fn last_access(&self) -> Instant {
        self.last_access
    }
}

#[derive(Debug)]
struct MemoryTier {
    entries: LruCache<CacheKey, CacheEntry>,
    capacity: NonZeroUsize,
    max_bytes: u64,
    total_bytes: u64,
}

impl MemoryTier {
    fn new(capacity: NonZeroUsize, max_bytes: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity,
            max_bytes,
            total_bytes: 0,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Bytes> {
        let entry = self.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(entry.bytes.clone())
    }

    fn put(&mut self, key: &CacheKey, bytes: Bytes) {
        let entry = CacheEntry::new(key.clone(), bytes);
        if entry.size() > self.max_bytes {
            debug!(key = %key, size = entry.size(), "entry exceeds memory budget; not kept in memory");
            if let Some(old) = self.entries.pop(key) {
                self.total_bytes -= old.size();
            }
            return;
        }

        self.total_bytes += entry.size();
        if let Some(old) = self.entries.put(key.clone(), entry) {
            self.total_bytes -= old.size();
        }

        while self.entries.len() > self.capacity.get() || self.total_bytes > self.max_bytes {
            let Some((evicted, old)) = self.entries.pop_lru() else { break };
            self.total_bytes -= old.size();
            debug!(key = %evicted, size = old.size(), "evicted from memory tier");
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}

/// Bounded, two-tier key/value store for raw image bytes.
///
/// All methods take `&self`. Each tier sits behind its own mutex, and disk
/// file I/O runs with neither held, so a slow disk never stalls memory-tier
/// lookups or lookups of other keys.
///
/// The synchronous [`get`](Self::get) and [`put`](Self::put) may touch the
/// disk on the calling thread. From async code prefer [`load`](Self::load)
/// and [`save`](Self::save), which move disk work to Tokio's blocking pool.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use imcache::key::CacheKey;
/// use imcache::store::Store;
///
/// let store = Store::with_capacity(2);
/// let key = CacheKey::derive("http://x/img.png", None);
///
/// store.put(&key, Bytes::from_static(b"png"));
/// assert_eq!(store.get(&key).as_deref(), Some(&b"png"[..]));
///
/// store.truncate();
/// assert!(store.get(&key).is_none());
/// ```
#[derive(Debug)]
pub struct Store {
    memory: Mutex<MemoryTier>,
    disk: Option<Mutex<DiskTier>>,
}

impl Store {
    /// Creates a memory-only store holding at most `entries` entries.
    ///
    /// A capacity of zero is raised to one.
    pub fn with_capacity(entries: usize) -> Self {
        Self::memory_only(entries, u64::MAX)
    }

    fn memory_only(entries: usize, max_bytes: u64) -> Self {
        let capacity = NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Mutex::new(MemoryTier::new(capacity, max_bytes)),
            disk: None,
        }
    }

    /// Builds a store from `config`.
    ///
    /// If the disk directory cannot be opened the store logs a warning and
    /// runs memory-only.
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut store = Self::memory_only(config.memory_capacity, config.memory_max_bytes);
        if let Some(dir) = &config.disk_dir {
            match DiskTier::open(dir, config.disk_max_bytes) {
                Ok(tier) => store.disk = Some(Mutex::new(tier)),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "disk tier unavailable; running memory-only");
                }
            }
        }
        store
    }

    /// Looks up `key`, updating its recency on a hit.
    ///
    /// A disk-tier hit is copied into the memory tier.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.get_in_memory(key).or_else(|| self.get_from_disk(key))
    }

    /// Looks up `key` in the memory tier only. Never touches the disk.
    pub fn get_in_memory(&self, key: &CacheKey) -> Option<Bytes> {
        let bytes = self.memory.lock().get(key)?;
        debug!(key = %key, tier = "memory", "store hit");
        Some(bytes)
    }

    /// Like [`get`](Self::get), with the disk read on Tokio's blocking pool.
    pub async fn load(self: &Arc<Self>, key: &CacheKey) -> Option<Bytes> {
        if let Some(bytes) = self.get_in_memory(key) {
            return Some(bytes);
        }
        self.disk.as_ref()?;

        let store = Arc::clone(self);
        let key = key.clone();
        match task::spawn_blocking(move || store.get_from_disk(&key)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "disk lookup task failed; treating as miss");
                None
            }
        }
    }

    fn get_from_disk(&self, key: &CacheKey) -> Option<Bytes> {
        let tier = self.disk.as_ref()?;
        let path = tier.lock().lookup(key)?;

        match disk::read_entry(&path) {
            Ok(bytes) => {
                debug!(key = %key, tier = "disk", "store hit");
                self.memory.lock().put(key, bytes.clone());
                Some(bytes)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "disk tier read failed; treating as miss");
                tier.lock().forget(key);
                None
            }
        }
    }

    /// Inserts or replaces `key` in every tier, evicting least-recently-used
    /// entries from a tier that goes over its capacity.
    pub fn put(&self, key: &CacheKey, bytes: Bytes) {
        self.memory.lock().put(key, bytes.clone());
        self.put_on_disk(key, &bytes);
    }

    /// Like [`put`](Self::put), with the disk write on Tokio's blocking pool.
    ///
    /// The memory tier is updated before the first await.
    pub async fn save(self: &Arc<Self>, key: &CacheKey, bytes: Bytes) {
        self.memory.lock().put(key, bytes.clone());
        if self.disk.is_none() {
            return;
        }

        let store = Arc::clone(self);
        let key = key.clone();
        if let Err(e) = task::spawn_blocking(move || store.put_on_disk(&key, &bytes)).await {
            warn!(error = %e, "disk write task failed");
        }
    }

    fn put_on_disk(&self, key: &CacheKey, bytes: &Bytes) {
        let Some(tier) = &self.disk else { return };
        let size = bytes.len() as u64;

        let path = {
            let mut index = tier.lock();
            if !index.admits(size) {
                debug!(key = %key, size, "entry exceeds disk budget; not persisted");
                let stale = index.forget(key);
                drop(index);
                disk::remove_files(stale.as_slice());
                return;
            }
            index.path_for(key)
        };

        if let Err(e) = disk::write_atomically(&path, bytes) {
            warn!(key = %key, error = %e, "disk tier write failed");
            let stale = tier.lock().forget(key);
            disk::remove_files(stale.as_slice());
            return;
        }

        let evicted = tier.lock().record(key, size);
        disk::remove_files(&evicted);
    }

    /// Returns `true` if any tier holds `key`. Does not update recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.memory.lock().entries.contains(key)
            || self.disk.as_ref().is_some_and(|d| d.lock().contains(key))
    }

    /// Returns a snapshot of the memory-tier entry for `key` without touching recency.
    pub fn peek_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.memory.lock().entries.peek(key).cloned()
    }

    /// Drops every entry from the memory tier. The disk tier is untouched.
    pub fn clear_in_memory(&self) {
        let mut memory = self.memory.lock();
        let dropped = memory.entries.len();
        memory.clear();
        info!(entries = dropped, "memory tier cleared");
    }

    /// Removes every entry from every tier.
    pub fn truncate(&self) {
        self.memory.lock().clear();
        if let Some(disk) = &self.disk {
            disk.lock().truncate();
        }
        info!("store truncated");
    }

    /// Number of entries in the memory tier.
    pub fn len(&self) -> usize {
        self.memory.lock().entries.len()
    }

    /// Returns `true` if the memory tier is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes held in memory.
    pub fn memory_bytes(&self) -> u64 {
        self.memory.lock().total_bytes
    }

    /// Number of entries in the disk tier (zero when memory-only).
    pub fn disk_len(&self) -> usize {
        self.disk.as_ref().map_or(0, |d| d.lock().len())
    }

    /// Total payload bytes held on disk (zero when memory-only).
    pub fn disk_bytes(&self) -> u64 {
        self.disk.as_ref().map_or(0, |d| d.lock().total_bytes())
    }

    /// Directory of the disk tier, if one is open.
    pub fn disk_dir(&self) -> Option<PathBuf> {
        self.disk.as_ref().map(|d| d.lock().dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::derive(&format!("http://x/{name}.png"), None)
    }

    #[test]
    fn round_trip() {
        let store = Store::with_capacity(4);
        store.put(&key("a"), Bytes::from_static(b"alpha"));
        assert_eq!(store.get(&key("a")).as_deref(), Some(&b"alpha"[..]));
        assert_eq!(store.memory_bytes(), 5);
    }

    #[test]
    fn replace_keeps_byte_count_exact() {
        let store = Store::with_capacity(4);
        store.put(&key("a"), Bytes::from_static(b"alpha"));
        store.put(&key("a"), Bytes::from_static(b"al"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.memory_bytes(), 2);
        assert_eq!(store.get(&key("a")).as_deref(), Some(&b"al"[..]));
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let store = Store::with_capacity(3);
        store.put(&key("a"), Bytes::from_static(b"a"));
        store.put(&key("b"), Bytes::from_static(b"b"));
        store.put(&key("c"), Bytes::from_static(b"c"));
        // "a" is now most recently used, leaving "b" as the eviction candidate.
        assert!(store.get(&key("a")).is_some());

        store.put(&key("d"), Bytes::from_static(b"d"));

        assert_eq!(store.len(), 3);
        assert!(store.get(&key("b")).is_none());
        assert!(store.get(&key("a")).is_some());
        assert!(store.get(&key("c")).is_some());
        assert!(store.get(&key("d")).is_some());
    }

    #[test]
    fn byte_budget_evicts() {
        let store = Store::memory_only(10, 6);
        store.put(&key("a"), Bytes::from_static(b"aaa"));
        store.put(&key("b"), Bytes::from_static(b"bbb"));
        store.put(&key("c"), Bytes::from_static(b"ccc"));
        assert!(store.get(&key("a")).is_none());
        assert_eq!(store.memory_bytes(), 6);
    }

    #[test]
    fn oversized_entry_skips_memory() {
        let store = Store::memory_only(10, 2);
        store.put(&key("a"), Bytes::from_static(b"huge"));
        assert!(store.is_empty());
    }

    #[test]
    fn truncate_then_get_is_absent() {
        let store = Store::with_capacity(4);
        store.put(&key("a"), Bytes::from_static(b"a"));
        store.put(&key("b"), Bytes::from_static(b"b"));
        store.truncate();
        assert!(store.get(&key("a")).is_none());
        assert!(store.get(&key("b")).is_none());
        assert_eq!(store.memory_bytes(), 0);
    }

    #[test]
    fn last_access_advances_on_hit() {
        let store = Store::with_capacity(4);
        store.put(&key("a"), Bytes::from_static(b"a"));
        let written = store.peek_entry(&key("a")).unwrap().last_access();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.get(&key("a"));
        let entry = store.peek_entry(&key("a")).unwrap();
        assert!(entry.last_access() > written);
        assert_eq!(entry.size(), 1);
        assert_eq!(entry.key(), &key("a"));
    }

    #[test]
    fn clear_in_memory_keeps_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::from_config(&CacheConfig::new().disk_dir(dir.path()));
        store.put(&key("a"), Bytes::from_static(b"persisted"));

        store.clear_in_memory();
        assert!(store.is_empty());
        assert_eq!(store.disk_len(), 1);

        // Served from disk and promoted back into memory.
        assert_eq!(store.get(&key("a")).as_deref(), Some(&b"persisted"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn truncate_clears_disk_too() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::from_config(&CacheConfig::new().disk_dir(dir.path()));
        store.put(&key("a"), Bytes::from_static(b"persisted"));
        store.truncate();

        assert!(store.get(&key("a")).is_none());
        assert_eq!(store.disk_len(), 0);
        assert_eq!(store.disk_bytes(), 0);
    }

    #[test]
    fn new_store_sees_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::new().disk_dir(dir.path());
        Store::from_config(&config).put(&key("a"), Bytes::from_static(b"kept"));

        let reopened = Store::from_config(&config);
        assert!(reopened.contains(&key("a")));
        assert_eq!(reopened.get(&key("a")).as_deref(), Some(&b"kept"[..]));
        assert_eq!(reopened.disk_dir().as_deref(), Some(dir.path()));
    }

    #[test]
    fn failed_disk_write_keeps_memory_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let store = Store::from_config(&CacheConfig::new().disk_dir(&cache_dir));
        store.put(&key("a"), Bytes::from_static(b"v1"));
        assert_eq!(store.disk_len(), 1);

        std::fs::remove_dir_all(&cache_dir).unwrap();
        store.put(&key("a"), Bytes::from_static(b"v2"));
        store.put(&key("b"), Bytes::from_static(b"b"));

        assert_eq!(store.get(&key("a")).as_deref(), Some(&b"v2"[..]));
        assert_eq!(store.get(&key("b")).as_deref(), Some(&b"b"[..]));
        // The stale disk copy of "a" is no longer indexed.
        assert_eq!(store.disk_len(), 0);
        assert_eq!(store.disk_bytes(), 0);

        store.clear_in_memory();
        assert!(store.get(&key("a")).is_none());
    }

    #[tokio::test]
    async fn load_and_save_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::from_config(&CacheConfig::new().disk_dir(dir.path())));
        store.save(&key("a"), Bytes::from_static(b"async")).await;
        assert_eq!(store.disk_len(), 1);

        store.clear_in_memory();
        assert!(store.get_in_memory(&key("a")).is_none());
        assert_eq!(store.load(&key("a")).await.as_deref(), Some(&b"async"[..]));
        assert_eq!(store.get_in_memory(&key("a")).as_deref(), Some(&b"async"[..]));
        assert!(store.load(&key("missing")).await.is_none());
    }

    #[test]
    fn unusable_disk_dir_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let store = Store::from_config(&CacheConfig::new().disk_dir(blocker.join("sub")));
        assert!(store.disk_dir().is_none());
        store.put(&key("a"), Bytes::from_static(b"a"));
        assert!(store.get(&key("a")).is_some());
    }
}
