//! Durable tier: one file per entry under a cache directory.
//!
//! Entries are stored as `<key>.img`. Writes land in a temporary file that is
//! renamed into place, so a reader never sees a partial payload. Recency is
//! kept in an in-memory LRU index and mirrored to file modification times so
//! it survives a restart.
//!
//! [`DiskTier`] only keeps the index. Reading, writing and deleting entry
//! files go through the free functions here so the store can run them
//! without holding its lock.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, warn};

use crate::key::CacheKey;

const ENTRY_SUFFIX: &str = ".img";
const TMP_MARKER: &str = ".tmp-";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub(crate) struct DiskTier {
    dir: PathBuf,
    max_bytes: u64,
    index: LruCache<CacheKey, u64>,
    total_bytes: u64,
}

impl DiskTier {
    /// Opens (creating if needed) the tier at `dir` and rebuilds its index.
    pub(crate) fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut found = Vec::new();
        for dirent in fs::read_dir(&dir)? {
            let dirent = match dirent {
                Ok(d) => d,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable cache dir entry");
                    continue;
                }
            };
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.contains(TMP_MARKER) {
                // Left behind by an interrupted write.
                let _ = fs::remove_file(dirent.path());
                continue;
            }
            let Some(key) = name.strip_suffix(ENTRY_SUFFIX).and_then(CacheKey::from_hex) else {
                continue;
            };
            let Ok(meta) = dirent.metadata() else { continue };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, key, meta.len()));
        }

        // Oldest first so the most recently touched file ends up most recently used.
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut tier = Self {
            dir,
            max_bytes,
            index: LruCache::unbounded(),
            total_bytes: 0,
        };
        for (_, key, size) in found {
            tier.total_bytes += size;
            tier.index.push(key, size);
        }
        let evicted = tier.evict_to_budget();
        remove_files(&evicted);

        debug!(
            dir = %tier.dir.display(),
            entries = tier.index.len(),
            bytes = tier.total_bytes,
            "disk tier opened"
        );
        Ok(tier)
    }

    pub(crate) fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}{ENTRY_SUFFIX}"))
    }

    /// Marks `key` most recently used and returns its file, if indexed.
    pub(crate) fn lookup(&mut self, key: &CacheKey) -> Option<PathBuf> {
        self.index.get(key)?;
        Some(self.path_for(key))
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains(key)
    }

    /// Returns `true` if an entry of `size` bytes fits the tier's budget.
    pub(crate) fn admits(&self, size: u64) -> bool {
        size <= self.max_bytes
    }

    /// Indexes a freshly written entry and returns the files evicted to make
    /// room. The caller deletes them.
    #[must_use]
    pub(crate) fn record(&mut self, key: &CacheKey, size: u64) -> Vec<PathBuf> {
        if let Some(old) = self.index.put(key.clone(), size) {
            self.total_bytes -= old;
        }
        self.total_bytes += size;
        self.evict_to_budget()
    }

    /// Drops `key` from the index. Returns its file if it was indexed.
    pub(crate) fn forget(&mut self, key: &CacheKey) -> Option<PathBuf> {
        let size = self.index.pop(key)?;
        self.total_bytes -= size;
        Some(self.path_for(key))
    }

    /// Deletes every entry file, including ones the index does not know about.
    pub(crate) fn truncate(&mut self) {
        self.index.clear();
        self.total_bytes = 0;

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "disk tier truncate could not list directory");
                return;
            }
        };
        for dirent in entries.flatten() {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(ENTRY_SUFFIX) || name.contains(TMP_MARKER) {
                if let Err(e) = fs::remove_file(dirent.path()) {
                    warn!(file = %name, error = %e, "failed to remove cache file");
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn evict_to_budget(&mut self) -> Vec<PathBuf> {
        let mut evicted = Vec::new();
        while self.total_bytes > self.max_bytes {
            let Some((key, size)) = self.index.pop_lru() else { break };
            self.total_bytes -= size;
            debug!(key = %key, size, "evicted from disk tier");
            evicted.push(self.path_for(&key));
        }
        evicted
    }
}

/// Reads an entry file and bumps its modification time.
pub(crate) fn read_entry(path: &Path) -> io::Result<Bytes> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    // Best effort: recency is still tracked in the index if this fails.
    let _ = file.set_modified(SystemTime::now());
    Ok(Bytes::from(data))
}

pub(crate) fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!("{TMP_MARKER}{}-{seq}", std::process::id()));
    let tmp = PathBuf::from(tmp);

    if let Err(e) = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

pub(crate) fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(file = %path.display(), error = %e, "failed to remove cache file");
            }
        }
    }
}
