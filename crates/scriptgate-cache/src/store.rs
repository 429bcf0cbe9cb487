//! Persistence for cache entries across restarts

use crate::entry::CacheEntry;
use crate::error::StoreError;
use parking_lot::Mutex;
use scriptgate_model::Fingerprint;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Durable home for cache entries
///
/// Calls are synchronous and short; the cache invokes them from eviction
/// callbacks as well as from request paths.
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    /// Every stored entry, expired or not
    ///
    /// # Errors
    /// Returns error if the store cannot be read at all
    fn load_all(&self) -> Result<Vec<CacheEntry>, StoreError>;

    /// Insert or replace one entry
    ///
    /// # Errors
    /// Returns error if the entry could not be written
    fn put(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Remove one entry; missing entries are not an error
    ///
    /// # Errors
    /// Returns error if an existing entry could not be removed
    fn remove(&self, fingerprint: &Fingerprint) -> Result<(), StoreError>;

    /// Remove everything
    ///
    /// # Errors
    /// Returns error if the store could not be emptied
    fn clear(&self) -> Result<(), StoreError>;
}

/// In-memory store, mostly for tests
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<BTreeMap<Fingerprint, CacheEntry>>,
}

impl MemoryCacheStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether `fingerprint` is stored
    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.lock().contains_key(fingerprint)
    }
}

impl CacheStore for MemoryCacheStore {
    fn load_all(&self) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.entries.lock().insert(entry.fingerprint, entry.clone());
        Ok(())
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        self.entries.lock().remove(fingerprint);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// One JSON file per entry, named by fingerprint
///
/// Writes go to a temporary file that is renamed into place, so a reader
/// never sees a half-written record.
#[derive(Debug)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    /// Store rooted at `dir`, created if missing
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, &e))?;
        Ok(Self { dir })
    }

    /// Root directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let read = std::fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, &e))?;
        let mut paths = Vec::new();
        for item in read {
            let path = item.map_err(|e| StoreError::io(&self.dir, &e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl CacheStore for FileCacheStore {
    fn load_all(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let mut entries = Vec::new();
        for path in self.record_paths()? {
            let bytes = std::fs::read(&path).map_err(|e| StoreError::io(&path, &e))?;
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable cache record");
                }
            }
        }
        Ok(entries)
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let path = self.path_for(&entry.fingerprint);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(entry).map_err(|e| StoreError::Serialization {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, &e))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, &e))
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        let path = self.path_for(fingerprint);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StoreError::io(&path, &e)),
            _ => Ok(()),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        for path in self.record_paths()? {
            std::fs::remove_file(&path).map_err(|e| StoreError::io(&path, &e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use scriptgate_model::{Language, PolicyId, ScanResult, Severity, SourceDigest};

    fn entry(byte: u8) -> CacheEntry {
        let source = format!("print({byte})\n");
        let now = Utc::now();
        CacheEntry {
            fingerprint: Fingerprint::new([byte; 32]),
            language: Language::Python,
            prompt: "print a number".into(),
            scan: ScanResult::evaluate(
                Vec::new(),
                PolicyId::new("moderate", 1),
                Language::Python,
                Severity::Medium,
                SourceDigest::of(&source),
            ),
            source,
            generator: None,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            last_accessed_at: now,
            access_count: 0,
            last_execution: None,
        }
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::open(dir.path().join("cache")).unwrap();
        let a = entry(1);
        store.put(&a).unwrap();
        store.put(&entry(2)).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], a);

        store.remove(&a.fingerprint).unwrap();
        store.remove(&a.fingerprint).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);

        store.clear().unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn file_store_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::open(dir.path()).unwrap();
        store.put(&entry(3)).unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn memory_store_basics() {
        let store = MemoryCacheStore::new();
        store.put(&entry(4)).unwrap();
        assert!(store.contains(&Fingerprint::new([4; 32])));
        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
