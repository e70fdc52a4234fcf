use crate::index_cache::IndexCache;
use crate::key::{CacheFileName, IndexCacheKey};
use crate::store::{CacheStore, CachedIndex};
use async_trait::async_trait;
use beanscan_core::{DependencyMap, DocumentDescriptor, IndexRecord, Result, ScanError};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One line of a cache file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum DeltaElement {
    Snapshot {
        store: CacheStore,
    },
    Update {
        files: Vec<DocumentDescriptor>,
        records: Vec<IndexRecord>,
        #[serde(default)]
        dependencies: DependencyMap,
    },
    Delete {
        files: Vec<String>,
    },
}

impl DeltaElement {
    fn apply(self, store: &mut CacheStore) {
        match self {
            DeltaElement::Snapshot { store: snapshot } => *store = snapshot,
            DeltaElement::Update {
                files,
                records,
                dependencies,
            } => store.apply_update(&files, records, &dependencies),
            DeltaElement::Delete { files } => store.apply_delete(&files),
        }
    }
}

/// Synchronous file operations, run on the blocking pool.
#[derive(Debug, Clone)]
struct CacheFiles {
    directory: PathBuf,
}

/// Replayed content of a cache file.
struct Loaded {
    store: CacheStore,
    deltas: usize,
}

impl CacheFiles {
    fn path(&self, key: &IndexCacheKey) -> PathBuf {
        self.directory.join(key.file_name())
    }

    /// `Ok(None)` when no file exists. Undecodable lines surface as `CacheCorrupted`.
    fn load(&self, key: &IndexCacheKey) -> Result<Option<Loaded>> {
        let path = self.path(key);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut store = CacheStore::default();
        let mut deltas = 0;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let element: DeltaElement = serde_json::from_str(&line).map_err(|e| {
                ScanError::CacheCorrupted(format!(
                    "{} line {}: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            match element {
                DeltaElement::Snapshot { .. } => deltas = 0,
                _ => deltas += 1,
            }
            element.apply(&mut store);
        }
        Ok(Some(Loaded { store, deltas }))
    }

    /// Writes a single snapshot through a temporary file.
    fn write_snapshot(&self, key: &IndexCacheKey, store: CacheStore) -> Result<()> {
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        let mut line = serde_json::to_string(&DeltaElement::Snapshot { store })?;
        line.push('\n');
        fs::write(&tmp, line)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn append(&self, key: &IndexCacheKey, element: &DeltaElement) -> Result<()> {
        let mut line = serde_json::to_string(element)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(key))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn slot_files(&self, key: &IndexCacheKey) -> Result<Vec<(PathBuf, CacheFileName)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(parsed) = name.to_str().and_then(CacheFileName::parse) else {
                continue;
            };
            if key.is_slot_file(&parsed) {
                found.push((entry.path(), parsed));
            }
        }
        Ok(found)
    }

    /// Deletes files of the same logical slot carrying another fingerprint.
    fn cleanup_stale(&self, key: &IndexCacheKey) -> Result<usize> {
        let mut deleted = 0;
        for (path, parsed) in self.slot_files(key)? {
            if key.is_stale_file(&parsed) {
                match fs::remove_file(&path) {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!("Failed to delete stale cache file {}: {}", path.display(), e),
                }
            }
        }
        Ok(deleted)
    }

    fn remove_slot(&self, key: &IndexCacheKey) -> Result<()> {
        for (path, _) in self.slot_files(key)? {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn remove_file(&self, key: &IndexCacheKey) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ScanError::Storage(format!("Cache task failed: {}", e)))?
}

/// On-disk cache. Every logical slot is one JSON-lines file: a snapshot followed by
/// appended update and delete deltas, compacted back into a snapshot once the number
/// of deltas exceeds the threshold.
pub struct DiskIndexCache {
    files: CacheFiles,
    compaction_threshold: usize,
    timestamps: DashMap<IndexCacheKey, BTreeMap<String, i64>>,
    deltas: DashMap<IndexCacheKey, usize>,
    cleaned: DashSet<IndexCacheKey>,
    io_lock: Arc<Mutex<()>>,
}

impl DiskIndexCache {
    pub fn open(directory: &Path, compaction_threshold: usize) -> Result<Self> {
        fs::create_dir_all(directory).map_err(|e| {
            ScanError::Storage(format!(
                "Cannot create cache directory {}: {}",
                directory.display(),
                e
            ))
        })?;
        info!("Opened index cache at {}", directory.display());
        Ok(Self {
            files: CacheFiles {
                directory: directory.to_path_buf(),
            },
            compaction_threshold: compaction_threshold.max(1),
            timestamps: DashMap::new(),
            deltas: DashMap::new(),
            cleaned: DashSet::new(),
            io_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.files.directory
    }

    /// Number of deltas appended since the last snapshot, as far as this instance knows.
    pub fn pending_deltas(&self, key: &IndexCacheKey) -> usize {
        self.deltas.get(key).map(|d| *d).unwrap_or(0)
    }

    fn forget_slot(&self, key: &IndexCacheKey) {
        self.timestamps.retain(|k, _| !k.same_slot(key));
        self.deltas.retain(|k, _| !k.same_slot(key));
        self.cleaned.retain(|k| !k.same_slot(key));
    }

    /// Appends `element`, compacting when the delta threshold is exceeded.
    async fn append_delta(&self, key: &IndexCacheKey, element: DeltaElement) -> Result<()> {
        let _io = self.io_lock.lock().await;

        let first_touch = self.cleaned.insert(key.clone());
        let known_deltas = self.deltas.get(key).map(|d| *d);
        let threshold = self.compaction_threshold;
        let files = self.files.clone();
        let key_owned = key.clone();

        let (deltas, compacted) = blocking(move || {
            if first_touch {
                let deleted = files.cleanup_stale(&key_owned)?;
                if deleted > 0 {
                    debug!("Deleted {} stale cache files for {}", deleted, key_owned);
                }
            }
            let before = match known_deltas {
                Some(n) => n,
                None => match files.load(&key_owned) {
                    Ok(loaded) => loaded.map(|l| l.deltas).unwrap_or(0),
                    Err(ScanError::CacheCorrupted(reason)) => {
                        warn!("Discarding corrupt cache file: {}", reason);
                        files.remove_file(&key_owned)?;
                        0
                    }
                    Err(e) => return Err(e),
                },
            };
            files.append(&key_owned, &element)?;
            let deltas = before + 1;
            if deltas > threshold {
                if let Some(loaded) = files.load(&key_owned)? {
                    files.write_snapshot(&key_owned, loaded.store)?;
                    return Ok((0, true));
                }
            }
            Ok((deltas, false))
        })
        .await?;

        if compacted {
            debug!("Compacted cache file for {}", key);
        }
        self.deltas.insert(key.clone(), deltas);
        Ok(())
    }
}

#[async_trait]
impl IndexCache for DiskIndexCache {
    async fn store(
        &self,
        key: &IndexCacheKey,
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        dependencies: DependencyMap,
    ) -> Result<()> {
        let _io = self.io_lock.lock().await;

        let store = CacheStore::new(files, records, dependencies);
        let timestamps = store.timestamped_files.clone();
        let cache_files = self.files.clone();
        let key_owned = key.clone();
        let deleted = blocking(move || {
            cache_files.write_snapshot(&key_owned, store)?;
            cache_files.cleanup_stale(&key_owned)
        })
        .await?;

        self.forget_slot(key);
        self.timestamps.insert(key.clone(), timestamps);
        self.deltas.insert(key.clone(), 0);
        self.cleaned.insert(key.clone());
        debug!(
            "Stored {} files for {} ({} stale files removed)",
            files.len(),
            key,
            deleted
        );
        Ok(())
    }

    async fn retrieve(
        &self,
        key: &IndexCacheKey,
        files: &[DocumentDescriptor],
    ) -> Result<Option<CachedIndex>> {
        let _io = self.io_lock.lock().await;

        let cache_files = self.files.clone();
        let key_owned = key.clone();
        let loaded = blocking(move || match cache_files.load(&key_owned) {
            Err(ScanError::CacheCorrupted(reason)) => {
                warn!("Cache file unreadable, treating as miss: {}", reason);
                cache_files.remove_file(&key_owned)?;
                Ok(None)
            }
            other => other,
        })
        .await?;

        let Some(loaded) = loaded else {
            self.timestamps.remove(key);
            self.deltas.remove(key);
            debug!("No cache file for {}", key);
            return Ok(None);
        };

        self.timestamps
            .insert(key.clone(), loaded.store.timestamped_files.clone());
        self.deltas.insert(key.clone(), loaded.deltas);

        if loaded.store.matches(files) {
            debug!("Cache hit for {} ({} files)", key, files.len());
            Ok(Some(loaded.store.to_cached()))
        } else {
            debug!("Cache miss for {}: file set changed", key);
            Ok(None)
        }
    }

    async fn update_files(
        &self,
        key: &IndexCacheKey,
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        dependencies: DependencyMap,
    ) -> Result<()> {
        self.append_delta(
            key,
            DeltaElement::Update {
                files: files.to_vec(),
                records,
                dependencies,
            },
        )
        .await?;

        let mut timestamps = self.timestamps.entry(key.clone()).or_default();
        for doc in files {
            timestamps.insert(doc.uri.clone(), doc.last_modified);
        }
        Ok(())
    }

    async fn remove(&self, key: &IndexCacheKey) -> Result<()> {
        let _io = self.io_lock.lock().await;

        let cache_files = self.files.clone();
        let key_owned = key.clone();
        blocking(move || cache_files.remove_slot(&key_owned)).await?;
        self.forget_slot(key);
        debug!("Removed cache slot {}", key);
        Ok(())
    }

    async fn remove_files(&self, key: &IndexCacheKey, uris: &[String]) -> Result<()> {
        self.append_delta(
            key,
            DeltaElement::Delete {
                files: uris.to_vec(),
            },
        )
        .await?;

        if let Some(mut timestamps) = self.timestamps.get_mut(key) {
            for uri in uris {
                timestamps.remove(uri);
            }
        }
        Ok(())
    }

    async fn modification_timestamp(&self, key: &IndexCacheKey, uri: &str) -> Option<i64> {
        self.timestamps
            .get(key)
            .and_then(|timestamps| timestamps.get(uri).copied())
    }
}
