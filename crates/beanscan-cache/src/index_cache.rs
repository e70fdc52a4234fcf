use crate::disk::DiskIndexCache;
use crate::key::IndexCacheKey;
use crate::store::{CacheStore, CachedIndex};
use async_trait::async_trait;
use beanscan_core::{
    CacheBackend, CacheConfig, DependencyMap, DocumentDescriptor, IndexRecord, Result,
};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Durable or volatile store of index output, valid only for an exact file set.
#[async_trait]
pub trait IndexCache: Send + Sync {
    /// Bulk write after a full index. Replaces everything stored for the logical slot.
    async fn store(
        &self,
        key: &IndexCacheKey,
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        dependencies: DependencyMap,
    ) -> Result<()>;

    /// Returns the cached output only if `files` equals the stored file set with
    /// identical timestamps.
    async fn retrieve(
        &self,
        key: &IndexCacheKey,
        files: &[DocumentDescriptor],
    ) -> Result<Option<CachedIndex>>;

    /// Replaces the records and dependencies of `files` only.
    async fn update_files(
        &self,
        key: &IndexCacheKey,
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        dependencies: DependencyMap,
    ) -> Result<()>;

    async fn update(
        &self,
        key: &IndexCacheKey,
        file: &DocumentDescriptor,
        records: Vec<IndexRecord>,
        dependencies: BTreeSet<String>,
    ) -> Result<()> {
        let mut map = DependencyMap::new();
        map.insert(file.uri.clone(), dependencies);
        self.update_files(key, std::slice::from_ref(file), records, map)
            .await
    }

    /// Drops the logical slot of `key`, whatever its fingerprint.
    async fn remove(&self, key: &IndexCacheKey) -> Result<()>;

    async fn remove_files(&self, key: &IndexCacheKey, uris: &[String]) -> Result<()>;

    /// Timestamp recorded for `uri`, if the cache knows the file.
    async fn modification_timestamp(&self, key: &IndexCacheKey, uri: &str) -> Option<i64>;
}

/// Volatile cache for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryIndexCache {
    stores: DashMap<IndexCacheKey, CacheStore>,
}

impl InMemoryIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[async_trait]
impl IndexCache for InMemoryIndexCache {
    async fn store(
        &self,
        key: &IndexCacheKey,
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        dependencies: DependencyMap,
    ) -> Result<()> {
        self.stores.retain(|k, _| !k.same_slot(key));
        self.stores
            .insert(key.clone(), CacheStore::new(files, records, dependencies));
        debug!("Stored {} files for {}", files.len(), key);
        Ok(())
    }

    async fn retrieve(
        &self,
        key: &IndexCacheKey,
        files: &[DocumentDescriptor],
    ) -> Result<Option<CachedIndex>> {
        Ok(self
            .stores
            .get(key)
            .filter(|store| store.matches(files))
            .map(|store| store.to_cached()))
    }

    async fn update_files(
        &self,
        key: &IndexCacheKey,
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        dependencies: DependencyMap,
    ) -> Result<()> {
        self.stores
            .entry(key.clone())
            .or_default()
            .apply_update(files, records, &dependencies);
        Ok(())
    }

    async fn remove(&self, key: &IndexCacheKey) -> Result<()> {
        self.stores.retain(|k, _| !k.same_slot(key));
        Ok(())
    }

    async fn remove_files(&self, key: &IndexCacheKey, uris: &[String]) -> Result<()> {
        if let Some(mut store) = self.stores.get_mut(key) {
            store.apply_delete(uris);
        }
        Ok(())
    }

    async fn modification_timestamp(&self, key: &IndexCacheKey, uri: &str) -> Option<i64> {
        self.stores
            .get(key)
            .and_then(|store| store.timestamped_files.get(uri).copied())
    }
}

/// Cache that never hits. Every initialization runs a full index.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndexCache;

#[async_trait]
impl IndexCache for NoopIndexCache {
    async fn store(
        &self,
        _key: &IndexCacheKey,
        _files: &[DocumentDescriptor],
        _records: Vec<IndexRecord>,
        _dependencies: DependencyMap,
    ) -> Result<()> {
        Ok(())
    }

    async fn retrieve(
        &self,
        _key: &IndexCacheKey,
        _files: &[DocumentDescriptor],
    ) -> Result<Option<CachedIndex>> {
        Ok(None)
    }

    async fn update_files(
        &self,
        _key: &IndexCacheKey,
        _files: &[DocumentDescriptor],
        _records: Vec<IndexRecord>,
        _dependencies: DependencyMap,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _key: &IndexCacheKey) -> Result<()> {
        Ok(())
    }

    async fn remove_files(&self, _key: &IndexCacheKey, _uris: &[String]) -> Result<()> {
        Ok(())
    }

    async fn modification_timestamp(&self, _key: &IndexCacheKey, _uri: &str) -> Option<i64> {
        None
    }
}

/// Builds the configured backend. Failing to create the cache directory is fatal.
pub fn create_index_cache(config: &CacheConfig) -> Result<Arc<dyn IndexCache>> {
    let cache: Arc<dyn IndexCache> = match config.backend {
        CacheBackend::Disk => Arc::new(DiskIndexCache::open(
            &config.directory,
            config.compaction_threshold,
        )?),
        CacheBackend::Memory => Arc::new(InMemoryIndexCache::new()),
        CacheBackend::None => Arc::new(NoopIndexCache),
    };
    info!(backend = ?config.backend, "Index cache ready");
    Ok(cache)
}
