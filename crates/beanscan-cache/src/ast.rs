use crate::environment::{EnvironmentLease, ProjectEnvironmentCache};
use crate::stats::CacheStats;
use beanscan_core::{
    AstCacheConfig, CompilerFrontend, DocumentContentProvider, ParseOptions, Project, Result,
    ScanError, SyntaxTree,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A memoized tree. The mutex hands it to one callback at a time.
pub type SharedTree = Arc<AsyncMutex<Box<dyn SyntaxTree>>>;

struct AstSlot {
    project: String,
    cell: OnceCell<SharedTree>,
    cancel: CancellationToken,
    last_accessed: Mutex<Instant>,
}

impl AstSlot {
    fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            cell: OnceCell::new(),
            cancel: CancellationToken::new(),
            last_accessed: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_accessed.lock().elapsed()
    }
}

/// Per-document cache of fully analyzed trees.
///
/// Parses run on the blocking pool under the project read lock and are coalesced per
/// URI. A failed or cancelled parse removes its own entry so the next request parses
/// again. Entries expire after `ttl` of inactivity and the cache never holds more
/// than `max_entries` trees.
pub struct AstCache {
    frontend: Arc<dyn CompilerFrontend>,
    environments: Arc<ProjectEnvironmentCache>,
    contents: Arc<dyn DocumentContentProvider>,
    entries: DashMap<String, Arc<AstSlot>>,
    ttl: Duration,
    max_entries: usize,
    stats: Mutex<CacheStats>,
}

impl AstCache {
    pub fn new(
        frontend: Arc<dyn CompilerFrontend>,
        environments: Arc<ProjectEnvironmentCache>,
        contents: Arc<dyn DocumentContentProvider>,
        config: &AstCacheConfig,
    ) -> Self {
        Self {
            frontend,
            environments,
            contents,
            entries: DashMap::new(),
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Tree for `uri`, parsing it on a miss.
    pub async fn get(&self, project: &Project, uri: &str) -> Result<SharedTree> {
        let lease = self.environments.lease(project).await?;
        self.get_with_lease(&lease, project, uri).await
    }

    /// Runs `f` with the tree of `uri` inside the project read lock. A frontend
    /// failure yields `None`; only cancellation is returned as an error.
    pub async fn with_tree<T, F>(&self, project: &Project, uri: &str, f: F) -> Result<T>
    where
        F: FnOnce(Option<&dyn SyntaxTree>) -> T,
    {
        let lease = self.environments.lease(project).await?;
        match self.get_with_lease(&lease, project, uri).await {
            Ok(tree) => {
                let tree = tree.lock().await;
                Ok(f(Some(tree.as_ref())))
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                warn!(uri, error = %e, "Parse failed, continuing without a tree");
                Ok(f(None))
            }
        }
    }

    async fn get_with_lease(
        &self,
        lease: &EnvironmentLease,
        project: &Project,
        uri: &str,
    ) -> Result<SharedTree> {
        let (slot, inserted) = self.slot_for(&project.name, uri);
        slot.touch();

        if let Some(tree) = slot.cell.get() {
            self.stats.lock().hits += 1;
            return Ok(Arc::clone(tree));
        }
        self.stats.lock().misses += 1;
        if inserted {
            self.enforce_capacity(uri);
        }

        let result = slot
            .cell
            .get_or_try_init(|| self.parse(lease.clone(), uri, slot.cancel.clone()))
            .await
            .map(Arc::clone);

        if let Err(ref e) = result {
            self.remove_if_current(uri, &slot);
            if e.is_cancellation() {
                debug!(uri, "Parse cancelled");
            }
        }
        result
    }

    fn slot_for(&self, project: &str, uri: &str) -> (Arc<AstSlot>, bool) {
        let mut inserted = false;
        let slot = self
            .entries
            .entry(uri.to_string())
            .or_insert_with(|| {
                inserted = true;
                Arc::new(AstSlot::new(project))
            })
            .clone();
        (slot, inserted)
    }

    async fn parse(
        &self,
        lease: EnvironmentLease,
        uri: &str,
        cancel: CancellationToken,
    ) -> Result<SharedTree> {
        let frontend = Arc::clone(&self.frontend);
        let contents = Arc::clone(&self.contents);
        let owned_uri = uri.to_string();
        // The lease moves into the job: the environment stays valid until the
        // frontend returns, even if every caller has gone away.
        let job = tokio::task::spawn_blocking(move || {
            let source = contents.fetch_content(&owned_uri)?;
            frontend.parse(
                lease.environment(),
                &owned_uri,
                &source,
                &ParseOptions::full(),
            )
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(ScanError::Cancelled(format!("parse of {}", uri))),
            joined = job => match joined {
                Ok(Ok(tree)) => Ok(Arc::new(AsyncMutex::new(tree))),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ScanError::Frontend(format!("Parser task failed for {}: {}", uri, e))),
            },
        }
    }

    fn remove_if_current(&self, uri: &str, slot: &Arc<AstSlot>) {
        self.entries
            .remove_if(uri, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Evicts least recently used trees beyond the capacity, never `keep`.
    fn enforce_capacity(&self, keep: &str) {
        let excess = self.entries.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }
        let mut candidates: Vec<(String, Instant)> = self
            .entries
            .iter()
            .filter(|e| e.key() != keep)
            .map(|e| (e.key().clone(), *e.value().last_accessed.lock()))
            .collect();
        candidates.sort_by_key(|(_, accessed)| *accessed);

        let mut evicted = 0;
        for (uri, _) in candidates.into_iter().take(excess) {
            if self.entries.remove(&uri).is_some() {
                evicted += 1;
            }
        }
        self.stats.lock().evictions += evicted;
        debug!(evicted, "AST cache over capacity");
    }

    /// Drops the tree of `uri` and cancels a parse in flight.
    pub fn invalidate(&self, uri: &str) -> bool {
        match self.entries.remove(uri) {
            Some((_, slot)) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn invalidate_project(&self, project: &str) -> usize {
        let mut removed = Vec::new();
        self.entries.retain(|_, slot| {
            if slot.project == project {
                removed.push(Arc::clone(slot));
                false
            } else {
                true
            }
        });
        for slot in &removed {
            slot.cancel.cancel();
        }
        if !removed.is_empty() {
            debug!(project, count = removed.len(), "Invalidated project trees");
        }
        removed.len()
    }

    /// Removes memoized trees idle for longer than the TTL. Parses in flight are kept.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| !(slot.cell.initialized() && slot.idle_for() > ttl));
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            self.stats.lock().evictions += evicted as u64;
            debug!(evicted, "Reaped idle trees");
        }
        evicted
    }

    /// Periodically evicts idle trees until the cache is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.evict_expired();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries
            .get(uri)
            .map(|slot| slot.cell.initialized())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().clone();
        stats.entries = self.entries.len();
        stats
    }
}
