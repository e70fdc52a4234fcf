use crate::content::DocumentContents;
use crate::debounce::Debouncer;
use crate::engine::{IndexerContext, SymbolIndexer};
use crate::factories::FactoriesIndexer;
use crate::files::{ProjectFiles, SourceScope};
use crate::queue::{JobHandle, SerialQueue};
use crate::registry::ExtractorRegistry;
use crate::traits::{IndexOutcome, ProjectIndexer};
use crate::watch::{ProjectWatcher, WatchPatterns, WatchedKind};
use beanscan_cache::{
    create_index_cache, AstCache, CacheStats, EnvironmentStats, IndexCache,
    ProjectEnvironmentCache,
};
use beanscan_core::{
    path_for_uri, CompilerFrontend, ConfigManager, DocumentContentProvider, DocumentDescriptor,
    FileChangeKind, IndexEvent, IndexerConfig, NodeKind, Project, Reconciler, Result, ScanError,
    SymbolExtractor, SymbolStore,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Default)]
struct ServiceCounters {
    initializations: AtomicU64,
    cache_restores: AtomicU64,
    revalidations: AtomicU64,
    file_updates: AtomicU64,
    file_removals: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub initializations: u64,
    /// Indexer initializations answered by the result cache, one per indexer
    pub cache_restores: u64,
    /// Debounced reactions to build output changes
    pub revalidations: u64,
    pub file_updates: u64,
    pub file_removals: u64,
    pub failures: u64,
    pub jobs_completed: u64,
    pub environments: EnvironmentStats,
    pub trees: CacheStats,
}

pub struct IndexServiceBuilder {
    config: IndexerConfig,
    frontend: Arc<dyn CompilerFrontend>,
    store: Arc<dyn SymbolStore>,
    registry: ExtractorRegistry,
    reconcilers: Vec<Arc<dyn Reconciler>>,
    index_cache: Option<Arc<dyn IndexCache>>,
    extra_indexers: Vec<Arc<dyn ProjectIndexer>>,
}

impl IndexServiceBuilder {
    pub fn annotation_rule(mut self, key: impl Into<String>, rule: Arc<dyn SymbolExtractor>) -> Self {
        self.registry.register_annotation(key, rule);
        self
    }

    pub fn node_rule(mut self, kind: NodeKind, rule: Arc<dyn SymbolExtractor>) -> Self {
        self.registry.register_kind(kind, rule);
        self
    }

    pub fn reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.push(reconciler);
        self
    }

    /// Registers an indexer that runs after the built-in ones.
    pub fn indexer(mut self, indexer: Arc<dyn ProjectIndexer>) -> Self {
        self.extra_indexers.push(indexer);
        self
    }

    /// Overrides the result cache selected by the configuration.
    pub fn index_cache(mut self, cache: Arc<dyn IndexCache>) -> Self {
        self.index_cache = Some(cache);
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<IndexService>> {
        let config = self.config;
        ConfigManager::validate_config(&config)?;

        let contents = Arc::new(DocumentContents::new());
        let environments = Arc::new(ProjectEnvironmentCache::new(Arc::clone(&self.frontend)));
        let ast_cache = Arc::new(AstCache::new(
            Arc::clone(&self.frontend),
            Arc::clone(&environments),
            Arc::clone(&contents) as Arc<dyn DocumentContentProvider>,
            &config.ast_cache,
        ));
        let index_cache = match self.index_cache {
            Some(cache) => cache,
            None => create_index_cache(&config.cache)?,
        };

        let store = self.store;

        let context = IndexerContext {
            frontend: self.frontend,
            environments,
            ast_cache: Arc::clone(&ast_cache),
            contents: Arc::clone(&contents) as Arc<dyn DocumentContentProvider>,
            index_cache: Arc::clone(&index_cache),
            store: Arc::clone(&store),
        };
        let registry = self
            .registry
            .with_default_symbols(config.indexing.default_symbol_prefix.clone());
        let indexer = Arc::new(SymbolIndexer::new(
            config.indexing.clone(),
            context,
            ProjectFiles::new(&config.watch.source_patterns)?,
            registry,
            self.reconcilers,
        )?);

        let mut indexers: Vec<Arc<dyn ProjectIndexer>> =
            vec![Arc::clone(&indexer) as Arc<dyn ProjectIndexer>];
        if !config.watch.factories_patterns.is_empty() {
            indexers.push(Arc::new(FactoriesIndexer::new(
                config.indexing.generation.clone(),
                ProjectFiles::new(&config.watch.factories_patterns)?,
                Arc::clone(&contents) as Arc<dyn DocumentContentProvider>,
                index_cache,
                Arc::clone(&store),
            )));
        }
        indexers.extend(self.extra_indexers);
        let patterns = WatchPatterns::new(&config.watch)?;
        let reaper = ast_cache.spawn_reaper(config.ast_cache.reap_interval());

        info!(
            indexers = indexers.len(),
            chunk_size = config.indexing.chunk_size,
            parse_threads = config.indexing.parse_threads,
            debounce_ms = config.environment.output_debounce_ms,
            "Index service started"
        );

        Ok(Arc::new_cyclic(|service: &Weak<IndexService>| {
            let service = service.clone();
            let debouncer = Debouncer::new(config.environment.output_debounce(), move |project| {
                if let Some(service) = service.upgrade() {
                    tokio::spawn(async move { service.revalidate(&project).await });
                }
            });
            let scan_test_sources = AtomicBool::new(config.indexing.scan_test_sources);
            IndexService {
                config,
                indexer,
                indexers,
                store,
                contents,
                scan_test_sources,
                patterns,
                queue: SerialQueue::start(),
                projects: DashMap::new(),
                debouncer,
                counters: Arc::new(ServiceCounters::default()),
                reaper: Mutex::new(Some(reaper)),
                watcher: Mutex::new(None),
                forwarder: Mutex::new(None),
            }
        }))
    }
}

/// Entry point for workspace events.
///
/// Cache invalidation happens synchronously when an event is dispatched; the
/// indexing work it implies runs on a serial queue in arrival order. Build output
/// changes are debounced per project and end in one revalidation.
pub struct IndexService {
    config: IndexerConfig,
    indexer: Arc<SymbolIndexer>,
    /// Every indexer in initialization order, the source indexer first
    indexers: Vec<Arc<dyn ProjectIndexer>>,
    store: Arc<dyn SymbolStore>,
    contents: Arc<DocumentContents>,
    scan_test_sources: AtomicBool,
    patterns: WatchPatterns,
    queue: SerialQueue,
    projects: DashMap<String, Project>,
    debouncer: Debouncer,
    counters: Arc<ServiceCounters>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<ProjectWatcher>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl IndexService {
    pub fn builder(
        config: IndexerConfig,
        frontend: Arc<dyn CompilerFrontend>,
        store: Arc<dyn SymbolStore>,
    ) -> IndexServiceBuilder {
        IndexServiceBuilder {
            config,
            frontend,
            store,
            registry: ExtractorRegistry::new(),
            reconcilers: Vec::new(),
            index_cache: None,
            extra_indexers: Vec::new(),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn indexer(&self) -> &Arc<SymbolIndexer> {
        &self.indexer
    }

    pub fn indexers(&self) -> &[Arc<dyn ProjectIndexer>] {
        &self.indexers
    }

    pub fn scan_test_sources(&self) -> bool {
        self.scan_test_sources.load(Ordering::SeqCst)
    }

    /// Switches test source roots in or out of every known project. Files under
    /// test roots are indexed or removed by a queued job per project and indexer.
    pub fn set_scan_test_sources(&self, enabled: bool) {
        if self.scan_test_sources.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        info!(enabled, "Test source scanning changed");
        let projects: Vec<Project> = self.projects.iter().map(|p| p.value().clone()).collect();
        for project in projects {
            for indexer in &self.indexers {
                self.enqueue_test_sources(Arc::clone(indexer), project.clone(), enabled);
            }
        }
    }

    pub fn contents(&self) -> &Arc<DocumentContents> {
        &self.contents
    }

    pub fn project(&self, name: &str) -> Option<Project> {
        self.projects.get(name).map(|p| p.value().clone())
    }

    pub fn projects(&self) -> Vec<String> {
        let mut names: Vec<String> = self.projects.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    pub async fn dispatch(&self, event: IndexEvent) -> Result<()> {
        match event {
            IndexEvent::ProjectCreated(project) | IndexEvent::ProjectChanged(project) => {
                self.debouncer.cancel(&project.name);
                let known = self
                    .projects
                    .insert(project.name.clone(), project.clone())
                    .is_some();
                debug!(project = %project.name, known, "Project observed");
                self.invalidate_project_state(&project.name).await;
                self.watch_project(&project);
                self.enqueue_initialize(project);
            }
            IndexEvent::ProjectDeleted(project) => {
                self.debouncer.cancel(&project.name);
                self.projects.remove(&project.name);
                self.unwatch_project(&project);
                let context = self.indexer.context();
                context.environments.remove_project(&project.name).await;
                context.ast_cache.invalidate_project(&project.name);
                let indexers = self.indexers.clone();
                self.submit("remove project", async move {
                    for indexer in indexers {
                        indexer.remove_project(&project).await?;
                    }
                    Ok(IndexOutcome::default())
                });
            }
            IndexEvent::FileChanged { uri, kind } => self.file_changed(uri, kind),
            IndexEvent::DocumentClosed { uri } => {
                self.contents.close(&uri);
                self.indexer.context().ast_cache.invalidate(&uri);
            }
        }
        Ok(())
    }

    /// Editor snapshot of an open document; later reads prefer it over the disk.
    pub fn open_document(&self, uri: &str, text: impl Into<String>, last_modified: i64) {
        self.contents.open(uri, text, last_modified);
    }

    pub async fn change_document(&self, uri: &str, text: impl Into<String>, last_modified: i64) -> Result<()> {
        self.contents.change(uri, text, last_modified);
        self.dispatch(IndexEvent::FileChanged {
            uri: uri.to_string(),
            kind: FileChangeKind::Modified,
        })
        .await
    }

    pub async fn close_document(&self, uri: &str) -> Result<()> {
        self.dispatch(IndexEvent::DocumentClosed {
            uri: uri.to_string(),
        })
        .await
    }

    fn file_changed(&self, uri: String, kind: FileChangeKind) {
        let Some(path) = path_for_uri(&uri) else {
            debug!(uri = %uri, "Ignoring change of a non-file URI");
            return;
        };
        let Some(watched) = self.patterns.classify(&path) else {
            trace!(uri = %uri, "Ignoring change of an unwatched file");
            return;
        };

        let include_test = self.scan_test_sources();
        let owners: Vec<Project> = self
            .projects
            .iter()
            .filter(|p| match watched {
                WatchedKind::Source => p.contains_source(&path, include_test),
                WatchedKind::Output => p.contains_output(&path),
            })
            .map(|p| p.value().clone())
            .collect();
        if owners.is_empty() {
            debug!(uri = %uri, "Changed file belongs to no project");
            return;
        }

        for project in owners {
            match watched {
                WatchedKind::Source => {
                    self.indexer.context().ast_cache.invalidate(&uri);
                    for indexer in self.indexers.iter().filter(|i| i.is_interested_in(&path)) {
                        self.enqueue_file(Arc::clone(indexer), project.clone(), uri.clone(), kind);
                    }
                }
                WatchedKind::Output => {
                    trace!(project = %project.name, uri = %uri, "Build output changed");
                    self.debouncer.trigger(&project.name);
                }
            }
        }
    }

    fn enqueue_file(
        &self,
        indexer: Arc<dyn ProjectIndexer>,
        project: Project,
        uri: String,
        kind: FileChangeKind,
    ) {
        let contents = Arc::clone(&self.contents);
        let counters = Arc::clone(&self.counters);
        self.submit("update file", async move {
            let last_modified = match kind {
                FileChangeKind::Deleted => None,
                FileChangeKind::Created | FileChangeKind::Modified => contents.last_modified(&uri),
            };
            match last_modified {
                Some(ts) => {
                    counters.file_updates.fetch_add(1, Ordering::Relaxed);
                    indexer
                        .update_file(&project, DocumentDescriptor::new(uri, ts))
                        .await
                }
                None => {
                    counters.file_removals.fetch_add(1, Ordering::Relaxed);
                    indexer.remove_file(&project, &uri).await?;
                    Ok(IndexOutcome::default())
                }
            }
        });
    }

    /// Clears what the store holds for `project`, then runs every indexer over its files.
    fn enqueue_initialize(&self, project: Project) -> JobHandle<IndexOutcome> {
        let indexers = self.indexers.clone();
        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let scope = SourceScope::including_tests(self.scan_test_sources());
        self.submit("initialize project", async move {
            counters.initializations.fetch_add(1, Ordering::Relaxed);
            store.remove_project(&project).await;

            let mut total = IndexOutcome {
                from_cache: true,
                ..Default::default()
            };
            for indexer in indexers {
                let result = match collect_files(Arc::clone(&indexer), project.clone(), scope).await {
                    Ok(files) => indexer.initialize_project(&project, files).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(outcome) => {
                        if outcome.from_cache {
                            counters.cache_restores.fetch_add(1, Ordering::Relaxed);
                        }
                        total.from_cache &= outcome.from_cache;
                        total.scanned += outcome.scanned;
                        total.rescanned += outcome.rescanned;
                        total.pass_two += outcome.pass_two;
                    }
                    Err(e) if e.is_cancellation() => return Err(e),
                    Err(e) => {
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        total.from_cache = false;
                        error!(
                            project = %project.name,
                            indexer = indexer.id(),
                            error = %e,
                            "Indexer failed to initialize project"
                        );
                    }
                }
            }
            Ok(total)
        })
    }

    fn enqueue_test_sources(&self, indexer: Arc<dyn ProjectIndexer>, project: Project, enabled: bool) {
        let counters = Arc::clone(&self.counters);
        self.submit("toggle test sources", async move {
            let files =
                collect_files(Arc::clone(&indexer), project.clone(), SourceScope::TestsOnly).await?;
            if files.is_empty() {
                return Ok(IndexOutcome::skipped());
            }
            debug!(
                project = %project.name,
                indexer = indexer.id(),
                files = files.len(),
                enabled,
                "Applying test sources"
            );
            if enabled {
                counters.file_updates.fetch_add(files.len() as u64, Ordering::Relaxed);
                indexer.update_files(&project, files).await
            } else {
                counters.file_removals.fetch_add(files.len() as u64, Ordering::Relaxed);
                for doc in &files {
                    indexer.remove_file(&project, &doc.uri).await?;
                }
                Ok(IndexOutcome::default())
            }
        });
    }

    fn submit<F>(&self, operation: &'static str, job: F) -> JobHandle<IndexOutcome>
    where
        F: Future<Output = Result<IndexOutcome>> + Send + 'static,
    {
        let counters = Arc::clone(&self.counters);
        self.queue.submit(async move {
            let result = job.await;
            if let Err(e) = &result {
                if e.is_cancellation() {
                    debug!(operation, error = %e, "Indexing job cancelled");
                } else {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(operation, error = %e, "Indexing job failed");
                }
            }
            result
        })
    }

    async fn invalidate_project_state(&self, project: &str) {
        let context = self.indexer.context();
        context.environments.invalidate(project).await;
        context.ast_cache.invalidate_project(project);
    }

    async fn revalidate(&self, name: &str) {
        let Some(project) = self.project(name) else {
            debug!(project = name, "Revalidation for a removed project");
            return;
        };
        self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
        info!(project = name, "Build output changed, revalidating");
        self.invalidate_project_state(name).await;
        self.enqueue_initialize(project);
    }

    /// Resolves once every job queued before the call has run.
    pub async fn wait_for_queued(&self) -> Result<()> {
        self.queue.flush().await
    }

    pub fn stats(&self) -> ServiceStats {
        let context = self.indexer.context();
        ServiceStats {
            initializations: self.counters.initializations.load(Ordering::Relaxed),
            cache_restores: self.counters.cache_restores.load(Ordering::Relaxed),
            revalidations: self.counters.revalidations.load(Ordering::Relaxed),
            file_updates: self.counters.file_updates.load(Ordering::Relaxed),
            file_removals: self.counters.file_removals.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            jobs_completed: self.queue.completed(),
            environments: context.environments.stats(),
            trees: context.ast_cache.stats(),
        }
    }

    /// Starts forwarding file system changes of every known project to [`Self::dispatch`].
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = ProjectWatcher::new(self.patterns.clone(), tx)?;
        for project in self.projects.iter() {
            if let Err(e) = watcher.watch_project(project.value()) {
                warn!(project = %project.key(), error = %e, "Cannot watch project");
            }
        }
        *self.watcher.lock() = Some(watcher);

        let service = Arc::downgrade(self);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                if let Err(e) = service.dispatch(event).await {
                    warn!(error = %e, "Failed to dispatch file change");
                }
            }
        });
        if let Some(previous) = self.forwarder.lock().replace(forwarder) {
            previous.abort();
        }
        Ok(())
    }

    fn watch_project(&self, project: &Project) {
        if let Some(watcher) = self.watcher.lock().as_ref() {
            if let Err(e) = watcher.watch_project(project) {
                warn!(project = %project.name, error = %e, "Cannot watch project");
            }
        }
    }

    fn unwatch_project(&self, project: &Project) {
        if let Some(watcher) = self.watcher.lock().as_ref() {
            watcher.unwatch_project(project);
        }
    }

    /// Stops background work and releases every environment.
    pub async fn shutdown(&self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        self.watcher.lock().take();
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        self.queue.shutdown();
        self.indexer.context().environments.invalidate_all().await;
        info!("Index service stopped");
    }
}

async fn collect_files(
    indexer: Arc<dyn ProjectIndexer>,
    project: Project,
    scope: SourceScope,
) -> Result<Vec<DocumentDescriptor>> {
    tokio::task::spawn_blocking(move || indexer.collect(&project, scope))
        .await
        .map_err(|e| ScanError::Storage(format!("file discovery failed: {}", e)))?
}
