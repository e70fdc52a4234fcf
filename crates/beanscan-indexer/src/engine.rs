use crate::dependency::DependencyTracker;
use crate::files::{ProjectFiles, SourceScope};
use crate::registry::ExtractorRegistry;
use crate::scan::{parse_document, Analyzer, FileScan};
use crate::traits::{IndexOutcome, ProjectIndexer};
use async_trait::async_trait;
use beanscan_cache::{AstCache, IndexCache, IndexCacheKey, ProjectEnvironmentCache};
use beanscan_core::{
    CachedDiagnostic, CompilerFrontend, DependencyMap, DocumentContentProvider,
    DocumentDescriptor, IndexRecord, IndexingConfig, ParseOptions, Project, Reconciler, Result,
    ScanError, ScanPass, SymbolStore,
};
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const SOURCE_INDEXER_ID: &str = "java";
pub const SYMBOLS_CATEGORY: &str = "symbols";

/// Collaborators shared by the indexer and the service around it.
#[derive(Clone)]
pub struct IndexerContext {
    pub frontend: Arc<dyn CompilerFrontend>,
    pub environments: Arc<ProjectEnvironmentCache>,
    pub ast_cache: Arc<AstCache>,
    pub contents: Arc<dyn DocumentContentProvider>,
    pub index_cache: Arc<dyn IndexCache>,
    pub store: Arc<dyn SymbolStore>,
}

/// Files and types scanned so far in one indexing round.
#[derive(Debug, Default)]
struct ScanRound {
    files: HashSet<String>,
    types: HashSet<String>,
}

/// Symbol indexer for source projects.
///
/// A full index parses every document in chunks on a dedicated thread pool while
/// holding the project read lock, runs a second pass with method bodies only for
/// documents whose diagnostics need one, and publishes once the batch is complete.
/// Incremental updates rescan the changed document and then every document whose
/// recorded dependencies intersect the types it declares.
pub struct SymbolIndexer {
    config: IndexingConfig,
    context: IndexerContext,
    files: ProjectFiles,
    analyzer: Analyzer,
    trackers: DashMap<String, Arc<DependencyTracker>>,
    pool: Arc<rayon::ThreadPool>,
}

impl SymbolIndexer {
    pub fn new(
        config: IndexingConfig,
        context: IndexerContext,
        files: ProjectFiles,
        registry: ExtractorRegistry,
        reconcilers: Vec<Arc<dyn Reconciler>>,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parse_threads.max(1))
            .thread_name(|i| format!("beanscan-scan-{}", i))
            .build()
            .map_err(|e| ScanError::InvalidOperation(format!("cannot start scan pool: {}", e)))?;
        Ok(Self {
            config,
            context,
            files,
            analyzer: Analyzer::new(Arc::new(registry), reconcilers),
            trackers: DashMap::new(),
            pool: Arc::new(pool),
        })
    }

    pub fn context(&self) -> &IndexerContext {
        &self.context
    }

    pub fn cache_key(&self, project: &Project) -> IndexCacheKey {
        IndexCacheKey::for_project(
            project,
            SOURCE_INDEXER_ID,
            SYMBOLS_CATEGORY,
            &self.config.generation,
        )
    }

    fn tracker(&self, project: &str) -> Arc<DependencyTracker> {
        self.trackers
            .entry(project.to_string())
            .or_insert_with(|| Arc::new(DependencyTracker::new()))
            .clone()
    }

    /// Current dependency edges of `project`.
    pub fn dependencies(&self, project: &str) -> DependencyMap {
        self.trackers
            .get(project)
            .map(|tracker| tracker.all_dependencies())
            .unwrap_or_default()
    }

    /// Indexes a whole project, from the result cache when the file set is unchanged.
    /// Publishes on top of the store; documents no longer in `files` are not retracted.
    pub async fn initialize_project(
        &self,
        project: &Project,
        files: Vec<DocumentDescriptor>,
    ) -> Result<IndexOutcome> {
        let started = Instant::now();
        let key = self.cache_key(project);
        let tracker = self.tracker(&project.name);

        match self.context.index_cache.retrieve(&key, &files).await {
            Ok(Some(cached)) => {
                tracker.restore(cached.dependencies);
                self.publish_cached(project, &files, cached.records).await;
                info!(
                    project = %project.name,
                    files = files.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Restored symbols from cache"
                );
                return Ok(IndexOutcome {
                    from_cache: true,
                    ..Default::default()
                });
            }
            Ok(None) => debug!(project = %project.name, "Result cache miss"),
            Err(e) => warn!(project = %project.name, error = %e, "Result cache unavailable, rescanning"),
        }

        tracker.clear();
        let mut round = ScanRound::default();
        let mut scans = self.scan_batch(project, &files).await?;
        let pass_two = scans.iter().filter(|s| s.needs_full_tree).count();
        self.record_batch(&tracker, &mut round, &mut scans);

        let records: Vec<IndexRecord> = scans.iter().flat_map(|s| s.cache_records()).collect();
        if let Err(e) = self
            .context
            .index_cache
            .store(&key, &files, records, tracker.all_dependencies())
            .await
        {
            warn!(project = %project.name, error = %e, "Failed to store index in cache");
        }

        self.publish(project, &scans).await;
        info!(
            project = %project.name,
            files = files.len(),
            pass_two,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Indexed project"
        );
        Ok(IndexOutcome {
            scanned: files.len(),
            pass_two,
            ..Default::default()
        })
    }

    /// Rescans one changed document from the syntax tree cache, then its dependents.
    pub async fn update_file(&self, project: &Project, doc: DocumentDescriptor) -> Result<IndexOutcome> {
        let key = self.cache_key(project);
        if self.is_current(&key, &doc).await {
            return Ok(IndexOutcome::skipped());
        }

        let analyzer = &self.analyzer;
        let scanned = self
            .context
            .ast_cache
            .with_tree(project, &doc.uri, |tree| {
                analyzer.analyze(project, &doc, tree, ScanPass::Two)
            })
            .await;
        let scan = match scanned {
            Ok(scan) => scan,
            Err(e) if e.is_cancellation() => {
                debug!(uri = %doc.uri, "Update superseded by a newer edit");
                return Ok(IndexOutcome::skipped());
            }
            Err(e) => return Err(e),
        };

        self.propagate(project, &key, ScanRound::default(), vec![scan])
            .await
    }

    /// Rescans a batch of changed documents, then their dependents.
    pub async fn update_files(
        &self,
        project: &Project,
        docs: Vec<DocumentDescriptor>,
    ) -> Result<IndexOutcome> {
        let key = self.cache_key(project);
        let mut changed = Vec::with_capacity(docs.len());
        for doc in docs {
            if !self.is_current(&key, &doc).await {
                changed.push(doc);
            }
        }
        if changed.is_empty() {
            return Ok(IndexOutcome::skipped());
        }

        let scans = self.scan_batch(project, &changed).await?;
        self.propagate(project, &key, ScanRound::default(), scans)
            .await
    }

    async fn is_current(&self, key: &IndexCacheKey, doc: &DocumentDescriptor) -> bool {
        let current = self
            .context
            .index_cache
            .modification_timestamp(key, &doc.uri)
            .await
            == Some(doc.last_modified);
        if current {
            debug!(uri = %doc.uri, "Timestamp unchanged, skipping update");
        }
        current
    }

    async fn propagate(
        &self,
        project: &Project,
        key: &IndexCacheKey,
        mut round: ScanRound,
        mut scans: Vec<FileScan>,
    ) -> Result<IndexOutcome> {
        let tracker = self.tracker(&project.name);
        let mut outcome = IndexOutcome {
            scanned: scans.len(),
            ..Default::default()
        };

        loop {
            outcome.pass_two += scans.iter().filter(|s| s.needs_full_tree).count();
            let affected = self.record_batch(&tracker, &mut round, &mut scans);
            self.write_through(project, key, &scans).await;
            self.publish_replacing(project, &scans).await;

            let mut batch = Vec::with_capacity(affected.len());
            for uri in affected {
                match self.context.contents.last_modified(&uri) {
                    Some(ts) => batch.push(DocumentDescriptor::new(uri, ts)),
                    None => {
                        debug!(uri = %uri, "Dependent document is gone");
                        self.remove_file(project, &uri).await?;
                    }
                }
            }
            if batch.is_empty() {
                break;
            }
            info!(project = %project.name, count = batch.len(), "Rescanning dependent files");
            outcome.rescanned += batch.len();
            scans = self.scan_batch(project, &batch).await?;
        }
        Ok(outcome)
    }

    /// Records the edges of a freshly scanned batch and returns the files that must
    /// be scanned next because they depend on types this batch declares.
    fn record_batch(
        &self,
        tracker: &DependencyTracker,
        round: &mut ScanRound,
        scans: &mut [FileScan],
    ) -> Vec<String> {
        let mut batch_types = HashSet::new();
        for scan in scans.iter() {
            round.files.insert(scan.doc.uri.clone());
            batch_types.extend(scan.defined_types.iter().cloned());
        }
        round.types.extend(batch_types.iter().cloned());

        for scan in scans.iter_mut() {
            let own = &scan.defined_types;
            scan.dependencies
                .retain(|t| !round.types.contains(t) && !own.contains(t));
            tracker.update(&scan.doc.uri, scan.dependencies.clone());
        }

        let affected = tracker.affected_by(&batch_types, &round.files);
        let pruned = tracker.prune_types(&round.types);
        if pruned > 0 {
            debug!(pruned, "Pruned edges to rescanned types");
        }
        affected
    }

    /// Parses `docs` in chunks, then gives documents that need one a second pass.
    async fn scan_batch(&self, project: &Project, docs: &[DocumentDescriptor]) -> Result<Vec<FileScan>> {
        let chunk_size = self.config.chunk_size.max(1);
        let mut done = Vec::with_capacity(docs.len());
        let mut deferred = Vec::new();

        for chunk in docs.chunks(chunk_size) {
            for scan in self.run_pass_one(project, chunk.to_vec()).await? {
                if scan.needs_full_tree {
                    deferred.push(scan);
                } else {
                    done.push(scan);
                }
            }
        }

        if !deferred.is_empty() {
            debug!(project = %project.name, count = deferred.len(), "Second pass with method bodies");
            while !deferred.is_empty() {
                let rest = deferred.split_off(deferred.len().min(chunk_size));
                let chunk = std::mem::replace(&mut deferred, rest);
                done.extend(self.run_pass_two(project, chunk).await?);
            }
        }

        done.sort_by(|a, b| a.doc.uri.cmp(&b.doc.uri));
        Ok(done)
    }

    async fn run_pass_one(&self, project: &Project, chunk: Vec<DocumentDescriptor>) -> Result<Vec<FileScan>> {
        let lease = self.context.environments.lease(project).await?;
        let frontend = Arc::clone(&self.context.frontend);
        let contents = Arc::clone(&self.context.contents);
        let analyzer = self.analyzer.clone();
        let pool = Arc::clone(&self.pool);
        let owned = project.clone();

        tokio::task::spawn_blocking(move || {
            let options = ParseOptions::pass_one();
            pool.install(|| {
                chunk
                    .par_iter()
                    .map(|doc| {
                        let tree = parse_document(
                            frontend.as_ref(),
                            lease.environment(),
                            contents.as_ref(),
                            doc,
                            &options,
                        );
                        analyzer.analyze(&owned, doc, tree.as_deref(), ScanPass::One)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(|e| ScanError::Frontend(format!("Scan of {} aborted: {}", project.name, e)))
    }

    async fn run_pass_two(&self, project: &Project, chunk: Vec<FileScan>) -> Result<Vec<FileScan>> {
        let lease = self.context.environments.lease(project).await?;
        let frontend = Arc::clone(&self.context.frontend);
        let contents = Arc::clone(&self.context.contents);
        let analyzer = self.analyzer.clone();
        let pool = Arc::clone(&self.pool);
        let owned = project.clone();

        tokio::task::spawn_blocking(move || {
            let options = ParseOptions::full();
            pool.install(|| {
                chunk
                    .into_par_iter()
                    .map(|scan| {
                        let tree = parse_document(
                            frontend.as_ref(),
                            lease.environment(),
                            contents.as_ref(),
                            &scan.doc,
                            &options,
                        );
                        analyzer.complete(&owned, scan, tree.as_deref())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(|e| ScanError::Frontend(format!("Second pass of {} aborted: {}", project.name, e)))
    }

    async fn write_through(&self, project: &Project, key: &IndexCacheKey, scans: &[FileScan]) {
        let files: Vec<DocumentDescriptor> = scans.iter().map(|s| s.doc.clone()).collect();
        let records: Vec<IndexRecord> = scans.iter().flat_map(|s| s.cache_records()).collect();
        let dependencies: DependencyMap = scans
            .iter()
            .map(|s| (s.doc.uri.clone(), s.dependencies.clone()))
            .collect();
        if let Err(e) = self
            .context
            .index_cache
            .update_files(key, &files, records, dependencies)
            .await
        {
            warn!(project = %project.name, error = %e, "Failed to update cached index");
        }
    }

    async fn publish(&self, project: &Project, scans: &[FileScan]) {
        let files: Vec<DocumentDescriptor> = scans.iter().map(|s| s.doc.clone()).collect();
        let records: Vec<IndexRecord> = scans.iter().flat_map(|s| s.records.iter().cloned()).collect();
        let diagnostics: BTreeMap<String, Vec<CachedDiagnostic>> = scans
            .iter()
            .map(|s| (s.doc.uri.clone(), s.diagnostics.clone()))
            .collect();
        self.context
            .store
            .add_symbols(project, &files, records, diagnostics)
            .await;
    }

    async fn publish_replacing(&self, project: &Project, scans: &[FileScan]) {
        for scan in scans {
            self.context
                .store
                .remove_symbols(project, &scan.doc.uri)
                .await;
        }
        self.publish(project, scans).await;
    }

    async fn publish_cached(&self, project: &Project, files: &[DocumentDescriptor], cached: Vec<IndexRecord>) {
        let mut records = Vec::with_capacity(cached.len());
        let mut diagnostics: BTreeMap<String, Vec<CachedDiagnostic>> = BTreeMap::new();
        for record in cached {
            match record {
                IndexRecord::Diagnostic(diagnostic) => diagnostics
                    .entry(diagnostic.doc_uri.clone())
                    .or_default()
                    .push(diagnostic),
                other => records.push(other),
            }
        }
        self.context
            .store
            .add_symbols(project, files, records, diagnostics)
            .await;
    }

    /// Forgets a deleted document everywhere.
    pub async fn remove_file(&self, project: &Project, uri: &str) -> Result<()> {
        let key = self.cache_key(project);
        self.tracker(&project.name).remove_file(uri);
        self.context.ast_cache.invalidate(uri);
        if let Err(e) = self
            .context
            .index_cache
            .remove_files(&key, &[uri.to_string()])
            .await
        {
            warn!(uri, error = %e, "Failed to remove document from cached index");
        }
        self.context.store.remove_symbols(project, uri).await;
        debug!(project = %project.name, uri, "Removed document");
        Ok(())
    }

    /// Forgets a deleted project everywhere.
    pub async fn remove_project(&self, project: &Project) -> Result<()> {
        self.trackers.remove(&project.name);
        self.context.ast_cache.invalidate_project(&project.name);
        if let Err(e) = self.context.index_cache.remove(&self.cache_key(project)).await {
            warn!(project = %project.name, error = %e, "Failed to remove cached index");
        }
        self.context.store.remove_project(project).await;
        info!(project = %project.name, "Removed project");
        Ok(())
    }
}

#[async_trait]
impl ProjectIndexer for SymbolIndexer {
    fn id(&self) -> &str {
        SOURCE_INDEXER_ID
    }

    fn cache_key(&self, project: &Project) -> IndexCacheKey {
        SymbolIndexer::cache_key(self, project)
    }

    fn is_interested_in(&self, path: &Path) -> bool {
        self.files.matches(path)
    }

    fn collect(&self, project: &Project, scope: SourceScope) -> Result<Vec<DocumentDescriptor>> {
        self.files.collect(project, scope)
    }

    async fn initialize_project(
        &self,
        project: &Project,
        files: Vec<DocumentDescriptor>,
    ) -> Result<IndexOutcome> {
        SymbolIndexer::initialize_project(self, project, files).await
    }

    async fn update_file(&self, project: &Project, doc: DocumentDescriptor) -> Result<IndexOutcome> {
        SymbolIndexer::update_file(self, project, doc).await
    }

    async fn update_files(
        &self,
        project: &Project,
        docs: Vec<DocumentDescriptor>,
    ) -> Result<IndexOutcome> {
        SymbolIndexer::update_files(self, project, docs).await
    }

    async fn remove_file(&self, project: &Project, uri: &str) -> Result<()> {
        SymbolIndexer::remove_file(self, project, uri).await
    }

    async fn remove_project(&self, project: &Project) -> Result<()> {
        SymbolIndexer::remove_project(self, project).await
    }
}
