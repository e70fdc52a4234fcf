use crate::files::SourceScope;
use async_trait::async_trait;
use beanscan_cache::IndexCacheKey;
use beanscan_core::{DocumentDescriptor, Project, Result};
use std::path::Path;

/// What an indexing operation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    /// Output was restored from the result cache
    pub from_cache: bool,
    /// Nothing to do: unchanged timestamp or superseded by a newer edit
    pub skipped: bool,
    pub scanned: usize,
    /// Dependent files scanned again within the same round
    pub rescanned: usize,
    /// Files that needed a second pass with method bodies
    pub pass_two: usize,
}

impl IndexOutcome {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// One kind of document indexed per project, with its own result cache slot.
///
/// The service runs every registered indexer on project initialization and routes
/// each changed file to the indexers interested in it. Initialization publishes on
/// top of whatever the store holds; the caller clears the project beforehand.
#[async_trait]
pub trait ProjectIndexer: Send + Sync {
    /// Indexer component of this indexer's cache keys.
    fn id(&self) -> &str;

    fn cache_key(&self, project: &Project) -> IndexCacheKey;

    fn is_interested_in(&self, path: &Path) -> bool;

    /// Documents of `project` this indexer scans. Blocking.
    fn collect(&self, project: &Project, scope: SourceScope) -> Result<Vec<DocumentDescriptor>>;

    async fn initialize_project(
        &self,
        project: &Project,
        files: Vec<DocumentDescriptor>,
    ) -> Result<IndexOutcome>;

    async fn update_file(&self, project: &Project, doc: DocumentDescriptor) -> Result<IndexOutcome>;

    async fn update_files(
        &self,
        project: &Project,
        docs: Vec<DocumentDescriptor>,
    ) -> Result<IndexOutcome>;

    async fn remove_file(&self, project: &Project, uri: &str) -> Result<()>;

    async fn remove_project(&self, project: &Project) -> Result<()>;
}
