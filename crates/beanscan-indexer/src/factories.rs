//! Bean registrations declared in `META-INF/spring.factories` files.
//!
//! These are plain properties files, so no compiler environment is involved: every
//! file is read through the content provider and scanned line by line. Results live
//! in their own result cache slot next to the source index.

use crate::files::{ProjectFiles, SourceScope};
use crate::traits::{IndexOutcome, ProjectIndexer};
use async_trait::async_trait;
use beanscan_cache::{IndexCache, IndexCacheKey};
use beanscan_core::{
    CachedBean, CachedSymbol, DependencyMap, DocumentContentProvider, DocumentDescriptor,
    IndexRecord, Position, Project, Range, Result, ScanError, SymbolKind, SymbolStore,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const FACTORIES_INDEXER_ID: &str = "factories";
pub const BEANS_CATEGORY: &str = "beans";

/// Factory keys whose values are registered as beans.
pub const REGISTRATION_KEYS: &[&str] = &[
    "org.springframework.aot.hint.RuntimeHintsRegistrar",
    "org.springframework.beans.factory.aot.BeanFactoryInitializationAotProcessor",
    "org.springframework.beans.factory.aot.BeanRegistrationAotProcessor",
];

pub struct FactoriesIndexer {
    generation: String,
    files: ProjectFiles,
    contents: Arc<dyn DocumentContentProvider>,
    index_cache: Arc<dyn IndexCache>,
    store: Arc<dyn SymbolStore>,
}

impl FactoriesIndexer {
    pub fn new(
        generation: impl Into<String>,
        files: ProjectFiles,
        contents: Arc<dyn DocumentContentProvider>,
        index_cache: Arc<dyn IndexCache>,
        store: Arc<dyn SymbolStore>,
    ) -> Self {
        Self {
            generation: generation.into(),
            files,
            contents,
            index_cache,
            store,
        }
    }

    fn scan(&self, doc: &DocumentDescriptor) -> Vec<IndexRecord> {
        match self.contents.fetch_content(&doc.uri) {
            Ok(text) => registrations(&doc.uri, &text),
            Err(e) => {
                warn!(uri = %doc.uri, error = %e, "Cannot read factories file");
                Vec::new()
            }
        }
    }

    async fn scan_all(&self, docs: &[DocumentDescriptor]) -> Vec<IndexRecord> {
        let mut records = Vec::new();
        for doc in docs {
            records.extend(self.scan(doc));
            tokio::task::yield_now().await;
        }
        records
    }

    async fn publish(&self, project: &Project, docs: &[DocumentDescriptor], records: Vec<IndexRecord>) {
        self.store
            .add_symbols(project, docs, records, BTreeMap::new())
            .await;
    }
}

#[async_trait]
impl ProjectIndexer for FactoriesIndexer {
    fn id(&self) -> &str {
        FACTORIES_INDEXER_ID
    }

    fn cache_key(&self, project: &Project) -> IndexCacheKey {
        IndexCacheKey::for_project(project, FACTORIES_INDEXER_ID, BEANS_CATEGORY, &self.generation)
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
        let started = Instant::now();
        let key = self.cache_key(project);

        match self.index_cache.retrieve(&key, &files).await {
            Ok(Some(cached)) => {
                debug!(project = %project.name, records = cached.records.len(), "Factories restored from cache");
                self.publish(project, &files, cached.records).await;
                return Ok(IndexOutcome {
                    from_cache: true,
                    ..Default::default()
                });
            }
            Ok(None) => {}
            Err(e) => warn!(project = %project.name, error = %e, "Result cache unavailable, rescanning"),
        }

        let records = self.scan_all(&files).await;
        if let Err(e) = self
            .index_cache
            .store(&key, &files, records.clone(), DependencyMap::new())
            .await
        {
            warn!(project = %project.name, error = %e, "Failed to store factories in cache");
        }
        self.publish(project, &files, records).await;
        info!(
            project = %project.name,
            files = files.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Indexed factories files"
        );
        Ok(IndexOutcome {
            scanned: files.len(),
            ..Default::default()
        })
    }

    async fn update_file(&self, project: &Project, doc: DocumentDescriptor) -> Result<IndexOutcome> {
        self.update_files(project, vec![doc]).await
    }

    async fn update_files(
        &self,
        project: &Project,
        docs: Vec<DocumentDescriptor>,
    ) -> Result<IndexOutcome> {
        let key = self.cache_key(project);
        let mut changed = Vec::with_capacity(docs.len());
        for doc in docs {
            if self.index_cache.modification_timestamp(&key, &doc.uri).await != Some(doc.last_modified) {
                changed.push(doc);
            }
        }
        if changed.is_empty() {
            return Ok(IndexOutcome::skipped());
        }

        let records = self.scan_all(&changed).await;
        let dependencies: DependencyMap = changed
            .iter()
            .map(|doc| (doc.uri.clone(), Default::default()))
            .collect();
        if let Err(e) = self
            .index_cache
            .update_files(&key, &changed, records.clone(), dependencies)
            .await
        {
            warn!(project = %project.name, error = %e, "Failed to update cached factories");
        }
        for doc in &changed {
            self.store.remove_symbols(project, &doc.uri).await;
        }
        self.publish(project, &changed, records).await;
        Ok(IndexOutcome {
            scanned: changed.len(),
            ..Default::default()
        })
    }

    async fn remove_file(&self, project: &Project, uri: &str) -> Result<()> {
        if let Err(e) = self
            .index_cache
            .remove_files(&self.cache_key(project), &[uri.to_string()])
            .await
        {
            warn!(uri, error = %e, "Failed to remove factories file from cache");
        }
        self.store.remove_symbols(project, uri).await;
        Ok(())
    }

    async fn remove_project(&self, project: &Project) -> Result<()> {
        self.index_cache
            .remove(&self.cache_key(project))
            .await
            .map_err(|e| ScanError::Storage(format!("cannot drop factories cache: {}", e)))?;
        self.store.remove_project(project).await;
        Ok(())
    }
}

/// One `key=value` entry, possibly continued over several lines.
struct Entry {
    key: String,
    value: String,
    range: Range,
}

fn entries(text: &str) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut pending: Option<(String, u32, u32)> = None;

    for (line_no, raw) in text.lines().enumerate() {
        let line_no = line_no as u32;
        let end = raw.chars().count() as u32;
        let trimmed = raw.trim();

        let (mut logical, start) = match pending.take() {
            Some((logical, start, _)) => (logical, start),
            None => {
                if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                    continue;
                }
                (String::new(), line_no)
            }
        };

        match trimmed.strip_suffix('\\') {
            Some(head) => {
                logical.push_str(head);
                pending = Some((logical, start, end));
            }
            None => {
                logical.push_str(trimmed);
                if let Some(entry) = split_entry(&logical, start, line_no, end) {
                    entries.push(entry);
                }
            }
        }
    }

    if let Some((logical, start, end)) = pending {
        let last = text.lines().count().saturating_sub(1) as u32;
        if let Some(entry) = split_entry(&logical, start, last, end) {
            entries.push(entry);
        }
    }
    entries
}

fn split_entry(logical: &str, start: u32, end_line: u32, end: u32) -> Option<Entry> {
    let at = logical.find(|c: char| c == '=' || c == ':')?;
    Some(Entry {
        key: logical[..at].trim().to_string(),
        value: logical[at + 1..].trim().to_string(),
        range: Range {
            start: Position {
                line: start,
                character: 0,
            },
            end: Position {
                line: end_line,
                character: end,
            },
        },
    })
}

/// Beans registered by the known factory keys of one file.
pub fn registrations(uri: &str, text: &str) -> Vec<IndexRecord> {
    let file_name = uri.rsplit('/').next().unwrap_or(uri);
    let mut records = Vec::new();

    for entry in entries(text) {
        if !REGISTRATION_KEYS.contains(&entry.key.as_str()) {
            continue;
        }
        for type_key in entry.value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let name = bean_name(type_key);
            records.push(IndexRecord::Symbol(CachedSymbol {
                doc_uri: uri.to_string(),
                name: format!("@+ '{}' {} ({})", name, type_key, file_name),
                kind: SymbolKind::ConfigurationBinding,
                range: entry.range,
                container: Some(entry.key.clone()),
            }));
            records.push(IndexRecord::Bean(CachedBean {
                doc_uri: uri.to_string(),
                name,
                type_key: type_key.to_string(),
                range: entry.range,
                injection_points: Vec::new(),
                annotations: vec![entry.key.clone()],
            }));
        }
    }
    records
}

/// Bean name derived from a type: the simple name with its first letter lowered,
/// unless the name starts with two capitals.
fn bean_name(type_key: &str) -> String {
    let simple = type_key.rsplit('.').next().unwrap_or(type_key);
    let mut chars = simple.chars();
    match (chars.next(), chars.next()) {
        (Some(first), Some(second)) if first.is_uppercase() && second.is_uppercase() => {
            simple.to_string()
        }
        (Some(first), _) => first.to_lowercase().chain(simple.chars().skip(1)).collect(),
        (None, _) => String::new(),
    }
}
