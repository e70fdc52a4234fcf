use beanscan_core::{DependencyMap, DocumentDescriptor, IndexRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Result of a cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedIndex {
    pub records: Vec<IndexRecord>,
    pub dependencies: DependencyMap,
}

/// Full content of one cached index: which file versions it covers, what they produced
/// and which types each file depends on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStore {
    pub timestamped_files: BTreeMap<String, i64>,
    pub records: Vec<IndexRecord>,
    #[serde(default)]
    pub dependencies: DependencyMap,
}

impl CacheStore {
    pub fn new(
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        dependencies: DependencyMap,
    ) -> Self {
        Self {
            timestamped_files: files
                .iter()
                .map(|doc| (doc.uri.clone(), doc.last_modified))
                .collect(),
            records,
            dependencies,
        }
    }

    /// Exact match: same file set and identical timestamps for every file.
    pub fn matches(&self, files: &[DocumentDescriptor]) -> bool {
        let requested: BTreeMap<&str, i64> = files
            .iter()
            .map(|doc| (doc.uri.as_str(), doc.last_modified))
            .collect();

        requested.len() == files.len()
            && requested.len() == self.timestamped_files.len()
            && requested
                .iter()
                .all(|(uri, ts)| self.timestamped_files.get(*uri) == Some(ts))
    }

    /// Replaces the records, timestamps and dependencies of `files`.
    pub fn apply_update(
        &mut self,
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        dependencies: &DependencyMap,
    ) {
        let updated: HashSet<&str> = files.iter().map(|doc| doc.uri.as_str()).collect();
        self.records.retain(|r| !updated.contains(r.doc_uri()));
        self.records.extend(records);

        for doc in files {
            self.timestamped_files
                .insert(doc.uri.clone(), doc.last_modified);
            match dependencies.get(&doc.uri) {
                Some(deps) if !deps.is_empty() => {
                    self.dependencies.insert(doc.uri.clone(), deps.clone());
                }
                _ => {
                    self.dependencies.remove(&doc.uri);
                }
            }
        }
    }

    pub fn apply_delete(&mut self, uris: &[String]) {
        let removed: HashSet<&str> = uris.iter().map(String::as_str).collect();
        self.records.retain(|r| !removed.contains(r.doc_uri()));
        for uri in uris {
            self.timestamped_files.remove(uri);
            self.dependencies.remove(uri);
        }
    }

    /// Records grouped by document in URI order, keeping per-document order.
    pub fn to_cached(&self) -> CachedIndex {
        let mut records = self.records.clone();
        records.sort_by(|a, b| a.doc_uri().cmp(b.doc_uri()));
        CachedIndex {
            records,
            dependencies: self.dependencies.clone(),
        }
    }
}
