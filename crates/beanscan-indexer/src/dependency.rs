use beanscan_core::DependencyMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::trace;

/// Source file -> type keys defined elsewhere that the file's output depends on.
///
/// Edges of a file are replaced wholesale on every scan of that file. Answers the
/// one question the engine asks: which already indexed files must be scanned again
/// because a set of types changed?
#[derive(Debug, Default)]
pub struct DependencyTracker {
    edges: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the edges of `file`. An empty set removes the file.
    pub fn update(&self, file: &str, dependencies: BTreeSet<String>) {
        let mut edges = self.edges.write();
        if dependencies.is_empty() {
            edges.remove(file);
        } else {
            trace!(file, count = dependencies.len(), "Recorded dependencies");
            edges.insert(file.to_string(), dependencies);
        }
    }

    pub fn remove_file(&self, file: &str) {
        self.edges.write().remove(file);
    }

    pub fn dependencies_of(&self, file: &str) -> BTreeSet<String> {
        self.edges.read().get(file).cloned().unwrap_or_default()
    }

    pub fn all_dependencies(&self) -> DependencyMap {
        self.edges
            .read()
            .iter()
            .map(|(file, deps)| (file.clone(), deps.clone()))
            .collect()
    }

    /// Replaces the whole tracker with a snapshot loaded from the result cache.
    pub fn restore(&self, snapshot: DependencyMap) {
        let mut edges = self.edges.write();
        edges.clear();
        edges.extend(snapshot.into_iter().filter(|(_, deps)| !deps.is_empty()));
    }

    pub fn clear(&self) {
        self.edges.write().clear();
    }

    /// Files outside `exclude` depending on any of `types`, sorted.
    pub fn affected_by(&self, types: &HashSet<String>, exclude: &HashSet<String>) -> Vec<String> {
        if types.is_empty() {
            return Vec::new();
        }
        let mut affected: Vec<String> = self
            .edges
            .read()
            .iter()
            .filter(|(file, deps)| !exclude.contains(*file) && deps.iter().any(|t| types.contains(t)))
            .map(|(file, _)| file.clone())
            .collect();
        affected.sort();
        affected
    }

    /// Removes every edge targeting one of `types`. Returns the number of edges removed.
    pub fn prune_types(&self, types: &HashSet<String>) -> usize {
        if types.is_empty() {
            return 0;
        }
        let mut removed = 0;
        let mut edges = self.edges.write();
        edges.retain(|_, deps| {
            let before = deps.len();
            deps.retain(|t| !types.contains(t));
            removed += before - deps.len();
            !deps.is_empty()
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.edges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.read().is_empty()
    }
}
