use beanscan_core::{
    modified_millis, uri_for_path, DocumentDescriptor, Project, Result, ScanError,
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| ScanError::Config(format!("invalid pattern '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| ScanError::Config(format!("invalid pattern set: {}", e)))
}

/// Which source roots of a project a walk covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceScope {
    Main,
    WithTests,
    TestsOnly,
}

impl SourceScope {
    pub fn including_tests(include_test: bool) -> Self {
        if include_test {
            SourceScope::WithTests
        } else {
            SourceScope::Main
        }
    }
}

/// Discovers the documents of a project that match a set of patterns.
pub struct ProjectFiles {
    patterns: GlobSet,
}

impl ProjectFiles {
    pub fn new(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            patterns: build_globset(patterns)?,
        })
    }

    /// Walks the source roots of `project` selected by `scope`. Returns descriptors
    /// sorted by URI, each file once even when source roots overlap.
    pub fn collect(&self, project: &Project, scope: SourceScope) -> Result<Vec<DocumentDescriptor>> {
        let roots: Vec<&Path> = match scope {
            SourceScope::Main => project.source_roots(false).collect(),
            SourceScope::WithTests => project.source_roots(true).collect(),
            SourceScope::TestsOnly => project.test_source_roots().collect(),
        };
        let mut found: BTreeMap<String, i64> = BTreeMap::new();

        for root in roots {
            if !root.is_dir() {
                debug!(project = %project.name, root = %root.display(), "Skipping missing source root");
                continue;
            }
            let walker = WalkBuilder::new(root)
                .hidden(false)
                .git_ignore(true)
                .git_exclude(true)
                .ignore(true)
                .build();

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(project = %project.name, error = %e, "Walker error");
                        continue;
                    }
                };
                let path = entry.path();
                if !path.is_file() || !self.matches(path) {
                    continue;
                }
                let Some(last_modified) = modified_millis(path) else {
                    continue;
                };
                found.insert(uri_for_path(path), last_modified);
            }
        }

        info!(project = %project.name, files = found.len(), ?scope, "Collected project files");
        Ok(found
            .into_iter()
            .map(|(uri, last_modified)| DocumentDescriptor::new(uri, last_modified))
            .collect())
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.patterns.is_match(path)
    }
}
