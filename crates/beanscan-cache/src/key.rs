use beanscan_core::{Fingerprint, Project};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifies one cached index: the logical slot `(project, indexer, category)` at
/// the classpath generation described by `fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexCacheKey {
    project: String,
    indexer: String,
    category: String,
    fingerprint: Fingerprint,
}

/// Components recovered from a cache file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFileName {
    pub project: String,
    pub indexer: String,
    pub category: String,
    pub fingerprint: String,
}

impl IndexCacheKey {
    pub fn new(
        project: impl Into<String>,
        indexer: &str,
        category: &str,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            project: project.into(),
            indexer: indexer.replace('_', "-"),
            category: category.replace('_', "-"),
            fingerprint,
        }
    }

    /// Key for `project` with the fingerprint of its current classpath state.
    pub fn for_project(project: &Project, indexer: &str, category: &str, generation: &str) -> Self {
        Self::new(
            project.name.clone(),
            indexer,
            category,
            Fingerprint::compute(generation, project),
        )
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn indexer(&self) -> &str {
        &self.indexer
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// True when both keys address the same logical slot, whatever the fingerprint.
    pub fn same_slot(&self, other: &IndexCacheKey) -> bool {
        self.project == other.project
            && self.indexer == other.indexer
            && self.category == other.category
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}.json",
            project_stem(&self.project),
            self.indexer,
            self.category,
            self.fingerprint
        )
    }

    /// True when `file` belongs to this logical slot but to another fingerprint.
    pub fn is_stale_file(&self, file: &CacheFileName) -> bool {
        self.is_slot_file(file) && file.fingerprint != self.fingerprint.as_str()
    }

    pub fn is_slot_file(&self, file: &CacheFileName) -> bool {
        file.project == project_stem(&self.project)
            && file.indexer == self.indexer
            && file.category == self.category
    }
}

impl fmt::Display for IndexCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.fingerprint.as_str().chars().take(12).collect();
        write!(
            f,
            "{}/{}/{}@{}",
            self.project, self.indexer, self.category, short
        )
    }
}

impl CacheFileName {
    /// Splits from the right, so sanitized project names may contain separators.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".json")?;
        let mut parts = stem.rsplitn(4, '_');
        let fingerprint = parts.next()?;
        let category = parts.next()?;
        let indexer = parts.next()?;
        let project = parts.next()?;
        if project.is_empty() || fingerprint.is_empty() {
            return None;
        }
        Some(Self {
            project: project.to_string(),
            indexer: indexer.to_string(),
            category: category.to_string(),
            fingerprint: fingerprint.to_string(),
        })
    }
}

/// Readable project name followed by a digest of the raw name, so names that
/// sanitize alike still get distinct files.
fn project_stem(project: &str) -> String {
    let digest = Sha256::digest(project.as_bytes());
    let suffix: String = digest[..6].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", sanitize(project), suffix)
}

fn sanitize(project: &str) -> String {
    project
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
