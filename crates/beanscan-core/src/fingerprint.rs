use crate::{modified_millis, Project};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Generation tag of the extraction logic. Bumping it invalidates every cache.
pub const DEFAULT_GENERATION: &str = "beanscan-symbols-1";

/// Hash over the generation tag and the library classpath state of a project.
///
/// Only binary entries take part: source folders are validated per file through
/// their timestamps, and a project's own output folder changes on every build.
/// Entries that do not exist on disk are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(generation: &str, project: &Project) -> Self {
        let parts: Vec<String> = project
            .binary_roots()
            .filter_map(|root| {
                modified_millis(root).map(|millis| format!("{}#{}", root.display(), millis))
            })
            .collect();
        Self::from_parts(generation, &parts)
    }

    pub fn from_parts(generation: &str, parts: &[String]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(generation.as_bytes());
        hasher.update(b"\n");
        hasher.update(parts.join(",").as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wraps a value previously produced by [`Fingerprint::as_str`].
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClasspathEntry;

    #[test]
    fn generation_changes_fingerprint() {
        let parts = vec!["/lib/a.jar#1".to_string()];
        let a = Fingerprint::from_parts("gen-1", &parts);
        let b = Fingerprint::from_parts("gen-2", &parts);
        assert_ne!(a, b);
        assert_eq!(a, Fingerprint::from_parts("gen-1", &parts));
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn library_timestamp_changes_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("lib.jar");
        std::fs::write(&jar, b"v1").unwrap();
        let project = Project::new("demo", dir.path()).with_classpath(vec![
            ClasspathEntry::binary(&jar),
            ClasspathEntry::binary(dir.path().join("missing.jar")),
            ClasspathEntry::source(dir.path().join("src")),
        ]);

        let before = Fingerprint::compute(DEFAULT_GENERATION, &project);
        assert_eq!(before, Fingerprint::compute(DEFAULT_GENERATION, &project));

        let file = std::fs::File::options().write(true).open(&jar).unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        file.set_modified(later).unwrap();

        assert_ne!(before, Fingerprint::compute(DEFAULT_GENERATION, &project));
    }
}
