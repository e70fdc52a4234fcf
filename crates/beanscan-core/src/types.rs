use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use url::Url;

/// A source document at a point in time. Equality covers both the URI and the
/// modification timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    pub uri: String,
    pub last_modified: i64,
}

impl DocumentDescriptor {
    pub fn new(uri: impl Into<String>, last_modified: i64) -> Self {
        Self {
            uri: uri.into(),
            last_modified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClasspathKind {
    /// Library jar or class folder provided by the build
    Binary,
    /// Source folder scanned by the indexer
    Source,
    /// Build output folder of the project itself
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClasspathEntry {
    pub path: PathBuf,
    pub kind: ClasspathKind,
    #[serde(default)]
    pub test: bool,
}

impl ClasspathEntry {
    pub fn binary(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ClasspathKind::Binary,
            test: false,
        }
    }

    pub fn source(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ClasspathKind::Source,
            test: false,
        }
    }

    pub fn output(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ClasspathKind::Output,
            test: false,
        }
    }

    pub fn for_tests(mut self) -> Self {
        self.test = true;
        self
    }
}

/// A project as reported by the build tooling. The classpath changes over time and
/// every cached artifact keyed to the project depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub location: PathBuf,
    #[serde(default)]
    pub classpath: Vec<ClasspathEntry>,
}

impl Project {
    pub fn new(name: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            classpath: Vec::new(),
        }
    }

    pub fn with_classpath(mut self, classpath: Vec<ClasspathEntry>) -> Self {
        self.classpath = classpath;
        self
    }

    pub fn source_roots(&self, include_test: bool) -> impl Iterator<Item = &Path> {
        self.classpath
            .iter()
            .filter(move |e| e.kind == ClasspathKind::Source && (include_test || !e.test))
            .map(|e| e.path.as_path())
    }

    pub fn test_source_roots(&self) -> impl Iterator<Item = &Path> {
        self.classpath
            .iter()
            .filter(|e| e.kind == ClasspathKind::Source && e.test)
            .map(|e| e.path.as_path())
    }

    pub fn binary_roots(&self) -> impl Iterator<Item = &Path> {
        self.classpath
            .iter()
            .filter(|e| e.kind == ClasspathKind::Binary)
            .map(|e| e.path.as_path())
    }

    pub fn output_roots(&self) -> impl Iterator<Item = &Path> {
        self.classpath
            .iter()
            .filter(|e| e.kind == ClasspathKind::Output)
            .map(|e| e.path.as_path())
    }

    pub fn contains_source(&self, path: &Path, include_test: bool) -> bool {
        self.source_roots(include_test)
            .any(|root| path.starts_with(root))
    }

    /// Build outputs and libraries: a change below any of them alters what the
    /// lookup environment resolves.
    pub fn contains_output(&self, path: &Path) -> bool {
        self.output_roots()
            .chain(self.binary_roots())
            .any(|root| path.starts_with(root))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn line(line: u32, start: u32, end: u32) -> Self {
        Self {
            start: Position {
                line,
                character: start,
            },
            end: Position {
                line,
                character: end,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Annotation,
    Component,
    InjectionPoint,
    FactoryMethod,
    ConfigurationBinding,
    RequestMapping,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CachedSymbol {
    pub doc_uri: String,
    pub name: String,
    pub kind: SymbolKind,
    pub range: Range,
    #[serde(default)]
    pub container: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CachedBean {
    pub doc_uri: String,
    pub name: String,
    pub type_key: String,
    pub range: Range,
    #[serde(default)]
    pub injection_points: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Hint,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CachedDiagnostic {
    pub doc_uri: String,
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub range: Range,
}

/// Immutable output of one extraction, tagged with the owning document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexRecord {
    Symbol(CachedSymbol),
    Bean(CachedBean),
    Diagnostic(CachedDiagnostic),
}

impl IndexRecord {
    pub fn doc_uri(&self) -> &str {
        match self {
            IndexRecord::Symbol(s) => &s.doc_uri,
            IndexRecord::Bean(b) => &b.doc_uri,
            IndexRecord::Diagnostic(d) => &d.doc_uri,
        }
    }

    pub fn is_diagnostic(&self) -> bool {
        matches!(self, IndexRecord::Diagnostic(_))
    }
}

/// File URI -> referenced type keys. Ordered so snapshots serialize identically.
pub type DependencyMap = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanPass {
    /// Method bodies skipped, symbols extracted
    One,
    /// Full analysis, diagnostics only
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Inputs accepted by the index dispatcher.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    ProjectCreated(Project),
    ProjectChanged(Project),
    ProjectDeleted(Project),
    FileChanged { uri: String, kind: FileChangeKind },
    DocumentClosed { uri: String },
}

pub fn uri_for_path(path: &Path) -> String {
    match Url::from_file_path(path) {
        Ok(url) => url.to_string(),
        Err(_) => format!("file://{}", path.display()),
    }
}

pub fn path_for_uri(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok()?.to_file_path().ok()
}

/// Modification time in milliseconds since the epoch, if the file exists.
pub fn modified_millis(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let millis = modified.duration_since(UNIX_EPOCH).ok()?.as_millis();
    i64::try_from(millis).ok()
}
