use crate::{
    CachedBean, CachedDiagnostic, CachedSymbol, DocumentDescriptor, IndexRecord, Project, Range,
    Result, ScanPass,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    TypeDeclaration,
    MethodDeclaration,
    FieldDeclaration,
    Annotation,
    TypeReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Type,
    Annotation,
    Method,
    Field,
}

/// Resolved meaning of a node as reported by the compiler frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Stable key of the bound type (qualified name for types and annotations)
    pub key: String,
    pub kind: BindingKind,
    /// Declared in workspace sources rather than in a library
    pub from_source: bool,
    /// Qualified names of the annotations this annotation is itself annotated with
    pub meta_annotations: Vec<String>,
}

impl Binding {
    pub fn source_type(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: BindingKind::Type,
            from_source: true,
            meta_annotations: Vec::new(),
        }
    }

    pub fn library_annotation(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: BindingKind::Annotation,
            from_source: false,
            meta_annotations: Vec::new(),
        }
    }
}

/// A node handed out during traversal. Valid only for the duration of the visit.
pub trait SyntaxNode {
    fn kind(&self) -> NodeKind;
    fn name(&self) -> &str;
    fn range(&self) -> Range;
    fn resolve_binding(&self) -> Option<Binding>;
    /// Name of the enclosing declaration, e.g. the annotated type of an annotation.
    fn parent_name(&self) -> Option<&str>;
}

pub trait TreeVisitor {
    /// Returns false to skip the children of `node`.
    fn visit(&mut self, node: &dyn SyntaxNode) -> bool;
}

/// Parsed compilation unit. Not thread-safe to share; owners hand it out by reference
/// inside a single synchronous callback.
pub trait SyntaxTree: Send {
    fn uri(&self) -> &str;
    fn method_bodies_parsed(&self) -> bool;
    fn accept(&self, visitor: &mut dyn TreeVisitor);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParseOptions {
    pub ignore_method_bodies: bool,
    pub resolve_bindings: bool,
}

impl ParseOptions {
    pub fn pass_one() -> Self {
        Self {
            ignore_method_bodies: true,
            resolve_bindings: true,
        }
    }

    pub fn full() -> Self {
        Self {
            ignore_method_bodies: false,
            resolve_bindings: true,
        }
    }

    pub fn for_pass(pass: ScanPass) -> Self {
        match pass {
            ScanPass::One => Self::pass_one(),
            ScanPass::Two => Self::full(),
        }
    }
}

/// Per-project frontend state: resolved classpath plus lookup tables. Holds native
/// resources that must be released explicitly.
pub trait LookupEnvironment: Send + Sync {
    fn project(&self) -> &str;
    fn classpath_roots(&self) -> &[PathBuf];
    fn release(&self) -> Result<()>;
}

pub trait CompilerFrontend: Send + Sync {
    /// Resolves the classpath of `project`. Expensive, may block.
    fn create_environment(&self, project: &Project) -> Result<Arc<dyn LookupEnvironment>>;

    fn parse(
        &self,
        env: &dyn LookupEnvironment,
        uri: &str,
        source: &str,
        options: &ParseOptions,
    ) -> Result<Box<dyn SyntaxTree>>;
}

/// Collects the output of extraction rules for one document.
pub struct ExtractionContext<'a> {
    project: &'a Project,
    doc: &'a DocumentDescriptor,
    pass: ScanPass,
    records: Vec<IndexRecord>,
    dependencies: BTreeSet<String>,
}

impl<'a> ExtractionContext<'a> {
    pub fn new(project: &'a Project, doc: &'a DocumentDescriptor, pass: ScanPass) -> Self {
        Self {
            project,
            doc,
            pass,
            records: Vec::new(),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn project(&self) -> &Project {
        self.project
    }

    pub fn doc(&self) -> &DocumentDescriptor {
        self.doc
    }

    pub fn pass(&self) -> ScanPass {
        self.pass
    }

    pub fn add_symbol(&mut self, symbol: CachedSymbol) {
        self.records.push(IndexRecord::Symbol(symbol));
    }

    pub fn add_bean(&mut self, bean: CachedBean) {
        self.records.push(IndexRecord::Bean(bean));
    }

    /// Records that the extracted output depends on `binding`. Library types cannot
    /// change through source edits and are ignored.
    pub fn add_dependency(&mut self, binding: &Binding) {
        if binding.from_source {
            self.dependencies.insert(binding.key.clone());
        }
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    pub fn into_parts(self) -> (Vec<IndexRecord>, BTreeSet<String>) {
        (self.records, self.dependencies)
    }
}

/// Capability: given a declaration or annotation node and its binding, produce
/// domain symbols and report the types they touched.
pub trait SymbolExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn extract(
        &self,
        node: &dyn SyntaxNode,
        binding: Option<&Binding>,
        cx: &mut ExtractionContext<'_>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Complete(Vec<CachedDiagnostic>),
    /// Diagnostics depend on information a tree without method bodies lacks
    RequiresFullTree,
}

pub trait Reconciler: Send + Sync {
    fn reconcile(
        &self,
        project: &Project,
        doc: &DocumentDescriptor,
        tree: &dyn SyntaxTree,
    ) -> Result<Reconciliation>;
}

/// Consumer of index output.
#[async_trait]
pub trait SymbolStore: Send + Sync {
    async fn add_symbols(
        &self,
        project: &Project,
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        diagnostics: BTreeMap<String, Vec<CachedDiagnostic>>,
    );

    async fn remove_symbols(&self, project: &Project, uri: &str);

    async fn remove_project(&self, project: &Project);
}

pub trait DocumentContentProvider: Send + Sync {
    fn fetch_content(&self, uri: &str) -> Result<String>;

    /// Timestamp of the current content, snapshot or disk.
    fn last_modified(&self, uri: &str) -> Option<i64>;
}
