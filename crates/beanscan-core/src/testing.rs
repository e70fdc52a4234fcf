//! In-memory collaborators for tests.
//!
//! `ToyFrontend` understands a line-oriented toy language:
//!
//! ```text
//! @org.springframework.stereotype.Component   annotation on the next declaration
//! type com.example.Foo                        type declaration
//! field repo com.example.Repo                 field with a resolved type
//! method create                               method declaration
//! uses com.example.Bar                        type reference, `uses ?Bar` is unresolved
//! body-uses com.example.Baz                   reference only visible with method bodies
//! !parse-error                                frontend failure
//! !panic                                      frontend crash
//! ```

use crate::{
    Binding, BindingKind, CachedBean, CachedDiagnostic, CachedSymbol, CompilerFrontend,
    DocumentContentProvider, DocumentDescriptor, ExtractionContext, IndexRecord,
    LookupEnvironment, NodeKind, ParseOptions, Project, Range, Reconciler, Reconciliation,
    Result, ScanError, Severity, SymbolExtractor, SymbolKind, SymbolStore, SyntaxNode,
    SyntaxTree, TreeVisitor,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const COMPONENT: &str = "org.springframework.stereotype.Component";
pub const SERVICE: &str = "org.springframework.stereotype.Service";
pub const BEAN: &str = "org.springframework.context.annotation.Bean";
/// Methods carrying this annotation can never be analyzed completely.
pub const UNANALYZABLE: &str = "demo.Unanalyzable";

#[derive(Debug, Default)]
pub struct FrontendCounters {
    pub environments_built: AtomicUsize,
    pub environments_released: AtomicUsize,
    pub parses: AtomicUsize,
    pub full_parses: AtomicUsize,
}

impl FrontendCounters {
    pub fn built(&self) -> usize {
        self.environments_built.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.environments_released.load(Ordering::SeqCst)
    }

    pub fn parses(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }

    pub fn full_parses(&self) -> usize {
        self.full_parses.load(Ordering::SeqCst)
    }
}

pub struct ToyFrontend {
    counters: Arc<FrontendCounters>,
    meta_annotations: Mutex<HashMap<String, Vec<String>>>,
    parse_delay: Mutex<Duration>,
    build_delay: Mutex<Duration>,
    fail_release: Arc<AtomicBool>,
    fail_environment: AtomicBool,
}

impl Default for ToyFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl ToyFrontend {
    pub fn new() -> Self {
        let frontend = Self {
            counters: Arc::new(FrontendCounters::default()),
            meta_annotations: Mutex::new(HashMap::new()),
            parse_delay: Mutex::new(Duration::ZERO),
            build_delay: Mutex::new(Duration::ZERO),
            fail_release: Arc::new(AtomicBool::new(false)),
            fail_environment: AtomicBool::new(false),
        };
        frontend.add_meta_annotation(SERVICE, COMPONENT);
        frontend
    }

    pub fn counters(&self) -> Arc<FrontendCounters> {
        Arc::clone(&self.counters)
    }

    pub fn add_meta_annotation(&self, annotation: &str, meta: &str) {
        self.meta_annotations
            .lock()
            .entry(annotation.to_string())
            .or_default()
            .push(meta.to_string());
    }

    pub fn set_parse_delay(&self, delay: Duration) {
        *self.parse_delay.lock() = delay;
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock() = delay;
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_environment(&self, fail: bool) {
        self.fail_environment.store(fail, Ordering::SeqCst);
    }

    fn annotation_binding(&self, key: &str) -> Binding {
        let mut binding = Binding::library_annotation(key);
        if let Some(meta) = self.meta_annotations.lock().get(key) {
            binding.meta_annotations = meta.clone();
        }
        binding
    }
}

pub struct ToyEnvironment {
    project: String,
    roots: Vec<PathBuf>,
    released: AtomicBool,
    fail_release: Arc<AtomicBool>,
    counters: Arc<FrontendCounters>,
}

impl ToyEnvironment {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl LookupEnvironment for ToyEnvironment {
    fn project(&self) -> &str {
        &self.project
    }

    fn classpath_roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn release(&self) -> Result<()> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(ScanError::Frontend(format!(
                "cannot release environment of {}",
                self.project
            )));
        }
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counters
                .environments_released
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl CompilerFrontend for ToyFrontend {
    fn create_environment(&self, project: &Project) -> Result<Arc<dyn LookupEnvironment>> {
        let delay = *self.build_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_environment.load(Ordering::SeqCst) {
            return Err(ScanError::Frontend(format!(
                "classpath of {} cannot be resolved",
                project.name
            )));
        }
        self.counters
            .environments_built
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ToyEnvironment {
            project: project.name.clone(),
            roots: project.classpath.iter().map(|e| e.path.clone()).collect(),
            released: AtomicBool::new(false),
            fail_release: Arc::clone(&self.fail_release),
            counters: Arc::clone(&self.counters),
        }))
    }

    fn parse(
        &self,
        _env: &dyn LookupEnvironment,
        uri: &str,
        source: &str,
        options: &ParseOptions,
    ) -> Result<Box<dyn SyntaxTree>> {
        self.counters.parses.fetch_add(1, Ordering::SeqCst);
        if !options.ignore_method_bodies {
            self.counters.full_parses.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.parse_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut nodes = Vec::new();
        let mut pending: Vec<(String, Range)> = Vec::new();
        let mut current_type: Option<String> = None;

        for (line_no, raw) in source.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let range = Range::line(line_no as u32, 0, raw.len() as u32);
            let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
            let rest = rest.trim();

            let declaration = match head {
                "!parse-error" => {
                    return Err(ScanError::Frontend(format!("syntax error in {}", uri)))
                }
                "!panic" => panic!("toy frontend crashed on {}", uri),
                "type" => {
                    current_type = Some(rest.to_string());
                    Some(ToyNode {
                        kind: NodeKind::TypeDeclaration,
                        name: rest.to_string(),
                        range,
                        binding: Some(Binding::source_type(rest)),
                        parent: None,
                    })
                }
                "method" => Some(ToyNode {
                    kind: NodeKind::MethodDeclaration,
                    name: rest.to_string(),
                    range,
                    binding: Some(Binding {
                        key: format!("{}#{}", current_type.as_deref().unwrap_or(""), rest),
                        kind: BindingKind::Method,
                        from_source: true,
                        meta_annotations: Vec::new(),
                    }),
                    parent: current_type.clone(),
                }),
                "field" => {
                    let (name, type_key) = rest.split_once(' ').unwrap_or((rest, ""));
                    let binding = (!type_key.is_empty()).then(|| Binding {
                        key: type_key.to_string(),
                        kind: BindingKind::Type,
                        from_source: !type_key.starts_with("java."),
                        meta_annotations: Vec::new(),
                    });
                    Some(ToyNode {
                        kind: NodeKind::FieldDeclaration,
                        name: name.to_string(),
                        range,
                        binding,
                        parent: current_type.clone(),
                    })
                }
                "uses" | "body-uses" => {
                    if head == "body-uses" && options.ignore_method_bodies {
                        continue;
                    }
                    let unresolved = rest.starts_with('?');
                    let name = rest.trim_start_matches('?');
                    nodes.push(ToyNode {
                        kind: NodeKind::TypeReference,
                        name: name.to_string(),
                        range,
                        binding: (!unresolved).then(|| Binding::source_type(name)),
                        parent: current_type.clone(),
                    });
                    None
                }
                annotation if annotation.starts_with('@') => {
                    pending.push((annotation.trim_start_matches('@').to_string(), range));
                    None
                }
                _ => None,
            };

            if let Some(declaration) = declaration {
                let parent = declaration.name.clone();
                nodes.push(declaration);
                for (key, range) in pending.drain(..) {
                    nodes.push(ToyNode {
                        kind: NodeKind::Annotation,
                        name: key.rsplit('.').next().unwrap_or(&key).to_string(),
                        range,
                        binding: Some(self.annotation_binding(&key)),
                        parent: Some(parent.clone()),
                    });
                }
            }
        }

        Ok(Box::new(ToyTree {
            uri: uri.to_string(),
            nodes,
            bodies: !options.ignore_method_bodies,
        }))
    }
}

struct ToyNode {
    kind: NodeKind,
    name: String,
    range: Range,
    binding: Option<Binding>,
    parent: Option<String>,
}

impl SyntaxNode for ToyNode {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn range(&self) -> Range {
        self.range
    }

    fn resolve_binding(&self) -> Option<Binding> {
        self.binding.clone()
    }

    fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }
}

struct ToyTree {
    uri: String,
    nodes: Vec<ToyNode>,
    bodies: bool,
}

impl SyntaxTree for ToyTree {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn method_bodies_parsed(&self) -> bool {
        self.bodies
    }

    fn accept(&self, visitor: &mut dyn TreeVisitor) {
        for node in &self.nodes {
            visitor.visit(node);
        }
    }
}

fn simple_name(key: &str) -> &str {
    key.rsplit('.').next().unwrap_or(key)
}

fn bean_name(type_key: &str) -> String {
    let simple = simple_name(type_key);
    let mut chars = simple.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `@Component` (directly or as meta-annotation) on a type yields a bean.
pub struct ComponentRule;

impl SymbolExtractor for ComponentRule {
    fn name(&self) -> &str {
        "component"
    }

    fn extract(
        &self,
        node: &dyn SyntaxNode,
        binding: Option<&Binding>,
        cx: &mut ExtractionContext<'_>,
    ) -> Result<()> {
        let (Some(binding), Some(type_key)) = (binding, node.parent_name()) else {
            return Ok(());
        };
        let uri = cx.doc().uri.clone();
        cx.add_symbol(CachedSymbol {
            doc_uri: uri.clone(),
            name: format!("@+ '{}' ({}) {}", bean_name(type_key), node.name(), type_key),
            kind: SymbolKind::Component,
            range: node.range(),
            container: Some(type_key.to_string()),
        });
        cx.add_bean(CachedBean {
            doc_uri: uri,
            name: bean_name(type_key),
            type_key: type_key.to_string(),
            range: node.range(),
            injection_points: Vec::new(),
            annotations: vec![binding.key.clone()],
        });
        Ok(())
    }
}

/// Fields become injection points and make the file depend on the field type.
pub struct InjectionRule;

impl SymbolExtractor for InjectionRule {
    fn name(&self) -> &str {
        "injection-point"
    }

    fn extract(
        &self,
        node: &dyn SyntaxNode,
        binding: Option<&Binding>,
        cx: &mut ExtractionContext<'_>,
    ) -> Result<()> {
        let Some(binding) = binding else {
            return Ok(());
        };
        cx.add_dependency(binding);
        let uri = cx.doc().uri.clone();
        cx.add_symbol(CachedSymbol {
            doc_uri: uri,
            name: format!("{} {}", simple_name(&binding.key), node.name()),
            kind: SymbolKind::InjectionPoint,
            range: node.range(),
            container: node.parent_name().map(str::to_string),
        });
        Ok(())
    }
}

/// Plain type references only contribute dependencies.
pub struct ReferenceRule;

impl SymbolExtractor for ReferenceRule {
    fn name(&self) -> &str {
        "type-reference"
    }

    fn extract(
        &self,
        _node: &dyn SyntaxNode,
        binding: Option<&Binding>,
        cx: &mut ExtractionContext<'_>,
    ) -> Result<()> {
        if let Some(binding) = binding {
            cx.add_dependency(binding);
        }
        Ok(())
    }
}

/// Reports unresolved references. `@Bean` methods need method bodies, methods
/// marked [`UNANALYZABLE`] can never be reconciled.
pub struct ToyReconciler;

#[derive(Default)]
struct ReconcileVisitor {
    unresolved: Vec<(String, Range)>,
    bean_methods: Vec<(String, Range)>,
    unanalyzable: bool,
    last_declaration: Option<NodeKind>,
}

impl TreeVisitor for ReconcileVisitor {
    fn visit(&mut self, node: &dyn SyntaxNode) -> bool {
        match node.kind() {
            NodeKind::TypeReference if node.resolve_binding().is_none() => {
                self.unresolved.push((node.name().to_string(), node.range()));
            }
            NodeKind::Annotation if self.last_declaration == Some(NodeKind::MethodDeclaration) => {
                match node.resolve_binding().map(|b| b.key) {
                    Some(key) if key == BEAN => {
                        let method = node.parent_name().unwrap_or_default().to_string();
                        self.bean_methods.push((method, node.range()));
                    }
                    Some(key) if key == UNANALYZABLE => self.unanalyzable = true,
                    _ => {}
                }
            }
            NodeKind::Annotation | NodeKind::TypeReference => {}
            declaration => self.last_declaration = Some(declaration),
        }
        true
    }
}

impl Reconciler for ToyReconciler {
    fn reconcile(
        &self,
        _project: &Project,
        doc: &DocumentDescriptor,
        tree: &dyn SyntaxTree,
    ) -> Result<Reconciliation> {
        let mut visitor = ReconcileVisitor::default();
        tree.accept(&mut visitor);

        if visitor.unanalyzable || (!visitor.bean_methods.is_empty() && !tree.method_bodies_parsed())
        {
            return Ok(Reconciliation::RequiresFullTree);
        }

        let mut diagnostics: Vec<CachedDiagnostic> = visitor
            .unresolved
            .into_iter()
            .map(|(name, range)| CachedDiagnostic {
                doc_uri: doc.uri.clone(),
                code: "unresolved-type".to_string(),
                message: format!("{} cannot be resolved to a type", name),
                severity: Severity::Error,
                range,
            })
            .collect();
        diagnostics.extend(visitor.bean_methods.into_iter().map(|(method, range)| {
            CachedDiagnostic {
                doc_uri: doc.uri.clone(),
                code: "bean-method".to_string(),
                message: format!("Bean method {} analyzed", method),
                severity: Severity::Hint,
                range,
            }
        }));
        Ok(Reconciliation::Complete(diagnostics))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Added { project: String, files: Vec<String> },
    Removed { project: String, uri: String },
    ProjectRemoved { project: String },
}

/// Symbol store that keeps the latest output per document and logs every call.
#[derive(Default)]
pub struct RecordingSymbolStore {
    records: Mutex<BTreeMap<(String, String), Vec<IndexRecord>>>,
    diagnostics: Mutex<BTreeMap<(String, String), Vec<CachedDiagnostic>>>,
    ops: Mutex<Vec<StoreOp>>,
}

impl RecordingSymbolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_for(&self, uri: &str) -> Vec<IndexRecord> {
        self.records
            .lock()
            .iter()
            .filter(|((_, u), _)| u == uri)
            .flat_map(|(_, records)| records.clone())
            .collect()
    }

    pub fn diagnostics_for(&self, uri: &str) -> Vec<CachedDiagnostic> {
        self.diagnostics
            .lock()
            .iter()
            .filter(|((_, u), _)| u == uri)
            .flat_map(|(_, diagnostics)| diagnostics.clone())
            .collect()
    }

    pub fn has_document(&self, uri: &str) -> bool {
        self.records.lock().keys().any(|(_, u)| u == uri)
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    /// Every record published so far, ordered by document.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<IndexRecord>> {
        self.records
            .lock()
            .iter()
            .map(|((_, uri), records)| (uri.clone(), records.clone()))
            .collect()
    }
}

#[async_trait]
impl SymbolStore for RecordingSymbolStore {
    async fn add_symbols(
        &self,
        project: &Project,
        files: &[DocumentDescriptor],
        records: Vec<IndexRecord>,
        mut diagnostics: BTreeMap<String, Vec<CachedDiagnostic>>,
    ) {
        let mut by_file: BTreeMap<String, Vec<IndexRecord>> = files
            .iter()
            .map(|doc| (doc.uri.clone(), Vec::new()))
            .collect();
        for record in records {
            by_file
                .entry(record.doc_uri().to_string())
                .or_default()
                .push(record);
        }

        {
            let mut stored = self.records.lock();
            let mut stored_diagnostics = self.diagnostics.lock();
            for (uri, records) in by_file {
                let key = (project.name.clone(), uri.clone());
                stored_diagnostics.insert(key.clone(), diagnostics.remove(&uri).unwrap_or_default());
                stored.insert(key, records);
            }
        }

        self.ops.lock().push(StoreOp::Added {
            project: project.name.clone(),
            files: files.iter().map(|d| d.uri.clone()).collect(),
        });
    }

    async fn remove_symbols(&self, project: &Project, uri: &str) {
        let key = (project.name.clone(), uri.to_string());
        self.records.lock().remove(&key);
        self.diagnostics.lock().remove(&key);
        self.ops.lock().push(StoreOp::Removed {
            project: project.name.clone(),
            uri: uri.to_string(),
        });
    }

    async fn remove_project(&self, project: &Project) {
        self.records.lock().retain(|(p, _), _| p != &project.name);
        self.diagnostics.lock().retain(|(p, _), _| p != &project.name);
        self.ops.lock().push(StoreOp::ProjectRemoved {
            project: project.name.clone(),
        });
    }
}

/// Content provider backed by a map of URI to (text, timestamp).
#[derive(Default)]
pub struct StaticContents {
    documents: Mutex<HashMap<String, (String, i64)>>,
}

impl StaticContents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, uri: &str, text: &str, last_modified: i64) -> DocumentDescriptor {
        self.documents
            .lock()
            .insert(uri.to_string(), (text.to_string(), last_modified));
        DocumentDescriptor::new(uri, last_modified)
    }

    pub fn remove(&self, uri: &str) {
        self.documents.lock().remove(uri);
    }
}

impl DocumentContentProvider for StaticContents {
    fn fetch_content(&self, uri: &str) -> Result<String> {
        self.documents
            .lock()
            .get(uri)
            .map(|(text, _)| text.clone())
            .ok_or_else(|| ScanError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, uri.to_string())))
    }

    fn last_modified(&self, uri: &str) -> Option<i64> {
        self.documents.lock().get(uri).map(|(_, ts)| *ts)
    }
}

pub fn toy_project(name: &str) -> Project {
    Project::new(name, format!("/workspace/{}", name)).with_classpath(vec![
        crate::ClasspathEntry::source(format!("/workspace/{}/src/main/java", name)),
        crate::ClasspathEntry::output(format!("/workspace/{}/target/classes", name)),
    ])
}

pub fn toy_uri(project: &str, file: &str) -> String {
    format!("file:///workspace/{}/src/main/java/{}", project, file)
}
