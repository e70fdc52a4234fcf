use crate::registry::ExtractorRegistry;
use beanscan_core::{
    CachedDiagnostic, CompilerFrontend, DocumentContentProvider, DocumentDescriptor,
    ExtractionContext, IndexRecord, LookupEnvironment, NodeKind, ParseOptions, Project,
    Reconciler, Reconciliation, ScanPass, SyntaxNode, SyntaxTree, TreeVisitor,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, warn};

/// Output of scanning one document.
#[derive(Debug, Clone)]
pub(crate) struct FileScan {
    pub doc: DocumentDescriptor,
    /// Symbols and beans
    pub records: Vec<IndexRecord>,
    pub diagnostics: Vec<CachedDiagnostic>,
    /// Source types declared by the document
    pub defined_types: BTreeSet<String>,
    /// Source types the records depend on
    pub dependencies: BTreeSet<String>,
    /// Reconciliation needs a tree with method bodies
    pub needs_full_tree: bool,
}

impl FileScan {
    pub fn empty(doc: &DocumentDescriptor) -> Self {
        Self {
            doc: doc.clone(),
            records: Vec::new(),
            diagnostics: Vec::new(),
            defined_types: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            needs_full_tree: false,
        }
    }

    /// Records plus diagnostics, the shape stored in the result cache.
    pub fn cache_records(&self) -> impl Iterator<Item = IndexRecord> + '_ {
        self.records.iter().cloned().chain(
            self.diagnostics
                .iter()
                .cloned()
                .map(IndexRecord::Diagnostic),
        )
    }
}

enum Reconciled {
    Complete(Vec<CachedDiagnostic>),
    NeedsFullTree,
}

struct ExtractionVisitor<'a> {
    registry: &'a ExtractorRegistry,
    cx: ExtractionContext<'a>,
    defined: BTreeSet<String>,
}

impl TreeVisitor for ExtractionVisitor<'_> {
    fn visit(&mut self, node: &dyn SyntaxNode) -> bool {
        let binding = node.resolve_binding();
        if node.kind() == NodeKind::TypeDeclaration {
            if let Some(binding) = binding.as_ref().filter(|b| b.from_source) {
                self.defined.insert(binding.key.clone());
            }
        }
        for rule in self.registry.resolve(node, binding.as_ref()) {
            if let Err(e) = rule.extract(node, binding.as_ref(), &mut self.cx) {
                warn!(
                    rule = rule.name(),
                    uri = %self.cx.doc().uri,
                    error = %e,
                    "Extraction rule failed"
                );
            }
        }
        true
    }
}

/// Runs extraction rules and reconcilers over parsed trees.
#[derive(Clone)]
pub(crate) struct Analyzer {
    registry: Arc<ExtractorRegistry>,
    reconcilers: Vec<Arc<dyn Reconciler>>,
}

impl Analyzer {
    pub fn new(registry: Arc<ExtractorRegistry>, reconcilers: Vec<Arc<dyn Reconciler>>) -> Self {
        Self {
            registry,
            reconcilers,
        }
    }

    /// Extracts symbols and reconciles. A document without a tree yields an empty scan.
    pub fn analyze(
        &self,
        project: &Project,
        doc: &DocumentDescriptor,
        tree: Option<&dyn SyntaxTree>,
        pass: ScanPass,
    ) -> FileScan {
        let Some(tree) = tree else {
            return FileScan::empty(doc);
        };

        let mut visitor = ExtractionVisitor {
            registry: &self.registry,
            cx: ExtractionContext::new(project, doc, pass),
            defined: BTreeSet::new(),
        };
        tree.accept(&mut visitor);
        let defined_types = visitor.defined;
        let (records, dependencies) = visitor.cx.into_parts();

        let mut scan = FileScan {
            doc: doc.clone(),
            records,
            diagnostics: Vec::new(),
            defined_types,
            dependencies,
            needs_full_tree: false,
        };
        match self.reconcile(project, doc, tree) {
            Reconciled::Complete(diagnostics) => scan.diagnostics = diagnostics,
            Reconciled::NeedsFullTree if tree.method_bodies_parsed() => {
                error!(uri = %doc.uri, "Reconciliation incomplete on a full tree, dropping diagnostics");
            }
            Reconciled::NeedsFullTree => scan.needs_full_tree = true,
        }
        scan
    }

    /// Second pass: only diagnostics are recomputed from the full tree.
    pub fn complete(&self, project: &Project, mut scan: FileScan, tree: Option<&dyn SyntaxTree>) -> FileScan {
        scan.diagnostics.clear();
        let Some(tree) = tree else {
            warn!(uri = %scan.doc.uri, "No full tree for second pass, dropping diagnostics");
            return scan;
        };
        match self.reconcile(project, &scan.doc, tree) {
            Reconciled::Complete(diagnostics) => scan.diagnostics = diagnostics,
            Reconciled::NeedsFullTree => {
                error!(uri = %scan.doc.uri, "Reconciliation incomplete after second pass, dropping diagnostics");
            }
        }
        scan
    }

    fn reconcile(&self, project: &Project, doc: &DocumentDescriptor, tree: &dyn SyntaxTree) -> Reconciled {
        let mut diagnostics = Vec::new();
        for reconciler in &self.reconcilers {
            match reconciler.reconcile(project, doc, tree) {
                Ok(Reconciliation::Complete(found)) => diagnostics.extend(found),
                Ok(Reconciliation::RequiresFullTree) => return Reconciled::NeedsFullTree,
                Err(e) => warn!(uri = %doc.uri, error = %e, "Reconciler failed"),
            }
        }
        Reconciled::Complete(diagnostics)
    }
}

/// Reads and parses a document. Failures are logged and yield no tree.
pub(crate) fn parse_document(
    frontend: &dyn CompilerFrontend,
    environment: &dyn LookupEnvironment,
    contents: &dyn DocumentContentProvider,
    doc: &DocumentDescriptor,
    options: &ParseOptions,
) -> Option<Box<dyn SyntaxTree>> {
    let source = match contents.fetch_content(&doc.uri) {
        Ok(source) => source,
        Err(e) => {
            warn!(uri = %doc.uri, error = %e, "Cannot read document");
            return None;
        }
    };
    match frontend.parse(environment, &doc.uri, &source, options) {
        Ok(tree) => Some(tree),
        Err(e) => {
            warn!(uri = %doc.uri, error = %e, "Parse failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanscan_core::testing::{
        toy_project, toy_uri, ComponentRule, InjectionRule, ReferenceRule, StaticContents,
        ToyFrontend, ToyReconciler, COMPONENT,
    };
    use beanscan_core::SymbolKind;

    fn analyzer() -> Analyzer {
        let mut registry = ExtractorRegistry::new();
        registry.register_annotation(COMPONENT, Arc::new(ComponentRule));
        registry.register_kind(NodeKind::FieldDeclaration, Arc::new(InjectionRule));
        registry.register_kind(NodeKind::TypeReference, Arc::new(ReferenceRule));
        Analyzer::new(Arc::new(registry), vec![Arc::new(ToyReconciler)])
    }

    fn scan(source: &str, options: ParseOptions, pass: ScanPass) -> FileScan {
        let frontend = ToyFrontend::new();
        let project = toy_project("demo");
        let environment = frontend.create_environment(&project).unwrap();
        let contents = StaticContents::new();
        let doc = contents.set(&toy_uri("demo", "A.java"), source, 1);
        let tree = parse_document(&frontend, environment.as_ref(), &contents, &doc, &options);
        analyzer().analyze(&project, &doc, tree.as_deref(), pass)
    }

    #[test]
    fn extracts_beans_types_and_source_dependencies() {
        let scan = scan(
            "@org.springframework.stereotype.Component\ntype demo.A\nfield repo demo.Repo\nfield name java.lang.String\nuses demo.Helper",
            ParseOptions::pass_one(),
            ScanPass::One,
        );
        assert_eq!(scan.defined_types, BTreeSet::from(["demo.A".to_string()]));
        assert_eq!(
            scan.dependencies,
            BTreeSet::from(["demo.Helper".to_string(), "demo.Repo".to_string()])
        );
        assert!(scan
            .records
            .iter()
            .any(|r| matches!(r, IndexRecord::Bean(bean) if bean.name == "a")));
        assert!(scan.records.iter().any(
            |r| matches!(r, IndexRecord::Symbol(s) if s.kind == SymbolKind::InjectionPoint)
        ));
        assert!(!scan.needs_full_tree);
    }

    #[test]
    fn bean_methods_defer_diagnostics_to_second_pass() {
        let source = "type demo.Config\n@org.springframework.context.annotation.Bean\nmethod repo\nuses ?Missing";
        let first = scan(source, ParseOptions::pass_one(), ScanPass::One);
        assert!(first.needs_full_tree);
        assert!(first.diagnostics.is_empty());

        let full = scan(source, ParseOptions::full(), ScanPass::Two);
        assert!(!full.needs_full_tree);
        let codes: Vec<_> = full.diagnostics.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["unresolved-type", "bean-method"]);
    }

    #[test]
    fn unanalyzable_full_tree_drops_diagnostics() {
        let scan = scan(
            "type demo.Odd\n@demo.Unanalyzable\nmethod run\nuses ?Missing",
            ParseOptions::full(),
            ScanPass::Two,
        );
        assert!(!scan.needs_full_tree);
        assert!(scan.diagnostics.is_empty());
    }

    #[test]
    fn unreadable_document_yields_empty_scan() {
        let frontend = ToyFrontend::new();
        let project = toy_project("demo");
        let environment = frontend.create_environment(&project).unwrap();
        let contents = StaticContents::new();
        let doc = DocumentDescriptor::new(toy_uri("demo", "Gone.java"), 1);
        let tree = parse_document(
            &frontend,
            environment.as_ref(),
            &contents,
            &doc,
            &ParseOptions::pass_one(),
        );
        assert!(tree.is_none());
        let scan = analyzer().analyze(&project, &doc, None, ScanPass::One);
        assert!(scan.records.is_empty());
        assert_eq!(scan.cache_records().count(), 0);
    }
}
