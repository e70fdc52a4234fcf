use beanscan_core::{
    Binding, CachedSymbol, ExtractionContext, NodeKind, Result, SymbolExtractor, SymbolKind,
    SyntaxNode,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps annotation keys and node kinds to extraction rules.
///
/// An annotation node dispatches on its own key and on every meta-annotation of its
/// binding, so a rule registered for a stereotype also sees annotations derived from
/// it. Each rule runs at most once per node.
#[derive(Default)]
pub struct ExtractorRegistry {
    by_annotation: HashMap<String, Vec<Arc<dyn SymbolExtractor>>>,
    by_kind: HashMap<NodeKind, Vec<Arc<dyn SymbolExtractor>>>,
    fallback: Option<Arc<dyn SymbolExtractor>>,
    fallback_prefix: Option<String>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_annotation(&mut self, key: impl Into<String>, rule: Arc<dyn SymbolExtractor>) {
        self.by_annotation.entry(key.into()).or_default().push(rule);
    }

    pub fn register_kind(&mut self, kind: NodeKind, rule: Arc<dyn SymbolExtractor>) {
        self.by_kind.entry(kind).or_default().push(rule);
    }

    /// Annotations without a dedicated rule whose key starts with `prefix` still
    /// produce a plain annotation symbol.
    pub fn with_default_symbols(mut self, prefix: Option<String>) -> Self {
        self.fallback = prefix
            .as_ref()
            .map(|_| Arc::new(DefaultSymbolRule) as Arc<dyn SymbolExtractor>);
        self.fallback_prefix = prefix;
        self
    }

    pub fn rule_count(&self) -> usize {
        self.by_annotation.values().map(Vec::len).sum::<usize>()
            + self.by_kind.values().map(Vec::len).sum::<usize>()
    }

    /// Rules that apply to `node`, in registration order.
    pub fn resolve(&self, node: &dyn SyntaxNode, binding: Option<&Binding>) -> Vec<Arc<dyn SymbolExtractor>> {
        let mut rules: Vec<Arc<dyn SymbolExtractor>> = Vec::new();

        if let Some(kind_rules) = self.by_kind.get(&node.kind()) {
            for rule in kind_rules {
                push_unique(&mut rules, rule);
            }
        }

        if node.kind() == NodeKind::Annotation {
            if let Some(binding) = binding {
                let mut matched = false;
                let keys = std::iter::once(&binding.key).chain(binding.meta_annotations.iter());
                for key in keys {
                    if let Some(annotation_rules) = self.by_annotation.get(key) {
                        matched = true;
                        for rule in annotation_rules {
                            push_unique(&mut rules, rule);
                        }
                    }
                }
                if !matched {
                    if let (Some(fallback), Some(prefix)) = (&self.fallback, &self.fallback_prefix) {
                        if binding.key.starts_with(prefix.as_str()) {
                            push_unique(&mut rules, fallback);
                        }
                    }
                }
            }
        }
        rules
    }
}

fn push_unique(rules: &mut Vec<Arc<dyn SymbolExtractor>>, rule: &Arc<dyn SymbolExtractor>) {
    if !rules.iter().any(|r| Arc::ptr_eq(r, rule)) {
        rules.push(Arc::clone(rule));
    }
}

/// `@Name` symbol for framework annotations nobody registered a rule for.
pub struct DefaultSymbolRule;

impl SymbolExtractor for DefaultSymbolRule {
    fn name(&self) -> &str {
        "default-annotation"
    }

    fn extract(
        &self,
        node: &dyn SyntaxNode,
        _binding: Option<&Binding>,
        cx: &mut ExtractionContext<'_>,
    ) -> Result<()> {
        let name = match node.parent_name() {
            Some(parent) => format!("@{} on {}", node.name(), parent),
            None => format!("@{}", node.name()),
        };
        let uri = cx.doc().uri.clone();
        cx.add_symbol(CachedSymbol {
            doc_uri: uri,
            name,
            kind: SymbolKind::Annotation,
            range: node.range(),
            container: node.parent_name().map(str::to_string),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanscan_core::testing::{ComponentRule, InjectionRule, COMPONENT, SERVICE};
    use beanscan_core::{BindingKind, Range};

    struct Node {
        kind: NodeKind,
        name: &'static str,
    }

    impl SyntaxNode for Node {
        fn kind(&self) -> NodeKind {
            self.kind
        }
        fn name(&self) -> &str {
            self.name
        }
        fn range(&self) -> Range {
            Range::line(0, 0, 1)
        }
        fn resolve_binding(&self) -> Option<Binding> {
            None
        }
        fn parent_name(&self) -> Option<&str> {
            Some("com.example.Foo")
        }
    }

    fn annotation(key: &str, meta: &[&str]) -> Binding {
        Binding {
            key: key.to_string(),
            kind: BindingKind::Annotation,
            from_source: false,
            meta_annotations: meta.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn registry() -> ExtractorRegistry {
        let mut registry =
            ExtractorRegistry::new().with_default_symbols(Some("org.springframework".to_string()));
        registry.register_annotation(COMPONENT, Arc::new(ComponentRule));
        registry.register_kind(NodeKind::FieldDeclaration, Arc::new(InjectionRule));
        registry
    }

    #[test]
    fn meta_annotations_dispatch_once() {
        let registry = registry();
        let node = Node {
            kind: NodeKind::Annotation,
            name: "Service",
        };
        let binding = annotation(SERVICE, &[COMPONENT, COMPONENT]);
        let rules = registry.resolve(&node, Some(&binding));
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name(), "component");
    }

    #[test]
    fn unregistered_framework_annotation_uses_default_rule() {
        let registry = registry();
        let node = Node {
            kind: NodeKind::Annotation,
            name: "Transactional",
        };
        let binding = annotation("org.springframework.transaction.annotation.Transactional", &[]);
        let rules = registry.resolve(&node, Some(&binding));
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name(), "default-annotation");

        let foreign = annotation("lombok.Data", &[]);
        assert!(registry.resolve(&node, Some(&foreign)).is_empty());
        assert!(registry.resolve(&node, None).is_empty());
    }

    #[test]
    fn node_kind_rules_apply_without_binding() {
        let registry = registry();
        let node = Node {
            kind: NodeKind::FieldDeclaration,
            name: "repo",
        };
        let rules = registry.resolve(&node, None);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name(), "injection-point");
        assert_eq!(registry.rule_count(), 2);
    }
}
