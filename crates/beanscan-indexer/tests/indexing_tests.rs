use beanscan_cache::{AstCache, InMemoryIndexCache, IndexCache, NoopIndexCache, ProjectEnvironmentCache};
use beanscan_core::testing::{
    toy_project, toy_uri, ComponentRule, InjectionRule, RecordingSymbolStore, ReferenceRule,
    StaticContents, StoreOp, ToyFrontend, ToyReconciler, COMPONENT,
};
use beanscan_core::{
    AstCacheConfig, DocumentDescriptor, IndexRecord, IndexingConfig, NodeKind, Project,
    SymbolKind,
};
use beanscan_indexer::{ExtractorRegistry, IndexerContext, ProjectFiles, SymbolIndexer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

struct Fixture {
    frontend: Arc<ToyFrontend>,
    contents: Arc<StaticContents>,
    store: Arc<RecordingSymbolStore>,
    cache: Arc<dyn IndexCache>,
    indexer: SymbolIndexer,
    project: Project,
}

fn registry() -> ExtractorRegistry {
    let mut registry =
        ExtractorRegistry::new().with_default_symbols(Some("org.springframework".to_string()));
    registry.register_annotation(COMPONENT, Arc::new(ComponentRule));
    registry.register_kind(NodeKind::FieldDeclaration, Arc::new(InjectionRule));
    registry.register_kind(NodeKind::TypeReference, Arc::new(ReferenceRule));
    registry
}

fn indexer(
    frontend: &Arc<ToyFrontend>,
    contents: &Arc<StaticContents>,
    store: &Arc<RecordingSymbolStore>,
    cache: &Arc<dyn IndexCache>,
    config: IndexingConfig,
) -> SymbolIndexer {
    let environments = Arc::new(ProjectEnvironmentCache::new(frontend.clone()));
    let ast_cache = Arc::new(AstCache::new(
        frontend.clone(),
        environments.clone(),
        contents.clone(),
        &AstCacheConfig::default(),
    ));
    let context = IndexerContext {
        frontend: frontend.clone(),
        environments,
        ast_cache,
        contents: contents.clone(),
        index_cache: cache.clone(),
        store: store.clone(),
    };
    let files = ProjectFiles::new(&["**/*.java".to_string()]).unwrap();
    SymbolIndexer::new(config, context, files, registry(), vec![Arc::new(ToyReconciler)]).unwrap()
}

fn fixture_with(config: IndexingConfig, cache: Arc<dyn IndexCache>) -> Fixture {
    let frontend = Arc::new(ToyFrontend::new());
    let contents = Arc::new(StaticContents::new());
    let store = Arc::new(RecordingSymbolStore::new());
    let indexer = indexer(&frontend, &contents, &store, &cache, config);
    Fixture {
        frontend,
        contents,
        store,
        cache,
        indexer,
        project: toy_project("demo"),
    }
}

fn fixture() -> Fixture {
    fixture_with(
        IndexingConfig {
            parse_threads: 2,
            ..Default::default()
        },
        Arc::new(InMemoryIndexCache::new()),
    )
}

impl Fixture {
    fn file(&self, name: &str, text: &str, ts: i64) -> DocumentDescriptor {
        self.contents.set(&toy_uri("demo", name), text, ts)
    }
}

fn edges(entries: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
    entries
        .iter()
        .map(|(file, types)| {
            (
                toy_uri("demo", file),
                types.iter().map(|t| t.to_string()).collect(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_full_index_publishes_once_and_restores_from_cache() {
    let fx = fixture();
    let counters = fx.frontend.counters();
    let files = vec![
        fx.file("A.java", "@org.springframework.stereotype.Component\ntype demo.A", 1),
        fx.file("B.java", "@org.springframework.stereotype.Service\ntype demo.B", 1),
        fx.file("C.java", "type demo.C", 1),
    ];

    let outcome = fx
        .indexer
        .initialize_project(&fx.project, files.clone())
        .await
        .unwrap();
    assert_eq!(outcome.scanned, 3);
    assert!(!outcome.from_cache);
    assert_eq!(
        fx.store.ops(),
        vec![StoreOp::Added {
            project: "demo".to_string(),
            files: files.iter().map(|f| f.uri.clone()).collect(),
        }]
    );
    // @Service reaches the component rule through its meta-annotation
    let beans: Vec<String> = fx
        .store
        .snapshot()
        .values()
        .flatten()
        .filter_map(|r| match r {
            IndexRecord::Bean(bean) => Some(bean.name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(beans, vec!["a".to_string(), "b".to_string()]);
    let parses = counters.parses();

    let before = fx.store.snapshot();
    let outcome = fx.indexer.initialize_project(&fx.project, files).await.unwrap();
    assert!(outcome.from_cache);
    assert_eq!(counters.parses(), parses);
    assert_eq!(fx.store.snapshot(), before);
}

#[tokio::test]
async fn test_reindex_without_cache_is_idempotent() {
    let fx = fixture_with(IndexingConfig::default(), Arc::new(NoopIndexCache));
    let files = vec![
        fx.file("A.java", "@org.springframework.stereotype.Component\ntype demo.A\nfield b demo.B", 1),
        fx.file("B.java", "type demo.B\nuses ?Missing", 1),
    ];

    fx.indexer
        .initialize_project(&fx.project, files.clone())
        .await
        .unwrap();
    let first = fx.store.snapshot();
    let first_diagnostics = fx.store.diagnostics_for(&files[1].uri);

    let outcome = fx.indexer.initialize_project(&fx.project, files.clone()).await.unwrap();
    assert!(!outcome.from_cache);
    assert_eq!(fx.store.snapshot(), first);
    assert_eq!(fx.store.diagnostics_for(&files[1].uri), first_diagnostics);
    assert_eq!(first_diagnostics.len(), 1);
}

#[tokio::test]
async fn test_defining_a_referenced_type_rescans_dependents() {
    let fx = fixture();
    let b = fx.file("B.java", "type demo.B\nfield x demo.X", 1);

    fx.indexer
        .initialize_project(&fx.project, vec![b.clone()])
        .await
        .unwrap();
    assert_eq!(fx.indexer.dependencies("demo"), edges(&[("B.java", &["demo.X"])]));

    fx.store.clear_ops();
    let a = fx.file("A.java", "type demo.X", 1);
    let outcome = fx.indexer.update_file(&fx.project, a.clone()).await.unwrap();

    assert_eq!(outcome.scanned, 1);
    assert_eq!(outcome.rescanned, 1);
    assert!(fx.indexer.dependencies("demo").is_empty());
    assert_eq!(
        fx.store.ops(),
        vec![
            StoreOp::Removed {
                project: "demo".to_string(),
                uri: a.uri.clone()
            },
            StoreOp::Added {
                project: "demo".to_string(),
                files: vec![a.uri.clone()]
            },
            StoreOp::Removed {
                project: "demo".to_string(),
                uri: b.uri.clone()
            },
            StoreOp::Added {
                project: "demo".to_string(),
                files: vec![b.uri.clone()]
            },
        ]
    );

    // the pruned edge no longer fans out
    fx.store.clear_ops();
    let a2 = fx.file("A.java", "type demo.X\nmethod run", 2);
    fx.indexer.context().ast_cache.invalidate(&a2.uri);
    let outcome = fx.indexer.update_file(&fx.project, a2).await.unwrap();
    assert_eq!(outcome.rescanned, 0);
    assert_eq!(fx.store.ops().len(), 2);
}

#[tokio::test]
async fn test_dependency_edges_are_replaced_on_rescan() {
    let fx = fixture();
    let b = fx.file("B.java", "type demo.B\nfield x demo.X\nuses demo.Z", 1);
    fx.indexer
        .initialize_project(&fx.project, vec![b])
        .await
        .unwrap();
    assert_eq!(
        fx.indexer.dependencies("demo"),
        edges(&[("B.java", &["demo.X", "demo.Z"])])
    );

    let b2 = fx.file("B.java", "type demo.B\nfield y demo.Y", 2);
    fx.indexer.update_file(&fx.project, b2.clone()).await.unwrap();
    assert_eq!(fx.indexer.dependencies("demo"), edges(&[("B.java", &["demo.Y"])]));

    let key = fx.indexer.cache_key(&fx.project);
    let cached = fx.cache.retrieve(&key, &[b2]).await.unwrap().unwrap();
    assert_eq!(cached.dependencies, edges(&[("B.java", &["demo.Y"])]));
}

#[tokio::test]
async fn test_unchanged_timestamp_skips_update() {
    let fx = fixture();
    let counters = fx.frontend.counters();
    let a = fx.file("A.java", "type demo.A", 5);
    fx.indexer
        .initialize_project(&fx.project, vec![a.clone()])
        .await
        .unwrap();
    let parses = counters.parses();
    fx.store.clear_ops();

    let outcome = fx.indexer.update_file(&fx.project, a.clone()).await.unwrap();
    assert!(outcome.skipped);
    assert_eq!(counters.parses(), parses);
    assert!(fx.store.ops().is_empty());

    let outcome = fx
        .indexer
        .update_files(&fx.project, vec![a])
        .await
        .unwrap();
    assert!(outcome.skipped);
}

#[tokio::test]
async fn test_crashing_chunk_publishes_nothing() {
    let fx = fixture_with(
        IndexingConfig {
            chunk_size: 1,
            parse_threads: 2,
            ..Default::default()
        },
        Arc::new(InMemoryIndexCache::new()),
    );
    let files = vec![
        fx.file("A.java", "type demo.A", 1),
        fx.file("B.java", "!panic", 1),
        fx.file("C.java", "type demo.C", 1),
    ];

    let result = fx.indexer.initialize_project(&fx.project, files.clone()).await;
    assert!(result.is_err());
    assert!(fx.store.ops().is_empty());

    let key = fx.indexer.cache_key(&fx.project);
    assert!(fx.cache.retrieve(&key, &files).await.unwrap().is_none());
}

#[tokio::test]
async fn test_second_pass_only_for_files_that_need_bodies() {
    let fx = fixture();
    let counters = fx.frontend.counters();
    let config = fx.file(
        "Config.java",
        "type demo.Config\n@org.springframework.context.annotation.Bean\nmethod repo",
        1,
    );
    let plain = fx.file("Plain.java", "type demo.Plain\nuses ?Missing", 1);

    let outcome = fx
        .indexer
        .initialize_project(&fx.project, vec![config.clone(), plain.clone()])
        .await
        .unwrap();
    assert_eq!(outcome.pass_two, 1);
    assert_eq!(counters.full_parses(), 1);
    assert_eq!(counters.parses(), 3);

    let hints = fx.store.diagnostics_for(&config.uri);
    assert_eq!(hints.len(), 1);
    assert_eq!(hints[0].code, "bean-method");
    assert_eq!(fx.store.diagnostics_for(&plain.uri)[0].code, "unresolved-type");

    // framework annotation without a rule gets a default symbol
    assert!(fx.store.records_for(&config.uri).iter().any(|r| matches!(
        r,
        IndexRecord::Symbol(s) if s.kind == SymbolKind::Annotation && s.name == "@Bean on repo"
    )));
}

#[tokio::test]
async fn test_chunks_share_one_environment_and_one_publication() {
    let fx = fixture_with(
        IndexingConfig {
            chunk_size: 2,
            parse_threads: 2,
            ..Default::default()
        },
        Arc::new(InMemoryIndexCache::new()),
    );
    let counters = fx.frontend.counters();
    let files: Vec<DocumentDescriptor> = (0..5)
        .map(|i| fx.file(&format!("F{}.java", i), &format!("type demo.F{}", i), 1))
        .collect();

    let outcome = fx.indexer.initialize_project(&fx.project, files).await.unwrap();
    assert_eq!(outcome.scanned, 5);
    assert_eq!(counters.built(), 1);
    let added: Vec<usize> = fx
        .store
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            StoreOp::Added { files, .. } => Some(files.len()),
            _ => None,
        })
        .collect();
    assert_eq!(added, vec![5]);
}

#[tokio::test]
async fn test_removed_file_disappears_everywhere() {
    let fx = fixture();
    let a = fx.file("A.java", "type demo.A", 1);
    let b = fx.file("B.java", "type demo.B\nfield x demo.X", 1);
    fx.indexer
        .initialize_project(&fx.project, vec![a.clone(), b.clone()])
        .await
        .unwrap();
    assert!(fx.store.has_document(&b.uri));

    fx.indexer.remove_file(&fx.project, &b.uri).await.unwrap();
    assert!(!fx.store.has_document(&b.uri));
    assert!(fx.indexer.dependencies("demo").is_empty());
    let key = fx.indexer.cache_key(&fx.project);
    assert_eq!(fx.cache.modification_timestamp(&key, &b.uri).await, None);
    assert!(fx.cache.retrieve(&key, &[a]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_vanished_dependent_is_removed_from_store_and_cache() {
    let fx = fixture();
    let b = fx.file("B.java", "type demo.B\nfield x demo.X", 1);
    fx.indexer
        .initialize_project(&fx.project, vec![b.clone()])
        .await
        .unwrap();
    assert!(fx.store.has_document(&b.uri));

    fx.contents.remove(&b.uri);
    let a = fx.file("A.java", "type demo.X", 1);
    let outcome = fx.indexer.update_file(&fx.project, a.clone()).await.unwrap();

    assert_eq!(outcome.rescanned, 0);
    assert!(!fx.store.has_document(&b.uri));
    assert!(fx.store.has_document(&a.uri));
    assert!(fx.indexer.dependencies("demo").is_empty());
    let key = fx.indexer.cache_key(&fx.project);
    assert_eq!(fx.cache.modification_timestamp(&key, &b.uri).await, None);
    assert_eq!(fx.cache.modification_timestamp(&key, &a.uri).await, Some(1));
}

#[tokio::test]
async fn test_cache_hit_restores_dependency_edges() {
    let frontend = Arc::new(ToyFrontend::new());
    let contents = Arc::new(StaticContents::new());
    let store = Arc::new(RecordingSymbolStore::new());
    let cache: Arc<dyn IndexCache> = Arc::new(InMemoryIndexCache::new());
    let project = toy_project("demo");
    let b = contents.set(&toy_uri("demo", "B.java"), "type demo.B\nfield x demo.X", 1);

    let first = indexer(&frontend, &contents, &store, &cache, IndexingConfig::default());
    first
        .initialize_project(&project, vec![b.clone()])
        .await
        .unwrap();

    let restarted = indexer(&frontend, &contents, &store, &cache, IndexingConfig::default());
    let outcome = restarted
        .initialize_project(&project, vec![b.clone()])
        .await
        .unwrap();
    assert!(outcome.from_cache);
    assert_eq!(restarted.dependencies("demo"), edges(&[("B.java", &["demo.X"])]));

    let a = contents.set(&toy_uri("demo", "A.java"), "type demo.X", 1);
    let outcome = restarted.update_file(&project, a).await.unwrap();
    assert_eq!(outcome.rescanned, 1);
}

#[tokio::test]
async fn test_unreadable_document_is_indexed_empty() {
    let fx = fixture();
    let a = fx.file("A.java", "type demo.A", 1);
    let gone = DocumentDescriptor::new(toy_uri("demo", "Gone.java"), 1);
    let broken = fx.file("Broken.java", "!parse-error", 1);

    let outcome = fx
        .indexer
        .initialize_project(&fx.project, vec![a, gone.clone(), broken.clone()])
        .await
        .unwrap();
    assert_eq!(outcome.scanned, 3);
    assert!(fx.store.records_for(&gone.uri).is_empty());
    assert!(fx.store.has_document(&broken.uri));
}

#[tokio::test]
async fn test_removed_project_forgets_everything() {
    let fx = fixture();
    let b = fx.file("B.java", "type demo.B\nfield x demo.X", 1);
    fx.indexer
        .initialize_project(&fx.project, vec![b.clone()])
        .await
        .unwrap();

    fx.indexer.remove_project(&fx.project).await.unwrap();
    assert!(fx.indexer.dependencies("demo").is_empty());
    assert!(fx.store.snapshot().is_empty());
    let key = fx.indexer.cache_key(&fx.project);
    assert!(fx.cache.retrieve(&key, &[b]).await.unwrap().is_none());
}
