use beanscan_core::testing::{
    ComponentRule, InjectionRule, RecordingSymbolStore, ReferenceRule, ToyFrontend, ToyReconciler,
    COMPONENT,
};
use beanscan_core::{
    uri_for_path, CacheBackend, ClasspathEntry, FileChangeKind, IndexEvent, IndexRecord,
    IndexerConfig, NodeKind, Project, SymbolKind,
};
use beanscan_indexer::{IndexService, ProjectIndexer};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Workspace {
    _dir: TempDir,
    root: PathBuf,
    frontend: Arc<ToyFrontend>,
    store: Arc<RecordingSymbolStore>,
    service: Arc<IndexService>,
    project: Project,
}

fn config() -> IndexerConfig {
    let mut config = IndexerConfig::default();
    config.cache.backend = CacheBackend::Memory;
    config.indexing.parse_threads = 2;
    config.environment.output_debounce_ms = 100;
    config
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("demo");
        fs::create_dir_all(root.join("src/main/java/demo")).unwrap();
        fs::create_dir_all(root.join("src/main/resources/META-INF")).unwrap();
        fs::create_dir_all(root.join("src/test/java/demo")).unwrap();
        fs::create_dir_all(root.join("target/classes/demo")).unwrap();
        let project = Project::new("demo", &root).with_classpath(vec![
            ClasspathEntry::source(root.join("src/main/java")),
            ClasspathEntry::source(root.join("src/main/resources")),
            ClasspathEntry::source(root.join("src/test/java")).for_tests(),
            ClasspathEntry::output(root.join("target/classes")),
        ]);

        let frontend = Arc::new(ToyFrontend::new());
        let store = Arc::new(RecordingSymbolStore::new());
        let service = IndexService::builder(config(), frontend.clone(), store.clone())
            .annotation_rule(COMPONENT, Arc::new(ComponentRule))
            .node_rule(NodeKind::FieldDeclaration, Arc::new(InjectionRule))
            .node_rule(NodeKind::TypeReference, Arc::new(ReferenceRule))
            .reconciler(Arc::new(ToyReconciler))
            .build()
            .unwrap();

        Self {
            _dir: dir,
            root,
            frontend,
            store,
            service,
            project,
        }
    }

    fn source(&self, name: &str) -> PathBuf {
        self.root.join("src/main/java/demo").join(name)
    }

    fn write_source(&self, name: &str, text: &str) -> String {
        let path = self.source(name);
        fs::write(&path, text).unwrap();
        uri_for_path(&path)
    }

    fn factories(&self) -> PathBuf {
        self.root.join("src/main/resources/META-INF/spring.factories")
    }

    fn write_factories(&self, text: &str) -> String {
        fs::write(self.factories(), text).unwrap();
        uri_for_path(&self.factories())
    }

    fn write_test_source(&self, name: &str, text: &str) -> (PathBuf, String) {
        let path = self.root.join("src/test/java/demo").join(name);
        fs::write(&path, text).unwrap();
        let uri = uri_for_path(&path);
        (path, uri)
    }

    async fn create(&self) {
        self.service
            .dispatch(IndexEvent::ProjectCreated(self.project.clone()))
            .await
            .unwrap();
        self.service.wait_for_queued().await.unwrap();
    }

    async fn change(&self, path: &Path, kind: FileChangeKind) {
        self.service
            .dispatch(IndexEvent::FileChanged {
                uri: uri_for_path(path),
                kind,
            })
            .await
            .unwrap();
    }
}

fn bean_names(records: &[IndexRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| match r {
            IndexRecord::Bean(bean) => Some(bean.name.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_created_project_is_indexed() {
    let ws = Workspace::new();
    let uri = ws.write_source("A.java", "@org.springframework.stereotype.Component\ntype demo.A");
    ws.create().await;

    assert_eq!(bean_names(&ws.store.records_for(&uri)), vec!["a".to_string()]);
    let stats = ws.service.stats();
    assert_eq!(stats.initializations, 1);
    assert_eq!(stats.cache_restores, 0);
    assert_eq!(stats.failures, 0);
    assert_eq!(ws.service.projects(), vec!["demo".to_string()]);
}

#[tokio::test]
async fn test_source_files_are_added_and_removed() {
    let ws = Workspace::new();
    ws.write_source("A.java", "type demo.A");
    ws.create().await;

    let b = ws.write_source("B.java", "@org.springframework.stereotype.Service\ntype demo.B");
    ws.change(&ws.source("B.java"), FileChangeKind::Created).await;
    ws.service.wait_for_queued().await.unwrap();
    assert_eq!(bean_names(&ws.store.records_for(&b)), vec!["b".to_string()]);

    fs::remove_file(ws.source("B.java")).unwrap();
    ws.change(&ws.source("B.java"), FileChangeKind::Deleted).await;
    ws.service.wait_for_queued().await.unwrap();
    assert!(!ws.store.has_document(&b));

    let stats = ws.service.stats();
    assert_eq!(stats.file_updates, 1);
    assert_eq!(stats.file_removals, 1);
}

#[tokio::test]
async fn test_editor_snapshot_is_indexed_instead_of_disk() {
    let ws = Workspace::new();
    let uri = ws.write_source("A.java", "type demo.A");
    ws.create().await;

    ws.service.open_document(&uri, "type demo.A", 1);
    ws.service
        .change_document(&uri, "type demo.A\nfield repo demo.Repo", i64::MAX)
        .await
        .unwrap();
    ws.service.wait_for_queued().await.unwrap();

    assert!(ws.store.records_for(&uri).iter().any(|r| matches!(
        r,
        IndexRecord::Symbol(s) if s.kind == SymbolKind::InjectionPoint
    )));
    assert!(ws.service.indexer().dependencies("demo").contains_key(&uri));

    ws.service.close_document(&uri).await.unwrap();
    assert!(!ws.service.contents().is_open(&uri));
}

#[tokio::test]
async fn test_output_burst_triggers_one_revalidation() {
    let ws = Workspace::new();
    ws.write_source("A.java", "type demo.A");
    ws.create().await;
    let counters = ws.frontend.counters();
    assert_eq!(counters.built(), 1);

    let class_file = ws.root.join("target/classes/demo/A.class");
    ws.change(&class_file, FileChangeKind::Modified).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    ws.change(&class_file, FileChangeKind::Modified).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    ws.service.wait_for_queued().await.unwrap();

    let stats = ws.service.stats();
    assert_eq!(stats.revalidations, 1);
    assert_eq!(stats.initializations, 2);
    // one restore per indexer
    assert_eq!(stats.cache_restores, 2);
    assert_eq!(counters.released(), 1);
}

#[tokio::test]
async fn test_changes_outside_projects_are_ignored() {
    let ws = Workspace::new();
    ws.write_source("A.java", "type demo.A");
    ws.create().await;

    ws.change(Path::new("/elsewhere/src/X.java"), FileChangeKind::Modified)
        .await;
    ws.change(&ws.root.join("README.md"), FileChangeKind::Modified)
        .await;
    ws.service.wait_for_queued().await.unwrap();

    let stats = ws.service.stats();
    assert_eq!(stats.file_updates, 0);
    assert_eq!(stats.revalidations, 0);
}

#[tokio::test]
async fn test_deleted_project_is_forgotten() {
    let ws = Workspace::new();
    ws.write_source("A.java", "@org.springframework.stereotype.Component\ntype demo.A");
    ws.create().await;
    assert!(!ws.store.snapshot().is_empty());

    ws.service
        .dispatch(IndexEvent::ProjectDeleted(ws.project.clone()))
        .await
        .unwrap();
    ws.service.wait_for_queued().await.unwrap();

    assert!(ws.store.snapshot().is_empty());
    assert!(ws.service.projects().is_empty());
    assert_eq!(ws.frontend.counters().released(), 1);
}

#[tokio::test]
async fn test_shutdown_releases_environments() {
    let ws = Workspace::new();
    ws.write_source("A.java", "type demo.A");
    ws.create().await;

    ws.service.shutdown().await;
    assert_eq!(ws.frontend.counters().released(), 1);
    assert_eq!(ws.service.stats().environments.live, 0);
}

#[tokio::test]
async fn test_factories_file_is_indexed_in_its_own_cache_slot() {
    let ws = Workspace::new();
    let source = ws.write_source("A.java", "@org.springframework.stereotype.Component\ntype demo.A");
    let factories = ws.write_factories(
        "org.springframework.aot.hint.RuntimeHintsRegistrar=demo.DemoHints\n",
    );
    ws.create().await;

    let ids: Vec<&str> = ws.service.indexers().iter().map(|i| i.id()).collect();
    assert_eq!(ids, vec!["java", "factories"]);
    let keys: Vec<_> = ws
        .service
        .indexers()
        .iter()
        .map(|i| i.cache_key(&ws.project))
        .collect();
    assert_ne!(keys[0], keys[1]);

    assert_eq!(bean_names(&ws.store.records_for(&source)), vec!["a".to_string()]);
    assert_eq!(bean_names(&ws.store.records_for(&factories)), vec!["demoHints".to_string()]);

    // editing the factories file only reaches the factories indexer
    tokio::time::sleep(Duration::from_millis(20)).await;
    ws.write_factories(
        "org.springframework.aot.hint.RuntimeHintsRegistrar=demo.DemoHints,demo.OtherHints\n",
    );
    ws.change(&ws.factories(), FileChangeKind::Modified).await;
    ws.service.wait_for_queued().await.unwrap();
    assert_eq!(ws.service.stats().file_updates, 1);
    assert_eq!(
        bean_names(&ws.store.records_for(&factories)),
        vec!["demoHints".to_string(), "otherHints".to_string()]
    );
    assert_eq!(bean_names(&ws.store.records_for(&source)), vec!["a".to_string()]);

    // both slots still answer a revalidation on their own
    let parses = ws.frontend.counters().parses();
    ws.change(&ws.root.join("target/classes/demo/A.class"), FileChangeKind::Modified)
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    ws.service.wait_for_queued().await.unwrap();

    let stats = ws.service.stats();
    assert_eq!(stats.revalidations, 1);
    assert_eq!(stats.cache_restores, 2);
    assert_eq!(ws.frontend.counters().parses(), parses);
    assert_eq!(
        bean_names(&ws.store.records_for(&factories)),
        vec!["demoHints".to_string(), "otherHints".to_string()]
    );
    assert_eq!(bean_names(&ws.store.records_for(&source)), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_toggling_test_sources_adds_and_removes_test_files() {
    let ws = Workspace::new();
    ws.write_source("A.java", "type demo.A");
    let (path, uri) = ws.write_test_source(
        "ATest.java",
        "@org.springframework.stereotype.Component\ntype demo.ATest",
    );
    ws.create().await;
    assert!(!ws.service.scan_test_sources());
    assert!(!ws.store.has_document(&uri));

    ws.service.set_scan_test_sources(true);
    ws.service.wait_for_queued().await.unwrap();
    assert!(ws.service.scan_test_sources());
    assert!(ws.store.has_document(&uri));
    assert_eq!(bean_names(&ws.store.records_for(&uri)).len(), 1);
    assert_eq!(ws.service.stats().file_updates, 1);

    // setting the same value again queues nothing
    ws.service.set_scan_test_sources(true);
    ws.service.wait_for_queued().await.unwrap();
    assert_eq!(ws.service.stats().file_updates, 1);

    ws.service.set_scan_test_sources(false);
    ws.service.wait_for_queued().await.unwrap();
    assert!(!ws.store.has_document(&uri));
    assert_eq!(ws.service.stats().file_removals, 1);

    // changes below a test root are ignored again
    ws.change(&path, FileChangeKind::Modified).await;
    ws.service.wait_for_queued().await.unwrap();
    assert_eq!(ws.service.stats().file_updates, 1);
    assert!(!ws.store.has_document(&uri));
}
