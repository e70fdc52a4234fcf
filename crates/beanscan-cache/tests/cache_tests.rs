use beanscan_cache::{DiskIndexCache, IndexCache, IndexCacheKey, InMemoryIndexCache, NoopIndexCache};
use beanscan_core::{
    CachedSymbol, DependencyMap, DocumentDescriptor, Fingerprint, IndexRecord, Range, SymbolKind,
};
use std::collections::BTreeSet;
use tempfile::TempDir;

fn key(fingerprint: &str) -> IndexCacheKey {
    IndexCacheKey::new("demo", "java", "symbols", Fingerprint::from_hex(fingerprint))
}

fn doc(name: &str, ts: i64) -> DocumentDescriptor {
    DocumentDescriptor::new(format!("file:///demo/src/{}", name), ts)
}

fn symbol(doc: &DocumentDescriptor, name: &str) -> IndexRecord {
    IndexRecord::Symbol(CachedSymbol {
        doc_uri: doc.uri.clone(),
        name: name.to_string(),
        kind: SymbolKind::Component,
        range: Range::line(1, 0, 10),
        container: None,
    })
}

fn deps(entries: &[(&DocumentDescriptor, &[&str])]) -> DependencyMap {
    entries
        .iter()
        .map(|(doc, types)| {
            (
                doc.uri.clone(),
                types.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            )
        })
        .collect()
}

async fn assert_exact_validity(cache: &dyn IndexCache) {
    let key = key("f1");
    let a = doc("A.java", 10);
    let b = doc("B.java", 20);
    cache
        .store(
            &key,
            &[a.clone(), b.clone()],
            vec![symbol(&a, "a"), symbol(&b, "b")],
            deps(&[(&b, &["X"])]),
        )
        .await
        .unwrap();

    let hit = cache
        .retrieve(&key, &[a.clone(), b.clone()])
        .await
        .unwrap()
        .expect("identical file set must hit");
    assert_eq!(hit.records.len(), 2);
    assert_eq!(hit.dependencies, deps(&[(&b, &["X"])]));

    // modified timestamp
    assert!(cache
        .retrieve(&key, &[a.clone(), doc("B.java", 21)])
        .await
        .unwrap()
        .is_none());
    // removed file
    assert!(cache.retrieve(&key, &[a.clone()]).await.unwrap().is_none());
    // added file
    assert!(cache
        .retrieve(&key, &[a.clone(), b.clone(), doc("C.java", 1)])
        .await
        .unwrap()
        .is_none());
    // other fingerprint
    assert!(cache
        .retrieve(&self::key("f2"), &[a, b])
        .await
        .unwrap()
        .is_none());
}

async fn assert_update_and_removal(cache: &dyn IndexCache) {
    let key = key("f1");
    let a = doc("A.java", 10);
    let b = doc("B.java", 20);
    cache
        .store(
            &key,
            &[a.clone(), b.clone()],
            vec![symbol(&a, "a1"), symbol(&b, "b1")],
            deps(&[(&a, &["Y"])]),
        )
        .await
        .unwrap();

    let a2 = doc("A.java", 11);
    cache
        .update(&key, &a2, vec![symbol(&a2, "a2")], BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(cache.modification_timestamp(&key, &a2.uri).await, Some(11));

    let hit = cache
        .retrieve(&key, &[a2.clone(), b.clone()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hit.records, vec![symbol(&a2, "a2"), symbol(&b, "b1")]);
    assert!(hit.dependencies.is_empty());

    cache.remove_files(&key, &[b.uri.clone()]).await.unwrap();
    assert_eq!(cache.modification_timestamp(&key, &b.uri).await, None);
    let hit = cache.retrieve(&key, &[a2.clone()]).await.unwrap().unwrap();
    assert_eq!(hit.records, vec![symbol(&a2, "a2")]);

    cache.remove(&key).await.unwrap();
    assert!(cache.retrieve(&key, &[a2]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_in_memory_cache_validity_is_exact() {
    assert_exact_validity(&InMemoryIndexCache::new()).await;
}

#[tokio::test]
async fn test_disk_cache_validity_is_exact() {
    let dir = TempDir::new().unwrap();
    assert_exact_validity(&DiskIndexCache::open(dir.path(), 20).unwrap()).await;
}

#[tokio::test]
async fn test_in_memory_cache_update_and_removal() {
    assert_update_and_removal(&InMemoryIndexCache::new()).await;
}

#[tokio::test]
async fn test_disk_cache_update_and_removal() {
    let dir = TempDir::new().unwrap();
    assert_update_and_removal(&DiskIndexCache::open(dir.path(), 20).unwrap()).await;
}

#[tokio::test]
async fn test_disk_cache_survives_restart() {
    let dir = TempDir::new().unwrap();
    let key = key("f1");
    let a = doc("A.java", 10);
    {
        let cache = DiskIndexCache::open(dir.path(), 20).unwrap();
        cache
            .store(&key, &[a.clone()], vec![symbol(&a, "a1")], DependencyMap::new())
            .await
            .unwrap();
        let a2 = doc("A.java", 12);
        cache
            .update(&key, &a2, vec![symbol(&a2, "a2")], BTreeSet::from(["X".to_string()]))
            .await
            .unwrap();
    }

    let reopened = DiskIndexCache::open(dir.path(), 20).unwrap();
    assert_eq!(reopened.modification_timestamp(&key, &a.uri).await, None);

    let a2 = doc("A.java", 12);
    let hit = reopened.retrieve(&key, &[a2.clone()]).await.unwrap().unwrap();
    assert_eq!(hit.records, vec![symbol(&a2, "a2")]);
    assert_eq!(hit.dependencies, deps(&[(&a2, &["X"])]));
    assert_eq!(reopened.modification_timestamp(&key, &a2.uri).await, Some(12));
}

#[tokio::test]
async fn test_disk_cache_deletes_stale_fingerprints() {
    let dir = TempDir::new().unwrap();
    let cache = DiskIndexCache::open(dir.path(), 20).unwrap();
    let a = doc("A.java", 10);
    let other_project =
        IndexCacheKey::new("other", "java", "symbols", Fingerprint::from_hex("f1"));

    cache
        .store(&key("f1"), &[a.clone()], vec![], DependencyMap::new())
        .await
        .unwrap();
    cache
        .store(&other_project, &[a.clone()], vec![], DependencyMap::new())
        .await
        .unwrap();
    cache
        .store(&key("f2"), &[a.clone()], vec![], DependencyMap::new())
        .await
        .unwrap();

    assert!(!dir.path().join(key("f1").file_name()).exists());
    assert!(dir.path().join(key("f2").file_name()).exists());
    assert!(dir.path().join(other_project.file_name()).exists());
}

#[tokio::test]
async fn test_unwritable_directory_is_fatal() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"").unwrap();
    assert!(DiskIndexCache::open(&blocker.join("cache"), 20).is_err());
}

#[tokio::test]
async fn test_noop_cache_never_hits() {
    let cache = NoopIndexCache;
    let a = doc("A.java", 1);
    cache
        .store(&key("f1"), &[a.clone()], vec![], DependencyMap::new())
        .await
        .unwrap();
    assert!(cache.retrieve(&key("f1"), &[a]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_disk_cache_keeps_projects_with_similar_names_apart() {
    let dir = TempDir::new().unwrap();
    let cache = DiskIndexCache::open(dir.path(), 20).unwrap();
    let a = doc("A.java", 10);
    let b = doc("B.java", 20);
    let spaced = IndexCacheKey::new("my app", "java", "symbols", Fingerprint::from_hex("f1"));
    let dashed = IndexCacheKey::new("my-app", "java", "symbols", Fingerprint::from_hex("f2"));

    cache
        .store(&spaced, &[a.clone()], vec![symbol(&a, "a")], DependencyMap::new())
        .await
        .unwrap();
    cache
        .store(&dashed, &[b.clone()], vec![symbol(&b, "b")], DependencyMap::new())
        .await
        .unwrap();
    let underscored = IndexCacheKey::new("my_app", "java", "symbols", Fingerprint::from_hex("f3"));
    cache.remove(&underscored).await.unwrap();

    let reopened = DiskIndexCache::open(dir.path(), 20).unwrap();
    let hit = reopened.retrieve(&spaced, &[a.clone()]).await.unwrap().unwrap();
    assert_eq!(hit.records, vec![symbol(&a, "a")]);
    let hit = reopened.retrieve(&dashed, &[b.clone()]).await.unwrap().unwrap();
    assert_eq!(hit.records, vec![symbol(&b, "b")]);
}
