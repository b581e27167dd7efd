use std::path::{Path, PathBuf};
use std::time::Duration;

use arca_core::document::DocumentFields;
use arca_core::{IndexableDocument, NamespacedResource, ResourceKey};
use arca_search::{BulkItem, SearchBackend, SearchError, SearchOptions};
use tokio_util::sync::CancellationToken;

fn shard() -> NamespacedResource {
    NamespacedResource::new("default", "dashboard.arca.dev", "dashboards")
}

fn doc(name: &str, rv: i64) -> IndexableDocument {
    IndexableDocument::new(ResourceKey::new("dashboard.arca.dev", "dashboards", "default", name), rv, name)
        .with_folder(if name < "m" { "early" } else { "late" })
}

fn docs(n: usize) -> Vec<IndexableDocument> {
    (0..n).map(|i| doc(&format!("d{i:03}"), i as i64 + 1)).collect()
}

fn backend(root: &Path, file_threshold: usize, ttl: Duration) -> SearchBackend {
    SearchBackend::new(SearchOptions { root: root.to_path_buf(), file_threshold, batch_size: 2, index_cache_ttl: ttl })
        .unwrap()
}

fn shard_dir(root: &Path) -> PathBuf {
    root.join("default").join("dashboard.arca.dev").join("dashboards")
}

fn index_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(shard_dir(root)) else { return Vec::new() };
    let mut dirs: Vec<PathBuf> = entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect();
    dirs.sort();
    dirs
}

fn build_n(b: &SearchBackend, n: usize, rv: i64) -> arca_search::SearchResult<std::sync::Arc<arca_search::ShardIndex>> {
    let all = docs(n);
    b.build_index(&CancellationToken::new(), &shard(), n, 0, DocumentFields::default(), |w| {
        for d in &all {
            w.index(d)?;
        }
        Ok(rv)
    })
}

#[test]
fn small_shards_stay_in_memory() {
    let root = tempfile::tempdir().unwrap();
    let b = backend(root.path(), 5, Duration::ZERO);
    let idx = build_n(&b, 3, 7).unwrap();
    assert!(!idx.is_file());
    assert_eq!(idx.rv(), 7);
    assert!(index_dirs(root.path()).is_empty());
    assert!(b.get_index(&shard()).is_some());
}

#[test]
fn large_shards_go_to_disk() {
    let root = tempfile::tempdir().unwrap();
    let b = backend(root.path(), 5, Duration::ZERO);
    let idx = build_n(&b, 5, 9).unwrap();
    assert!(idx.is_file());
    let dirs = index_dirs(root.path());
    assert_eq!(dirs.len(), 1);
    assert!(dirs[0].join("index.json").exists());
    assert_eq!(idx.storage().dir(), Some(dirs[0].as_path()));
    assert_eq!(idx.doc_count(&CancellationToken::new(), "").unwrap(), 5);
}

#[test]
fn zero_threshold_keeps_everything_in_memory() {
    let root = tempfile::tempdir().unwrap();
    let b = backend(root.path(), 0, Duration::ZERO);
    assert!(!build_n(&b, 50, 1).unwrap().is_file());
}

#[test]
fn a_complete_previous_index_is_reopened() {
    let root = tempfile::tempdir().unwrap();
    let first = backend(root.path(), 5, Duration::ZERO);
    build_n(&first, 5, 50).unwrap();
    first.close();

    let second = backend(root.path(), 5, Duration::ZERO);
    let idx = second
        .build_index(&CancellationToken::new(), &shard(), 5, 50, DocumentFields::default(), |_| {
            Err(SearchError::Internal("builder must not run".into()))
        })
        .unwrap();
    assert_eq!((idx.rv(), idx.doc_count(&CancellationToken::new(), "").unwrap()), (50, 5));
    second.close();

    // a newer RV forces a rebuild
    let third = backend(root.path(), 5, Duration::ZERO);
    let mut ran = false;
    let idx = third
        .build_index(&CancellationToken::new(), &shard(), 5, 51, DocumentFields::default(), |w| {
            ran = true;
            for d in docs(5) {
                w.index(&d)?;
            }
            Ok(60)
        })
        .unwrap();
    assert!(ran);
    assert_eq!(idx.rv(), 60);
    assert_eq!(index_dirs(root.path()).len(), 1);
}

#[test]
fn rebuilding_replaces_and_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let b = backend(root.path(), 5, Duration::ZERO);
    let old = build_n(&b, 5, 1).unwrap();
    let new = build_n(&b, 6, 2).unwrap();
    assert_ne!(old.storage().dir(), new.storage().dir());
    assert_eq!(index_dirs(root.path()), vec![new.storage().dir().unwrap().to_path_buf()]);
    assert_eq!(b.get_index(&shard()).unwrap().rv(), 2);
    // readers holding the old index still see its content
    assert_eq!(old.doc_count(&CancellationToken::new(), "").unwrap(), 5);
}

#[test]
fn failed_builds_leave_nothing_behind() {
    let root = tempfile::tempdir().unwrap();
    let b = backend(root.path(), 1, Duration::ZERO);
    let err = b
        .build_index(&CancellationToken::new(), &shard(), 3, 0, DocumentFields::default(), |_| {
            Err(SearchError::Internal("boom".into()))
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert!(index_dirs(root.path()).is_empty());
    assert!(b.get_index(&shard()).is_none());
}

#[test]
fn batches_flush_in_steps() {
    let root = tempfile::tempdir().unwrap();
    let b = backend(root.path(), 0, Duration::ZERO);
    let mut seen = Vec::new();
    b.build_index(&CancellationToken::new(), &shard(), 3, 0, DocumentFields::default(), |w| {
        for d in docs(3) {
            w.index(&d)?;
            seen.push(w.doc_count());
        }
        Ok(3)
    })
    .unwrap();
    assert_eq!(seen, vec![0, 2, 2]);
    assert_eq!(b.get_index(&shard()).unwrap().doc_count(&CancellationToken::new(), "").unwrap(), 3);
}

#[test]
fn expired_memory_indexes_are_evicted() {
    let root = tempfile::tempdir().unwrap();
    let b = backend(root.path(), 5, Duration::from_millis(50));
    build_n(&b, 2, 1).unwrap();
    assert!(b.get_index(&shard()).is_some());
    std::thread::sleep(Duration::from_millis(80));
    assert!(b.get_index(&shard()).is_none());
    assert!(b.cached_keys().is_empty());

    // file indexes are kept
    build_n(&b, 5, 1).unwrap();
    std::thread::sleep(Duration::from_millis(80));
    assert!(b.get_index(&shard()).is_some());
}

#[test]
fn bulk_updates_after_publish() {
    let root = tempfile::tempdir().unwrap();
    let b = backend(root.path(), 5, Duration::ZERO);
    let ctx = CancellationToken::new();
    let idx = build_n(&b, 5, 10).unwrap();
    idx.bulk_index(
        &ctx,
        vec![
            BulkItem::Index(doc("zeta", 11)),
            BulkItem::Delete { key: ResourceKey::new("dashboard.arca.dev", "dashboards", "default", "d000"), rv: 12 },
        ],
    )
    .unwrap();
    assert_eq!(idx.doc_count(&ctx, "").unwrap(), 5);
    assert_eq!(idx.doc_count(&ctx, "late").unwrap(), 1);
    assert_eq!(idx.rv(), 12);
    b.close();

    // the change was persisted, so the file index is reused as is
    let again = backend(root.path(), 5, Duration::ZERO);
    let idx = again
        .build_index(&ctx, &shard(), 5, 12, DocumentFields::default(), |_| Err(SearchError::Internal("rebuilt".into())))
        .unwrap();
    assert_eq!(idx.doc_count(&ctx, "late").unwrap(), 1);
}

#[test]
fn root_must_be_a_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();
    let opts = SearchOptions { root: file, file_threshold: 1, batch_size: 1, index_cache_ttl: Duration::ZERO };
    assert!(SearchBackend::new(opts).is_err());

    let nested = tmp.path().join("a").join("b");
    let opts = SearchOptions { root: nested.clone(), file_threshold: 1, batch_size: 1, index_cache_ttl: Duration::ZERO };
    SearchBackend::new(opts).unwrap();
    assert!(nested.is_dir());
}

#[test]
fn cancelled_builds_fail() {
    let root = tempfile::tempdir().unwrap();
    let b = backend(root.path(), 0, Duration::ZERO);
    let ctx = CancellationToken::new();
    ctx.cancel();
    let err = b.build_index(&ctx, &shard(), 1, 0, DocumentFields::default(), |_| Ok(1)).unwrap_err();
    assert!(matches!(err, SearchError::Cancelled));
}
