use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arca_api::IndexController;
use arca_core::columns::{col, ColumnType};
use arca_core::document::{DocumentBuilder, DocumentError, DocumentFields, IndexableDocument, StandardDocumentBuilder};
use arca_core::{NamespacedResource, ResourceKey};
use arca_persist::MemKv;
use arca_search::{SearchBackend, SearchOptions, SearchRequest, SortBy};
use arca_store::{BackendOptions, KvBackend, StorageBackend, WriteEvent};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const GROUP: &str = "playlist.arca.dev";
const RESOURCE: &str = "playlists";

struct Fixture {
    _tmp: tempfile::TempDir,
    storage: Arc<KvBackend>,
    search: Arc<SearchBackend>,
}

fn fixture(file_threshold: usize) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let storage = Arc::new(KvBackend::new(Arc::new(MemKv::new()), BackendOptions::default()).unwrap());
    let search = Arc::new(
        SearchBackend::new(SearchOptions {
            root: tmp.path().to_path_buf(),
            file_threshold,
            batch_size: 2,
            index_cache_ttl: Duration::ZERO,
        })
        .unwrap(),
    );
    Fixture { _tmp: tmp, storage, search }
}

fn controller(f: &Fixture) -> IndexController {
    IndexController::new(f.storage.clone(), f.search.clone())
}

fn key(ns: &str, name: &str) -> ResourceKey {
    ResourceKey::new(GROUP, RESOURCE, ns, name)
}

fn shard(ns: &str) -> NamespacedResource {
    NamespacedResource::new(ns, GROUP, RESOURCE)
}

fn playlist(name: &str, items: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({ "metadata": { "name": name }, "spec": { "title": name, "items": items } })).unwrap()
}

async fn put(f: &Fixture, ns: &str, name: &str, items: i64) -> i64 {
    f.storage.write_event(&CancellationToken::new(), WriteEvent::added(key(ns, name), playlist(name, items))).await.unwrap()
}

#[tokio::test]
async fn rebuild_indexes_one_shard() {
    let f = fixture(0);
    let ctx = CancellationToken::new();
    put(&f, "ns1", "a", 1).await;
    put(&f, "ns1", "b", 2).await;
    let rv = put(&f, "ns2", "c", 3).await;

    let idx = controller(&f).rebuild(&ctx, &shard("ns1")).await.unwrap();
    assert_eq!(idx.doc_count(&ctx, "").unwrap(), 2);
    assert_eq!(idx.rv(), rv);
    assert!(f.search.get_index(&shard("ns1")).is_some());
    assert!(f.search.get_index(&shard("ns2")).is_none());
}

#[tokio::test]
async fn cluster_scoped_shards_skip_namespaced_items() {
    let f = fixture(0);
    let ctx = CancellationToken::new();
    put(&f, "", "global", 1).await;
    put(&f, "ns1", "local", 1).await;
    let idx = controller(&f).rebuild(&ctx, &shard("")).await.unwrap();
    assert_eq!(idx.doc_count(&ctx, "").unwrap(), 1);
}

#[tokio::test]
async fn catch_up_applies_changes_since_the_index_rv() {
    let f = fixture(0);
    let ctx = CancellationToken::new();
    let ctl = controller(&f);
    let rv_a = put(&f, "ns", "a", 1).await;
    put(&f, "ns", "b", 1).await;
    let idx = ctl.index(&ctx, &shard("ns")).await.unwrap();
    assert_eq!(ctl.catch_up(&ctx, &idx).await.unwrap(), 0);

    put(&f, "ns", "c", 1).await;
    let del = f
        .storage
        .write_event(&ctx, WriteEvent::deleted(key("ns", "a"), playlist("a", 1), rv_a))
        .await
        .unwrap();
    // writes elsewhere do not count
    put(&f, "other", "x", 1).await;

    assert_eq!(ctl.catch_up(&ctx, &idx).await.unwrap(), 2);
    assert_eq!(idx.doc_count(&ctx, "").unwrap(), 2);
    assert_eq!(idx.rv(), del);

    // the cached index is reused and caught up on the next lookup
    put(&f, "ns", "d", 1).await;
    let again = ctl.index(&ctx, &shard("ns")).await.unwrap();
    assert!(Arc::ptr_eq(&idx, &again));
    assert_eq!(again.doc_count(&ctx, "").unwrap(), 3);
}

#[tokio::test]
async fn custom_builders_add_typed_fields() {
    let f = fixture(0);
    let ctx = CancellationToken::new();
    put(&f, "ns", "short", 2).await;
    put(&f, "ns", "long", 10).await;
    put(&f, "ns", "mid", 5).await;
    let builder = StandardDocumentBuilder::new().with_field(col("items", ColumnType::Int64, 1), "spec.items");
    let ctl = controller(&f).with_builder(GROUP, RESOURCE, Arc::new(builder));
    let idx = ctl.index(&ctx, &shard("ns")).await.unwrap();

    let mut req = SearchRequest::new(shard("ns"));
    req.sort_by = vec![SortBy::desc("items")];
    req.fields = vec!["title".into(), "items".into()];
    let rsp = idx.search(&ctx, &req, &[]).unwrap();
    let names: Vec<_> = rsp.results.rows.iter().map(|r| r.key.name.as_str()).collect();
    assert_eq!(names, ["long", "mid", "short"]);
    assert_eq!(rsp.results.columns[1].kind, ColumnType::Int64);
}

#[tokio::test]
async fn large_shards_rebuild_into_files() {
    let f = fixture(3);
    let ctx = CancellationToken::new();
    for n in ["a", "b", "c"] {
        put(&f, "ns", n, 1).await;
    }
    put(&f, "small", "x", 1).await;
    let ctl = controller(&f);
    assert!(ctl.rebuild(&ctx, &shard("ns")).await.unwrap().is_file());
    assert!(!ctl.rebuild(&ctx, &shard("small")).await.unwrap().is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn the_updater_follows_the_write_feed() {
    let f = fixture(0);
    let ctx = CancellationToken::new();
    put(&f, "ns", "a", 1).await;
    let ctl = Arc::new(controller(&f));
    let idx = ctl.index(&ctx, &shard("ns")).await.unwrap();
    let task = ctl.spawn_updater(ctx.clone()).await.unwrap();

    put(&f, "ns", "b", 1).await;
    put(&f, "ns", "c", 1).await;
    // no index for this shard: skipped
    put(&f, "unindexed", "z", 1).await;

    let deadline = Instant::now() + Duration::from_secs(2);
    while idx.doc_count(&ctx, "").unwrap() < 3 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(idx.doc_count(&ctx, "").unwrap(), 3);
    assert!(f.search.get_index(&shard("unindexed")).is_none());

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}

/// Rejects resources named "bad" until `healed` is set.
struct Flaky {
    healed: AtomicBool,
    inner: StandardDocumentBuilder,
}

impl DocumentBuilder for Flaky {
    fn fields(&self) -> DocumentFields {
        self.inner.fields()
    }

    fn build(&self, key: &ResourceKey, rv: i64, value: &[u8]) -> Result<IndexableDocument, DocumentError> {
        if key.name == "bad" && !self.healed.load(Ordering::SeqCst) {
            return Err(DocumentError::NotAnObject("rejected".into()));
        }
        self.inner.build(key, rv, value)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_updates_hold_the_index_back_until_they_apply() {
    let f = fixture(0);
    let ctx = CancellationToken::new();
    let rv_a = put(&f, "ns", "a", 1).await;
    let flaky = Arc::new(Flaky { healed: AtomicBool::new(false), inner: StandardDocumentBuilder::new() });
    let ctl = Arc::new(controller(&f).with_builder(GROUP, RESOURCE, flaky.clone()));
    let idx = ctl.index(&ctx, &shard("ns")).await.unwrap();
    let task = ctl.spawn_updater(ctx.clone()).await.unwrap();

    put(&f, "ns", "bad", 1).await;
    put(&f, "ns", "b", 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // nothing after the rejected change may be marked as applied
    assert_eq!(idx.rv(), rv_a);
    assert!(ctl.catch_up(&ctx, &idx).await.is_err());

    flaky.healed.store(true, Ordering::SeqCst);
    let last = put(&f, "ns", "c", 1).await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while idx.rv() < last && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(idx.rv(), last);
    assert_eq!(idx.doc_count(&ctx, "").unwrap(), 4);

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}
