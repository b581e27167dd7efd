#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arca_core::{ContinueToken, DataAction, DataKey, NamespacedResource, ResourceKey};
use arca_persist::{Dialect, Kv, KvExt, MemKv, SqlKv, SECTION_DATA};
use arca_store::{
    BackendOptions, HistoryRequest, KvBackend, ListRequest, PutBlobRequest, StorageBackend, StorageError,
    VersionMatch, WatchEventType, WriteEvent,
};
use tokio_util::sync::CancellationToken;

fn backend() -> Arc<KvBackend> {
    Arc::new(KvBackend::new(Arc::new(MemKv::new()), BackendOptions::default()).unwrap())
}

fn key(ns: &str, name: &str) -> ResourceKey {
    ResourceKey::new("playlist.arca.dev", "playlists", ns, name)
}

fn obj(name: &str, v: i64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "metadata": { "name": name }, "spec": { "v": v } })).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_get_unique_increasing_rvs() {
    let b = backend();
    let ctx = CancellationToken::new();
    let mut handles = Vec::new();
    for i in 0..8 {
        let b = Arc::clone(&b);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let mut rvs = Vec::new();
            for j in 0..10 {
                let name = format!("w{}-{}", i, j);
                rvs.push(b.write_event(&ctx, WriteEvent::added(key("ns", &name), obj(&name, 0))).await.unwrap());
            }
            rvs
        }));
    }
    let mut all = Vec::new();
    for h in handles {
        let rvs = h.await.unwrap();
        assert!(rvs.windows(2).all(|w| w[0] < w[1]));
        all.extend(rvs);
    }
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 80);
    assert_eq!(b.current_rv(), *all.last().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_updates_have_one_winner() {
    let b = backend();
    let ctx = CancellationToken::new();
    let rv = b.write_event(&ctx, WriteEvent::added(key("ns", "x"), obj("x", 0))).await.unwrap();
    let mut handles = Vec::new();
    for i in 0..6 {
        let b = Arc::clone(&b);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            b.write_event(&ctx, WriteEvent::modified(key("ns", "x"), obj("x", i), rv)).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(StorageError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test]
async fn list_pages_stay_at_the_first_page_rv() {
    let b = backend();
    let ctx = CancellationToken::new();
    for name in ["a", "b", "c", "d", "e"] {
        b.write_event(&ctx, WriteEvent::added(key("ns", name), obj(name, 1))).await.unwrap();
    }
    let req = ListRequest { key: key("ns", ""), limit: 2, ..Default::default() };
    let first = b.list(&ctx, &req).await.unwrap();
    assert_eq!(first.items.len(), 2);
    let token = first.continue_token().unwrap();
    assert_eq!(token.resource_version, first.resource_version);
    assert_eq!(token.start_offset, 2);

    // later writes must not leak into the remaining pages
    let c = b.read_resource(&ctx, &key("ns", "c"), 0).await.unwrap();
    b.write_event(&ctx, WriteEvent::deleted(key("ns", "c"), Vec::new(), c.resource_version)).await.unwrap();
    b.write_event(&ctx, WriteEvent::added(key("ns", "aa"), obj("aa", 1))).await.unwrap();

    let mut names: Vec<String> = first.items.iter().map(|i| i.key.name.clone()).collect();
    let mut next = first.next_page_token.clone();
    while !next.is_empty() {
        let page = b.list(&ctx, &ListRequest { next_page_token: next, ..req.clone() }).await.unwrap();
        assert_eq!(page.resource_version, first.resource_version);
        names.extend(page.items.iter().map(|i| i.key.name.clone()));
        next = page.next_page_token;
    }
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);

    let now = b.list(&ctx, &ListRequest { key: key("ns", ""), ..Default::default() }).await.unwrap();
    let names: Vec<&str> = now.items.iter().map(|i| i.key.name.as_str()).collect();
    assert_eq!(names, vec!["a", "aa", "b", "d", "e"]);
}

#[tokio::test]
async fn list_rejects_bad_versions_and_tokens() {
    let b = backend();
    let ctx = CancellationToken::new();
    let rv = b.write_event(&ctx, WriteEvent::added(key("ns", "a"), obj("a", 1))).await.unwrap();
    let token = ContinueToken::new(rv, 1).encode();
    let mismatch = ListRequest { key: key("ns", ""), resource_version: rv - 1, next_page_token: token, limit: 1 };
    let err = b.list(&ctx, &mismatch).await.unwrap_err();
    assert_eq!(err.to_string(), "resource version mismatch");
    let garbage = ListRequest { key: key("ns", ""), next_page_token: "%%%".into(), ..Default::default() };
    assert_eq!(b.list(&ctx, &garbage).await.unwrap_err().to_string(), "invalid continue token");
    let future = ListRequest { key: key("ns", ""), resource_version: rv + 10, ..Default::default() };
    assert!(matches!(b.list(&ctx, &future).await, Err(StorageError::BadRequest(_))));
}

#[tokio::test]
async fn reads_before_the_first_write_find_nothing() {
    let b = backend();
    let ctx = CancellationToken::new();
    let rv = b.write_event(&ctx, WriteEvent::added(key("ns", "a"), obj("a", 1))).await.unwrap();
    for at in [1, 5, 1_000_000, rv - 1] {
        let got = b.read_resource(&ctx, &key("ns", "a"), at).await;
        assert!(matches!(got, Err(StorageError::NotFound(_))), "at_rv {at}: {got:?}");
    }
    assert_eq!(b.read_resource(&ctx, &key("ns", "a"), rv).await.unwrap().resource_version, rv);
}

#[tokio::test]
async fn versions_with_fewer_digits_keep_numeric_order() {
    let kv = Arc::new(MemKv::new());
    for rv in [9, 10, 123] {
        let dk = DataKey::new(&key("ns", "a"), rv, DataAction::Updated, "");
        kv.put_value(SECTION_DATA, &dk.to_string(), rv.to_string().as_bytes()).unwrap();
    }
    let b = KvBackend::new(Arc::clone(&kv) as Arc<dyn Kv>, BackendOptions::default()).unwrap();
    let ctx = CancellationToken::new();
    let k = key("ns", "a");
    assert_eq!(b.read_resource(&ctx, &k, 0).await.unwrap().resource_version, 123);
    assert_eq!(b.read_resource(&ctx, &k, 9).await.unwrap().resource_version, 9);
    assert_eq!(b.read_resource(&ctx, &k, 99).await.unwrap().resource_version, 10);
    assert!(matches!(b.read_resource(&ctx, &k, 8).await, Err(StorageError::NotFound(_))));
}

#[tokio::test]
async fn list_across_namespaces() {
    let b = backend();
    let ctx = CancellationToken::new();
    b.write_event(&ctx, WriteEvent::added(key("ns1", "a"), obj("a", 1))).await.unwrap();
    b.write_event(&ctx, WriteEvent::added(key("ns2", "a"), obj("a", 1))).await.unwrap();
    b.write_event(&ctx, WriteEvent::added(key("", "cluster"), obj("cluster", 1))).await.unwrap();
    let all = b.list(&ctx, &ListRequest { key: key("", ""), ..Default::default() }).await.unwrap();
    let got: Vec<(&str, &str)> = all.items.iter().map(|i| (i.key.namespace.as_str(), i.key.name.as_str())).collect();
    assert_eq!(got, vec![("", "cluster"), ("ns1", "a"), ("ns2", "a")]);
}

#[tokio::test]
async fn history_is_newest_first_and_ends_at_created() {
    let b = backend();
    let ctx = CancellationToken::new();
    let k = key("ns", "h");
    // an earlier incarnation that must not show up
    let old = b.write_event(&ctx, WriteEvent::added(k.clone(), obj("h", 0))).await.unwrap();
    b.write_event(&ctx, WriteEvent::deleted(k.clone(), Vec::new(), old)).await.unwrap();

    let mut rv = b.write_event(&ctx, WriteEvent::added(k.clone(), obj("h", 1))).await.unwrap();
    let created = rv;
    for v in 2..=4 {
        rv = b.write_event(&ctx, WriteEvent::modified(k.clone(), obj("h", v), rv)).await.unwrap();
    }

    let req = HistoryRequest { key: k.clone(), limit: 3, ..Default::default() };
    let page1 = b.list_history(&ctx, &req).await.unwrap();
    let rvs: Vec<i64> = page1.items.iter().map(|i| i.resource_version).collect();
    assert_eq!(rvs.len(), 3);
    assert_eq!(rvs[0], rv);
    assert!(rvs.windows(2).all(|w| w[0] > w[1]));
    let page2 = b
        .list_history(&ctx, &HistoryRequest { next_page_token: page1.next_page_token.clone(), ..req.clone() })
        .await
        .unwrap();
    assert_eq!(page2.items.len(), 1);
    assert_eq!(page2.items[0].resource_version, created);
    assert!(page2.next_page_token.is_empty());

    let asc = b
        .list_history(
            &ctx,
            &HistoryRequest {
                key: k.clone(),
                version_match: VersionMatch::NotOlderThan,
                resource_version: created,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let rvs: Vec<i64> = asc.items.iter().map(|i| i.resource_version).collect();
    assert_eq!(rvs.first(), Some(&created));
    assert!(rvs.windows(2).all(|w| w[0] < w[1]));

    b.write_event(&ctx, WriteEvent::deleted(k.clone(), Vec::new(), rv)).await.unwrap();
    let gone = b.list_history(&ctx, &HistoryRequest { key: k, ..Default::default() }).await.unwrap();
    assert!(gone.items.is_empty());
}

#[tokio::test]
async fn watch_delivers_in_commit_order() {
    let b = backend();
    let ctx = CancellationToken::new();
    let before = b.write_event(&ctx, WriteEvent::added(key("ns", "early"), obj("early", 0))).await.unwrap();
    let mut stream = b.watch_write_events(&ctx, Some(0)).await.unwrap();

    let mut expected = vec![before];
    let mut rv = b.write_event(&ctx, WriteEvent::added(key("ns", "w"), obj("w", 1))).await.unwrap();
    expected.push(rv);
    rv = b.write_event(&ctx, WriteEvent::modified(key("ns", "w"), obj("w", 2), rv)).await.unwrap();
    expected.push(rv);
    rv = b.write_event(&ctx, WriteEvent::deleted(key("ns", "w"), Vec::new(), rv)).await.unwrap();
    expected.push(rv);

    let mut got = Vec::new();
    let mut types = Vec::new();
    while got.len() < expected.len() {
        let ev = tokio::time::timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
        got.push(ev.resource_version);
        types.push(ev.event_type);
    }
    assert_eq!(got, expected);
    assert_eq!(
        types,
        vec![WatchEventType::Added, WatchEventType::Added, WatchEventType::Modified, WatchEventType::Deleted]
    );

    ctx.cancel();
    let end = tokio::time::timeout(Duration::from_secs(5), stream.recv()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn replay_spans_many_log_pages_then_goes_live() {
    let opts = BackendOptions { watch_buffer: 8, ..BackendOptions::default() };
    let b = KvBackend::new(Arc::new(MemKv::new()), opts).unwrap();
    let ctx = CancellationToken::new();
    let mut written = Vec::new();
    for i in 0..600 {
        let name = format!("n{}", i);
        written.push(b.write_event(&ctx, WriteEvent::added(key("ns", &name), obj(&name, 0))).await.unwrap());
    }
    let mut stream = b.watch_write_events(&ctx, Some(written[99])).await.unwrap();
    let live = b.write_event(&ctx, WriteEvent::added(key("ns", "late"), obj("late", 0))).await.unwrap();
    written.push(live);

    let mut got = Vec::new();
    while got.len() < 501 {
        let ev = tokio::time::timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
        got.push(ev.resource_version);
    }
    assert_eq!(got, written[100..]);
}

#[tokio::test]
async fn cancelling_during_replay_closes_the_stream() {
    let opts = BackendOptions { watch_buffer: 1, ..BackendOptions::default() };
    let b = KvBackend::new(Arc::new(MemKv::new()), opts).unwrap();
    let ctx = CancellationToken::new();
    for i in 0..50 {
        let name = format!("n{}", i);
        b.write_event(&ctx, WriteEvent::added(key("ns", &name), obj(&name, 0))).await.unwrap();
    }
    let watch_ctx = CancellationToken::new();
    let mut stream = b.watch_write_events(&watch_ctx, Some(0)).await.unwrap();
    assert!(stream.recv().await.is_some());
    watch_ctx.cancel();
    let mut drained = 0;
    while let Some(_) = tokio::time::timeout(Duration::from_secs(5), stream.recv()).await.unwrap() {
        drained += 1;
    }
    // at most the buffered event and the one in flight
    assert!(drained <= 2, "received {drained} events after cancel");
}

#[tokio::test]
async fn lagging_watcher_is_closed() {
    let opts = BackendOptions { watch_buffer: 1, watch_broadcast: 2, legacy_compat: false };
    let b = KvBackend::new(Arc::new(MemKv::new()), opts).unwrap();
    let ctx = CancellationToken::new();
    let mut stream = b.watch_write_events(&ctx, None).await.unwrap();
    for i in 0..20 {
        let name = format!("n{}", i);
        b.write_event(&ctx, WriteEvent::added(key("ns", &name), obj(&name, 0))).await.unwrap();
    }
    let mut received = 0;
    while let Ok(Some(_)) = tokio::time::timeout(Duration::from_secs(5), stream.recv()).await {
        received += 1;
    }
    assert!(received < 20);
}

#[tokio::test]
async fn modified_since_reports_latest_change_per_resource() {
    let b = backend();
    let ctx = CancellationToken::new();
    let shard = NamespacedResource::new("ns", "playlist.arca.dev", "playlists");
    let a = b.write_event(&ctx, WriteEvent::added(key("ns", "a"), obj("a", 1))).await.unwrap();
    let since = b.write_event(&ctx, WriteEvent::added(key("ns", "b"), obj("b", 1))).await.unwrap();
    b.write_event(&ctx, WriteEvent::added(key("other", "z"), obj("z", 1))).await.unwrap();
    let a2 = b.write_event(&ctx, WriteEvent::modified(key("ns", "a"), obj("a", 2), a)).await.unwrap();
    let a3 = b.write_event(&ctx, WriteEvent::modified(key("ns", "a"), obj("a", 3), a2)).await.unwrap();
    let b_rv = b.read_resource(&ctx, &key("ns", "b"), 0).await.unwrap().resource_version;
    b.write_event(&ctx, WriteEvent::deleted(key("ns", "b"), Vec::new(), b_rv)).await.unwrap();
    b.write_event(&ctx, WriteEvent::added(key("ns", "c"), obj("c", 1))).await.unwrap();

    let (latest, items) = b.list_modified_since(&ctx, &shard, since).await.unwrap();
    assert_eq!(latest, b.current_rv());
    let got: Vec<(&str, DataAction)> = items.iter().map(|m| (m.key.name.as_str(), m.action)).collect();
    assert_eq!(got, vec![("a", DataAction::Updated), ("b", DataAction::Deleted), ("c", DataAction::Created)]);
    assert_eq!(items[0].resource_version, a3);
    assert_eq!(items[0].value, obj("a", 3));
    assert!(items[1].value.is_empty());
}

#[tokio::test]
async fn stats_count_live_resources_per_shard() {
    let b = backend();
    let ctx = CancellationToken::new();
    for name in ["a", "b", "c"] {
        b.write_event(&ctx, WriteEvent::added(key("ns", name), obj(name, 0))).await.unwrap();
    }
    let rv = b.write_event(&ctx, WriteEvent::added(key("ns", "d"), obj("d", 0))).await.unwrap();
    let last = b.write_event(&ctx, WriteEvent::deleted(key("ns", "d"), Vec::new(), rv)).await.unwrap();
    b.write_event(&ctx, WriteEvent::added(key("other", "x"), obj("x", 0))).await.unwrap();

    let stats = b.get_resource_stats(&ctx, "ns", 0).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!((stats[0].count, stats[0].resource_version), (3, last));
    let all = b.get_resource_stats(&ctx, "", 0).await.unwrap();
    assert_eq!(all.iter().map(|s| s.namespace.as_str()).collect::<Vec<_>>(), vec!["ns", "other"]);
    assert!(b.get_resource_stats(&ctx, "", 3).await.unwrap().is_empty());
    assert!(b.get_resource_stats(&ctx, "nobody", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn blobs_are_addressed_by_uid() {
    let b = backend();
    let ctx = CancellationToken::new();
    let k = key("ns", "with-blob");
    let a = b
        .put_resource_blob(&ctx, PutBlobRequest { resource: k.clone(), content_type: "text/plain".into(), value: b"AAA".to_vec() })
        .await
        .unwrap();
    let bb = b
        .put_resource_blob(&ctx, PutBlobRequest { resource: k.clone(), content_type: "text/plain".into(), value: b"BBBB".to_vec() })
        .await
        .unwrap();
    assert_ne!(a.uid, bb.uid);
    assert_eq!(a.size, 3);
    assert_eq!(a.hash.len(), 64);
    let got = b.get_resource_blob(&ctx, &k, &a.uid).await.unwrap();
    assert_eq!((got.value.as_slice(), got.content_type.as_str()), (&b"AAA"[..], "text/plain"));
    assert_eq!(got.hash, a.hash);
    assert_eq!(b.get_resource_blob(&ctx, &k, &bb.uid).await.unwrap().value, b"BBBB");
    let missing = b.get_resource_blob(&ctx, &k, "00000000-0000-0000-0000-000000000000").await;
    assert!(matches!(missing, Err(StorageError::NotFound(_))));
}

#[tokio::test]
async fn sql_backend_with_legacy_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arca.db");
    let kv = Arc::new(SqlKv::open(path.to_str().unwrap(), Dialect::Sqlite).unwrap());
    let opts = BackendOptions { legacy_compat: true, ..Default::default() };
    let b = KvBackend::with_sql(Arc::clone(&kv), opts).unwrap();
    let ctx = CancellationToken::new();
    let rv = b.write_event(&ctx, WriteEvent::added(key("ns", "a"), obj("a", 1)).with_folder("f1")).await.unwrap();
    b.write_event(&ctx, WriteEvent::modified(key("ns", "a"), obj("a", 2), rv)).await.unwrap();
    assert_eq!(kv.legacy_row_count().unwrap(), 2);
    let read = b.read_resource(&ctx, &key("ns", "a"), rv).await.unwrap();
    assert_eq!(read.folder, "f1");
    assert_eq!(read.value, obj("a", 1));

    drop(b);
    let reopened = KvBackend::with_sql(kv, BackendOptions::default()).unwrap();
    assert!(reopened.current_rv() > rv);
}
