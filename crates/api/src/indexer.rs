use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use arca_core::document::{DocumentBuilder, StandardDocumentBuilder};
use arca_core::{DataAction, NamespacedResource, ResourceKey};
use arca_search::{BulkItem, SearchBackend, ShardIndex};
use arca_store::{ListRequest, StorageBackend, WatchEventType, WrittenEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ArcaResult;

/// Keeps search indexes in step with storage.
///
/// Indexes are built lazily from a full listing of their shard and then moved
/// forward either on demand ([`IndexController::catch_up`]) or by the background
/// updater following the write feed.
pub struct IndexController {
    storage: Arc<dyn StorageBackend>,
    search: Arc<SearchBackend>,
    builders: HashMap<(String, String), Arc<dyn DocumentBuilder>>,
    fallback: Arc<dyn DocumentBuilder>,
}

impl IndexController {
    pub fn new(storage: Arc<dyn StorageBackend>, search: Arc<SearchBackend>) -> Self {
        Self { storage, search, builders: HashMap::new(), fallback: Arc::new(StandardDocumentBuilder::new()) }
    }

    /// Use `builder` for every shard of `group/resource`.
    pub fn with_builder(mut self, group: &str, resource: &str, builder: Arc<dyn DocumentBuilder>) -> Self {
        self.builders.insert((group.to_string(), resource.to_string()), builder);
        self
    }

    pub fn search(&self) -> &Arc<SearchBackend> {
        &self.search
    }

    pub fn builder(&self, shard: &NamespacedResource) -> Arc<dyn DocumentBuilder> {
        self.builders
            .get(&(shard.group.clone(), shard.resource.clone()))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// The current index of `shard`: the cached one caught up with storage, or a fresh build.
    pub async fn index(&self, ctx: &CancellationToken, shard: &NamespacedResource) -> ArcaResult<Arc<ShardIndex>> {
        match self.search.get_index(shard) {
            Some(idx) => {
                self.catch_up(ctx, &idx).await?;
                Ok(idx)
            }
            None => self.rebuild(ctx, shard).await,
        }
    }

    /// Build the index of `shard` from a full listing and publish it.
    pub async fn rebuild(&self, ctx: &CancellationToken, shard: &NamespacedResource) -> ArcaResult<Arc<ShardIndex>> {
        let t0 = Instant::now();
        let list = self
            .storage
            .list(
                ctx,
                &ListRequest {
                    key: ResourceKey::new(&shard.group, &shard.resource, &shard.namespace, ""),
                    ..Default::default()
                },
            )
            .await?;
        // an empty namespace lists every namespace; cluster-scoped shards keep only their own
        let items: Vec<_> = list.items.into_iter().filter(|it| shard.matches(&it.key)).collect();
        let builder = self.builder(shard);
        let rv = list.resource_version;
        let idx = self.search.build_index(ctx, shard, items.len(), rv, builder.fields(), |w| {
            for it in &items {
                let doc = builder
                    .build(&it.key, it.resource_version, &it.value)
                    .map_err(|e| arca_search::SearchError::BadRequest(format!("{}: {}", it.key, e)))?;
                w.index(&doc)?;
            }
            Ok(rv)
        })?;
        info!(shard = %shard, docs = items.len(), rv, took_ms = %t0.elapsed().as_millis(), "indexer: rebuild ok");
        Ok(idx)
    }

    /// Apply every change made to the shard since the index RV. Returns the number of changes.
    pub async fn catch_up(&self, ctx: &CancellationToken, idx: &ShardIndex) -> ArcaResult<usize> {
        let shard = idx.key();
        let (latest, changes) = self.storage.list_modified_since(ctx, shard, idx.rv()).await?;
        let builder = self.builder(shard);
        let mut items = Vec::with_capacity(changes.len());
        for m in changes.into_iter().filter(|m| shard.matches(&m.key)) {
            items.push(match m.action {
                DataAction::Deleted => BulkItem::Delete { key: m.key, rv: m.resource_version },
                DataAction::Created | DataAction::Updated => {
                    BulkItem::Index(builder.build(&m.key, m.resource_version, &m.value)?)
                }
            });
        }
        let n = items.len();
        if n > 0 {
            idx.bulk_index(ctx, items)?;
        }
        debug!(shard = %shard, changes = n, index_rv = idx.rv(), latest, "indexer: caught up");
        Ok(n)
    }

    /// Follow the write feed and apply each change to the cached index of its shard.
    /// Shards without an index are skipped; they are built from scratch when first searched.
    ///
    /// A change that cannot be applied stalls its shard: the index RV stays below it, and
    /// every later event for that shard retries through [`IndexController::catch_up`].
    pub async fn spawn_updater(self: &Arc<Self>, ctx: CancellationToken) -> ArcaResult<tokio::task::JoinHandle<()>> {
        let mut events = self.storage.watch_write_events(&ctx, None).await?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            info!("indexer: updater starting");
            let mut applied = 0usize;
            let mut stalled: HashSet<NamespacedResource> = HashSet::new();
            loop {
                let ev = tokio::select! {
                    _ = ctx.cancelled() => break,
                    ev = events.recv() => match ev { Some(ev) => ev, None => break },
                };
                let shard = ev.key.shard();
                let Some(idx) = this.search.get_index(&shard) else { continue };
                if ev.resource_version <= idx.rv() {
                    continue;
                }
                if stalled.contains(&shard) {
                    match this.catch_up(&ctx, &idx).await {
                        Ok(n) => {
                            stalled.remove(&shard);
                            applied += n;
                            info!(shard = %shard, changes = n, "indexer: stalled shard caught up");
                        }
                        Err(e) => warn!(shard = %shard, error = %e, "indexer: shard still stalled"),
                    }
                    continue;
                }
                match this.apply(&ctx, &idx, &ev) {
                    Ok(()) => applied += 1,
                    Err(e) => {
                        warn!(shard = %shard, key = %ev.key, rv = ev.resource_version, error = %e, "indexer: update failed; shard stalled");
                        stalled.insert(shard);
                    }
                }
            }
            info!(applied, stalled = stalled.len(), "indexer: updater ended");
        }))
    }

    fn apply(&self, ctx: &CancellationToken, idx: &ShardIndex, ev: &WrittenEvent) -> ArcaResult<()> {
        let item = match ev.event_type {
            WatchEventType::Deleted => BulkItem::Delete { key: ev.key.clone(), rv: ev.resource_version },
            WatchEventType::Added | WatchEventType::Modified => {
                BulkItem::Index(self.builder(idx.key()).build(&ev.key, ev.resource_version, &ev.value)?)
            }
        };
        idx.bulk_index(ctx, vec![item])?;
        Ok(())
    }
}
