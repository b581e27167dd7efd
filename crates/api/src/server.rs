use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use arca_core::document::{ObjectMeta, ANNO_BLOB};
use arca_core::{BlobInfo, ErrorResult, ResourceKey};
use arca_persist::SqlKv;
use arca_search::{SearchBackend, SearchOptions, SearchRequest};
use arca_store::{BackendOptions, KvBackend, PutBlobRequest, StorageBackend, WriteEvent};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    forbidden, AccessClient, AllowAll, ArcaError, ArcaResult, CancelHandle, CountManagedObjectsRequest,
    CountManagedObjectsResponse, CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, GetBlobRequest,
    GetBlobResponse, HistoryRequest, IndexController, ListManagedObjectsRequest, ListManagedObjectsResponse,
    ListRequest, ListResponse, PutBlobResponse, ReadRequest, ReadResponse, ResourceServer, ResourceWrapper,
    SearchResponse, StatsRequest, StatsResponse, StreamHandle, UpdateRequest, UpdateResponse, Verb, WatchEvent,
    WatchEventType, WatchRequest,
};

const DEFAULT_WATCH_BUFFER: usize = 100;

/// In-process implementation that calls the storage and search crates directly.
pub struct InProcServer {
    storage: Arc<dyn StorageBackend>,
    indexer: Arc<IndexController>,
    access: Arc<dyn AccessClient>,
    watch_buffer: usize,
}

impl InProcServer {
    pub fn new(storage: Arc<dyn StorageBackend>, search: Arc<SearchBackend>) -> Self {
        let indexer = Arc::new(IndexController::new(storage.clone(), search));
        Self::with_indexer(storage, indexer)
    }

    /// Share an index controller, e.g. one with custom document builders or a running updater.
    pub fn with_indexer(storage: Arc<dyn StorageBackend>, indexer: Arc<IndexController>) -> Self {
        Self { storage, indexer, access: Arc::new(AllowAll), watch_buffer: DEFAULT_WATCH_BUFFER }
    }

    /// SQL-backed storage and a search root, both configured from the environment.
    pub fn open_from_env() -> anyhow::Result<Self> {
        let t0 = Instant::now();
        let kv = SqlKv::open_default().context("open kv store")?;
        let opts = BackendOptions::from_env();
        let watch_buffer = opts.watch_buffer.max(1);
        let storage = KvBackend::with_sql(Arc::new(kv), opts).context("open storage backend")?;
        let search_opts = SearchOptions::from_env();
        let root = search_opts.root.clone();
        let search = SearchBackend::new(search_opts).context("open search backend")?;
        info!(search_root = %root.display(), took_ms = %t0.elapsed().as_millis(), "api: server open");
        let mut server = Self::new(Arc::new(storage), Arc::new(search));
        server.watch_buffer = watch_buffer;
        Ok(server)
    }

    pub fn with_access(mut self, access: Arc<dyn AccessClient>) -> Self {
        self.access = access;
        self
    }

    pub fn indexer(&self) -> &Arc<IndexController> {
        &self.indexer
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    fn allowed(&self, requester: &str, verb: Verb, key: &ResourceKey, folder: &str) -> Result<(), ErrorResult> {
        if self.access.check(requester, verb, key, folder) {
            Ok(())
        } else {
            Err(forbidden(verb, key))
        }
    }

    async fn create_inner(&self, ctx: &CancellationToken, req: CreateRequest) -> Result<i64, ErrorResult> {
        req.key.validate().map_err(|e| ErrorResult::bad_request(e.to_string()))?;
        let meta = object_meta(&req.key, &req.value)?;
        self.allowed(&req.requester, Verb::Create, &req.key, meta.folder())?;
        let mut ev = WriteEvent::added(req.key, req.value).with_folder(meta.folder());
        ev.requester = req.requester;
        Ok(self.storage.write_event(ctx, ev).await?)
    }

    async fn update_inner(&self, ctx: &CancellationToken, req: UpdateRequest) -> Result<i64, ErrorResult> {
        if req.resource_version < 0 {
            return Err(ErrorResult::bad_request("update must include the previous version"));
        }
        req.key.validate().map_err(|e| ErrorResult::bad_request(e.to_string()))?;
        let latest = self.storage.read_resource(ctx, &req.key, 0).await?;
        let meta = object_meta(&req.key, &req.value)?;
        let folder = meta.folder();
        let moved = latest.folder != folder;
        if moved {
            self.allowed(&req.requester, Verb::Update, &req.key, &latest.folder)?;
            self.allowed(&req.requester, Verb::Create, &req.key, folder)?;
        } else {
            self.allowed(&req.requester, Verb::Update, &req.key, folder)?;
        }
        // the storage layer rejects a stale RV atomically
        let previous = if req.resource_version > 0 { req.resource_version } else { latest.resource_version };
        let mut ev = WriteEvent::modified(req.key, req.value, previous).with_folder(folder);
        ev.folder_changed = moved;
        ev.requester = req.requester;
        Ok(self.storage.write_event(ctx, ev).await?)
    }

    async fn delete_inner(&self, ctx: &CancellationToken, req: DeleteRequest) -> Result<i64, ErrorResult> {
        if req.resource_version < 0 {
            return Err(ErrorResult::bad_request("delete must include the previous version"));
        }
        req.key.validate().map_err(|e| ErrorResult::bad_request(e.to_string()))?;
        let latest = self.storage.read_resource(ctx, &req.key, 0).await?;
        self.allowed(&req.requester, Verb::Delete, &req.key, &latest.folder)?;
        let previous = if req.resource_version > 0 { req.resource_version } else { latest.resource_version };
        let marker = deletion_marker(&latest.value)?;
        let mut ev = WriteEvent::deleted(req.key, marker, previous).with_folder(&latest.folder);
        ev.requester = req.requester;
        Ok(self.storage.write_event(ctx, ev).await?)
    }

    async fn read_inner(&self, ctx: &CancellationToken, req: ReadRequest) -> Result<ReadResponse, ErrorResult> {
        if req.key.resource.is_empty() {
            return Err(ErrorResult::bad_request("missing resource"));
        }
        let rsp = self.storage.read_resource(ctx, &req.key, req.resource_version).await?;
        self.allowed(&req.requester, Verb::Get, &req.key, &rsp.folder)?;
        Ok(ReadResponse { value: rsp.value, resource_version: rsp.resource_version, folder: rsp.folder, error: None })
    }

    fn visible(&self, requester: &str, rsp: arca_store::ListResponse) -> ListResponse {
        let items = rsp
            .items
            .into_iter()
            .filter(|it| self.access.check(requester, Verb::Get, &it.key, &it.folder))
            .map(|it| ResourceWrapper { key: it.key, resource_version: it.resource_version, value: it.value })
            .collect();
        ListResponse { items, next_page_token: rsp.next_page_token, resource_version: rsp.resource_version, error: None }
    }

    async fn list_inner(&self, ctx: &CancellationToken, req: ListRequest) -> Result<ListResponse, ErrorResult> {
        let scope = ResourceKey::new(&req.key.group, &req.key.resource, &req.key.namespace, "");
        self.allowed(&req.requester, Verb::List, &scope, "")?;
        let rsp = self
            .storage
            .list(
                ctx,
                &arca_store::ListRequest {
                    key: scope,
                    limit: req.limit,
                    resource_version: req.resource_version,
                    next_page_token: req.next_page_token,
                },
            )
            .await?;
        Ok(self.visible(&req.requester, rsp))
    }

    async fn history_inner(&self, ctx: &CancellationToken, req: HistoryRequest) -> Result<ListResponse, ErrorResult> {
        req.key.validate().map_err(|e| ErrorResult::bad_request(e.to_string()))?;
        let rsp = self
            .storage
            .list_history(
                ctx,
                &arca_store::HistoryRequest {
                    key: req.key,
                    limit: req.limit,
                    next_page_token: req.next_page_token,
                    version_match: req.version_match,
                    resource_version: req.resource_version,
                },
            )
            .await?;
        Ok(self.visible(&req.requester, rsp))
    }

    async fn search_inner(&self, ctx: &CancellationToken, req: SearchRequest) -> Result<SearchResponse, ErrorResult> {
        let key = req.key.clone().ok_or_else(|| ErrorResult::bad_request("missing search key"))?;
        let idx = self.indexer.index(ctx, &key).await?;
        let mut federated = Vec::with_capacity(req.federated.len());
        for f in &req.federated {
            federated.push(self.indexer.index(ctx, f).await?);
        }
        let rsp = idx.search(ctx, &req, &federated)?;
        Ok(rsp.into())
    }

    async fn get_blob_inner(&self, ctx: &CancellationToken, req: GetBlobRequest) -> Result<GetBlobResponse, ErrorResult> {
        req.resource.validate().map_err(|e| ErrorResult::bad_request(e.to_string()))?;
        let uid = if req.uid.is_empty() {
            let latest = self.storage.read_resource(ctx, &req.resource, req.resource_version).await?;
            let meta = ObjectMeta::from_bytes(&latest.value).map_err(|e| ErrorResult::internal(e.to_string()))?;
            linked_blob(&meta)
                .ok_or_else(|| ErrorResult::not_found(format!("resource {} does not have a linked blob", req.resource)))?
                .uid
        } else {
            req.uid
        };
        let blob = self.storage.get_resource_blob(ctx, &req.resource, &uid).await?;
        Ok(GetBlobResponse { value: blob.value, content_type: blob.content_type, hash: blob.hash, error: None })
    }

    async fn managed_shards(
        &self,
        ctx: &CancellationToken,
        namespace: &str,
    ) -> Result<Vec<Arc<arca_search::ShardIndex>>, ErrorResult> {
        let stats = self.storage.get_resource_stats(ctx, namespace, 0).await?;
        let mut out = Vec::with_capacity(stats.len());
        for s in stats {
            out.push(self.indexer.index(ctx, &s.shard()).await?);
        }
        Ok(out)
    }
}

fn object_meta(key: &ResourceKey, value: &[u8]) -> Result<ObjectMeta, ErrorResult> {
    let meta = ObjectMeta::from_bytes(value).map_err(|e| ErrorResult::bad_request(e.to_string()))?;
    meta.check_key(key).map_err(|e| ErrorResult::bad_request(e.to_string()))?;
    Ok(meta)
}

/// The blob a resource points at through its annotation, if any.
pub(crate) fn linked_blob(meta: &ObjectMeta) -> Option<BlobInfo> {
    let raw = meta.annotations.get(ANNO_BLOB)?;
    serde_json::from_str::<BlobInfo>(raw).ok().filter(|b| !b.uid.is_empty())
}

/// The last live value, stamped with a deletion timestamp.
fn deletion_marker(value: &[u8]) -> Result<Vec<u8>, ErrorResult> {
    let mut obj: serde_json::Value = serde_json::from_slice(value)
        .map_err(|e| ErrorResult::bad_request(format!("unable to read previous object, {}", e)))?;
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    if let Some(root) = obj.as_object_mut() {
        let meta = root.entry("metadata").or_insert_with(|| serde_json::json!({}));
        if let Some(m) = meta.as_object_mut() {
            m.insert("deletionTimestamp".to_string(), serde_json::Value::String(now));
        }
    }
    serde_json::to_vec(&obj).map_err(|e| ErrorResult::internal(format!("unable to create deletion marker, {}", e)))
}

fn observe(op: &'static str, t0: Instant, error: Option<&ErrorResult>) {
    histogram!("api_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    match error {
        Some(e) => {
            counter!("api_errors_total", 1u64, "op" => op, "reason" => e.reason.clone());
            debug!(op, code = e.code, message = %e.message, took_ms = %t0.elapsed().as_millis(), "api: request failed");
        }
        None => debug!(op, took_ms = %t0.elapsed().as_millis(), "api: request ok"),
    }
}

#[async_trait::async_trait]
impl ResourceServer for InProcServer {
    async fn create(&self, ctx: &CancellationToken, req: CreateRequest) -> ArcaResult<CreateResponse> {
        let t0 = Instant::now();
        let rsp = match self.create_inner(ctx, req).await {
            Ok(rv) => CreateResponse { resource_version: rv, error: None },
            Err(e) => CreateResponse { resource_version: 0, error: Some(e) },
        };
        observe("create", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn update(&self, ctx: &CancellationToken, req: UpdateRequest) -> ArcaResult<UpdateResponse> {
        let t0 = Instant::now();
        let rsp = match self.update_inner(ctx, req).await {
            Ok(rv) => UpdateResponse { resource_version: rv, error: None },
            Err(e) => UpdateResponse { resource_version: 0, error: Some(e) },
        };
        observe("update", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn delete(&self, ctx: &CancellationToken, req: DeleteRequest) -> ArcaResult<DeleteResponse> {
        let t0 = Instant::now();
        let rsp = match self.delete_inner(ctx, req).await {
            Ok(rv) => DeleteResponse { resource_version: rv, error: None },
            Err(e) => DeleteResponse { resource_version: 0, error: Some(e) },
        };
        observe("delete", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn read(&self, ctx: &CancellationToken, req: ReadRequest) -> ArcaResult<ReadResponse> {
        let t0 = Instant::now();
        let rsp = self
            .read_inner(ctx, req)
            .await
            .unwrap_or_else(|e| ReadResponse { error: Some(e), ..Default::default() });
        observe("read", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn list(&self, ctx: &CancellationToken, req: ListRequest) -> ArcaResult<ListResponse> {
        let t0 = Instant::now();
        let rsp = self
            .list_inner(ctx, req)
            .await
            .unwrap_or_else(|e| ListResponse { error: Some(e), ..Default::default() });
        observe("list", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn history(&self, ctx: &CancellationToken, req: HistoryRequest) -> ArcaResult<ListResponse> {
        let t0 = Instant::now();
        let rsp = self
            .history_inner(ctx, req)
            .await
            .unwrap_or_else(|e| ListResponse { error: Some(e), ..Default::default() });
        observe("history", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn watch(&self, ctx: &CancellationToken, req: WatchRequest) -> ArcaResult<StreamHandle<WatchEvent>> {
        let f = &req.key;
        if req.send_initial_events && (f.group.is_empty() || f.resource.is_empty()) {
            return Err(ErrorResult::bad_request("initial events require a group and a resource").into());
        }
        let scope = ResourceKey::new(&f.group, &f.resource, &f.namespace, "");
        self.allowed(&req.requester, Verb::List, &scope, "")?;
        info!(filter = %f, since = ?req.since_rv, initial = req.send_initial_events, "api: watch start");

        let token = ctx.child_token();
        let mut events = self.storage.watch_write_events(&token, req.since_rv).await?;
        let (tx, rx) = mpsc::channel::<WatchEvent>(self.watch_buffer);
        let storage = self.storage.clone();
        let access = self.access.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut sent = 0usize;
            // live events at or below the initial listing's RV are already covered by it
            let mut floor = 0i64;
            if req.send_initial_events {
                let list_req = arca_store::ListRequest { key: scope, ..Default::default() };
                match storage.list(&task_token, &list_req).await {
                    Ok(list) => {
                        floor = list.resource_version;
                        for it in list.items {
                            if !req.matches(&it.key) || !access.check(&req.requester, Verb::Get, &it.key, &it.folder) {
                                continue;
                            }
                            let ev = WatchEvent {
                                event_type: WatchEventType::Added,
                                key: it.key,
                                value: it.value,
                                folder: it.folder,
                                resource_version: it.resource_version,
                                previous_rv: 0,
                            };
                            if !send(&task_token, &tx, ev).await {
                                task_token.cancel();
                                return;
                            }
                            sent += 1;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "api: watch initial list failed");
                        task_token.cancel();
                        return;
                    }
                }
            }
            loop {
                let ev = tokio::select! {
                    _ = task_token.cancelled() => break,
                    ev = events.recv() => match ev { Some(ev) => ev, None => break },
                };
                if ev.resource_version <= floor
                    || !req.matches(&ev.key)
                    || !access.check(&req.requester, Verb::Get, &ev.key, &ev.folder)
                {
                    continue;
                }
                let out = WatchEvent {
                    event_type: ev.event_type,
                    key: ev.key.clone(),
                    value: ev.value.clone(),
                    folder: ev.folder.clone(),
                    resource_version: ev.resource_version,
                    previous_rv: ev.previous_rv,
                };
                if !send(&task_token, &tx, out).await {
                    break;
                }
                sent += 1;
            }
            // stops the storage forwarder as well
            task_token.cancel();
            info!(sent, "api: watch ended");
        });
        Ok(StreamHandle { rx, cancel: CancelHandle { token, task: Some(handle) } })
    }

    async fn search(&self, ctx: &CancellationToken, req: SearchRequest) -> ArcaResult<SearchResponse> {
        let t0 = Instant::now();
        let rsp = self
            .search_inner(ctx, req)
            .await
            .unwrap_or_else(|e| SearchResponse { error: Some(e), ..Default::default() });
        observe("search", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn get_stats(&self, ctx: &CancellationToken, req: StatsRequest) -> ArcaResult<StatsResponse> {
        let t0 = Instant::now();
        let rsp = match self.storage.get_resource_stats(ctx, &req.namespace, req.min_count).await {
            Ok(stats) => StatsResponse { stats, error: None },
            Err(e) => StatsResponse { stats: Vec::new(), error: Some(e.into()) },
        };
        observe("get_stats", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn put_blob(&self, ctx: &CancellationToken, req: PutBlobRequest) -> ArcaResult<PutBlobResponse> {
        let t0 = Instant::now();
        let rsp = match req.resource.validate() {
            Err(e) => PutBlobResponse { error: Some(ErrorResult::bad_request(e.to_string())), ..Default::default() },
            Ok(()) => match self.storage.put_resource_blob(ctx, req).await {
                Ok(blob) => PutBlobResponse { blob, error: None },
                Err(e) => PutBlobResponse { error: Some(e.into()), ..Default::default() },
            },
        };
        observe("put_blob", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn get_blob(&self, ctx: &CancellationToken, req: GetBlobRequest) -> ArcaResult<GetBlobResponse> {
        let t0 = Instant::now();
        let rsp = self
            .get_blob_inner(ctx, req)
            .await
            .unwrap_or_else(|e| GetBlobResponse { error: Some(e), ..Default::default() });
        observe("get_blob", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn list_managed_objects(
        &self,
        ctx: &CancellationToken,
        req: ListManagedObjectsRequest,
    ) -> ArcaResult<ListManagedObjectsResponse> {
        let t0 = Instant::now();
        let result: Result<_, ErrorResult> = async {
            if req.kind.is_empty() {
                return Err(ErrorResult::bad_request("empty manager kind"));
            }
            if req.id.is_empty() {
                return Err(ErrorResult::bad_request("empty manager id"));
            }
            let mut items = Vec::new();
            for idx in self.managed_shards(ctx, &req.namespace).await? {
                items.extend(idx.list_managed_objects(ctx, &req.kind, &req.id).map_err(ArcaError::from)?);
            }
            items.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(items)
        }
        .await;
        let rsp = match result {
            Ok(items) => ListManagedObjectsResponse { items, error: None },
            Err(e) => ListManagedObjectsResponse { items: Vec::new(), error: Some(e) },
        };
        observe("list_managed_objects", t0, rsp.error.as_ref());
        Ok(rsp)
    }

    async fn count_managed_objects(
        &self,
        ctx: &CancellationToken,
        req: CountManagedObjectsRequest,
    ) -> ArcaResult<CountManagedObjectsResponse> {
        let t0 = Instant::now();
        let result: Result<_, ErrorResult> = async {
            let mut items = Vec::new();
            for idx in self.managed_shards(ctx, &req.namespace).await? {
                let counts = idx.count_managed_objects(ctx).map_err(ArcaError::from)?;
                items.extend(counts.into_iter().filter(|c| req.kind.is_empty() || c.kind == req.kind));
            }
            items.sort_by(|a, b| (&a.kind, &a.id, &a.group, &a.resource).cmp(&(&b.kind, &b.id, &b.group, &b.resource)));
            Ok(items)
        }
        .await;
        let rsp = match result {
            Ok(items) => CountManagedObjectsResponse { items, error: None },
            Err(e) => CountManagedObjectsResponse { items: Vec::new(), error: Some(e) },
        };
        observe("count_managed_objects", t0, rsp.error.as_ref());
        Ok(rsp)
    }
}

/// Deliver one event unless the watch was cancelled or the receiver is gone.
async fn send(token: &CancellationToken, tx: &mpsc::Sender<WatchEvent>, ev: WatchEvent) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        r = tx.send(ev) => r.is_ok(),
    }
}
