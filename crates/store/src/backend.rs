use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use arca_core::key::list_prefix;
use arca_core::{BlobInfo, ContinueToken, DataAction, DataKey, NamespacedResource, ResourceKey};
use arca_persist::{
    Kv, KvError, KvExt, LegacyTx, ListOptions, SqlKv, SECTION_BLOBS, SECTION_DATA, SECTION_EVENTS,
};
use async_trait::async_trait;
use metrics::{counter, decrement_gauge, histogram, increment_gauge};
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventKey, EventRecord, RvGenerator};
use crate::{
    check_ctx, BackendOptions, BlobData, HistoryRequest, ListRequest, ListResponse, ModifiedResource, PutBlobRequest,
    ReadResponse, ResourceStats, StorageBackend, StorageError, StorageResult, VersionMatch, WatchEventType,
    WatchStream, WriteEvent, WrittenEvent,
};

const STRIPES: usize = 64;
/// Long scans look at the context once per this many keys.
const CTX_CHECK_EVERY: usize = 256;
/// Events read from the log per replay step.
const REPLAY_PAGE: usize = 256;

/// [`StorageBackend`] over any [`Kv`].
pub struct KvBackend {
    kv: Arc<dyn Kv>,
    compat: Option<(Arc<SqlKv>, LegacyTx)>,
    opts: BackendOptions,
    /// Serializes check-then-write per identity.
    stripes: Vec<Mutex<()>>,
    /// Held only for RV assignment, persistence and broadcast.
    commit: Mutex<RvGenerator>,
    live: broadcast::Sender<Arc<WrittenEvent>>,
}

impl KvBackend {
    pub fn new(kv: Arc<dyn Kv>, opts: BackendOptions) -> StorageResult<Self> {
        let started = Instant::now();
        let seed = latest_persisted_rv(kv.as_ref())?;
        let (live, _) = broadcast::channel(opts.watch_broadcast.max(1));
        info!(seed_rv = seed, took_ms = %started.elapsed().as_millis(), "storage backend opened");
        Ok(Self {
            kv,
            compat: None,
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            commit: Mutex::new(RvGenerator::new(seed)),
            live,
            opts,
        })
    }

    /// Backend over a SQL store; honours `legacy_compat`.
    pub fn with_sql(kv: Arc<SqlKv>, opts: BackendOptions) -> StorageResult<Self> {
        let compat = opts.legacy_compat.then(|| (Arc::clone(&kv), kv.legacy_tx()));
        let mut me = Self::new(kv, opts)?;
        me.compat = compat;
        Ok(me)
    }

    pub fn options(&self) -> &BackendOptions {
        &self.opts
    }

    fn stripe(&self, key: &ResourceKey) -> &Mutex<()> {
        let mut h = FxHasher::default();
        key.identity_prefix().hash(&mut h);
        &self.stripes[(h.finish() as usize) % self.stripes.len()]
    }

    /// Every history entry of one resource, oldest first.
    fn history_keys(&self, ctx: &CancellationToken, key: &ResourceKey) -> StorageResult<Vec<DataKey>> {
        let mut out = Vec::new();
        for (i, k) in self.kv.keys(SECTION_DATA, ListOptions::prefix(&key.identity_prefix())).enumerate() {
            if i % CTX_CHECK_EVERY == 0 {
                check_ctx(ctx)?;
            }
            out.push(DataKey::parse(&k?)?);
        }
        Ok(out)
    }

    /// Newest entry with rv <= `at_rv` (any rv when 0).
    fn newest_entry(&self, key: &ResourceKey, at_rv: i64) -> StorageResult<Option<DataKey>> {
        let prefix = key.identity_prefix();
        let mut opts = ListOptions::prefix(&prefix).desc().limit(1);
        if at_rv > 0 {
            // rvs are zero-padded, so `{prefix}{at_rv + 1:019}` bounds the range
            opts.end_key = format!("{}{:019}", prefix, at_rv.saturating_add(1));
        }
        match self.kv.keys(SECTION_DATA, opts).next() {
            Some(k) => Ok(Some(DataKey::parse(&k?)?)),
            None => Ok(None),
        }
    }

    fn write_sync(&self, ctx: &CancellationToken, ev: WriteEvent) -> StorageResult<i64> {
        check_ctx(ctx)?;
        ev.key.validate()?;
        let action = ev.event_type.action();
        DataKey::new(&ev.key, 0, action, &ev.folder).validate()?;
        let started = Instant::now();
        let _identity = self.stripe(&ev.key).lock();

        let latest = self.newest_entry(&ev.key, 0)?.filter(|dk| dk.action != DataAction::Deleted);
        match (ev.event_type, &latest) {
            (WatchEventType::Added, _) if ev.previous_rv != 0 => {
                return Err(StorageError::BadRequest(format!(
                    "previous resource version must be 0 when creating, got {}",
                    ev.previous_rv
                )));
            }
            (WatchEventType::Added, Some(_)) => {
                counter!("storage_write_conflicts_total", 1u64, "kind" => "exists");
                return Err(StorageError::AlreadyExists(format!("resource already exists: {}", ev.key)));
            }
            (WatchEventType::Modified | WatchEventType::Deleted, None) => {
                return Err(StorageError::NotFound(format!("resource not found: {}", ev.key)));
            }
            (WatchEventType::Modified | WatchEventType::Deleted, Some(cur)) if cur.resource_version != ev.previous_rv => {
                counter!("storage_write_conflicts_total", 1u64, "kind" => "version");
                return Err(StorageError::Conflict(format!(
                    "resource version mismatch for {}: expected {}, current {}",
                    ev.key, ev.previous_rv, cur.resource_version
                )));
            }
            _ => {}
        }

        let mut gen = self.commit.lock();
        let timestamp = chrono::Utc::now().timestamp_millis();
        let rv = gen.next(timestamp);
        let data_key = DataKey::new(&ev.key, rv, action, &ev.folder).to_string();
        self.save_data(&data_key, &ev.value)?;

        let event_key = EventKey { resource_version: rv, key: ev.key.clone(), action, folder: ev.folder.clone() };
        let record = EventRecord {
            key: ev.key.clone(),
            action,
            resource_version: rv,
            previous_rv: ev.previous_rv,
            folder: ev.folder.clone(),
            folder_changed: ev.folder_changed,
            requester: ev.requester.clone(),
            timestamp,
        };
        let body = serde_json::to_vec(&record).map_err(|e| StorageError::Internal(e.to_string()))?;
        if let Err(e) = self.kv.put_value(SECTION_EVENTS, &event_key.to_string(), &body) {
            // keep data and events in step
            if let Err(undo) = self.kv.delete(SECTION_DATA, &data_key) {
                warn!(key = %data_key, error = %undo, "failed to roll back data entry");
            }
            return Err(e.into());
        }

        let written = WrittenEvent {
            event_type: ev.event_type,
            key: ev.key,
            value: ev.value,
            folder: ev.folder,
            folder_changed: ev.folder_changed,
            previous_rv: ev.previous_rv,
            resource_version: rv,
            timestamp,
            requester: ev.requester,
        };
        // no receivers is fine
        let _ = self.live.send(Arc::new(written));
        drop(gen);

        histogram!("storage_write_ms", started.elapsed().as_secs_f64() * 1000.0, "action" => action.as_str());
        debug!(rv, action = action.as_str(), key = %data_key, "write committed");
        Ok(rv)
    }

    fn save_data(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        match &self.compat {
            Some((sql, tx)) => {
                let mut w = sql.save_compat(SECTION_DATA, key, tx)?;
                w.write_all(value).map_err(KvError::from)?;
                w.close()?;
            }
            None => self.kv.put_value(SECTION_DATA, key, value)?,
        }
        Ok(())
    }

    fn read_sync(&self, ctx: &CancellationToken, key: &ResourceKey, at_rv: i64) -> StorageResult<ReadResponse> {
        check_ctx(ctx)?;
        key.validate()?;
        let Some(dk) = self.newest_entry(key, at_rv)?.filter(|dk| dk.action != DataAction::Deleted) else {
            return Err(StorageError::NotFound(format!("resource not found: {}", key)));
        };
        let value = self.kv.get_value(SECTION_DATA, &dk.to_string())?;
        Ok(ReadResponse { key: dk.resource_key(), value, resource_version: dk.resource_version, folder: dk.folder })
    }

    fn list_sync(&self, ctx: &CancellationToken, req: &ListRequest) -> StorageResult<ListResponse> {
        check_ctx(ctx)?;
        if req.key.group.is_empty() {
            return Err(arca_core::KeyError::Required("group").into());
        }
        if req.key.resource.is_empty() {
            return Err(arca_core::KeyError::Required("resource").into());
        }
        let current = self.current_rv();
        let token = decode_token(&req.next_page_token)?;
        if let Some(t) = token {
            if req.resource_version > 0 && t.resource_version != req.resource_version {
                return Err(StorageError::BadRequest("resource version mismatch".into()));
            }
        }
        let list_rv = match token {
            Some(t) if t.resource_version > 0 => t.resource_version,
            _ if req.resource_version > 0 => req.resource_version,
            _ => current,
        };
        if list_rv > current {
            return Err(StorageError::BadRequest(format!(
                "resource version {} is newer than the current version {}",
                list_rv, current
            )));
        }
        let offset = token.map(|t| t.start_offset as usize).unwrap_or(0);

        let prefix = list_prefix(&req.key.group, &req.key.resource, &req.key.namespace);
        let mut visible: Vec<DataKey> = Vec::new();
        let mut candidate: Option<DataKey> = None;
        let mut identity = String::new();
        let push = |c: Option<DataKey>, out: &mut Vec<DataKey>| {
            if let Some(dk) = c.filter(|dk| dk.action != DataAction::Deleted) {
                out.push(dk);
            }
        };
        for (i, k) in self.kv.keys(SECTION_DATA, ListOptions::prefix(&prefix)).enumerate() {
            if i % CTX_CHECK_EVERY == 0 {
                check_ctx(ctx)?;
            }
            let dk = DataKey::parse(&k?)?;
            let id = dk.identity_prefix();
            if id != identity {
                push(candidate.take(), &mut visible);
                identity = id;
            }
            if dk.resource_version <= list_rv {
                candidate = Some(dk);
            }
        }
        push(candidate, &mut visible);

        let page = paginate(&visible, offset, req.limit);
        let next_page_token = match page.more {
            true => ContinueToken::new(list_rv, (offset + page.items.len()) as i64).encode(),
            false => String::new(),
        };
        Ok(ListResponse { items: self.load(page.items)?, next_page_token, resource_version: list_rv })
    }

    fn history_sync(&self, ctx: &CancellationToken, req: &HistoryRequest) -> StorageResult<ListResponse> {
        check_ctx(ctx)?;
        req.key.validate()?;
        let token = decode_token(&req.next_page_token)?;
        let history_rv = match token {
            Some(t) if t.resource_version > 0 => t.resource_version,
            _ => self.current_rv(),
        };
        let ascending = match token {
            Some(t) => t.sort_ascending,
            None => req.version_match == VersionMatch::NotOlderThan,
        };
        let offset = token.map(|t| t.start_offset as usize).unwrap_or(0);

        let mut entries: Vec<DataKey> =
            self.history_keys(ctx, &req.key)?.into_iter().filter(|dk| dk.resource_version <= history_rv).collect();
        // only the current incarnation counts
        if let Some(pos) = entries.iter().rposition(|dk| dk.action == DataAction::Deleted) {
            entries.drain(..=pos);
        }
        if req.version_match == VersionMatch::NotOlderThan {
            entries.retain(|dk| dk.resource_version >= req.resource_version);
        }
        if !ascending {
            entries.reverse();
        }

        let page = paginate(&entries, offset, req.limit);
        let next_page_token = match page.more {
            true => ContinueToken {
                resource_version: history_rv,
                start_offset: (offset + page.items.len()) as i64,
                sort_ascending: ascending,
            }
            .encode(),
            false => String::new(),
        };
        Ok(ListResponse { items: self.load(page.items)?, next_page_token, resource_version: history_rv })
    }

    fn load(&self, keys: &[DataKey]) -> StorageResult<Vec<ReadResponse>> {
        let raw: Vec<String> = keys.iter().map(|dk| dk.to_string()).collect();
        let mut values: BTreeMap<String, Vec<u8>> =
            self.kv.batch_get(SECTION_DATA, &raw)?.into_iter().map(|kv| (kv.key, kv.value)).collect();
        keys.iter()
            .zip(raw.iter())
            .map(|(dk, k)| {
                let value = values
                    .remove(k)
                    .ok_or_else(|| StorageError::Internal(format!("history entry vanished: {}", k)))?;
                Ok(ReadResponse {
                    key: dk.resource_key(),
                    value,
                    resource_version: dk.resource_version,
                    folder: dk.folder.clone(),
                })
            })
            .collect()
    }

    fn modified_since_sync(
        &self,
        ctx: &CancellationToken,
        shard: &NamespacedResource,
        since_rv: i64,
    ) -> StorageResult<(i64, Vec<ModifiedResource>)> {
        check_ctx(ctx)?;
        let latest_rv = self.current_rv();
        let opts = ListOptions { start_key: EventKey::start_after(since_rv), ..Default::default() };
        let mut newest: BTreeMap<String, EventKey> = BTreeMap::new();
        for (i, k) in self.kv.keys(SECTION_EVENTS, opts).enumerate() {
            if i % CTX_CHECK_EVERY == 0 {
                check_ctx(ctx)?;
            }
            let ek = EventKey::parse(&k?)?;
            if ek.resource_version > latest_rv {
                break;
            }
            let in_shard = ek.key.group == shard.group
                && ek.key.resource == shard.resource
                && (shard.namespace.is_empty() || ek.key.namespace == shard.namespace);
            if in_shard {
                newest.insert(ek.key.identity_prefix(), ek);
            }
        }
        let mut out = Vec::with_capacity(newest.len());
        for ek in newest.into_values() {
            let value = match ek.action {
                DataAction::Deleted => Vec::new(),
                action => {
                    let dk = DataKey::new(&ek.key, ek.resource_version, action, &ek.folder);
                    self.kv.get_value(SECTION_DATA, &dk.to_string())?
                }
            };
            out.push(ModifiedResource { action: ek.action, resource_version: ek.resource_version, key: ek.key, value });
        }
        Ok((latest_rv, out))
    }

    fn stats_sync(&self, ctx: &CancellationToken, namespace: &str, min_count: i64) -> StorageResult<Vec<ResourceStats>> {
        check_ctx(ctx)?;
        // (namespace, group, resource) -> (live count, max rv)
        let mut shards: BTreeMap<(String, String, String), (i64, i64)> = BTreeMap::new();
        let mut identity = String::new();
        let mut last: Option<DataKey> = None;
        let close = |dk: Option<DataKey>, shards: &mut BTreeMap<(String, String, String), (i64, i64)>| {
            if let Some(dk) = dk {
                if dk.action != DataAction::Deleted {
                    shards.entry((dk.namespace, dk.group, dk.resource)).or_default().0 += 1;
                }
            }
        };
        for (i, k) in self.kv.keys(SECTION_DATA, ListOptions::default()).enumerate() {
            if i % CTX_CHECK_EVERY == 0 {
                check_ctx(ctx)?;
            }
            let dk = DataKey::parse(&k?)?;
            if !namespace.is_empty() && dk.namespace != namespace {
                continue;
            }
            let entry = shards.entry((dk.namespace.clone(), dk.group.clone(), dk.resource.clone())).or_default();
            entry.1 = entry.1.max(dk.resource_version);
            let id = dk.identity_prefix();
            if id != identity {
                close(last.take(), &mut shards);
                identity = id;
            }
            last = Some(dk);
        }
        close(last, &mut shards);
        Ok(shards
            .into_iter()
            .filter(|(_, (count, _))| *count > min_count)
            .map(|((namespace, group, resource), (count, resource_version))| ResourceStats {
                namespace,
                group,
                resource,
                count,
                resource_version,
            })
            .collect())
    }

    fn put_blob_sync(&self, ctx: &CancellationToken, req: PutBlobRequest) -> StorageResult<BlobInfo> {
        check_ctx(ctx)?;
        req.resource.validate()?;
        let info = BlobInfo {
            uid: uuid::Uuid::new_v4().to_string(),
            hash: hex::encode(Sha256::digest(&req.value)),
            size: req.value.len() as u64,
            content_type: req.content_type,
        };
        let path = blob_path(&req.resource, &info.uid);
        let meta = serde_json::to_vec(&info).map_err(|e| StorageError::Internal(e.to_string()))?;
        self.kv.put_value(SECTION_BLOBS, &path, &req.value)?;
        self.kv.put_value(SECTION_BLOBS, &format!("{}.meta", path), &meta)?;
        debug!(key = %req.resource, uid = %info.uid, size = info.size, "blob stored");
        Ok(info)
    }

    fn get_blob_sync(&self, ctx: &CancellationToken, key: &ResourceKey, uid: &str) -> StorageResult<BlobData> {
        check_ctx(ctx)?;
        key.validate()?;
        if uid.is_empty() || uid.contains('/') {
            return Err(StorageError::BadRequest(format!("invalid blob uid '{}'", uid)));
        }
        let path = blob_path(key, uid);
        let not_found = |e: KvError| match e {
            KvError::NotFound => StorageError::NotFound(format!("blob not found: {}/{}", key, uid)),
            other => other.into(),
        };
        let meta = self.kv.get_value(SECTION_BLOBS, &format!("{}.meta", path)).map_err(not_found)?;
        let info: BlobInfo = serde_json::from_slice(&meta).map_err(|e| StorageError::Internal(e.to_string()))?;
        let value = self.kv.get_value(SECTION_BLOBS, &path).map_err(not_found)?;
        Ok(BlobData { value, content_type: info.content_type, hash: info.hash })
    }
}

/// Up to `limit` persisted events with rv > `after_rv`, oldest first, values attached.
fn replay_page(kv: &dyn Kv, after_rv: i64, limit: usize) -> StorageResult<Vec<Arc<WrittenEvent>>> {
    let opts = ListOptions { start_key: EventKey::start_after(after_rv), limit, ..Default::default() };
    let mut out = Vec::with_capacity(limit);
    for k in kv.keys(SECTION_EVENTS, opts) {
        let k = k?;
        let ek = EventKey::parse(&k)?;
        let record: EventRecord = serde_json::from_slice(&kv.get_value(SECTION_EVENTS, &k)?)
            .map_err(|e| StorageError::Internal(format!("corrupt event {}: {}", k, e)))?;
        let dk = DataKey::new(&ek.key, ek.resource_version, ek.action, &ek.folder);
        let value = kv.get_value(SECTION_DATA, &dk.to_string())?;
        out.push(Arc::new(WrittenEvent {
            event_type: WatchEventType::from_action(ek.action),
            key: ek.key,
            value,
            folder: ek.folder,
            folder_changed: record.folder_changed,
            previous_rv: record.previous_rv,
            resource_version: ek.resource_version,
            timestamp: record.timestamp,
            requester: record.requester,
        }));
    }
    Ok(out)
}

/// Stream the event log after `since_rv` one page at a time. Returns the last RV sent,
/// or None when the watcher went away or the log could not be read.
async fn replay(
    ctx: &CancellationToken,
    kv: &dyn Kv,
    tx: &mpsc::Sender<Arc<WrittenEvent>>,
    since_rv: i64,
    page_size: usize,
) -> Option<i64> {
    let mut last_rv = since_rv;
    loop {
        if ctx.is_cancelled() {
            return None;
        }
        let page = match replay_page(kv, last_rv, page_size) {
            Ok(page) => page,
            Err(e) => {
                warn!(after_rv = last_rv, error = %e, "watch replay failed; closing stream");
                return None;
            }
        };
        let full = page.len() == page_size;
        for ev in page {
            last_rv = ev.resource_version;
            let sent = tokio::select! {
                _ = ctx.cancelled() => false,
                r = tx.send(ev) => r.is_ok(),
            };
            if !sent {
                return None;
            }
        }
        if !full {
            return Some(last_rv);
        }
    }
}

fn blob_path(key: &ResourceKey, uid: &str) -> String {
    format!("{}{}", key.identity_prefix(), uid)
}

fn latest_persisted_rv(kv: &dyn Kv) -> StorageResult<i64> {
    match kv.keys(SECTION_EVENTS, ListOptions::default().desc().limit(1)).next() {
        Some(k) => Ok(EventKey::parse(&k?)?.resource_version),
        None => Ok(0),
    }
}

fn decode_token(raw: &str) -> StorageResult<Option<ContinueToken>> {
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(ContinueToken::decode(raw)?))
}

struct Page<'a> {
    items: &'a [DataKey],
    more: bool,
}

fn paginate(all: &[DataKey], offset: usize, limit: usize) -> Page<'_> {
    let start = offset.min(all.len());
    let end = match limit {
        0 => all.len(),
        n => start.saturating_add(n).min(all.len()),
    };
    Page { items: &all[start..end], more: end < all.len() }
}

/// Forward live events to one watcher, in RV order, until it goes away.
async fn forward(
    ctx: CancellationToken,
    mut live: broadcast::Receiver<Arc<WrittenEvent>>,
    tx: mpsc::Sender<Arc<WrittenEvent>>,
    mut last_rv: i64,
) {
    increment_gauge!("storage_watchers", 1.0);
    loop {
        let ev = tokio::select! {
            _ = ctx.cancelled() => break,
            r = live.recv() => r,
        };
        match ev {
            Ok(ev) if ev.resource_version > last_rv => {
                last_rv = ev.resource_version;
                let sent = tokio::select! {
                    _ = ctx.cancelled() => false,
                    r = tx.send(ev) => r.is_ok(),
                };
                if !sent {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // a gap would break ordering guarantees; close instead
                warn!(skipped = n, last_rv, "watcher lagged; closing stream");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    decrement_gauge!("storage_watchers", 1.0);
    debug!(last_rv, "watch stream closed");
}

#[async_trait]
impl StorageBackend for KvBackend {
    async fn write_event(&self, ctx: &CancellationToken, event: WriteEvent) -> StorageResult<i64> {
        self.write_sync(ctx, event)
    }

    async fn read_resource(&self, ctx: &CancellationToken, key: &ResourceKey, at_rv: i64) -> StorageResult<ReadResponse> {
        self.read_sync(ctx, key, at_rv)
    }

    async fn list(&self, ctx: &CancellationToken, req: &ListRequest) -> StorageResult<ListResponse> {
        self.list_sync(ctx, req)
    }

    async fn list_history(&self, ctx: &CancellationToken, req: &HistoryRequest) -> StorageResult<ListResponse> {
        self.history_sync(ctx, req)
    }

    async fn list_modified_since(
        &self,
        ctx: &CancellationToken,
        shard: &NamespacedResource,
        since_rv: i64,
    ) -> StorageResult<(i64, Vec<ModifiedResource>)> {
        self.modified_since_sync(ctx, shard, since_rv)
    }

    async fn watch_write_events(&self, ctx: &CancellationToken, since_rv: Option<i64>) -> StorageResult<WatchStream> {
        check_ctx(ctx)?;
        // subscribe before replaying so nothing falls between the two
        let live = self.live.subscribe();
        let (tx, rx) = mpsc::channel(self.opts.watch_buffer.max(1));
        let ctx = ctx.clone();
        let kv = Arc::clone(&self.kv);
        let page_size = REPLAY_PAGE;
        tokio::spawn(async move {
            let last_rv = match since_rv {
                Some(rv) => match replay(&ctx, kv.as_ref(), &tx, rv, page_size).await {
                    Some(last) => last,
                    None => return,
                },
                None => 0,
            };
            forward(ctx, live, tx, last_rv).await;
        });
        Ok(rx)
    }

    async fn get_resource_stats(
        &self,
        ctx: &CancellationToken,
        namespace: &str,
        min_count: i64,
    ) -> StorageResult<Vec<ResourceStats>> {
        self.stats_sync(ctx, namespace, min_count)
    }

    async fn put_resource_blob(&self, ctx: &CancellationToken, req: PutBlobRequest) -> StorageResult<BlobInfo> {
        self.put_blob_sync(ctx, req)
    }

    async fn get_resource_blob(&self, ctx: &CancellationToken, key: &ResourceKey, uid: &str) -> StorageResult<BlobData> {
        self.get_blob_sync(ctx, key, uid)
    }

    fn current_rv(&self) -> i64 {
        self.commit.lock().last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_persist::MemKv;

    fn backend() -> KvBackend {
        KvBackend::new(Arc::new(MemKv::new()), BackendOptions::default()).unwrap()
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("dashboard.arca.dev", "dashboards", "default", name)
    }

    #[tokio::test]
    async fn conflicts_leave_state_untouched() {
        let b = backend();
        let ctx = CancellationToken::new();
        let rv1 = b.write_event(&ctx, WriteEvent::added(key("a"), b"v1".to_vec())).await.unwrap();
        let err = b.write_event(&ctx, WriteEvent::added(key("a"), b"v2".to_vec())).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        let err = b.write_event(&ctx, WriteEvent::modified(key("a"), b"v2".to_vec(), rv1 - 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(b.current_rv(), rv1);
        let read = b.read_resource(&ctx, &key("a"), 0).await.unwrap();
        assert_eq!((read.value.as_slice(), read.resource_version), (&b"v1"[..], rv1));
        let err = b.write_event(&ctx, WriteEvent::modified(key("missing"), Vec::new(), 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        let err = b.write_event(&ctx, WriteEvent { previous_rv: 3, ..WriteEvent::added(key("b"), Vec::new()) }).await;
        assert!(matches!(err, Err(StorageError::BadRequest(_))));
    }

    #[tokio::test]
    async fn time_travel_reads() {
        let b = backend();
        let ctx = CancellationToken::new();
        let rv1 = b.write_event(&ctx, WriteEvent::added(key("a"), b"1".to_vec())).await.unwrap();
        let rv2 = b.write_event(&ctx, WriteEvent::modified(key("a"), b"2".to_vec(), rv1)).await.unwrap();
        let rv3 = b.write_event(&ctx, WriteEvent::deleted(key("a"), Vec::new(), rv2)).await.unwrap();
        assert_eq!(b.read_resource(&ctx, &key("a"), rv1).await.unwrap().value, b"1");
        assert_eq!(b.read_resource(&ctx, &key("a"), rv2).await.unwrap().value, b"2");
        assert!(matches!(b.read_resource(&ctx, &key("a"), rv3).await, Err(StorageError::NotFound(_))));
        assert!(matches!(b.read_resource(&ctx, &key("a"), 0).await, Err(StorageError::NotFound(_))));
        assert!(matches!(b.read_resource(&ctx, &key("a"), rv1 - 1).await, Err(StorageError::NotFound(_))));
        // recreate continues the global sequence
        let rv4 = b.write_event(&ctx, WriteEvent::added(key("a"), b"3".to_vec())).await.unwrap();
        assert!(rv4 > rv3);
    }

    #[tokio::test]
    async fn cancelled_context_fails_fast() {
        let b = backend();
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = b.write_event(&ctx, WriteEvent::added(key("a"), Vec::new())).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        assert_eq!(b.current_rv(), 0);
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected_before_writing() {
        let b = backend();
        let ctx = CancellationToken::new();
        let err = b.write_event(&ctx, WriteEvent::added(ResourceKey::new("g", "r", "ns", ""), Vec::new())).await;
        assert_eq!(err.unwrap_err().to_string(), "name is required");
        let err = b.write_event(&ctx, WriteEvent::added(key("a"), Vec::new()).with_folder("a/b")).await;
        assert!(matches!(err, Err(StorageError::Key(_))));
        assert_eq!(b.current_rv(), 0);
    }

    #[tokio::test]
    async fn rv_is_seeded_from_the_event_log() {
        let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
        let ctx = CancellationToken::new();
        let first = KvBackend::new(Arc::clone(&kv), BackendOptions::default()).unwrap();
        let rv = first.write_event(&ctx, WriteEvent::added(key("a"), Vec::new())).await.unwrap();
        let second = KvBackend::new(kv, BackendOptions::default()).unwrap();
        assert_eq!(second.current_rv(), rv);
    }

    #[test]
    fn pagination_windows() {
        let keys: Vec<DataKey> =
            (1..=5).map(|i| DataKey::new(&key("a"), i, DataAction::Created, "")).collect();
        let p = paginate(&keys, 0, 2);
        assert_eq!((p.items.len(), p.more), (2, true));
        let p = paginate(&keys, 4, 2);
        assert_eq!((p.items.len(), p.more), (1, false));
        let p = paginate(&keys, 9, 0);
        assert_eq!((p.items.len(), p.more), (0, false));
    }
}
