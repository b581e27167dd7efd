//! One published shard index: search, facets, sorting and result tables.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arca_core::columns::{col, encode_cell, CellValue, ColumnDefinition, ColumnType, ResourceTable, TableRow};
use arca_core::document::*;
use arca_core::{IndexableDocument, NamespacedResource, ResourceKey};
use fs2::FileExt;
use metrics::{gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::mapping::{MappedDoc, Mapping};
use crate::query::{self, Query};
use crate::{
    check_ctx, Facet, FacetRequest, ManagedObject, ManagedObjectCount, SearchError, SearchRequest, SearchResponse,
    SearchResult, SortBy, TermFacet,
};

/// Columns `_all` expands to, ahead of the shard's own fields.
const DEFAULT_COLUMNS: [&str; 8] =
    [FIELD_ID, FIELD_TITLE, FIELD_TAGS, FIELD_FOLDER, FIELD_RV, FIELD_CREATED, FIELD_LEGACY_ID, FIELD_MANAGER_KIND];
/// Custom fields with a higher priority number stay out of `_all`.
const MAX_DEFAULT_PRIORITY: i32 = 10;

/// Where an index lives.
#[derive(Debug)]
pub enum IndexStorage {
    Memory,
    /// Directory of a file index; the lock is held until the index is closed.
    File { dir: PathBuf, lock: Mutex<Option<File>> },
}

impl IndexStorage {
    /// Take the exclusive lock of an index directory.
    pub(crate) fn lock_dir(dir: &Path) -> SearchResult<Self> {
        let file = std::fs::OpenOptions::new().create(true).write(true).open(dir.join("index.lock"))?;
        file.try_lock_exclusive().map_err(|_| SearchError::Locked)?;
        Ok(IndexStorage::File { dir: dir.to_path_buf(), lock: Mutex::new(Some(file)) })
    }

    pub fn dir(&self) -> Option<&Path> {
        match self {
            IndexStorage::Memory => None,
            IndexStorage::File { dir, .. } => Some(dir),
        }
    }
}

/// A document change applied to a published index.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkItem {
    Index(IndexableDocument),
    Delete { key: ResourceKey, rv: i64 },
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub doc: Arc<MappedDoc>,
    pub explain: Option<Value>,
}

pub struct ShardIndex {
    key: NamespacedResource,
    fields: DocumentFields,
    mapping: Mapping,
    engine: RwLock<Engine>,
    storage: IndexStorage,
}

impl std::fmt::Debug for ShardIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardIndex")
            .field("key", &self.key)
            .field("storage", &self.storage)
            .field("docs", &self.engine.read().doc_count())
            .finish()
    }
}

impl ShardIndex {
    pub(crate) fn new(key: NamespacedResource, fields: DocumentFields, engine: Engine, storage: IndexStorage) -> Self {
        let mapping = Mapping::new(&fields);
        Self { key, fields, mapping, engine: RwLock::new(engine), storage }
    }

    pub fn key(&self) -> &NamespacedResource {
        &self.key
    }

    pub fn fields(&self) -> &DocumentFields {
        &self.fields
    }

    pub fn storage(&self) -> &IndexStorage {
        &self.storage
    }

    pub fn is_file(&self) -> bool {
        self.storage.dir().is_some()
    }

    /// RV the index content reflects.
    pub fn rv(&self) -> i64 {
        self.engine.read().rv()
    }

    pub(crate) fn engine(&self) -> &RwLock<Engine> {
        &self.engine
    }

    /// Write a file index to disk; memory indexes are left alone.
    pub(crate) fn persist(&self, engine: &Engine) -> SearchResult<()> {
        if let Some(dir) = self.storage.dir() {
            engine.save(dir)?;
        }
        Ok(())
    }

    /// Release the directory lock of a file index.
    pub(crate) fn close(&self) {
        if let IndexStorage::File { dir, lock } = &self.storage {
            if let Some(file) = lock.lock().take() {
                if let Err(e) = FileExt::unlock(&file) {
                    warn!(dir = %dir.display(), error = %e, "index unlock failed");
                }
            }
        }
    }

    /// Apply changes to the published index.
    pub fn bulk_index(&self, ctx: &CancellationToken, items: Vec<BulkItem>) -> SearchResult<()> {
        check_ctx(ctx)?;
        let mapped: Vec<(Option<MappedDoc>, String, i64)> = items
            .iter()
            .map(|item| match item {
                BulkItem::Index(doc) => (Some(self.mapping.map(doc)), doc.key.search_id(), doc.rv),
                BulkItem::Delete { key, rv } => (None, key.search_id(), *rv),
            })
            .collect();
        let mut engine = self.engine.write();
        for (doc, id, rv) in mapped {
            match doc {
                Some(d) => engine.upsert(d)?,
                None => {
                    engine.remove(&id);
                }
            }
            if rv > engine.rv() {
                engine.set_rv(rv);
            }
        }
        self.persist(&engine)?;
        gauge!("search_index_docs", engine.doc_count() as f64, "shard" => self.key.to_string());
        debug!(shard = %self.key, items = items.len(), rv = engine.rv(), "bulk index applied");
        Ok(())
    }

    /// Documents in the index, or in one folder when `folder` is non-empty.
    pub fn doc_count(&self, ctx: &CancellationToken, folder: &str) -> SearchResult<i64> {
        check_ctx(ctx)?;
        let engine = self.engine.read();
        if folder.is_empty() {
            return Ok(engine.doc_count() as i64);
        }
        Ok(engine.eval(&Query::term(FIELD_FOLDER, folder)).len() as i64)
    }

    fn verify_key(&self, key: Option<&NamespacedResource>) -> SearchResult<()> {
        let Some(k) = key else { return Err(SearchError::BadRequest("missing query key".into())) };
        if k.namespace != self.key.namespace {
            return Err(SearchError::BadRequest(format!("namespace mismatch (expected {})", self.key.namespace)));
        }
        if k.group != self.key.group {
            return Err(SearchError::BadRequest(format!("group mismatch (expected {})", self.key.group)));
        }
        if k.resource != self.key.resource {
            return Err(SearchError::BadRequest(format!("resource mismatch (expected {})", self.key.resource)));
        }
        Ok(())
    }

    /// Requirement and free-text queries of `req`, ANDed, in this index's field mapping.
    fn to_query(&self, req: &SearchRequest) -> SearchResult<Query> {
        let mut parts = Vec::with_capacity(req.labels.len() + req.requirements.len() + 1);
        for r in &req.labels {
            parts.push(query::requirement_query(&self.mapping, r, true)?);
        }
        for r in &req.requirements {
            parts.push(query::requirement_query(&self.mapping, r, false)?);
        }
        parts.push(query::parse_query_string(&self.mapping, &req.query)?);
        Ok(Query::and(parts))
    }

    fn hits(&self, q: &Query, explain: bool) -> Vec<SearchHit> {
        let engine = self.engine.read();
        engine
            .eval(q)
            .into_iter()
            .filter_map(|(id, score)| {
                engine.doc(id).map(|d| SearchHit {
                    id: d.id.clone(),
                    score,
                    doc: d.clone(),
                    explain: explain.then(|| {
                        serde_json::json!({"value": score, "query": q.to_string(), "index": self.key.to_string()})
                    }),
                })
            })
            .collect()
    }

    /// Search this index, together with `federated` when the request names secondary shards.
    pub fn search(
        &self,
        ctx: &CancellationToken,
        req: &SearchRequest,
        federated: &[Arc<ShardIndex>],
    ) -> SearchResult<SearchResponse> {
        check_ctx(ctx)?;
        let t0 = Instant::now();
        self.verify_key(req.key.as_ref())?;
        if federated.len() != req.federated.len() {
            return Err(SearchError::Internal("federation is misconfigured".into()));
        }
        for (idx, want) in federated.iter().zip(req.federated.iter()) {
            if idx.key() != want {
                return Err(SearchError::BadRequest("federated index keys do not match".into()));
            }
        }

        let mut hits = self.hits(&self.to_query(req)?, req.explain);
        for idx in federated {
            check_ctx(ctx)?;
            hits.extend(idx.hits(&idx.to_query(req)?, req.explain));
        }

        let total_hits = hits.len() as u64;
        let max_score = hits.iter().map(|h| h.score).fold(0.0, f64::max);
        let facets = req
            .facets
            .iter()
            .map(|(name, f)| (name.clone(), self.facet(f, &hits)))
            .collect::<BTreeMap<_, _>>();
        self.sort_hits(&mut hits, &req.sort_by, &req.query);

        let page: Vec<SearchHit> = hits.into_iter().skip(req.offset).take(req.limit).collect();
        let results = if req.fields.is_empty() && req.limit > 0 {
            let mut stored = vec![FIELD_ID.to_string()];
            stored.extend(
                self.engine
                    .read()
                    .stored_fields()
                    .into_iter()
                    .map(|f| f.strip_prefix(FIELD_PREFIX).map(str::to_string).unwrap_or(f)),
            );
            self.hits_to_table(&stored, &page, req.explain)?
        } else {
            self.hits_to_table(&req.fields, &page, req.explain)?
        };

        histogram!("search_query_ms", t0.elapsed().as_secs_f64() * 1000.0, "shard" => self.key.to_string());
        debug!(shard = %self.key, total_hits, federated = federated.len(), took_ms = %t0.elapsed().as_millis(), "search");
        Ok(SearchResponse { results, total_hits, max_score, facets })
    }

    fn facet(&self, req: &FacetRequest, hits: &[SearchHit]) -> Facet {
        let field = self.mapping.resolve(&req.field);
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        let mut missing = 0i64;
        for h in hits {
            let values = h.doc.stored.get(&field).map(facet_values).unwrap_or_default();
            if values.is_empty() {
                missing += 1;
            }
            for v in values {
                *counts.entry(v).or_default() += 1;
            }
        }
        let total = counts.values().sum();
        let mut terms: Vec<TermFacet> = counts.into_iter().map(|(term, count)| TermFacet { term, count }).collect();
        // BTreeMap order breaks count ties by term
        terms.sort_by(|a, b| b.count.cmp(&a.count));
        if req.limit > 0 {
            terms.truncate(req.limit);
        }
        Facet { field: req.field.clone(), total, missing, terms }
    }

    fn sort_hits(&self, hits: &mut [SearchHit], sort: &[SortBy], text: &str) {
        let mut keys: Vec<(String, bool, bool)> = Vec::new();
        let order = if sort.is_empty() {
            let text = text.trim();
            if !text.is_empty() && text != "*" {
                vec![SortBy::desc(FIELD_SCORE)]
            } else {
                vec![SortBy::asc(FIELD_TITLE)]
            }
        } else {
            sort.to_vec()
        };
        for s in order {
            let field = self.mapping.sort_field(&s.field);
            let numeric = field.starts_with("stats.") || self.mapping.kind(&field).is_numeric();
            keys.push((field, s.desc, numeric));
        }
        keys.push((FIELD_ID.to_string(), false, false));

        hits.sort_by(|a, b| {
            for (field, desc, numeric) in &keys {
                let dir = |o: Ordering| if *desc { o.reverse() } else { o };
                let ord = match field.as_str() {
                    FIELD_SCORE => dir(a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal)),
                    FIELD_ID => dir(a.id.cmp(&b.id)),
                    f if *numeric => match (sort_number(a.doc.stored.get(f)), sort_number(b.doc.stored.get(f))) {
                        (Some(x), Some(y)) => dir(x.partial_cmp(&y).unwrap_or(Ordering::Equal)),
                        (x, y) => missing_last(x.is_some(), y.is_some()),
                    },
                    f => match (sort_text(a.doc.stored.get(f)), sort_text(b.doc.stored.get(f))) {
                        (Some(x), Some(y)) => dir(x.cmp(&y)),
                        (x, y) => missing_last(x.is_some(), y.is_some()),
                    },
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    fn columns(&self, fields: &[String], explain: bool) -> Vec<ColumnDefinition> {
        let mut cols: Vec<ColumnDefinition> = Vec::new();
        let mut push = |c: ColumnDefinition| {
            if !cols.iter().any(|x| x.name == c.name) {
                cols.push(c);
            }
        };
        for name in fields {
            if name == FIELD_ALL {
                DEFAULT_COLUMNS.iter().filter_map(|n| standard_column(n)).for_each(&mut push);
                self.fields.fields.iter().filter(|f| f.priority <= MAX_DEFAULT_PRIORITY).cloned().for_each(&mut push);
            } else if let Some(c) = standard_column(name) {
                push(c);
            } else if let Some(c) = self.fields.field(name) {
                push(c.clone());
            } else if name.starts_with(&format!("{FIELD_LABELS}.")) {
                push(col(name, ColumnType::String, 0));
            }
        }
        if explain {
            push(col(FIELD_EXPLAIN, ColumnType::Json, 0));
        }
        cols
    }

    /// Encode hits as a typed table. Any cell that fails to encode fails the whole table.
    pub fn hits_to_table(&self, fields: &[String], hits: &[SearchHit], explain: bool) -> SearchResult<ResourceTable> {
        let columns = self.columns(fields, explain);
        let legacy_label = format!("{FIELD_LABELS}.{LABEL_LEGACY_ID}");
        let mut rows = Vec::with_capacity(hits.len());
        for (r, hit) in hits.iter().enumerate() {
            let key = ResourceKey::from_search_id(&hit.id).map_err(|e| SearchError::Internal(e.to_string()))?;
            let mut cells = Vec::with_capacity(columns.len());
            for (c, column) in columns.iter().enumerate() {
                let value = match column.name.as_str() {
                    FIELD_ID => CellValue::String(hit.id.clone()),
                    FIELD_SCORE => CellValue::Double(hit.score),
                    FIELD_EXPLAIN => hit.explain.clone().map(CellValue::Json).unwrap_or(CellValue::Null),
                    FIELD_LEGACY_ID => hit
                        .doc
                        .stored
                        .get(&legacy_label)
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse::<i64>().ok())
                        .map(CellValue::Int)
                        .unwrap_or(CellValue::Null),
                    name => hit
                        .doc
                        .stored
                        .get(name)
                        .or_else(|| hit.doc.stored.get(&format!("{FIELD_PREFIX}{name}")))
                        .map(CellValue::from_json)
                        .unwrap_or(CellValue::Null),
                };
                let cell = encode_cell(column.kind, &value)
                    .map_err(|e| SearchError::Internal(format!("error encoding (row:{r}/col:{c}) {e}")))?;
                cells.push(cell);
            }
            rows.push(TableRow { key, cells });
        }
        Ok(ResourceTable { columns, rows })
    }

    /// Resources managed by one manager, ordered by source path.
    pub fn list_managed_objects(&self, ctx: &CancellationToken, kind: &str, id: &str) -> SearchResult<Vec<ManagedObject>> {
        check_ctx(ctx)?;
        if kind.is_empty() {
            return Err(SearchError::BadRequest("empty manager kind".into()));
        }
        if id.is_empty() {
            return Err(SearchError::BadRequest("empty manager id".into()));
        }
        let q = Query::Conjunction(vec![Query::term(FIELD_MANAGER_KIND, kind), Query::term(FIELD_MANAGER_ID, id)]);
        let text = |h: &SearchHit, f: &str| h.doc.stored.get(f).and_then(Value::as_str).unwrap_or("").to_string();
        let mut items = self
            .hits(&q, false)
            .iter()
            .map(|h| {
                Ok(ManagedObject {
                    key: ResourceKey::from_search_id(&h.id).map_err(|e| SearchError::Internal(e.to_string()))?,
                    path: text(h, FIELD_SOURCE_PATH),
                    hash: text(h, FIELD_SOURCE_CHECKSUM),
                    time: h.doc.stored.get(FIELD_SOURCE_TIME).and_then(Value::as_i64).unwrap_or(0),
                    title: text(h, FIELD_TITLE),
                    folder: text(h, FIELD_FOLDER),
                })
            })
            .collect::<SearchResult<Vec<_>>>()?;
        items.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(items)
    }

    /// Managed resource counts per manager.
    pub fn count_managed_objects(&self, ctx: &CancellationToken) -> SearchResult<Vec<ManagedObjectCount>> {
        check_ctx(ctx)?;
        let hits = self.hits(&Query::MatchAll, false);
        let facet = self.facet(&FacetRequest { field: FIELD_MANAGED_BY.into(), limit: 0 }, &hits);
        Ok(facet
            .terms
            .into_iter()
            .filter_map(|t| {
                let (kind, id) = t.term.split_once(':')?;
                Some(ManagedObjectCount {
                    kind: kind.to_string(),
                    id: id.to_string(),
                    group: self.key.group.clone(),
                    resource: self.key.resource.clone(),
                    count: t.count,
                })
            })
            .collect())
    }
}

fn facet_values(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

fn sort_number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn sort_text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Hits without a value sort after hits with one, whatever the direction.
fn missing_last(a: bool, b: bool) -> Ordering {
    match (a, b) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
