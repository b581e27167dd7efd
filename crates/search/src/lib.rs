//! Arca search: one inverted index per (namespace, group, resource) shard.
//!
//! Indexes are built from a caller-supplied document stream, kept in memory or
//! on disk depending on their expected size, and cached by the [`SearchBackend`]
//! that built them. Queries combine structured requirements with free text and
//! can federate several shards into one result.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use arca_core::columns::ResourceTable;
use arca_core::{ErrorResult, NamespacedResource, ResourceKey};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod analysis;
mod backend;
pub mod engine;
mod index;
pub mod mapping;
pub mod query;

pub use backend::{BatchWriter, SearchBackend};
pub use index::{BulkItem, IndexStorage, SearchHit, ShardIndex};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("{0}")]
    BadRequest(String),
    #[error("index is locked by another process")]
    Locked,
    #[error("context cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("index file: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<&SearchError> for ErrorResult {
    fn from(e: &SearchError) -> Self {
        let msg = e.to_string();
        match e {
            SearchError::BadRequest(_) => ErrorResult::bad_request(msg),
            SearchError::Cancelled => ErrorResult::cancelled(msg),
            _ => ErrorResult::internal(msg),
        }
    }
}

impl From<SearchError> for ErrorResult {
    fn from(e: SearchError) -> Self {
        ErrorResult::from(&e)
    }
}

pub type SearchResult<T> = Result<T, SearchError>;

pub(crate) fn check_ctx(ctx: &CancellationToken) -> SearchResult<()> {
    if ctx.is_cancelled() {
        return Err(SearchError::Cancelled);
    }
    Ok(())
}

/// Tunables for [`SearchBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    /// Parent directory of all file-backed indexes.
    pub root: PathBuf,
    /// Shards expected to hold at least this many documents are file-backed; 0 keeps all in memory.
    pub file_threshold: usize,
    /// Documents buffered before a flush into the index being built.
    pub batch_size: usize,
    /// Memory indexes older than this are evicted on lookup; zero disables eviction.
    pub index_cache_ttl: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            root: default_index_root(),
            file_threshold: 1000,
            batch_size: 100,
            index_cache_ttl: Duration::ZERO,
        }
    }
}

impl SearchOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            root: std::env::var_os("ARCA_SEARCH_ROOT").map(PathBuf::from).unwrap_or(d.root),
            file_threshold: std::env::var("ARCA_INDEX_FILE_THRESHOLD")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(d.file_threshold),
            batch_size: std::env::var("ARCA_INDEX_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(d.batch_size),
            index_cache_ttl: std::env::var("ARCA_INDEX_CACHE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(d.index_cache_ttl),
        }
    }
}

fn default_index_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".arca").join("index"),
        None => PathBuf::from("arca-index"),
    }
}

/// `key operator values`, e.g. `tags = [aa]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Requirement {
    pub fn equals(key: &str, values: &[&str]) -> Self {
        Self { key: key.to_string(), operator: "=".to_string(), values: values.iter().map(|v| v.to_string()).collect() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    #[serde(default)]
    pub desc: bool,
}

impl SortBy {
    pub fn asc(field: &str) -> Self {
        Self { field: field.to_string(), desc: false }
    }

    pub fn desc(field: &str) -> Self {
        Self { field: field.to_string(), desc: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetRequest {
    pub field: String,
    /// 0 returns every term.
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// The shard being searched; must match the index it is sent to.
    pub key: Option<NamespacedResource>,
    #[serde(default)]
    pub query: String,
    /// Columns of the result table; `_all` for the default projection.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub labels: Vec<Requirement>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub sort_by: Vec<SortBy>,
    #[serde(default)]
    pub facets: BTreeMap<String, FacetRequest>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub explain: bool,
    /// Secondary shards searched together with the primary.
    #[serde(default)]
    pub federated: Vec<NamespacedResource>,
}

impl SearchRequest {
    pub fn new(key: NamespacedResource) -> Self {
        Self { key: Some(key), limit: 100, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermFacet {
    pub term: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub field: String,
    pub total: i64,
    pub missing: i64,
    pub terms: Vec<TermFacet>,
}

impl Facet {
    pub fn count(&self, term: &str) -> Option<i64> {
        self.terms.iter().find(|t| t.term == term).map(|t| t.count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: ResourceTable,
    pub total_hits: u64,
    pub max_score: f64,
    #[serde(default)]
    pub facets: BTreeMap<String, Facet>,
}

/// An externally managed resource, as tracked by its manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub key: ResourceKey,
    pub path: String,
    pub hash: String,
    /// Source timestamp in milliseconds.
    pub time: i64,
    pub title: String,
    pub folder: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedObjectCount {
    pub kind: String,
    pub id: String,
    pub group: String,
    pub resource: String,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_codes() {
        assert_eq!(ErrorResult::from(SearchError::BadRequest("x".into())).code, 400);
        assert_eq!(ErrorResult::from(SearchError::Cancelled).code, 499);
        let locked = ErrorResult::from(SearchError::Locked);
        assert_eq!((locked.code, locked.message.as_str()), (500, "index is locked by another process"));
    }

    #[test]
    fn requests_deserialize_with_defaults() {
        let req: SearchRequest = serde_json::from_value(serde_json::json!({
            "key": {"namespace": "ns", "group": "g", "resource": "r"},
            "query": "aaa",
            "facets": {"tags": {"field": "tags", "limit": 5}}
        }))
        .unwrap();
        assert_eq!(req.key, Some(NamespacedResource::new("ns", "g", "r")));
        assert_eq!(req.facets["tags"].limit, 5);
        assert_eq!((req.limit, req.offset, req.explain), (0, 0, false));
    }
}
