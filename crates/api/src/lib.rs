//! Arca resource server (in-process).
//!
//! This crate defines the service surface frontends (CLI, RPC adapters) depend on:
//! request/response types, the [`ResourceServer`] trait and its in-process
//! implementation over a [`StorageBackend`](arca_store::StorageBackend) and a
//! [`SearchBackend`](arca_search::SearchBackend).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use arca_core::columns::ResourceTable;
use arca_core::document::DocumentError;
use arca_core::{BlobInfo, ErrorResult, NamespacedResource, ResourceKey};
use arca_search::{Facet, ManagedObject, ManagedObjectCount, SearchError, SearchRequest};
use arca_store::StorageError;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

mod access;
mod indexer;
mod server;

pub use access::{AccessClient, AllowAll, Verb};
pub use arca_store::{PutBlobRequest, ResourceStats, VersionMatch, WatchEventType};
pub use indexer::IndexController;
pub use server::InProcServer;

/// Failures of the server itself. Domain errors travel inside responses as [`ErrorResult`].
#[derive(Debug, thiserror::Error)]
pub enum ArcaError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Status(#[from] ErrorResult),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<&ArcaError> for ErrorResult {
    fn from(e: &ArcaError) -> Self {
        match e {
            ArcaError::Storage(s) => ErrorResult::from(s),
            ArcaError::Search(s) => ErrorResult::from(s),
            ArcaError::Document(d) => ErrorResult::bad_request(d.to_string()),
            ArcaError::Status(r) => r.clone(),
            ArcaError::Internal(m) => ErrorResult::internal(m.clone()),
        }
    }
}

impl From<ArcaError> for ErrorResult {
    fn from(e: ArcaError) -> Self {
        ErrorResult::from(&e)
    }
}

pub type ArcaResult<T> = Result<T, ArcaError>;

pub const CODE_FORBIDDEN: i32 = 403;

pub(crate) fn forbidden(verb: Verb, key: &ResourceKey) -> ErrorResult {
    ErrorResult::new(CODE_FORBIDDEN, "Forbidden", format!("{} {} is not allowed", verb.as_str(), key))
}

// ----------------- Requests and responses -----------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    pub key: ResourceKey,
    /// JSON object; `metadata.name`/`metadata.namespace` must agree with `key` when present.
    pub value: Vec<u8>,
    pub requester: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateResponse {
    pub resource_version: i64,
    pub error: Option<ErrorResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    pub key: ResourceKey,
    pub value: Vec<u8>,
    /// The RV the caller last observed; 0 skips the check.
    pub resource_version: i64,
    pub requester: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResponse {
    pub resource_version: i64,
    pub error: Option<ErrorResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: ResourceKey,
    /// The RV the caller last observed; 0 skips the check.
    pub resource_version: i64,
    pub requester: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteResponse {
    pub resource_version: i64,
    pub error: Option<ErrorResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadRequest {
    pub key: ResourceKey,
    /// 0 reads the latest version.
    pub resource_version: i64,
    pub requester: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadResponse {
    pub value: Vec<u8>,
    pub resource_version: i64,
    pub folder: String,
    pub error: Option<ErrorResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Name is ignored; an empty namespace lists every namespace.
    pub key: ResourceKey,
    pub limit: usize,
    pub resource_version: i64,
    pub next_page_token: String,
    pub requester: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRequest {
    pub key: ResourceKey,
    pub limit: usize,
    pub next_page_token: String,
    pub version_match: VersionMatch,
    pub resource_version: i64,
    pub requester: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceWrapper {
    pub key: ResourceKey,
    pub resource_version: i64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListResponse {
    pub items: Vec<ResourceWrapper>,
    pub next_page_token: String,
    pub resource_version: i64,
    pub error: Option<ErrorResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchRequest {
    /// Empty fields match everything.
    pub key: NamespacedResource,
    /// Replay committed events after this RV before following live ones.
    pub since_rv: Option<i64>,
    /// Start with an `Added` event per live resource; requires group and resource.
    pub send_initial_events: bool,
    pub requester: String,
}

impl WatchRequest {
    pub fn matches(&self, key: &ResourceKey) -> bool {
        let f = &self.key;
        (f.namespace.is_empty() || f.namespace == key.namespace)
            && (f.group.is_empty() || f.group == key.group)
            && (f.resource.is_empty() || f.resource == key.resource)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub key: ResourceKey,
    pub value: Vec<u8>,
    pub folder: String,
    pub resource_version: i64,
    pub previous_rv: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    pub results: ResourceTable,
    pub total_hits: u64,
    pub max_score: f64,
    pub facets: BTreeMap<String, Facet>,
    pub error: Option<ErrorResult>,
}

impl From<arca_search::SearchResponse> for SearchResponse {
    fn from(r: arca_search::SearchResponse) -> Self {
        Self { results: r.results, total_hits: r.total_hits, max_score: r.max_score, facets: r.facets, error: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsRequest {
    /// Empty for every namespace.
    pub namespace: String,
    /// Shards with at most this many resources are left out.
    pub min_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsResponse {
    pub stats: Vec<ResourceStats>,
    pub error: Option<ErrorResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PutBlobResponse {
    pub blob: BlobInfo,
    pub error: Option<ErrorResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetBlobRequest {
    pub resource: ResourceKey,
    /// Resource version whose blob annotation is followed when `uid` is empty.
    pub resource_version: i64,
    /// Empty for the blob currently linked from the resource.
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GetBlobResponse {
    pub value: Vec<u8>,
    pub content_type: String,
    pub hash: String,
    pub error: Option<ErrorResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListManagedObjectsRequest {
    pub namespace: String,
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListManagedObjectsResponse {
    pub items: Vec<ManagedObject>,
    pub error: Option<ErrorResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountManagedObjectsRequest {
    pub namespace: String,
    /// Empty counts every manager kind.
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountManagedObjectsResponse {
    pub items: Vec<ManagedObjectCount>,
    pub error: Option<ErrorResult>,
}

// ----------------- Service surface -----------------

/// Service surface over versioned storage and search.
///
/// Every method observes `ctx`. Domain failures (not found, conflicts, bad input,
/// denied access) are reported in the response's `error`; `Err` is reserved for
/// the server failing to produce a response at all.
#[async_trait::async_trait]
pub trait ResourceServer: Send + Sync {
    /// Create a resource that does not exist yet.
    async fn create(&self, ctx: &CancellationToken, req: CreateRequest) -> ArcaResult<CreateResponse>;

    /// Replace the value of a live resource, guarded by the observed RV.
    async fn update(&self, ctx: &CancellationToken, req: UpdateRequest) -> ArcaResult<UpdateResponse>;

    /// Delete a live resource, leaving a deletion marker in its history.
    async fn delete(&self, ctx: &CancellationToken, req: DeleteRequest) -> ArcaResult<DeleteResponse>;

    /// Read the latest version, or the version current at `resource_version`.
    async fn read(&self, ctx: &CancellationToken, req: ReadRequest) -> ArcaResult<ReadResponse>;

    /// List live resources at a fixed RV, paginated by continue token.
    async fn list(&self, ctx: &CancellationToken, req: ListRequest) -> ArcaResult<ListResponse>;

    /// Versions of one resource since its last deletion.
    async fn history(&self, ctx: &CancellationToken, req: HistoryRequest) -> ArcaResult<ListResponse>;

    /// Stream committed writes in RV order until `ctx` fires or the handle is cancelled.
    async fn watch(&self, ctx: &CancellationToken, req: WatchRequest) -> ArcaResult<StreamHandle<WatchEvent>>;

    /// Search one shard, optionally federated with others.
    async fn search(&self, ctx: &CancellationToken, req: SearchRequest) -> ArcaResult<SearchResponse>;

    async fn get_stats(&self, ctx: &CancellationToken, req: StatsRequest) -> ArcaResult<StatsResponse>;

    async fn put_blob(&self, ctx: &CancellationToken, req: PutBlobRequest) -> ArcaResult<PutBlobResponse>;

    /// Fetch a blob by uid, or the one linked from the resource when `uid` is empty.
    async fn get_blob(&self, ctx: &CancellationToken, req: GetBlobRequest) -> ArcaResult<GetBlobResponse>;

    async fn list_managed_objects(
        &self,
        ctx: &CancellationToken,
        req: ListManagedObjectsRequest,
    ) -> ArcaResult<ListManagedObjectsResponse>;

    async fn count_managed_objects(
        &self,
        ctx: &CancellationToken,
        req: CountManagedObjectsRequest,
    ) -> ArcaResult<CountManagedObjectsResponse>;
}

// ----------------- Streaming primitives -----------------

/// Cancellation handle that stops the underlying task.
pub struct CancelHandle {
    token: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        self.token.cancel();
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Generic stream handle used by streaming endpoints.
pub struct StreamHandle<T> {
    pub rx: tokio::sync::mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_keep_their_codes() {
        let e = ArcaError::from(StorageError::Conflict("stale".into()));
        assert_eq!(ErrorResult::from(&e).code, 409);
        let e = ArcaError::from(SearchError::BadRequest("bad".into()));
        assert_eq!(ErrorResult::from(&e).code, 400);
        let e = ArcaError::Document(DocumentError::NotAnObject("[]".into()));
        assert_eq!(ErrorResult::from(&e).reason, "BadRequest");
        assert_eq!(ErrorResult::from(ArcaError::Internal("x".into())).code, 500);
    }

    #[test]
    fn watch_filters_use_wildcards() {
        let k = ResourceKey::new("g", "r", "ns", "a");
        let all = WatchRequest::default();
        assert!(all.matches(&k));
        let one = WatchRequest { key: NamespacedResource::new("ns", "g", "r"), ..Default::default() };
        assert!(one.matches(&k));
        let other = WatchRequest { key: NamespacedResource::new("", "g", "other"), ..Default::default() };
        assert!(!other.matches(&k));
    }
}
