//! Arca storage: versioned resources on top of the KV layer.
//!
//! Every write appends a history entry to `unified/data` and a record to
//! `unified/events`, stamped with a store-wide resource version (RV). Reads can
//! travel back to any RV; watchers see writes in RV order.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arca_core::{BlobInfo, ContinueToken, DataAction, ErrorResult, KeyError, NamespacedResource, ResourceKey, TokenError};
use arca_persist::KvError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod backend;
pub mod events;

pub use backend::KvBackend;
pub use events::{EventKey, RvGenerator};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("context cancelled")]
    Cancelled,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("{0}")]
    Internal(String),
}

impl From<TokenError> for StorageError {
    fn from(e: TokenError) -> Self {
        StorageError::BadRequest(e.to_string())
    }
}

impl From<&StorageError> for ErrorResult {
    fn from(e: &StorageError) -> Self {
        let msg = e.to_string();
        match e {
            StorageError::NotFound(_) => ErrorResult::not_found(msg),
            StorageError::Kv(kv) if kv.is_not_found() => ErrorResult::not_found(msg),
            StorageError::AlreadyExists(_) => ErrorResult::already_exists(msg),
            StorageError::Conflict(_) => ErrorResult::conflict(msg),
            StorageError::BadRequest(_) | StorageError::Key(_) => ErrorResult::bad_request(msg),
            StorageError::Cancelled => ErrorResult::cancelled(msg),
            StorageError::Kv(_) | StorageError::Internal(_) => ErrorResult::internal(msg),
        }
    }
}

impl From<StorageError> for ErrorResult {
    fn from(e: StorageError) -> Self {
        ErrorResult::from(&e)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

pub(crate) fn check_ctx(ctx: &CancellationToken) -> StorageResult<()> {
    if ctx.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub fn action(&self) -> DataAction {
        match self {
            WatchEventType::Added => DataAction::Created,
            WatchEventType::Modified => DataAction::Updated,
            WatchEventType::Deleted => DataAction::Deleted,
        }
    }

    pub fn from_action(action: DataAction) -> Self {
        match action {
            DataAction::Created => WatchEventType::Added,
            DataAction::Updated => WatchEventType::Modified,
            DataAction::Deleted => WatchEventType::Deleted,
        }
    }
}

/// A requested mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEvent {
    pub event_type: WatchEventType,
    pub key: ResourceKey,
    pub value: Vec<u8>,
    /// Must equal the current RV for updates and deletes; 0 for creates.
    pub previous_rv: i64,
    pub requester: String,
    pub folder: String,
    pub folder_changed: bool,
}

impl WriteEvent {
    pub fn added(key: ResourceKey, value: Vec<u8>) -> Self {
        Self::new(WatchEventType::Added, key, value, 0)
    }

    pub fn modified(key: ResourceKey, value: Vec<u8>, previous_rv: i64) -> Self {
        Self::new(WatchEventType::Modified, key, value, previous_rv)
    }

    pub fn deleted(key: ResourceKey, value: Vec<u8>, previous_rv: i64) -> Self {
        Self::new(WatchEventType::Deleted, key, value, previous_rv)
    }

    fn new(event_type: WatchEventType, key: ResourceKey, value: Vec<u8>, previous_rv: i64) -> Self {
        Self {
            event_type,
            key,
            value,
            previous_rv,
            requester: String::new(),
            folder: String::new(),
            folder_changed: false,
        }
    }

    pub fn with_folder(mut self, folder: &str) -> Self {
        self.folder = folder.to_string();
        self
    }
}

/// A committed write as delivered to watchers.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenEvent {
    pub event_type: WatchEventType,
    pub key: ResourceKey,
    pub value: Vec<u8>,
    pub folder: String,
    pub folder_changed: bool,
    pub previous_rv: i64,
    pub resource_version: i64,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub requester: String,
}

pub type WatchStream = mpsc::Receiver<Arc<WrittenEvent>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResponse {
    pub key: ResourceKey,
    pub value: Vec<u8>,
    pub resource_version: i64,
    pub folder: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Namespace may be empty for all namespaces; name is ignored.
    pub key: ResourceKey,
    /// 0 means no limit.
    pub limit: usize,
    /// 0 means "now".
    pub resource_version: i64,
    pub next_page_token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VersionMatch {
    #[default]
    Unset,
    /// Entries with rv >= the request RV, oldest first.
    NotOlderThan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRequest {
    pub key: ResourceKey,
    pub limit: usize,
    pub next_page_token: String,
    pub version_match: VersionMatch,
    pub resource_version: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResponse {
    pub items: Vec<ReadResponse>,
    /// Empty when there is nothing more to read.
    pub next_page_token: String,
    pub resource_version: i64,
}

impl ListResponse {
    pub fn continue_token(&self) -> Option<ContinueToken> {
        ContinueToken::decode(&self.next_page_token).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedResource {
    pub action: DataAction,
    pub resource_version: i64,
    pub key: ResourceKey,
    /// Empty for deletes.
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResourceStats {
    pub namespace: String,
    pub group: String,
    pub resource: String,
    pub count: i64,
    pub resource_version: i64,
}

impl ResourceStats {
    pub fn shard(&self) -> NamespacedResource {
        NamespacedResource::new(&self.namespace, &self.group, &self.resource)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutBlobRequest {
    pub resource: ResourceKey,
    pub content_type: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobData {
    pub value: Vec<u8>,
    pub content_type: String,
    pub hash: String,
}

/// Versioned resource storage. Every call observes `ctx` and fails with
/// `Cancelled` once it fires.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Commit one write and return its RV.
    async fn write_event(&self, ctx: &CancellationToken, event: WriteEvent) -> StorageResult<i64>;
    /// Latest entry when `at_rv` is 0, else the newest entry with rv <= `at_rv`.
    async fn read_resource(&self, ctx: &CancellationToken, key: &ResourceKey, at_rv: i64) -> StorageResult<ReadResponse>;
    async fn list(&self, ctx: &CancellationToken, req: &ListRequest) -> StorageResult<ListResponse>;
    async fn list_history(&self, ctx: &CancellationToken, req: &HistoryRequest) -> StorageResult<ListResponse>;
    /// Latest change per resource of `shard` after `since_rv`, deletes included.
    async fn list_modified_since(
        &self,
        ctx: &CancellationToken,
        shard: &NamespacedResource,
        since_rv: i64,
    ) -> StorageResult<(i64, Vec<ModifiedResource>)>;
    async fn watch_write_events(&self, ctx: &CancellationToken, since_rv: Option<i64>) -> StorageResult<WatchStream>;
    async fn get_resource_stats(
        &self,
        ctx: &CancellationToken,
        namespace: &str,
        min_count: i64,
    ) -> StorageResult<Vec<ResourceStats>>;
    async fn put_resource_blob(&self, ctx: &CancellationToken, req: PutBlobRequest) -> StorageResult<BlobInfo>;
    async fn get_resource_blob(&self, ctx: &CancellationToken, key: &ResourceKey, uid: &str) -> StorageResult<BlobData>;
    /// The last assigned RV.
    fn current_rv(&self) -> i64;
}

/// Tunables for [`KvBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    /// Capacity of each watcher's channel.
    pub watch_buffer: usize,
    /// Capacity of the shared live broadcast; a watcher further behind is closed.
    pub watch_broadcast: usize,
    /// Also record writes in the legacy history table (SQL store only).
    pub legacy_compat: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self { watch_buffer: 100, watch_broadcast: 1024, legacy_compat: false }
    }
}

impl BackendOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            watch_buffer: std::env::var("ARCA_WATCH_BUFFER")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(d.watch_buffer),
            watch_broadcast: std::env::var("ARCA_WATCH_BROADCAST")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(d.watch_broadcast),
            legacy_compat: std::env::var("ARCA_LEGACY_COMPAT")
                .ok()
                .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
                .unwrap_or(d.legacy_compat),
        }
    }
}
