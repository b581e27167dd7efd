//! Arca core types: resource identity, history-entry keys, structured errors,
//! continuation tokens, result tables and the document projection used for search.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod columns;
pub mod document;
pub mod key;
pub mod token;

pub use document::IndexableDocument;
pub use key::{DataAction, DataKey, KeyError};
pub use token::{ContinueToken, TokenError};

/// Identity of one logical resource across its whole version history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub resource: String,
    /// Empty for cluster-scoped resources.
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subresource: String,
}

impl ResourceKey {
    pub fn new(group: &str, resource: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            subresource: String::new(),
        }
    }

    /// The search shard this resource belongs to.
    pub fn shard(&self) -> NamespacedResource {
        NamespacedResource {
            namespace: self.namespace.clone(),
            group: self.group.clone(),
            resource: self.resource.clone(),
        }
    }

    /// Check that the key addresses exactly one resource.
    pub fn validate(&self) -> Result<(), KeyError> {
        key::validate_identity(&self.group, &self.resource, &self.namespace, &self.name)
    }

    /// `group/resource/namespace/name/`: the KV prefix shared by every history entry of this resource.
    pub fn identity_prefix(&self) -> String {
        format!("{}/{}/{}/{}/", self.group, self.resource, self.namespace, self.name)
    }

    /// Document identifier inside a search index: `namespace/group/resource/name`.
    pub fn search_id(&self) -> String {
        let mut id = format!("{}/{}/{}/{}", self.namespace, self.group, self.resource, self.name);
        if !self.subresource.is_empty() {
            id.push('/');
            id.push_str(&self.subresource);
        }
        id
    }

    /// Inverse of [`ResourceKey::search_id`].
    pub fn from_search_id(id: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = id.split('/').collect();
        match parts.as_slice() {
            [ns, group, resource, name] => Ok(Self::new(group, resource, ns, name)),
            [ns, group, resource, name, sub] => {
                let mut k = Self::new(group, resource, ns, name);
                k.subresource = (*sub).to_string();
                Ok(k)
            }
            _ => Err(KeyError::Malformed(format!("search id '{}' must have 4 or 5 segments", id))),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.group, self.resource, self.namespace, self.name)
    }
}

/// One search shard: (namespace, group, resource).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedResource {
    pub namespace: String,
    pub group: String,
    pub resource: String,
}

impl NamespacedResource {
    pub fn new(namespace: &str, group: &str, resource: &str) -> Self {
        Self { namespace: namespace.to_string(), group: group.to_string(), resource: resource.to_string() }
    }

    /// KV prefix covering every resource of this shard.
    pub fn kv_prefix(&self) -> String {
        key::list_prefix(&self.group, &self.resource, &self.namespace)
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        self.namespace == key.namespace && self.group == key.group && self.resource == key.resource
    }
}

impl fmt::Display for NamespacedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.group, self.resource)
    }
}

// ---------------- Structured errors ----------------

pub const CODE_BAD_REQUEST: i32 = 400;
pub const CODE_NOT_FOUND: i32 = 404;
pub const CODE_CONFLICT: i32 = 409;
pub const CODE_CANCELLED: i32 = 499;
pub const CODE_INTERNAL: i32 = 500;

/// Machine-checkable error carried inside service responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{reason} ({code}): {message}")]
pub struct ErrorResult {
    pub code: i32,
    pub reason: String,
    pub message: String,
}

impl ErrorResult {
    pub fn new(code: i32, reason: &str, message: impl Into<String>) -> Self {
        Self { code, reason: reason.to_string(), message: message.into() }
    }
    pub fn bad_request(message: impl Into<String>) -> Self { Self::new(CODE_BAD_REQUEST, "BadRequest", message) }
    pub fn not_found(message: impl Into<String>) -> Self { Self::new(CODE_NOT_FOUND, "NotFound", message) }
    pub fn already_exists(message: impl Into<String>) -> Self { Self::new(CODE_CONFLICT, "AlreadyExists", message) }
    pub fn conflict(message: impl Into<String>) -> Self { Self::new(CODE_CONFLICT, "Conflict", message) }
    pub fn cancelled(message: impl Into<String>) -> Self { Self::new(CODE_CANCELLED, "Cancelled", message) }
    pub fn internal(message: impl Into<String>) -> Self { Self::new(CODE_INTERNAL, "InternalError", message) }

    pub fn is_not_found(&self) -> bool { self.code == CODE_NOT_FOUND }
}

/// Out-of-band blob reference recorded in a resource's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub uid: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, rename = "contentType")]
    pub content_type: String,
}

pub mod prelude {
    pub use super::columns::{CellValue, ColumnDefinition, ColumnType, ResourceTable, TableRow};
    pub use super::document::{DocumentBuilder, DocumentFields, IndexableDocument};
    pub use super::{BlobInfo, ContinueToken, DataAction, DataKey, ErrorResult, NamespacedResource, ResourceKey};
}
