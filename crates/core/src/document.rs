//! Documents projected from stored resources for indexing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::columns::{col, ColumnDefinition, ColumnType};
use crate::ResourceKey;

// ---------------- Field names (stable) ----------------
pub const FIELD_ID: &str = "_id";
pub const FIELD_SCORE: &str = "_score";
pub const FIELD_EXPLAIN: &str = "_explain";
pub const FIELD_ALL: &str = "_all";
pub const FIELD_NAME: &str = "name";
pub const FIELD_TITLE: &str = "title";
pub const FIELD_TITLE_PHRASE: &str = "title_phrase";
pub const FIELD_TITLE_NGRAM: &str = "title_ngram";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_TAGS: &str = "tags";
pub const FIELD_FOLDER: &str = "folder";
pub const FIELD_RV: &str = "rv";
pub const FIELD_CREATED: &str = "created";
pub const FIELD_UPDATED: &str = "updated";
pub const FIELD_LABELS: &str = "labels";
pub const FIELD_LEGACY_ID: &str = "legacy_id";
pub const FIELD_MANAGER_KIND: &str = "manager.kind";
pub const FIELD_MANAGER_ID: &str = "manager.id";
pub const FIELD_MANAGED_BY: &str = "managedBy";
pub const FIELD_SOURCE_PATH: &str = "source.path";
pub const FIELD_SOURCE_CHECKSUM: &str = "source.checksum";
pub const FIELD_SOURCE_TIME: &str = "source.timestampMillis";
/// Resource-specific fields are stored under this prefix.
pub const FIELD_PREFIX: &str = "fields.";

// ---------------- Metadata keys ----------------
pub const ANNO_FOLDER: &str = "arca.dev/folder";
pub const ANNO_BLOB: &str = "arca.dev/blob";
pub const ANNO_MANAGER_KIND: &str = "arca.dev/managedBy";
pub const ANNO_MANAGER_ID: &str = "arca.dev/managerId";
pub const ANNO_SOURCE_PATH: &str = "arca.dev/sourcePath";
pub const ANNO_SOURCE_CHECKSUM: &str = "arca.dev/sourceChecksum";
pub const ANNO_SOURCE_TIMESTAMP: &str = "arca.dev/sourceTimestamp";
pub const LABEL_LEGACY_ID: &str = "arca.dev/deprecatedInternalID";

/// Column definitions for the fields every document carries.
pub fn standard_columns() -> Vec<ColumnDefinition> {
    vec![
        col(FIELD_ID, ColumnType::String, 0),
        col(FIELD_SCORE, ColumnType::Double, 0),
        col(FIELD_EXPLAIN, ColumnType::Json, 0),
        col(FIELD_NAME, ColumnType::String, 0),
        col(FIELD_TITLE, ColumnType::String, 0),
        col(FIELD_DESCRIPTION, ColumnType::String, 0),
        col(FIELD_TAGS, ColumnType::StringArray, 0),
        col(FIELD_FOLDER, ColumnType::String, 0),
        col(FIELD_RV, ColumnType::Int64, 0),
        col(FIELD_CREATED, ColumnType::DateTime, 0),
        col(FIELD_UPDATED, ColumnType::DateTime, 0),
        col(FIELD_LEGACY_ID, ColumnType::Int64, 0),
        col(FIELD_MANAGER_KIND, ColumnType::String, 0),
        col(FIELD_MANAGER_ID, ColumnType::String, 0),
        col(FIELD_MANAGED_BY, ColumnType::String, 0),
        col(FIELD_SOURCE_PATH, ColumnType::String, 0),
        col(FIELD_SOURCE_CHECKSUM, ColumnType::String, 0),
        col(FIELD_SOURCE_TIME, ColumnType::DateTime, 0),
    ]
}

pub fn standard_column(name: &str) -> Option<ColumnDefinition> {
    standard_columns().into_iter().find(|c| c.name == name)
}

/// Schema of the resource-specific fields a document builder emits.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentFields {
    pub fields: Vec<ColumnDefinition>,
}

impl DocumentFields {
    pub fn new(fields: Vec<ColumnDefinition>) -> Self { Self { fields } }

    pub fn field(&self, name: &str) -> Option<&ColumnDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerProperties {
    pub kind: String,
    pub id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProperties {
    pub path: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub timestamp_millis: i64,
}

/// Projection of one resource used to build index entries. Never persisted on its own.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexableDocument {
    pub key: ResourceKey,
    pub rv: i64,
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Milliseconds since the epoch; 0 when unknown.
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
    #[serde(default)]
    pub manager: Option<ManagerProperties>,
    #[serde(default)]
    pub source: Option<SourceProperties>,
    /// Resource-specific values, described by [`DocumentFields`].
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl IndexableDocument {
    pub fn new(key: ResourceKey, rv: i64, title: &str) -> Self {
        Self { name: key.name.clone(), key, rv, title: title.to_string(), ..Default::default() }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_folder(mut self, folder: &str) -> Self {
        self.folder = folder.to_string();
        self
    }

    pub fn with_label(mut self, k: &str, v: &str) -> Self {
        self.labels.insert(k.to_string(), v.to_string());
        self
    }

    pub fn with_field(mut self, name: &str, v: serde_json::Value) -> Self {
        self.fields.insert(name.to_string(), v);
        self
    }

    /// `kind:id` when the document is managed by an external tool.
    pub fn managed_by(&self) -> Option<String> {
        self.manager.as_ref().filter(|m| !m.kind.is_empty()).map(|m| format!("{}:{}", m.kind, m.id))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocumentError {
    #[error("value is not a JSON object: {0}")]
    NotAnObject(String),
    #[error("metadata.{field} '{found}' does not match key ({expected})")]
    Mismatch { field: &'static str, found: String, expected: String },
}

/// The handful of metadata fields the store and the indexer care about.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub creation_millis: i64,
}

impl ObjectMeta {
    pub fn from_value(raw: &serde_json::Value) -> Result<Self, DocumentError> {
        let obj = raw.as_object().ok_or_else(|| DocumentError::NotAnObject(truncate(&raw.to_string())))?;
        let meta = obj.get("metadata");
        let text = |k: &str| meta.and_then(|m| m.get(k)).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let map = |k: &str| -> BTreeMap<String, String> {
            meta.and_then(|m| m.get(k))
                .and_then(|v| v.as_object())
                .map(|o| o.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
                .unwrap_or_default()
        };
        let creation_millis = meta
            .and_then(|m| m.get("creationTimestamp"))
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0);
        Ok(Self {
            name: text("name"),
            namespace: text("namespace"),
            labels: map("labels"),
            annotations: map("annotations"),
            creation_millis,
        })
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, DocumentError> {
        let v: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| DocumentError::NotAnObject(e.to_string()))?;
        Self::from_value(&v)
    }

    pub fn folder(&self) -> &str {
        self.annotations.get(ANNO_FOLDER).map(String::as_str).unwrap_or("")
    }

    /// Reject metadata that disagrees with the key the value is stored under.
    pub fn check_key(&self, key: &ResourceKey) -> Result<(), DocumentError> {
        if !self.name.is_empty() && self.name != key.name {
            return Err(DocumentError::Mismatch { field: "name", found: self.name.clone(), expected: key.name.clone() });
        }
        if !self.namespace.is_empty() && self.namespace != key.namespace {
            return Err(DocumentError::Mismatch {
                field: "namespace",
                found: self.namespace.clone(),
                expected: key.namespace.clone(),
            });
        }
        Ok(())
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(64).collect()
}

/// Turns stored resource bytes into an indexable document.
pub trait DocumentBuilder: Send + Sync {
    /// Schema of the resource-specific fields this builder emits.
    fn fields(&self) -> DocumentFields;

    fn build(&self, key: &ResourceKey, rv: i64, value: &[u8]) -> Result<IndexableDocument, DocumentError>;
}

/// Generic builder: title/description/tags from `spec`, everything else from metadata.
/// Extra `spec` paths can be projected into typed fields.
#[derive(Clone, Debug, Default)]
pub struct StandardDocumentBuilder {
    projected: Vec<(ColumnDefinition, Vec<String>)>,
}

impl StandardDocumentBuilder {
    pub fn new() -> Self { Self::default() }

    /// Project a dotted JSON path (relative to the object root) into a custom field.
    pub fn with_field(mut self, def: ColumnDefinition, path: &str) -> Self {
        self.projected.push((def, path.split('.').map(str::to_string).collect()));
        self
    }
}

impl DocumentBuilder for StandardDocumentBuilder {
    fn fields(&self) -> DocumentFields {
        DocumentFields::new(self.projected.iter().map(|(d, _)| d.clone()).collect())
    }

    fn build(&self, key: &ResourceKey, rv: i64, value: &[u8]) -> Result<IndexableDocument, DocumentError> {
        let raw: serde_json::Value =
            serde_json::from_slice(value).map_err(|e| DocumentError::NotAnObject(e.to_string()))?;
        let meta = ObjectMeta::from_value(&raw)?;
        let spec = raw.get("spec");
        let spec_str = |k: &str| spec.and_then(|s| s.get(k)).and_then(|v| v.as_str()).map(str::to_string);

        let mut doc = IndexableDocument::new(key.clone(), rv, "");
        doc.title = spec_str("title").unwrap_or_else(|| key.name.clone());
        doc.description = spec_str("description").unwrap_or_default();
        doc.tags = spec
            .and_then(|s| s.get("tags"))
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        doc.folder = meta.folder().to_string();
        doc.created = meta.creation_millis;
        doc.labels = meta.labels.clone();
        if let Some(kind) = meta.annotations.get(ANNO_MANAGER_KIND) {
            let id = meta.annotations.get(ANNO_MANAGER_ID).cloned().unwrap_or_default();
            doc.manager = Some(ManagerProperties { kind: kind.clone(), id });
        }
        if let Some(path) = meta.annotations.get(ANNO_SOURCE_PATH) {
            doc.source = Some(SourceProperties {
                path: path.clone(),
                checksum: meta.annotations.get(ANNO_SOURCE_CHECKSUM).cloned().unwrap_or_default(),
                timestamp_millis: meta
                    .annotations
                    .get(ANNO_SOURCE_TIMESTAMP)
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0),
            });
        }
        for (def, path) in &self.projected {
            let mut cur = Some(&raw);
            for seg in path {
                cur = cur.and_then(|v| v.get(seg.as_str()));
            }
            if let Some(v) = cur.filter(|v| !v.is_null()) {
                doc.fields.insert(def.name.clone(), v.clone());
            }
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dashboard() -> Vec<u8> {
        serde_json::json!({
            "metadata": {
                "name": "aaa",
                "namespace": "ns",
                "creationTimestamp": "2021-01-01T00:00:00Z",
                "labels": {"region": "east"},
                "annotations": {
                    ANNO_FOLDER: "xxx",
                    ANNO_MANAGER_KIND: "repo",
                    ANNO_MANAGER_ID: "repo-1",
                    ANNO_SOURCE_PATH: "path/to/aaa.json"
                }
            },
            "spec": {"title": "aaa (dash)", "tags": ["aa", "bb"], "panels": 4}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn standard_builder_projects_metadata_and_spec() {
        let key = ResourceKey::new("dashboard.arca.dev", "dashboards", "ns", "aaa");
        let builder = StandardDocumentBuilder::new().with_field(col("panels", ColumnType::Int64, 1), "spec.panels");
        let doc = builder.build(&key, 7, &dashboard()).unwrap();
        assert_eq!(doc.title, "aaa (dash)");
        assert_eq!(doc.tags, vec!["aa", "bb"]);
        assert_eq!(doc.folder, "xxx");
        assert_eq!(doc.created, 1609459200000);
        assert_eq!(doc.labels.get("region").map(String::as_str), Some("east"));
        assert_eq!(doc.managed_by().as_deref(), Some("repo:repo-1"));
        assert_eq!(doc.source.unwrap().path, "path/to/aaa.json");
        assert_eq!(doc.fields.get("panels"), Some(&serde_json::json!(4)));
        assert_eq!(builder.fields().names().collect::<Vec<_>>(), vec!["panels"]);
    }

    #[test]
    fn title_falls_back_to_name() {
        let key = ResourceKey::new("g", "r", "ns", "plain");
        let doc = StandardDocumentBuilder::new().build(&key, 1, br#"{"metadata":{"name":"plain"}}"#).unwrap();
        assert_eq!(doc.title, "plain");
    }

    #[test]
    fn metadata_must_match_key() {
        let meta = ObjectMeta::from_bytes(&dashboard()).unwrap();
        assert!(meta.check_key(&ResourceKey::new("g", "r", "ns", "aaa")).is_ok());
        assert!(meta.check_key(&ResourceKey::new("g", "r", "ns", "bbb")).is_err());
        assert!(meta.check_key(&ResourceKey::new("g", "r", "other", "aaa")).is_err());
        assert!(ObjectMeta::from_bytes(b"[1,2]").is_err());
    }
}
