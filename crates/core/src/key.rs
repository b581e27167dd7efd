//! History-entry keys: `{group}/{resource}/{namespace}/{name}/{rv}~{action}~{folder}[~{guid}]`.
//!
//! For a fixed identity prefix, entries sort by RV because every generated RV has the
//! same number of decimal digits.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{NamespacedResource, ResourceKey};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("{0} is required")]
    Required(&'static str),
    #[error("{field} '{value}' is invalid")]
    Invalid { field: &'static str, value: String },
    #[error("invalid data key: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataAction {
    Created,
    Updated,
    Deleted,
}

impl DataAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataAction::Created => "created",
            DataAction::Updated => "updated",
            DataAction::Deleted => "deleted",
        }
    }
}

impl fmt::Display for DataAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for DataAction {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(DataAction::Created),
            "updated" => Ok(DataAction::Updated),
            "deleted" => Ok(DataAction::Deleted),
            "" => Err(KeyError::Required("action")),
            other => Err(KeyError::Invalid { field: "action", value: other.to_string() }),
        }
    }
}

/// One history entry of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataKey {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: i64,
    pub action: DataAction,
    pub folder: String,
    /// Join key for the legacy wide table; empty when unused.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guid: String,
}

impl DataKey {
    pub fn new(key: &ResourceKey, resource_version: i64, action: DataAction, folder: &str) -> Self {
        Self {
            group: key.group.clone(),
            resource: key.resource.clone(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            resource_version,
            action,
            folder: folder.to_string(),
            guid: String::new(),
        }
    }

    /// Parse a key produced by `to_string`, validating every component.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 5 {
            return Err(KeyError::Malformed(format!("expected 5 segments, found {} in '{}'", parts.len(), s)));
        }
        let tail: Vec<&str> = parts[4].split('~').collect();
        if tail.len() < 3 || tail.len() > 4 {
            return Err(KeyError::Malformed(format!("expected rv~action~folder[~guid], found '{}'", parts[4])));
        }
        let resource_version = tail[0]
            .parse::<i64>()
            .map_err(|_| KeyError::Malformed(format!("invalid resource version '{}'", tail[0])))?;
        let action = tail[1].parse::<DataAction>().map_err(|e| KeyError::Malformed(e.to_string()))?;
        let guid = match tail.get(3) {
            Some(g) if g.is_empty() => return Err(KeyError::Malformed("empty guid".into())),
            Some(g) => (*g).to_string(),
            None => String::new(),
        };
        let key = Self {
            group: parts[0].to_string(),
            resource: parts[1].to_string(),
            namespace: parts[2].to_string(),
            name: parts[3].to_string(),
            resource_version,
            action,
            folder: tail[2].to_string(),
            guid,
        };
        key.validate().map_err(|e| KeyError::Malformed(e.to_string()))?;
        Ok(key)
    }

    pub fn validate(&self) -> Result<(), KeyError> {
        validate_identity(&self.group, &self.resource, &self.namespace, &self.name)?;
        if self.folder.contains(['/', '~']) {
            return Err(KeyError::Invalid { field: "folder", value: self.folder.clone() });
        }
        if self.guid.contains(['/', '~']) {
            return Err(KeyError::Invalid { field: "guid", value: self.guid.clone() });
        }
        Ok(())
    }

    /// Compares identity only (group/resource/namespace/name).
    pub fn same_resource(&self, other: &DataKey) -> bool {
        self.group == other.group
            && self.resource == other.resource
            && self.namespace == other.namespace
            && self.name == other.name
    }

    pub fn identity_prefix(&self) -> String {
        format!("{}/{}/{}/{}/", self.group, self.resource, self.namespace, self.name)
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.group, &self.resource, &self.namespace, &self.name)
    }

    pub fn shard(&self) -> NamespacedResource {
        NamespacedResource::new(&self.namespace, &self.group, &self.resource)
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{:019}~{}~{}",
            self.group, self.resource, self.namespace, self.name, self.resource_version, self.action, self.folder
        )?;
        if !self.guid.is_empty() {
            write!(f, "~{}", self.guid)?;
        }
        Ok(())
    }
}

/// Prefix for listing a (group, resource) pair, optionally narrowed to one namespace.
pub fn list_prefix(group: &str, resource: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        format!("{}/{}/", group, resource)
    } else {
        format!("{}/{}/{}/", group, resource, namespace)
    }
}

fn segment_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9.-]*[a-z0-9])?$").expect("static segment pattern"))
}

fn check_segment(field: &'static str, value: &str) -> Result<(), KeyError> {
    if segment_pattern().is_match(value) {
        Ok(())
    } else {
        Err(KeyError::Invalid { field, value: value.to_string() })
    }
}

pub(crate) fn validate_identity(group: &str, resource: &str, namespace: &str, name: &str) -> Result<(), KeyError> {
    if group.is_empty() {
        return Err(KeyError::Required("group"));
    }
    if resource.is_empty() {
        return Err(KeyError::Required("resource"));
    }
    if name.is_empty() {
        return Err(KeyError::Required("name"));
    }
    check_segment("group", group)?;
    check_segment("resource", resource)?;
    if !namespace.is_empty() {
        check_segment("namespace", namespace)?;
    }
    check_segment("name", name)
}
