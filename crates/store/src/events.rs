//! Resource versions and the event log key layout.

use std::fmt;

use arca_core::{DataAction, KeyError, ResourceKey};
use serde::{Deserialize, Serialize};

/// Millisecond offset subtracted before shifting; keeps RVs at 19 digits for this century.
pub const RV_EPOCH_MS: i64 = 1_288_834_974_657;
const RV_SHIFT: u32 = 22;

/// Snowflake-style RV source, forced strictly increasing.
#[derive(Debug, Clone)]
pub struct RvGenerator {
    last: i64,
}

impl RvGenerator {
    pub fn new(seed: i64) -> Self {
        Self { last: seed.max(0) }
    }

    pub fn next(&mut self, now_ms: i64) -> i64 {
        let candidate = (now_ms - RV_EPOCH_MS).max(0) << RV_SHIFT;
        let rv = candidate.max(self.last + 1);
        self.last = rv;
        rv
    }

    pub fn last(&self) -> i64 {
        self.last
    }
}

/// Key of one record in the event log:
/// `{rv:019}~{namespace}~{group}~{resource}~{name}~{action}~{folder}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKey {
    pub resource_version: i64,
    pub key: ResourceKey,
    pub action: DataAction,
    pub folder: String,
}

impl EventKey {
    /// Lower bound (inclusive) for scanning events newer than `rv`.
    pub fn start_after(rv: i64) -> String {
        format!("{:019}", rv.saturating_add(1))
    }

    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = s.split('~').collect();
        let [rv, ns, group, resource, name, action, folder] = parts.as_slice() else {
            return Err(KeyError::Malformed(format!("event key '{}' must have 7 parts", s)));
        };
        let resource_version =
            rv.parse::<i64>().map_err(|_| KeyError::Malformed(format!("invalid resource version '{}'", rv)))?;
        let action = action.parse::<DataAction>().map_err(|e| KeyError::Malformed(e.to_string()))?;
        Ok(Self {
            resource_version,
            key: ResourceKey::new(group, resource, ns, name),
            action,
            folder: (*folder).to_string(),
        })
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:019}~{}~{}~{}~{}~{}~{}",
            self.resource_version,
            self.key.namespace,
            self.key.group,
            self.key.resource,
            self.key.name,
            self.action,
            self.folder
        )
    }
}

/// JSON body stored under an [`EventKey`]. The value itself lives in the data section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EventRecord {
    pub key: ResourceKey,
    pub action: DataAction,
    pub resource_version: i64,
    #[serde(default)]
    pub previous_rv: i64,
    #[serde(default)]
    pub folder: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub folder_changed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requester: String,
    pub timestamp: i64,
}
