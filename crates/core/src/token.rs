//! Opaque pagination cursors: `(resource_version, start_offset)` plus the sort direction.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid continue token")]
pub struct TokenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueToken {
    #[serde(rename = "rv")]
    pub resource_version: i64,
    #[serde(rename = "offset")]
    pub start_offset: i64,
    #[serde(rename = "asc", default)]
    pub sort_ascending: bool,
}

impl ContinueToken {
    pub fn new(resource_version: i64, start_offset: i64) -> Self {
        Self { resource_version, start_offset, sort_ascending: false }
    }

    pub fn encode(&self) -> String {
        // A struct of plain integers and a bool always serializes.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let raw = URL_SAFE_NO_PAD.decode(token.trim()).map_err(|_| TokenError)?;
        let t: ContinueToken = serde_json::from_slice(&raw).map_err(|_| TokenError)?;
        if t.resource_version < 0 || t.start_offset < 0 {
            return Err(TokenError);
        }
        Ok(t)
    }
}
