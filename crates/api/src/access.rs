//! Authorization seam: which verbs a caller may use on a resource, checked per folder.

use arca_core::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }
}

/// Authorization decisions are made elsewhere; the server only asks.
///
/// `folder` is the folder the resource lives in (or moves into) and is empty
/// for unfoldered resources. For `List` the key carries no name.
pub trait AccessClient: Send + Sync {
    fn check(&self, requester: &str, verb: Verb, key: &ResourceKey, folder: &str) -> bool;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessClient for AllowAll {
    fn check(&self, _requester: &str, _verb: Verb, _key: &ResourceKey, _folder: &str) -> bool {
        true
    }
}
