//! Types dealing with request identity.

use std::sync::Arc;

/// Identifies one outstanding request on a node connection.
///
/// On this protocol identifiers are textual tokens carried verbatim in
/// the `Identifier` field of every request/response pair. They are only
/// required to be unique within a single connection epoch.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub Arc<str>);

impl std::ops::Deref for QueryId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for QueryId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for QueryId {
    fn from(s: String) -> Self {
        Self(s.into_boxed_str().into())
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
