//! Identifier generation, unique per connection epoch.

use fcplink_api::QueryId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Each generator instance belongs to one connection epoch. A reconnect
/// is a fresh connect after a full disconnect, so callers construct a
/// new generator per epoch and stale identifiers from a previous epoch
/// can never alias new ones.
#[derive(Debug)]
pub struct IdentifierGen {
    epoch: u64,
    counter: AtomicU64,
}

impl Default for IdentifierGen {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierGen {
    /// Construct a generator for a fresh connection epoch.
    pub fn new() -> Self {
        static EPOCH: AtomicU64 = AtomicU64::new(1);
        Self {
            epoch: EPOCH.fetch_add(1, Ordering::Relaxed),
            counter: AtomicU64::new(1),
        }
    }

    /// Produce the next identifier. The prefix conventionally names the
    /// requesting component ("get", "put", "dda").
    pub fn next(&self, prefix: &str) -> QueryId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        QueryId::from(format!("{prefix}-{}-{n}", self.epoch))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identifiers_are_unique_within_and_across_epochs() {
        let a = IdentifierGen::new();
        let b = IdentifierGen::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(a.next("get")));
            assert!(seen.insert(b.next("get")));
        }
    }

    #[test]
    fn prefix_is_carried() {
        let idgen = IdentifierGen::new();
        assert!(idgen.next("put").starts_with("put-"));
    }
}
