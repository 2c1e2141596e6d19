//! Query model types and capability traits.

use crate::QueryId;
use std::sync::Arc;

/// The direction of a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Download a key from the node.
    Fetch,
    /// Upload a key to the node.
    Insert,
}

/// Whether a query's node-side state survives client disconnect or
/// restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Persistence {
    /// Purely in-memory and ephemeral. Only non-persistent queries may
    /// be multiplexed behind the aggregator.
    NonPersistent,
    /// Survives until the client disconnects.
    UntilDisconnect,
    /// Survives client restart.
    Forever,
}

impl Persistence {
    /// True for every tier except [Persistence::NonPersistent].
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Persistence::NonPersistent)
    }
}

/// A terminal failure code reported by the node.
///
/// The numeric values are the node's own codes carried in the `Code`
/// field of `GetFailed`/`PutFailed` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FailureCode(pub u32);

impl FailureCode {
    /// Local failure writing or reading payload data.
    pub const LOCAL_IO: FailureCode = FailureCode(1);
    /// An insert collided with an existing key. Retryable: the owner is
    /// expected to re-derive parameters (such as a new revision) and
    /// resubmit a fresh query.
    pub const COLLISION: FailureCode = FailureCode(9);
    /// The requested data was not found. Permanent for this key.
    pub const DATA_NOT_FOUND: FailureCode = FailureCode(13);

    /// Whether the owner may retry with re-derived parameters.
    pub fn is_retryable(&self) -> bool {
        *self == Self::COLLISION
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle state of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Constructed but not yet started.
    Created,
    /// Start message sent, awaiting the node's acknowledgement.
    Waiting,
    /// Acknowledged by the node.
    Running,
    /// Terminal: the node confirmed the operation.
    FinishedSuccess,
    /// Terminal: the node reported a failure with the given code.
    FinishedFailure(FailureCode),
    /// Terminal: stopped by the owner before a node verdict arrived.
    Stopped,
}

impl QueryState {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::FinishedSuccess
                | QueryState::FinishedFailure(_)
                | QueryState::Stopped
        )
    }
}

/// The read side of a single outstanding node request.
///
/// Together with [crate::MessageHandler] this forms the dual-role
/// capability a query needs to act as its own event sink: identity for
/// routing, plus message consumption.
pub trait Query: 'static + Send + Sync + std::fmt::Debug {
    /// The identifier this query is routed on.
    fn identifier(&self) -> QueryId;

    /// The transfer direction.
    fn direction(&self) -> Direction;

    /// The persistence tier.
    fn persistence(&self) -> Persistence;

    /// The current lifecycle state.
    fn state(&self) -> QueryState;

    /// Whether the query has reached a terminal state.
    fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the query finished successfully.
    fn is_successful(&self) -> bool {
        matches!(self.state(), QueryState::FinishedSuccess)
    }

    /// Whether the query's node-side state outlives this process's
    /// in-memory bookkeeping.
    fn is_persistent(&self) -> bool {
        self.persistence().is_persistent()
    }
}

/// Trait-object [Query].
pub type DynQuery = Arc<dyn Query>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!QueryState::Created.is_terminal());
        assert!(!QueryState::Waiting.is_terminal());
        assert!(!QueryState::Running.is_terminal());
        assert!(QueryState::FinishedSuccess.is_terminal());
        assert!(
            QueryState::FinishedFailure(FailureCode::COLLISION).is_terminal()
        );
        assert!(QueryState::Stopped.is_terminal());
    }

    #[test]
    fn retryable_codes() {
        assert!(FailureCode::COLLISION.is_retryable());
        assert!(!FailureCode::DATA_NOT_FOUND.is_retryable());
        assert!(!FailureCode::LOCAL_IO.is_retryable());
    }

    #[test]
    fn persistence_tiers() {
        assert!(!Persistence::NonPersistent.is_persistent());
        assert!(Persistence::UntilDisconnect.is_persistent());
        assert!(Persistence::Forever.is_persistent());
    }
}
