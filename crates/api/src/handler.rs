//! Handler traits for connection lifecycle and routed message events.

use crate::{BoxFut, NodeMessage, Query};
use std::sync::Arc;

/// Base trait for connection lifecycle events. The message handler
/// trait is based on this trait.
///
/// This is the only hook a presentation or storage layer needs to track
/// connection status.
pub trait BaseHandler: 'static + Send + Sync + std::fmt::Debug {
    /// The channel established its socket, reader and sender.
    fn connected(&self) {}

    /// The channel was torn down. Fired exactly once per
    /// connected-to-disconnected transition.
    fn disconnected(&self) {}

    /// A parsed message that no registered handler consumed, such as
    /// the node's hello at session start. Broadcast to every registered
    /// base listener.
    fn recv_broadcast(&self, _message: &NodeMessage) {}
}

/// Trait-object [BaseHandler].
pub type DynBaseHandler = Arc<dyn BaseHandler>;

/// Handler for parsed inbound messages routed by the dispatcher.
pub trait MessageHandler: BaseHandler {
    /// Handle a routed message. Return true when the message was
    /// consumed; a catch-all handler (such as the query aggregator)
    /// returns false to decline a message whose identifier it does not
    /// index, letting the dispatcher offer it elsewhere.
    ///
    /// Handlers run synchronously with respect to the connection's
    /// reader task, preserving per-connection message ordering. A
    /// handler that consumes a declared raw payload must do so before
    /// returning, or the channel will drain the payload before the next
    /// line is read.
    fn recv_message(&self, message: NodeMessage) -> BoxFut<'_, bool>;
}

/// Trait-object [MessageHandler].
pub type DynMessageHandler = Arc<dyn MessageHandler>;

/// Observer of query state transitions.
///
/// This is the only hook a presentation or storage layer needs to track
/// a query's progress; it is invoked on every state transition.
pub trait QueryListener: 'static + Send + Sync + std::fmt::Debug {
    /// The query transitioned to a new state.
    fn query_state_changed(&self, query: &dyn Query);
}

/// Trait-object [QueryListener].
pub type DynQueryListener = Arc<dyn QueryListener>;
