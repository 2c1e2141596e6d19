#![deny(missing_docs)]
//! Fcplink node-client core.
//!
//! The runtime components for talking to a content-addressable-network
//! node over a persistent socket: the [channel::WireChannel] owning the
//! socket, the [dispatcher::MessageDispatcher] routing inbound messages
//! by identifier, the [query::TransferQuery] request state machine, the
//! [aggregator::QueryAggregator] multiplexing large populations of
//! ephemeral queries, the [queue::QueueManager] enforcing per-direction
//! concurrency bounds, and the [dda::DdaProbe] direct-disk-access
//! capability handshake.

pub mod aggregator;
pub mod channel;
pub mod dda;
pub mod dispatcher;
pub mod epoch;
pub mod queue;
pub mod query;
