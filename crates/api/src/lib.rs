#![deny(missing_docs)]
//! Fcplink API contains the traits and basic types required to talk to a
//! content-addressable-network node over its line-oriented client protocol.
//!
//! If you want the runtime components themselves (channel, dispatcher,
//! queue), please see the fcplink_core crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub mod config;

mod error;
pub use error::*;

pub mod id;
pub use id::QueryId;

mod message;
pub use message::*;

mod query;
pub use query::*;

mod handler;
pub use handler::*;
