//! Fcplink error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The core fcplink error type. This type is used in all external
/// fcplink apis as well as internally in some modules.
///
/// This type is required to implement `Clone` to ease the use of
/// shared futures, which require the entire `Result` to be `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FcpError {
    /// Failure establishing or maintaining the node connection. These
    /// always downgrade the channel to the disconnected state; they are
    /// never propagated across the channel boundary as panics.
    #[error("connection: {ctx} (src: {src})")]
    Connection {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// Announced raw payload bytes were still pending when the next text
    /// line was requested. The channel drains them and keeps the
    /// connection alive; this variant exists for reporting the condition.
    #[error("protocol desync: {pending} unconsumed raw bytes drained")]
    ProtocolDesync {
        /// How many bytes were drained.
        pending: u64,
    },

    /// I/O failure in the middle of a raw payload read. It is ambiguous
    /// how much of the payload was consumed, so the connection is torn
    /// down and the session is unrecoverable.
    #[error("fatal io: {ctx} (src: {src})")]
    FatalIo {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// A caller broke a programming contract, e.g. submitted a persistent
    /// query to the aggregator. Rejected synchronously, never silently
    /// accepted.
    #[error("contract violation: {ctx}")]
    ContractViolation {
        /// Any context associated with this error.
        ctx: Arc<str>,
    },

    /// Generic fcplink internal error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },
}

impl FcpError {
    /// Construct a "connection" error.
    pub fn connection<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Connection {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }

    /// Construct a "connection" error with an inner source error.
    pub fn connection_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Connection {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct a "fatal io" error with an inner source error.
    pub fn fatal_io_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::FatalIo {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct a "contract violation" error.
    pub fn contract<C: std::fmt::Display>(ctx: C) -> Self {
        Self::ContractViolation {
            ctx: ctx.to_string().into_boxed_str().into(),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }

    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }
}

/// The core fcplink result type.
pub type FcpResult<T> = Result<T, FcpError>;
