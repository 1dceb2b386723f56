//! Error taxonomy for the query engine and the scheduler.
//!
//! Both enums are closed: hosts match on them exhaustively and the set of
//! identifiers is part of the public contract. Canonicalization and decode
//! failures surface synchronously at the API boundary and are never cached;
//! cycle and quota failures abort the executing query after releasing all
//! tracker and detector state.

use crate::key::{ContentId, MemoKey};
use crate::quota::QuotaKind;
use thiserror::Error;

/// Failures produced while canonicalizing, executing, or decoding queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// A string argument or payload was not valid UTF-8 and therefore has
    /// no canonical form.
    #[error("argument is not canonical")]
    NonCanonicalArg,

    /// An unknown argument tag was seen while decoding.
    #[error("unknown argument tag {0:#04x}")]
    InvalidArgType(u8),

    /// An unknown result-variant tag was seen while decoding.
    #[error("unknown result tag {0:#04x}")]
    InvalidResultType(u8),

    /// The encoded buffer ended before the value was complete.
    #[error("unexpected end of data")]
    UnexpectedEndOfData,

    /// The query transitively depends on itself. Carries the in-flight
    /// participants, outermost first.
    #[error("dependency cycle through {} active queries", .0.len())]
    Cycle(Vec<MemoKey>),

    /// A resource limit of the active quota profile was crossed.
    #[error("quota exceeded: {0:?}")]
    QuotaExceeded(QuotaKind),

    /// The AST database has no node for this CID.
    #[error("node not found: {0:?}")]
    NodeNotFound(ContentId),

    /// Name resolution failed.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// A scope operation was applied to a non-module node.
    #[error("not a module: {0:?}")]
    NotAModule(ContentId),

    /// Two types failed to unify during inference.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The type required by the context.
        expected: String,
        /// The type actually inferred.
        found: String,
    },

    /// The query body does not implement this operation yet.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// No body has been registered for the requested query kind.
    #[error("no body registered for {0}")]
    UnregisteredQuery(&'static str),
}

/// Failures produced by the scheduler surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedError {
    /// `Runtime::start` was called on an already-started runtime.
    #[error("runtime already started")]
    AlreadyStarted,

    /// A task could not be handed to the scheduler.
    #[error("task submission failed")]
    SubmissionFailed,

    /// A spawn was rejected: the nursery is no longer open, or its budget
    /// is exhausted.
    #[error("spawn rejected")]
    SpawnRejected,

    /// The channel collaborator was closed by its peer.
    #[error("channel closed")]
    ChannelClosed,
}
