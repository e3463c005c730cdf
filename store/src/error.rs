use crate::id::SpaceId;
use crate::path::PathBuf;
use thiserror::Error;

/// Result alias used by every fallible operation in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error taxonomy of the runtime core.
///
/// All core operations report failures through this enum; panics are
/// reserved for internal invariant breaches.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// An address refers to an entity or path that does not exist. Carries
    /// the deepest prefix that resolved.
    #[error("not found (deepest valid prefix: {prefix})")]
    NotFound {
        /// Deepest path prefix that still resolved to a value.
        prefix: PathBuf,
    },
    /// A writer was requested for a different space than the already-open
    /// writer of the transaction.
    #[error("write isolation violation: writer open for {open}, requested {requested}")]
    WriteIsolationViolation {
        /// Space the transaction's writer is bound to.
        open: SpaceId,
        /// Space the new writer was requested for.
        requested: SpaceId,
    },
    /// Operation attempted on a completed or aborted transaction.
    #[error("transaction is no longer active")]
    InactiveTransaction,
    /// A commit was invalidated by concurrent confirmed changes. Carries a
    /// rendering of the offending read invariants.
    #[error("commit invalidated by concurrent changes: {reads:?}")]
    Inconsistent {
        /// Addresses of the read invariants that no longer hold.
        reads: Vec<String>,
    },
    /// A path operation was requested on a non-JSON document.
    #[error("unsupported media type {0}")]
    UnsupportedMediaType(String),
    /// Cursor depth exceeded [`crate::MAX_RECURSION_DEPTH`].
    #[error("recursion limit exceeded while following links")]
    RecursionLimit,
    /// The storage provider failed to respond in time.
    #[error("sync timed out")]
    SyncTimeout,
    /// Write to a frozen document.
    #[error("document is frozen")]
    FrozenDocument,
    /// An id cannot be derived.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    /// Cyclic source-cell assignment or disallowed cyclic link closure.
    #[error("cycle violation: {0}")]
    CycleViolation(String),
}

impl Error {
    /// Constructs a `NotFound` from the deepest resolved prefix.
    pub fn not_found(prefix: PathBuf) -> Self {
        Self::NotFound { prefix }
    }

    /// True if the error signals a missing entity or path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
