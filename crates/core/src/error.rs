//! Unified error taxonomy.
//!
//! Every collaborator trait in [`crate::collab`], and every component
//! built on top of them, returns [`Result<T>`]. The five kinds below are
//! exactly the ones spec'd: `NotFound`, `Conflict`, `Timeout`,
//! `BackendFailure`, `IllegalTransition`. Callers branch on
//! [`Error::is_retryable`] rather than matching every variant, since new
//! conflict-shaped variants may be added as the commit pipeline grows.

use crate::uuid::Uuid;
use thiserror::Error;

/// Result alias used throughout the `cowtree` workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the transactional core.
#[derive(Debug, Error)]
pub enum Error {
    /// A lookup missed. Most public surfaces demote this to `None`/`false`
    /// locally rather than propagating it; it is surfaced as an error
    /// only where the caller needs to distinguish "missing" from "found
    /// but stale".
    #[error("not found: {0}")]
    NotFound(String),

    /// A version mismatch, lock held by another owner, or a registry
    /// all-or-nothing update that didn't match. Triggers rollback and
    /// retry within the transaction's `max_time`.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A lock is held by a conflicting owner and is not expired.
    #[error("lock held by {owner}")]
    LockHeld {
        /// The owning `LockID` reported by the cache.
        owner: Uuid,
    },

    /// The registry's batched all-or-nothing update did not apply
    /// because at least one row's stored version no longer matched.
    #[error("all-or-nothing registry update rejected")]
    UpdateAllOrNothing,

    /// `max_time` elapsed, or a `CancellationToken` was triggered, while
    /// a commit or recovery pass was retrying.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// An unrecoverable backend I/O error (registry, cache, or blob
    /// store). Triggers rollback and surfaces to the caller.
    #[error("backend failure: {0}")]
    BackendFailure(String),

    /// An illegal state transition was attempted (e.g. commit before
    /// begin, rollback after finalize). Surfaces immediately and does
    /// not mutate state.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// Serialization/deserialization of a node, item, handle, or log
    /// payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from a reference backend's disk-touching test harness.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Not-found lookups and stale-version conflicts are both
    /// "try again" signals to the two-phase transaction manager; the
    /// rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::LockHeld { .. } | Error::UpdateAllOrNothing
        )
    }

    /// True for a [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for a [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// True for [`Error::IllegalTransition`].
    pub fn is_illegal_transition(&self) -> bool {
        matches!(self, Error::IllegalTransition(_))
    }

    /// Construct a [`Error::Conflict`] carrying a lock owner, used by the
    /// cache-lock acquisition path in `cowtree-txn`.
    pub fn lock_held(owner: Uuid) -> Self {
        Error::LockHeld { owner }
    }
}
