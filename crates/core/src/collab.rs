//! Collaborator contracts.
//!
//! These traits are consumed, never implemented, by the production code
//! in `cowtree-txlog` and `cowtree-txn`. Concrete registry/cache/blob-store
//! backends — and the `TransactionLogStore` persistence underneath the
//! `cowtree-txlog` stage sequencer — are explicitly out of scope here;
//! `cowtree-backends` provides in-memory reference implementations used
//! only by the test suites across this workspace.

use crate::error::Result;
use crate::handle::Handle;
use crate::store::StoreInfo;
use crate::uuid::Uuid;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One opaque blob, addressed by ID within its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Blob identity within its table.
    pub id: Uuid,
    /// Opaque bytes.
    pub value: Vec<u8>,
}

/// A batched add/update payload: one table, many entries. Operations
/// accept a slice of these so a single call can touch several tables at
/// once — `(table, [(UUID, bytes)])` per call.
#[derive(Debug, Clone)]
pub struct BlobPayload {
    /// Table name.
    pub table: String,
    /// Entries to add/update within that table.
    pub entries: Vec<BlobEntry>,
}

/// A batched remove payload: one table, many IDs.
#[derive(Debug, Clone)]
pub struct BlobRemovePayload {
    /// Table name.
    pub table: String,
    /// IDs to remove within that table.
    pub ids: Vec<Uuid>,
}

/// Bulk add/get/remove of opaque byte blobs keyed by UUID in named
/// tables (C4).
///
/// Assumed idempotent on add (re-adding the same blob is allowed) and
/// tolerant of missing-on-remove.
pub trait BlobStore: Send + Sync {
    /// Fetch and deserialize one blob. `Err(Error::NotFound)` if absent.
    fn get_one(&self, table: &str, id: Uuid) -> Result<Vec<u8>>;

    /// Insert blobs across one or more tables.
    fn add(&self, payloads: &[BlobPayload]) -> Result<()>;

    /// Overwrite existing blobs across one or more tables.
    fn update(&self, payloads: &[BlobPayload]) -> Result<()>;

    /// Remove blobs across one or more tables. Missing IDs are not an
    /// error.
    fn remove(&self, payloads: &[BlobRemovePayload]) -> Result<()>;
}

/// Registry batch payload: handles to look up, keyed by logical ID,
/// within one table.
#[derive(Debug, Clone)]
pub struct RegistryPayload {
    /// Table name.
    pub table: String,
    /// Logical IDs to look up.
    pub logical_ids: Vec<Uuid>,
}

/// Batched get/add/update/remove of [`Handle`]s; conditional
/// all-or-nothing update (C2).
///
/// The registry is the sole arbiter of the commit cut-over: it must
/// therefore support a compare-and-swap-style batched conditional
/// update.
pub trait Registry: Send + Sync {
    /// Look up handles by logical ID. Missing logical IDs yield no
    /// entry in the result (not an error).
    fn get(&self, payloads: &[RegistryPayload]) -> Result<Vec<Handle>>;

    /// Unconditional insert.
    fn add(&self, table: &str, handles: &[Handle]) -> Result<()>;

    /// Batched update. When `all_or_nothing` is true, succeeds only if
    /// every row's stored `version` still matches the `version` on the
    /// incoming `Handle` minus one (i.e. this update is the very next
    /// version); on any mismatch, returns
    /// `Err(Error::UpdateAllOrNothing)` and applies none of the rows, so
    /// the transaction manager can roll back and retry. Without the
    /// flag, performs a best-effort batched write row by row.
    fn update(&self, table: &str, all_or_nothing: bool, handles: &[Handle]) -> Result<()>;

    /// Remove handles by logical ID.
    fn remove(&self, table: &str, logical_ids: &[Uuid]) -> Result<()>;
}

/// The outcome of a batched [`Cache::lock`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Every key was acquired by the caller.
    Acquired,
    /// At least one key was already held by a different owner.
    /// Acquisition is all-or-nothing: no partial locks are left owned.
    Conflict(Uuid),
}

/// Typed string & struct cache with TTL; distributed lock primitives
/// (C3).
///
/// Lock keys must be addressed under namespace prefix `"L"`, node cache
/// keys under `"N"`, item-value cache keys under `"V"` — concrete
/// implementations own that prefixing; callers in this workspace pass
/// bare UUIDs/names and rely on the implementation's own key layout.
pub trait Cache: Send + Sync {
    /// Set a string value. `ttl = None` means "do not cache this write"
    /// ("a `<0` TTL means no caching").
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Get a string value. `Err(Error::NotFound)` on miss.
    fn get(&self, key: &str) -> Result<String>;
    /// Set an opaque struct value (serialized bytes).
    fn set_struct(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;
    /// Get an opaque struct value. `Err(Error::NotFound)` on miss.
    fn get_struct(&self, key: &str) -> Result<Vec<u8>>;
    /// Delete a key. Missing keys are not an error.
    fn delete(&self, key: &str) -> Result<()>;
    /// Drop everything in the cache.
    fn clear(&self) -> Result<()>;
    /// Liveness check.
    fn ping(&self) -> Result<()>;

    /// Atomic set-if-absent over a batch of lock keys, all owned by
    /// `owner` on success. All-or-nothing: if any key is held by a
    /// different owner, returns that owner's ID and leaves no partial
    /// locks acquired.
    fn lock(&self, duration: Duration, keys: &[Uuid], owner: Uuid) -> Result<LockOutcome>;
    /// True if every one of `keys` is currently locked (by anyone).
    fn is_locked(&self, keys: &[Uuid]) -> Result<bool>;
    /// Like [`Cache::is_locked`], but extends the TTL of held locks.
    fn is_locked_ttl(&self, duration: Duration, keys: &[Uuid]) -> Result<bool>;
    /// Delete only the locks among `keys` that `owner` holds.
    fn unlock(&self, keys: &[Uuid], owner: Uuid) -> Result<()>;
    /// True only if every one of `keys` exists and is owned by someone
    /// other than `owner`.
    fn is_locked_by_others(&self, keys: &[Uuid], owner: Uuid) -> Result<bool>;

    /// Returns `true` exactly once per detected backend restart: on
    /// connection establishment the cache returns a run identifier; if
    /// it differs from the last observed identifier, this returns
    /// `true` so callers can invalidate cached assumptions, then goes
    /// back to `false` until the next restart.
    fn is_restarted(&self) -> Result<bool>;
}

/// Per-store metadata storage (C5).
pub trait StoreRepository: Send + Sync {
    /// Fetch a store's metadata by name.
    fn get(&self, name: &str) -> Result<StoreInfo>;
    /// Insert a brand-new store.
    fn add(&self, store: StoreInfo) -> Result<()>;
    /// Apply each store's `count_delta` into `count` atomically and
    /// persist the rest of the metadata.
    fn update(&self, stores: &[StoreInfo]) -> Result<()>;
    /// Drop a store's underlying registry and blob tables. Destructive;
    /// callers must not invoke this from within a transaction.
    fn remove(&self, name: &str) -> Result<()>;
}

/// The ten recognised commit stages, in strict
/// happy-path order. Recovery and rollback reason about "how far did
/// this transaction get" purely in terms of which stages were logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// No stage recorded yet.
    Unknown,
    /// A value was actively persisted ahead of commit (zero or more).
    AddActivelyPersistedItem,
    /// Item-level locks were acquired.
    LockTrackedItems,
    /// Separate-segment item values were committed.
    CommitTrackedItemsValues,
    /// A brand-new store's root node was committed directly.
    CommitNewRootNodes,
    /// Fetched-but-unmodified nodes were re-verified intact.
    AreFetchedItemsIntact,
    /// Updated nodes were committed to their inactive slots.
    CommitUpdatedNodes,
    /// Removed nodes were tombstoned.
    CommitRemovedNodes,
    /// Newly added nodes were committed.
    CommitAddedNodes,
    /// Per-store count deltas were reconciled.
    CommitStoreInfo,
    /// Final in-memory preparation before the Phase 2 cut-over.
    BeforeFinalize,
    /// The Phase 2 all-or-nothing registry update ran.
    FinalizeCommit,
    /// Obsolete inactive slots and tombstoned handles were cleaned up.
    DeleteObsoleteEntries,
    /// Obsolete separate-segment item value blobs were cleaned up.
    DeleteTrackedItemsValues,
    /// Item-level locks were released.
    UnlockTrackedItems,
}

/// One append-only transaction-log entry: a stage marker plus whatever
/// payload is needed to undo it without re-deriving state from volatile
/// memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Which stage this entry records.
    pub stage: Stage,
    /// Opaque, stage-specific payload (see `cowtree-txlog::payload`).
    pub payload: Vec<u8>,
}

/// Append-only per-TID log of `(stage, payload)` entries (the physical
/// storage underneath C8; C8 itself — the stage sequencer and replay
/// logic — lives in `cowtree-txlog` on top of this trait).
pub trait TransactionLogStore: Send + Sync {
    /// Start a new log for `tid` with its first entry.
    fn initiate(&self, tid: Uuid, entry: LogEntry) -> Result<()>;
    /// Append another entry to `tid`'s log.
    fn add(&self, tid: Uuid, entry: LogEntry) -> Result<()>;
    /// Delete `tid`'s entire log.
    fn remove(&self, tid: Uuid) -> Result<()>;
    /// Return the oldest transaction log whose most recent entry is
    /// older than the caller's expiry bound, or `None` if none qualify.
    /// Used by the recovery/cleanup scanner (C10).
    fn get_one_expired(&self, older_than_millis: i64) -> Result<Option<(Uuid, Vec<LogEntry>)>>;
}
