//! Core types and traits for the cowtree transactional B-tree engine.
//!
//! This crate defines the foundation every other `cowtree-*` crate builds
//! on:
//! - [`uuid`] — the 128-bit opaque identity used throughout the system.
//! - [`handle`] — the virtual-ID / copy-on-write model (C1).
//! - [`store`] — per-B-tree metadata (`StoreInfo`).
//! - [`item`] — `Item`, `TrackedItem`, `CacheNode`, and the item action
//!   state machine.
//! - [`error`] — the unified error taxonomy every collaborator trait
//!   returns.
//! - [`collab`] — the collaborator contracts (`Registry`, `BlobStore`,
//!   `Cache`, `StoreRepository`, `TransactionLogStore`) consumed, but not
//!   implemented, by this crate.
//! - [`config`] — validated configuration shapes (no file/env loading —
//!   that is client-side sugar, out of scope here).
//! - [`cancel`] — cooperative cancellation for long-running commit
//!   retries.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod collab;
pub mod config;
pub mod error;
pub mod handle;
pub mod item;
pub mod store;
pub mod uuid;

pub use cancel::CancellationToken;
pub use collab::{
    BlobEntry, BlobPayload, BlobRemovePayload, BlobStore, Cache, LockOutcome, LogEntry, Registry,
    RegistryPayload, Stage, StoreRepository, TransactionLogStore,
};
pub use config::{
    CacheConnectionConfig, NodeCacheConfig, RecoveryConfig, RegistryConnectionConfig,
    TransactionConfig, TransactionMode,
};
pub use error::{Error, Result};
pub use handle::{Handle, SlotId};
pub use item::{transition, Action, CacheNode, Event, Item, MetaData, TrackedItem};
pub use store::StoreInfo;
pub use uuid::{Uuid, NIL_UUID};

/// Millisecond timestamp, matching the `WorkInProgressTimestamp` /
/// `Timestamp` fields of [`Handle`] and the cache TTL surface of
/// [`collab::Cache`].
pub type MillisTimestamp = i64;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Centralized here so every component stamps handles and log entries
/// with the same clock source.
pub fn now_millis() -> MillisTimestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}
