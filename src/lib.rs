//! Core of a distributed, transactional B-tree storage engine.
//!
//! This crate is a facade over the workspace's layered pieces:
//! - [`cowtree_core`] — the handle/virtual-ID model, collaborator
//!   contracts, error taxonomy, and configuration shapes every other
//!   crate builds on.
//! - [`cowtree_txlog`] — append-only transaction-log sequencing and its
//!   per-stage payload encodings.
//! - [`cowtree_txn`] — the item action tracker, node repository, the
//!   two-phase transaction manager, and the recovery/cleanup scanner.
//!
//! A concrete deployment wires its own `Registry`/`Cache`/`BlobStore`/
//! `StoreRepository`/`TransactionLogStore` implementations against the
//! traits in [`cowtree_core::collab`] and drives commits through
//! [`cowtree_txn::Transaction`]; `cowtree-backends` (a dev-dependency of
//! this workspace, not re-exported here) supplies in-memory reference
//! implementations for tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use cowtree_core as core;
pub use cowtree_txlog as txlog;
pub use cowtree_txn as txn;

pub use cowtree_core::{
    collab::{
        BlobEntry, BlobPayload, BlobRemovePayload, BlobStore, Cache, LockOutcome, LogEntry,
        Registry, RegistryPayload, Stage, StoreRepository, TransactionLogStore,
    },
    config::{NodeCacheConfig, RecoveryConfig, TransactionConfig, TransactionMode},
    error::{Error, Result},
    handle::{Handle, SlotId},
    item::{Action, CacheNode, Event, Item, MetaData, TrackedItem},
    store::StoreInfo,
    uuid::Uuid,
    CancellationToken,
};
pub use cowtree_txlog::{payload, TransactionLog};
pub use cowtree_txn::{recover_one, run_recovery_loop, BTreeCallback, ItemActionTracker, NodeRepository, Phase, Transaction};
