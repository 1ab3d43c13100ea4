//! In-memory reference implementations of every collaborator trait in
//! [`cowtree_core::collab`].
//!
//! Nothing here is meant to run in production: no persistence, no
//! clustering, no real TTL sweeping beyond lazy-expiry-on-read. This
//! crate exists so the rest of the workspace's test suites can exercise
//! real commit/rollback/recovery code paths against something, the same
//! way a storage engine's own test harness stands in for a real disk or
//! cluster.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory_blob_store;
pub mod memory_cache;
pub mod memory_registry;
pub mod memory_store_repository;
pub mod memory_txlog_store;

pub use memory_blob_store::MemoryBlobStore;
pub use memory_cache::MemoryCache;
pub use memory_registry::MemoryRegistry;
pub use memory_store_repository::MemoryStoreRepository;
pub use memory_txlog_store::MemoryTransactionLogStore;
