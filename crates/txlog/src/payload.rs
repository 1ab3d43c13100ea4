//! Per-stage payload shapes: each carries exactly the information
//! needed to undo its stage without re-deriving state from volatile
//! memory.
//!
//! Each payload is encoded independently with `rmp-serde` and stored as
//! the opaque `payload` bytes of a [`cowtree_core::LogEntry`]; decoding
//! is driven by the entry's `stage`, since the byte layout differs per
//! stage.

use cowtree_core::{Error, Handle, Result, Uuid};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Encode a stage payload.
pub fn encode<P: Serialize>(payload: &P) -> Result<Vec<u8>> {
    rmp_serde::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a stage payload previously written by [`encode`].
pub fn decode<P: DeserializeOwned>(bytes: &[u8]) -> Result<P> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// `addActivelyPersistedItem` — one blob written ahead of commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivelyPersistedItemPayload {
    /// Table the blob lives in.
    pub table: String,
    /// The blob's ID, in case the recovery scanner must delete it.
    pub blob_id: Uuid,
}

/// `lockTrackedItems` — the full set of item IDs this transaction is
/// about to lock, so a crash mid-acquisition can be unwound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockTrackedItemsPayload {
    /// Item IDs locked (or being locked) by this transaction.
    pub item_ids: Vec<Uuid>,
}

/// `commitTrackedItemsValues` — item IDs freshly written to the blob
/// store this stage, to be deleted on rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitTrackedItemsValuesPayload {
    /// Blob table the values were written to.
    pub table: String,
    /// Freshly-assigned item UUIDs written this stage.
    pub written_item_ids: Vec<Uuid>,
}

/// `commitNewRootNodes` / `commitAddedNodes` — handles committed this
/// stage, so rollback can remove the registry rows and blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedHandlesPayload {
    /// Registry table the handles were registered in.
    pub table: String,
    /// The handles committed this stage.
    pub handles: Vec<Handle>,
}

/// `commitUpdatedNodes` — the pre-stage handle snapshot (for
/// restoring inactive slots) alongside the post-stage handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitUpdatedNodesPayload {
    /// Registry table the handles live in.
    pub table: String,
    /// Handles as they stood before this stage allocated inactive IDs.
    pub before: Vec<Handle>,
    /// Handles as they stand after inactive-ID allocation.
    pub after: Vec<Handle>,
}

/// `commitRemovedNodes` — handles marked deleted this stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRemovedNodesPayload {
    /// Registry table the handles live in.
    pub table: String,
    /// Handles tombstoned this stage.
    pub handles: Vec<Handle>,
}

/// `commitStoreInfo` — store names whose `count_delta` was reconciled
/// this stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitStoreInfoPayload {
    /// Names of stores reconciled this stage.
    pub store_names: Vec<String>,
}

/// `finalizeCommit` — the planned obsolete-entry cleanup, computed
/// before the Phase 2 cut-over so it can run identically whether the
/// cut-over happened moments ago (live rollforward) or hours ago
/// (crash recovery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeCommitPayload {
    /// Registry table touched by this commit.
    pub table: String,
    /// Logical IDs whose now-obsolete inactive slot should be cleared
    /// after the cut-over.
    pub activated_logical_ids: Vec<Uuid>,
    /// Logical IDs of tombstoned handles whose registry row should be
    /// removed after the cut-over.
    pub removed_logical_ids: Vec<Uuid>,
}

/// `deleteObsoleteEntries` — the registry rows and blob-store node IDs
/// the cleanup tail must remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteObsoleteEntriesPayload {
    /// Registry table touched.
    pub table: String,
    /// Logical IDs whose registry row should be removed.
    pub deleted_registry_ids: Vec<Uuid>,
    /// Physical blob IDs (obsolete inactive slots, or removed nodes'
    /// former active slots) to delete from cache and blob store.
    pub unused_node_ids: Vec<Uuid>,
}

/// `deleteTrackedItemsValues` — obsolete separate-segment item value
/// blobs to remove after a successful commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteTrackedItemsValuesPayload {
    /// Blob table the values live in.
    pub table: String,
    /// Item UUIDs whose blob is now obsolete.
    pub item_ids: Vec<Uuid>,
    /// True if these values are also mirrored in the shared cache and
    /// must be evicted there too.
    pub globally_cached: bool,
}

/// `unlockTrackedItems` — the item IDs whose lock this transaction
/// released (or must release on rollback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockTrackedItemsPayload {
    /// Item IDs unlocked.
    pub item_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_handles_payload_roundtrips() {
        let payload = CommittedHandlesPayload {
            table: "orders_registry".into(),
            handles: vec![Handle::new_for_add(Uuid::new_v4(), Uuid::new_v4(), 0)],
        };
        let bytes = encode(&payload).unwrap();
        let decoded: CommittedHandlesPayload = decode(&bytes).unwrap();
        assert_eq!(decoded.table, payload.table);
        assert_eq!(decoded.handles.len(), 1);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode::<LockTrackedItemsPayload>(&[0xff, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
