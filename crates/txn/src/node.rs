//! Node repository (C7): per-B-tree, per-transaction node cache plus the
//! commit sub-protocols that stage and cut over node bodies.
//!
//! Generic over `T`, the B-tree's own node-body type. This crate only
//! ever needs `T: MetaData` (id + version) to drive the commit pipeline,
//! plus `Serialize`/`DeserializeOwned` to cross the blob-store/cache
//! boundary — it never interprets the node's actual key/value layout.

use cowtree_core::{
    now_millis, Action, BlobEntry, BlobPayload, BlobRemovePayload, BlobStore, Cache, CacheNode,
    Error, Handle, MetaData, Registry, RegistryPayload, Result, StoreInfo, Uuid, NIL_UUID,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

fn encode<T: Serialize>(node: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(node).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

fn node_cache_key(physical_id: Uuid) -> String {
    format!("N{physical_id}")
}

/// Drop the last `n` entries pushed onto `v`, undoing a speculative
/// append when the batch it belonged to was rolled back.
fn truncate_tail<T>(v: &mut Vec<T>, n: usize) {
    let new_len = v.len().saturating_sub(n);
    v.truncate(new_len);
}

/// Per-store, per-transaction node repository.
pub struct NodeRepository<T> {
    store: StoreInfo,
    local: HashMap<Uuid, CacheNode<T>>,
    count_delta: i64,
    registry: Arc<dyn Registry>,
    cache: Arc<dyn Cache>,
    blob_store: Arc<dyn BlobStore>,
    node_cache_ttl: Duration,
    pending_updated: Vec<Handle>,
    pending_updated_before: Vec<Handle>,
    pending_removed: Vec<Handle>,
    pending_added: Vec<Handle>,
    pending_new_root: Option<Handle>,
    obsolete_physical: Vec<Uuid>,
}

impl<T> NodeRepository<T>
where
    T: MetaData + Clone + Serialize + DeserializeOwned,
{
    /// Open a node repository scoped to `store`, fresh for one
    /// transaction.
    pub fn new(
        store: StoreInfo,
        registry: Arc<dyn Registry>,
        cache: Arc<dyn Cache>,
        blob_store: Arc<dyn BlobStore>,
        node_cache_ttl: Duration,
    ) -> Self {
        NodeRepository {
            store,
            local: HashMap::new(),
            count_delta: 0,
            registry,
            cache,
            blob_store,
            node_cache_ttl,
            pending_updated: Vec::new(),
            pending_updated_before: Vec::new(),
            pending_removed: Vec::new(),
            pending_added: Vec::new(),
            pending_new_root: None,
            obsolete_physical: Vec::new(),
        }
    }

    /// The store this repository is scoped to (its `root_node_id`
    /// reflects in-flight changes once a brand-new root has committed).
    pub fn store(&self) -> &StoreInfo {
        &self.store
    }

    /// This repository's registry handle, so the transaction manager
    /// can drive the single Phase 2 all-or-nothing update without
    /// holding a second reference of its own.
    pub fn registry_handle(&self) -> Arc<dyn Registry> {
        self.registry.clone()
    }

    /// Net item-count change staged this transaction.
    pub fn count_delta(&self) -> i64 {
        self.count_delta
    }

    /// Adjust the staged count delta (the B-tree calls this as items
    /// are inserted/removed from nodes, independent of node-level
    /// add/update/remove).
    pub fn adjust_count(&mut self, delta: i64) {
        self.count_delta += delta;
    }

    /// `get`: serve from local cache if present (returning `None` for a
    /// locally removed node); otherwise resolve via registry → cache →
    /// blob store, back-filling the cache, and tag the node `Default`.
    pub fn get(&mut self, logical_id: Uuid) -> Result<Option<T>> {
        if let Some(cached) = self.local.get(&logical_id) {
            return Ok(match cached.action {
                Action::Remove => None,
                _ => Some(cached.node.clone()),
            });
        }

        let handles = self.registry.get(&[RegistryPayload {
            table: self.store.registry_table.clone(),
            logical_ids: vec![logical_id],
        }])?;
        let handle = match handles.into_iter().next() {
            Some(h) => h,
            None => return Ok(None),
        };

        let physical_id = handle.get_active_id();
        let cache_key = node_cache_key(physical_id);
        let bytes = match self.cache.get_struct(&cache_key) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                let bytes = self.blob_store.get_one(&self.store.blob_table, physical_id)?;
                if let Err(e) = self.cache.set_struct(&cache_key, &bytes, Some(self.node_cache_ttl)) {
                    warn!(?e, "failed to back-fill node cache");
                }
                bytes
            }
            Err(e) => return Err(e),
        };

        let mut node: T = decode(&bytes)?;
        node.set_version(handle.version);
        self.local.insert(logical_id, CacheNode::fetched(node.clone()));
        Ok(Some(node))
    }

    /// Upgrade a `Default`-tagged fetched node to `Get`: the B-tree
    /// calls this exactly when it reads an item out of the node.
    pub fn mark_get(&mut self, logical_id: Uuid) {
        if let Some(entry) = self.local.get_mut(&logical_id) {
            if entry.action == Action::Default {
                entry.action = Action::Get;
            }
        }
    }

    /// Insert a brand-new node.
    pub fn add(&mut self, logical_id: Uuid, node: T) {
        self.local.insert(
            logical_id,
            CacheNode {
                node,
                action: Action::Add,
            },
        );
    }

    /// Update a node's body. An in-transaction `Add` stays `Add`;
    /// anything else becomes `Update`.
    pub fn update(&mut self, logical_id: Uuid, node: T) {
        let stays_add = self.local.get(&logical_id).map(|e| e.action) == Some(Action::Add);
        self.local.insert(
            logical_id,
            CacheNode {
                node,
                action: if stays_add { Action::Add } else { Action::Update },
            },
        );
    }

    /// Remove a node. Cancels an in-transaction `Add` outright;
    /// otherwise marks the local entry `Remove`.
    pub fn remove(&mut self, logical_id: Uuid, node: T) {
        if self.local.get(&logical_id).map(|e| e.action) == Some(Action::Add) {
            self.local.remove(&logical_id);
            return;
        }
        self.local.insert(
            logical_id,
            CacheNode {
                node,
                action: Action::Remove,
            },
        );
    }

    /// Drop all local state (used by `refetchAndMerge`).
    pub fn clear_local(&mut self) {
        self.local.clear();
        self.pending_updated.clear();
        self.pending_updated_before.clear();
        self.pending_removed.clear();
        self.pending_added.clear();
        self.pending_new_root = None;
        self.obsolete_physical.clear();
    }

    /// `deleteObsoleteEntries`: after a successful Phase 2 cut-over,
    /// remove the registry rows of nodes this transaction tombstoned,
    /// clear the now-stale inactive-slot reservation on nodes it
    /// updated, and permanently delete the physical bodies the update/
    /// remove superseded (the old active body once an update flips
    /// live, or the tombstoned body once a remove is final). Returns
    /// `(deleted_registry_ids, unused_node_ids)` for the caller to log
    /// alongside this stage. Best-effort on the delete side: a body this
    /// misses is still unreferenced by any live handle and is recovered
    /// later.
    ///
    /// Clearing the inactive slot matters because flipping only swaps
    /// which slot is active, it doesn't null out the other one, so
    /// without this the handle would look like it still has a pending
    /// reservation and reject the node's next update forever.
    pub fn cleanup_obsolete_slots(&mut self) -> (Vec<Uuid>, Vec<Uuid>) {
        let updated_ids: Vec<Uuid> = std::mem::take(&mut self.pending_updated)
            .into_iter()
            .map(|h| h.logical_id)
            .collect();
        self.pending_updated_before.clear();
        if !updated_ids.is_empty() {
            match self.registry.get(&[RegistryPayload {
                table: self.store.registry_table.clone(),
                logical_ids: updated_ids,
            }]) {
                Ok(handles) => {
                    let cleared: Vec<Handle> = handles
                        .into_iter()
                        .map(|mut h| {
                            h.clear_inactive_id();
                            h
                        })
                        .collect();
                    if let Err(e) = self.registry.update(&self.store.registry_table, false, &cleared) {
                        warn!(?e, "failed to clear flipped handles' stale inactive slot");
                    }
                }
                Err(e) => warn!(?e, "failed to re-fetch flipped handles for inactive-slot cleanup"),
            }
        }

        let deleted_registry_ids: Vec<Uuid> = std::mem::take(&mut self.pending_removed)
            .into_iter()
            .map(|h| h.logical_id)
            .collect();
        if !deleted_registry_ids.is_empty() {
            if let Err(e) = self.registry.remove(&self.store.registry_table, &deleted_registry_ids) {
                warn!(?e, "failed to remove tombstoned registry rows");
            }
        }

        if self.obsolete_physical.is_empty() {
            return (deleted_registry_ids, Vec::new());
        }
        let unused_node_ids = std::mem::take(&mut self.obsolete_physical);
        if let Err(e) = self.blob_store.remove(&[BlobRemovePayload {
            table: self.store.blob_table.clone(),
            ids: unused_node_ids.clone(),
        }]) {
            warn!(?e, "failed to delete obsolete node bodies; will be swept by recovery");
        }
        for id in &unused_node_ids {
            if let Err(e) = self.cache.delete(&node_cache_key(*id)) {
                warn!(?e, "failed to evict obsolete node body from cache");
            }
        }
        (deleted_registry_ids, unused_node_ids)
    }

    fn ids_with_action(&self, action: Action) -> Vec<Uuid> {
        self.local
            .iter()
            .filter(|(_, e)| e.action == action)
            .map(|(id, _)| *id)
            .collect()
    }

    /// `commitNewRootNodes`: fast path for a store with baseline count
    /// zero whose only change this transaction is its root. No-op
    /// (trivially successful) for any other store shape.
    pub fn commit_new_root_nodes(&mut self) -> Result<bool> {
        if !self.store.is_brand_new() {
            return Ok(true);
        }
        let added = self.ids_with_action(Action::Add);
        if added.len() != 1 {
            return Ok(true);
        }
        let root_id = added[0];
        let existing = self.registry.get(&[RegistryPayload {
            table: self.store.registry_table.clone(),
            logical_ids: vec![root_id],
        }])?;
        if !existing.is_empty() {
            return Ok(false);
        }

        let node = self.local.get(&root_id).expect("checked above").node.clone();
        let physical_id = Uuid::new_v4();
        let bytes = encode(&node)?;
        self.blob_store.add(&[BlobPayload {
            table: self.store.blob_table.clone(),
            entries: vec![BlobEntry {
                id: physical_id,
                value: bytes.clone(),
            }],
        }])?;
        if let Err(e) = self.cache.set_struct(&node_cache_key(physical_id), &bytes, Some(self.node_cache_ttl)) {
            warn!(?e, "failed to cache new root node body");
        }
        let handle = Handle::new_for_add(root_id, physical_id, now_millis());
        self.registry.add(&self.store.registry_table, &[handle.clone()])?;
        self.store.root_node_id = root_id;
        self.pending_new_root = Some(handle);
        self.local.remove(&root_id);
        Ok(true)
    }

    /// `areFetchedItemsIntact`: every `Get`/`Default`-tagged node's
    /// stored version must still match what we observed.
    pub fn are_fetched_items_intact(&self) -> Result<bool> {
        let fetched: Vec<Uuid> = self
            .local
            .iter()
            .filter(|(_, e)| matches!(e.action, Action::Get | Action::Default))
            .map(|(id, _)| *id)
            .collect();
        if fetched.is_empty() {
            return Ok(true);
        }
        let handles = self.registry.get(&[RegistryPayload {
            table: self.store.registry_table.clone(),
            logical_ids: fetched.clone(),
        }])?;
        for id in &fetched {
            let observed = self.local[id].node.version();
            match handles.iter().find(|h| h.logical_id == *id) {
                Some(h) if h.version == observed => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// `commitUpdatedNodes`: allocate an inactive physical slot per
    /// updated node (reclaiming an expired reservation first), write
    /// the new body, and batch-update the registry (not
    /// all-or-nothing — the Phase 2 cut-over is what's all-or-nothing).
    pub fn commit_updated_nodes(&mut self) -> Result<bool> {
        let updated = self.ids_with_action(Action::Update);
        if updated.is_empty() {
            return Ok(true);
        }
        let handles = self.registry.get(&[RegistryPayload {
            table: self.store.registry_table.clone(),
            logical_ids: updated.clone(),
        }])?;

        let now = now_millis();
        let mut staged_handles = Vec::with_capacity(updated.len());
        let mut staged_bodies = Vec::with_capacity(updated.len());
        let mut superseded_ids = Vec::with_capacity(updated.len());
        for id in &updated {
            let mut handle = match handles.iter().find(|h| h.logical_id == *id) {
                Some(h) => h.clone(),
                None => return Ok(false),
            };
            if handle.is_deleted || handle.version != self.local[id].node.version() {
                return Ok(false);
            }
            if handle.get_inactive_id() != NIL_UUID {
                if handle.is_expired_inactive(now, cowtree_core::handle::DEFAULT_INACTIVE_EXPIRY_MILLIS) {
                    handle.clear_inactive_id();
                } else {
                    return Ok(false);
                }
            }
            let superseded = handle.get_active_id();
            let physical_id = handle.allocate_id(now);
            if physical_id == NIL_UUID {
                return Ok(false);
            }
            superseded_ids.push(superseded);
            let node = self.local[id].node.clone();
            staged_bodies.push(BlobEntry {
                id: physical_id,
                value: encode(&node)?,
            });
            staged_handles.push(handle);
        }

        self.registry.update(&self.store.registry_table, false, &staged_handles)?;
        self.blob_store.add(&[BlobPayload {
            table: self.store.blob_table.clone(),
            entries: staged_bodies.clone(),
        }])?;
        for entry in &staged_bodies {
            if let Err(e) = self.cache.set_struct(&node_cache_key(entry.id), &entry.value, Some(self.node_cache_ttl)) {
                warn!(?e, "failed to cache updated node body");
            }
        }
        self.obsolete_physical.extend(superseded_ids);
        self.pending_updated_before = handles;
        self.pending_updated = staged_handles;
        Ok(true)
    }

    /// The pre-stage and post-stage handle snapshots from the most
    /// recent successful [`NodeRepository::commit_updated_nodes`], for
    /// the caller to log as a [`cowtree_txlog::payload::CommitUpdatedNodesPayload`].
    pub fn pending_updated_handles(&self) -> (&[Handle], &[Handle]) {
        (&self.pending_updated_before, &self.pending_updated)
    }

    /// The tombstoned handles from the most recent successful
    /// [`NodeRepository::commit_removed_nodes`], for the caller to log
    /// as a [`cowtree_txlog::payload::CommitRemovedNodesPayload`].
    pub fn pending_removed_handles(&self) -> &[Handle] {
        &self.pending_removed
    }

    /// `commitRemovedNodes`: verify version, then tombstone.
    pub fn commit_removed_nodes(&mut self) -> Result<bool> {
        let removed = self.ids_with_action(Action::Remove);
        if removed.is_empty() {
            return Ok(true);
        }
        let handles = self.registry.get(&[RegistryPayload {
            table: self.store.registry_table.clone(),
            logical_ids: removed.clone(),
        }])?;
        let now = now_millis();
        let mut staged = Vec::with_capacity(removed.len());
        for id in &removed {
            let mut handle = match handles.iter().find(|h| h.logical_id == *id) {
                Some(h) => h.clone(),
                None => return Ok(false),
            };
            let observed = self.local[id].node.version();
            if handle.version != observed || handle.is_deleted {
                return Ok(false);
            }
            if handle.get_inactive_id() != NIL_UUID {
                return Ok(false);
            }
            handle.mark_deleted(now);
            staged.push(handle);
        }
        self.registry.update(&self.store.registry_table, false, &staged)?;
        self.obsolete_physical.extend(staged.iter().map(|h| h.get_active_id()));
        self.pending_removed = staged;
        Ok(true)
    }

    /// `commitAddedNodes`: assign a fresh handle, write the body, and
    /// register it.
    pub fn commit_added_nodes(&mut self) -> Result<bool> {
        let added = self.ids_with_action(Action::Add);
        if added.is_empty() {
            return Ok(true);
        }
        let now = now_millis();
        let mut handles = Vec::with_capacity(added.len());
        let mut bodies = Vec::with_capacity(added.len());
        for id in &added {
            let physical_id = Uuid::new_v4();
            let node = self.local[id].node.clone();
            bodies.push(BlobEntry {
                id: physical_id,
                value: encode(&node)?,
            });
            handles.push(Handle::new_for_add(*id, physical_id, now));
        }
        self.blob_store.add(&[BlobPayload {
            table: self.store.blob_table.clone(),
            entries: bodies.clone(),
        }])?;
        for entry in &bodies {
            if let Err(e) = self.cache.set_struct(&node_cache_key(entry.id), &entry.value, Some(self.node_cache_ttl)) {
                warn!(?e, "failed to cache added node body");
            }
        }
        self.registry.add(&self.store.registry_table, &handles)?;
        self.pending_added = handles;
        Ok(true)
    }

    /// `activateInactiveNodes`: in-memory flip of every handle staged by
    /// [`NodeRepository::commit_updated_nodes`]; the actual cut-over is
    /// the caller's Phase 2 registry update.
    pub fn activate_inactive_nodes(&self) -> Vec<Handle> {
        let now = now_millis();
        self.pending_updated
            .iter()
            .cloned()
            .map(|mut h| {
                h.flip_active_id();
                h.work_in_progress_timestamp = now.max(1);
                h
            })
            .collect()
    }

    /// `touchNodes`: in-memory version bump for handles staged by
    /// [`NodeRepository::commit_removed_nodes`].
    pub fn touch_nodes(&self) -> Vec<Handle> {
        self.pending_removed
            .iter()
            .cloned()
            .map(|mut h| {
                h.touch();
                h
            })
            .collect()
    }

    /// Handles newly registered this transaction (brand-new root plus
    /// ordinary added nodes) — used by the caller to fold `Add` actions
    /// into the final committed-state snapshot.
    pub fn committed_add_handles(&self) -> Vec<Handle> {
        let mut handles = self.pending_added.clone();
        handles.extend(self.pending_new_root.clone());
        handles
    }

    /// Undo [`NodeRepository::commit_updated_nodes`]: clear the
    /// inactive-slot reservation on each handle it allocated.
    pub fn rollback_updated_nodes(&mut self) -> Result<()> {
        if self.pending_updated.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = self.pending_updated.iter().map(|h| h.logical_id).collect();
        let handles = self.registry.get(&[RegistryPayload {
            table: self.store.registry_table.clone(),
            logical_ids: ids,
        }])?;
        let reverted: Vec<Handle> = handles
            .into_iter()
            .map(|mut h| {
                h.clear_inactive_id();
                h
            })
            .collect();
        self.registry.update(&self.store.registry_table, false, &reverted)?;
        truncate_tail(&mut self.obsolete_physical, self.pending_updated.len());
        self.pending_updated.clear();
        self.pending_updated_before.clear();
        Ok(())
    }

    /// Undo [`NodeRepository::commit_removed_nodes`]: un-tombstone.
    pub fn rollback_removed_nodes(&mut self) -> Result<()> {
        if self.pending_removed.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = self.pending_removed.iter().map(|h| h.logical_id).collect();
        let handles = self.registry.get(&[RegistryPayload {
            table: self.store.registry_table.clone(),
            logical_ids: ids,
        }])?;
        let reverted: Vec<Handle> = handles
            .into_iter()
            .map(|mut h| {
                h.is_deleted = false;
                h.work_in_progress_timestamp = 0;
                h
            })
            .collect();
        self.registry.update(&self.store.registry_table, false, &reverted)?;
        truncate_tail(&mut self.obsolete_physical, self.pending_removed.len());
        self.pending_removed.clear();
        Ok(())
    }

    /// Undo [`NodeRepository::commit_added_nodes`]: remove the registry
    /// rows and blob bodies.
    pub fn rollback_added_nodes(&mut self) {
        if self.pending_added.is_empty() {
            return;
        }
        let ids: Vec<Uuid> = self.pending_added.iter().map(|h| h.logical_id).collect();
        let physical: Vec<Uuid> = self.pending_added.iter().map(|h| h.get_active_id()).collect();
        if let Err(e) = self.registry.remove(&self.store.registry_table, &ids) {
            warn!(?e, "failed to roll back added registry rows");
        }
        if let Err(e) = self.blob_store.remove(&[BlobRemovePayload {
            table: self.store.blob_table.clone(),
            ids: physical,
        }]) {
            warn!(?e, "failed to roll back added node blobs");
        }
        self.pending_added.clear();
    }

    /// Undo [`NodeRepository::commit_new_root_nodes`].
    pub fn rollback_new_root_nodes(&mut self) {
        let Some(handle) = self.pending_new_root.take() else {
            return;
        };
        if let Err(e) = self.registry.remove(&self.store.registry_table, &[handle.logical_id]) {
            warn!(?e, "failed to roll back new root registry row");
        }
        if let Err(e) = self.blob_store.remove(&[BlobRemovePayload {
            table: self.store.blob_table.clone(),
            ids: vec![handle.get_active_id()],
        }]) {
            warn!(?e, "failed to roll back new root blob");
        }
        self.store.root_node_id = NIL_UUID;
    }
}
