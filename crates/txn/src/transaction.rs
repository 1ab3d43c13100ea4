//! Two-phase transaction manager (C9).
//!
//! Ties together the item action tracker (C6), the per-store node
//! repositories (C7), and the transaction log (C8) into the commit
//! protocol: a writer's Phase 1 prepares every touched
//! store's nodes into their inactive slots; Phase 2 performs the single
//! all-or-nothing registry update that makes them visible, then cleans
//! up. A reader's "commit" is just a conflict check against what it
//! fetched.

use cowtree_core::{
    CancellationToken, Error, MetaData, Result, Stage, StoreInfo, StoreRepository, TrackedItem,
    TransactionConfig, TransactionMode, Uuid,
};
use cowtree_txlog::payload::{
    ActivelyPersistedItemPayload, CommitRemovedNodesPayload, CommitStoreInfoPayload,
    CommittedHandlesPayload, CommitTrackedItemsValuesPayload, CommitUpdatedNodesPayload,
    DeleteObsoleteEntriesPayload, DeleteTrackedItemsValuesPayload, FinalizeCommitPayload,
    LockTrackedItemsPayload, UnlockTrackedItemsPayload,
};
use cowtree_txlog::TransactionLog;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::item_tracker::ItemActionTracker;
use crate::node::NodeRepository;

/// The phase counter: `{-1: fresh, 0: begun, 1: phase1
/// done, 2: finished}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not yet begun.
    Fresh,
    /// `begin()` has run.
    Begun,
    /// Phase 1 commit has prepared every store.
    Phase1Done,
    /// Phase 2 commit (or a rollback) has finished the transaction.
    Finished,
}

/// The (non-goal) B-tree's callback surface, injected so this crate
/// never needs to know the key/value layout inside a node body — only
/// `&dyn MetaData` and opaque bytes ("dynamic dispatch over
/// value types").
pub trait BTreeCallback<T> {
    /// Re-fetch each tracked item's current version from live B-tree
    /// state and report whether every one still matches what this
    /// transaction originally observed. Used by a reader's commit.
    fn check_item_versions(&self, tracked: &[TrackedItem]) -> Result<bool>;

    /// `refetchAndMerge`: clear local state, reload fresh `StoreInfo`,
    /// then replay this transaction's recorded item/node actions
    /// against the now-current B-tree state.
    fn refetch_and_merge(
        &mut self,
        store: &mut NodeRepository<T>,
        items: &mut ItemActionTracker,
    ) -> Result<()>;
}

struct StoreContext<T> {
    nodes: NodeRepository<T>,
    items: ItemActionTracker,
}

/// Randomised backoff window between commit retries ("100-600 ms").
const RETRY_BACKOFF_MIN_MS: u64 = 100;
const RETRY_BACKOFF_MAX_MS: u64 = 600;

/// Item lock duration; comfortably longer than one retry backoff so a
/// slow retry doesn't race its own lock's expiry.
const LOCK_DURATION: Duration = Duration::from_secs(30);

/// A single two-phase transaction, generic over the B-tree's node body
/// type `T`.
pub struct Transaction<T> {
    tid: Uuid,
    phase: Phase,
    config: TransactionConfig,
    log: TransactionLog,
    cancel: CancellationToken,
    store_repo: Arc<dyn StoreRepository>,
    stores: HashMap<String, StoreContext<T>>,
    cache: Arc<dyn cowtree_core::Cache>,
    prepared_updated_handles: Vec<cowtree_core::Handle>,
    prepared_removed_handles: Vec<cowtree_core::Handle>,
    committed_state: Stage,
}

impl<T> Transaction<T>
where
    T: MetaData + Clone + Serialize + DeserializeOwned,
{
    /// Begin a new transaction. Generates its own transaction UUID,
    /// used both as the transaction-log key and as the item lock
    /// identity.
    pub fn begin(
        config: TransactionConfig,
        log_store: Arc<dyn cowtree_core::TransactionLogStore>,
        cache: Arc<dyn cowtree_core::Cache>,
        store_repo: Arc<dyn StoreRepository>,
        cancel: CancellationToken,
    ) -> Self {
        let tid = Uuid::new_v4();
        Transaction {
            tid,
            phase: Phase::Begun,
            log: TransactionLog::new(log_store, tid, config.logging_enabled),
            config,
            cancel,
            store_repo,
            stores: HashMap::new(),
            cache,
            prepared_updated_handles: Vec::new(),
            prepared_removed_handles: Vec::new(),
            committed_state: Stage::Unknown,
        }
    }

    /// This transaction's generated identity.
    pub fn tid(&self) -> Uuid {
        self.tid
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn require_phase(&self, expected: Phase) -> Result<()> {
        if self.phase != expected {
            return Err(Error::IllegalTransition(format!(
                "expected phase {expected:?}, got {:?}",
                self.phase
            )));
        }
        Ok(())
    }

    /// Bring a store into this transaction's working set, fetching its
    /// metadata if not already present.
    pub fn touch_store(
        &mut self,
        store: StoreInfo,
        registry: Arc<dyn cowtree_core::Registry>,
        blob_store: Arc<dyn cowtree_core::BlobStore>,
        node_cache_ttl: Duration,
    ) {
        let cache = self.cache.clone();
        let tid = self.tid;
        let items = ItemActionTracker::new(&store, cache.clone(), blob_store.clone(), tid, node_cache_ttl);
        self.stores.entry(store.name.clone()).or_insert_with(|| StoreContext {
            nodes: NodeRepository::new(store, registry, cache, blob_store, node_cache_ttl),
            items,
        });
    }

    /// Node repository for a touched store, if any.
    pub fn nodes_mut(&mut self, store_name: &str) -> Option<&mut NodeRepository<T>> {
        self.stores.get_mut(store_name).map(|ctx| &mut ctx.nodes)
    }

    /// Item tracker for a touched store, if any.
    pub fn items_mut(&mut self, store_name: &str) -> Option<&mut ItemActionTracker> {
        self.stores.get_mut(store_name).map(|ctx| &mut ctx.items)
    }

    fn is_writer_no_op(&self) -> bool {
        self.stores.values().all(|ctx| ctx.items.is_empty())
    }

    /// Phase 1 commit for a writer transaction.
    pub async fn phase1_commit_writer(
        &mut self,
        callback: &mut dyn BTreeCallback<T>,
    ) -> Result<()> {
        self.require_phase(Phase::Begun)?;
        if self.config.mode != TransactionMode::ForWriting {
            return Err(Error::IllegalTransition("not opened for writing".into()));
        }
        if self.is_writer_no_op() {
            self.phase = Phase::Phase1Done;
            return Ok(());
        }

        let item_ids: Vec<Uuid> = self
            .stores
            .values()
            .flat_map(|ctx| ctx.items.entries().map(|e| e.item.id))
            .collect();
        self.log.initiate(Stage::LockTrackedItems, &LockTrackedItemsPayload { item_ids })?;
        self.committed_state = Stage::LockTrackedItems;
        self.lock_all_stores()?;

        let deadline = Instant::now() + self.config.max_time;
        loop {
            if self.cancel.is_cancelled() {
                self.rollback()?;
                return Err(Error::Timeout("cancelled during phase 1 commit".into()));
            }
            if Instant::now() > deadline {
                self.rollback()?;
                return Err(Error::Timeout("max_time elapsed during phase 1 commit".into()));
            }

            match self.try_phase1_pass() {
                Ok(true) => break,
                Ok(false) => {
                    self.rollback_partial_phase1()?;
                    self.sleep_backoff().await;
                    for ctx in self.stores.values_mut() {
                        callback.refetch_and_merge(&mut ctx.nodes, &mut ctx.items)?;
                    }
                    let retry_ids: Vec<Uuid> = self
                        .stores
                        .values()
                        .flat_map(|ctx| ctx.items.entries().map(|e| e.item.id))
                        .collect();
                    self.log.add(Stage::LockTrackedItems, &LockTrackedItemsPayload { item_ids: retry_ids })?;
                    self.lock_all_stores()?;
                }
                Err(e) => {
                    self.rollback()?;
                    return Err(e);
                }
            }
        }

        for ctx in self.stores.values_mut() {
            if !ctx.nodes.commit_added_nodes()? {
                self.rollback()?;
                return Err(Error::Conflict("commit_added_nodes failed after pass succeeded".into()));
            }
            self.log.add(
                Stage::CommitAddedNodes,
                &CommittedHandlesPayload {
                    table: ctx.nodes.store().registry_table.clone(),
                    handles: ctx.nodes.committed_add_handles(),
                },
            )?;
        }
        self.committed_state = Stage::CommitAddedNodes;

        self.commit_store_info()?;
        self.committed_state = Stage::CommitStoreInfo;

        self.log.add_marker(Stage::BeforeFinalize)?;
        self.committed_state = Stage::BeforeFinalize;
        self.prepared_updated_handles = self
            .stores
            .values()
            .flat_map(|ctx| ctx.nodes.activate_inactive_nodes())
            .collect();
        self.prepared_removed_handles = self
            .stores
            .values()
            .flat_map(|ctx| ctx.nodes.touch_nodes())
            .collect();

        for ctx in self.stores.values() {
            if let Err(e) = ctx.items.check_tracked_items() {
                self.rollback()?;
                return Err(e);
            }
            let items: Vec<TrackedItem> = ctx.items.entries().cloned().collect();
            if !items.is_empty() && !callback.check_item_versions(&items)? {
                self.rollback()?;
                return Err(Error::Conflict("item version race detected before finalize".into()));
            }
        }

        self.phase = Phase::Phase1Done;
        Ok(())
    }

    /// One pass of Phase 1 step 2 across every touched store: persist
    /// item values, re-derive node classification, and run the
    /// ordered commit sub-protocols. Returns `Ok(false)` (not an error)
    /// when any sub-protocol reports a conflict, so the caller retries.
    fn try_phase1_pass(&mut self) -> Result<bool> {
        for ctx in self.stores.values_mut() {
            let blob_table = ctx.items.blob_table().to_string();
            for blob_id in ctx.items.take_pending_active_persist() {
                self.log.add(
                    Stage::AddActivelyPersistedItem,
                    &ActivelyPersistedItemPayload { table: blob_table.clone(), blob_id },
                )?;
            }
        }

        for (name, ctx) in self.stores.iter_mut() {
            let table = ctx.nodes.store().blob_table.clone();
            let written = ctx.items.commit_values(&table)?;
            self.log.add(
                Stage::CommitTrackedItemsValues,
                &CommitTrackedItemsValuesPayload {
                    table: table.clone(),
                    written_item_ids: written,
                },
            )?;

            if !ctx.nodes.commit_new_root_nodes()? {
                debug!(store = %name, "commit_new_root_nodes reported a conflict");
                return Ok(false);
            }
            if !ctx.nodes.are_fetched_items_intact()? {
                debug!(store = %name, "a fetched node's version moved under us");
                return Ok(false);
            }
            if !ctx.nodes.commit_updated_nodes()? {
                debug!(store = %name, "commit_updated_nodes reported a conflict");
                return Ok(false);
            }
            let (before, after) = ctx.nodes.pending_updated_handles();
            self.log.add(
                Stage::CommitUpdatedNodes,
                &CommitUpdatedNodesPayload {
                    table: ctx.nodes.store().registry_table.clone(),
                    before: before.to_vec(),
                    after: after.to_vec(),
                },
            )?;
            if !ctx.nodes.commit_removed_nodes()? {
                debug!(store = %name, "commit_removed_nodes reported a conflict");
                return Ok(false);
            }
            self.log.add(
                Stage::CommitRemovedNodes,
                &CommitRemovedNodesPayload {
                    table: ctx.nodes.store().registry_table.clone(),
                    handles: ctx.nodes.pending_removed_handles().to_vec(),
                },
            )?;
        }
        Ok(true)
    }

    fn commit_store_info(&mut self) -> Result<()> {
        let mut touched_names = Vec::new();
        let mut infos: Vec<StoreInfo> = Vec::new();
        for ctx in self.stores.values() {
            let mut info = ctx.nodes.store().clone();
            info.count_delta = ctx.nodes.count_delta();
            touched_names.push(info.name.clone());
            infos.push(info);
        }
        if infos.is_empty() {
            return Ok(());
        }
        self.store_repo.update(&infos)?;
        self.log.add(
            Stage::CommitStoreInfo,
            &CommitStoreInfoPayload { store_names: touched_names },
        )?;
        Ok(())
    }

    fn lock_all_stores(&mut self) -> Result<()> {
        let ids: Vec<Uuid> = self
            .stores
            .values()
            .flat_map(|ctx| ctx.items.entries().filter(|e| !e.is_lock_owner).map(|e| e.item.id))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        match self.cache.lock(LOCK_DURATION, &ids, self.tid)? {
            cowtree_core::LockOutcome::Acquired => {
                for ctx in self.stores.values_mut() {
                    ctx.items.mark_locked(&ids);
                }
                Ok(())
            }
            cowtree_core::LockOutcome::Conflict(owner) => Err(Error::lock_held(owner)),
        }
    }

    async fn sleep_backoff(&self) {
        let millis = rand::thread_rng().gen_range(RETRY_BACKOFF_MIN_MS..=RETRY_BACKOFF_MAX_MS);
        self.cancel.sleep_or_cancelled(Duration::from_millis(millis)).await;
    }

    fn rollback_partial_phase1(&mut self) -> Result<()> {
        for ctx in self.stores.values_mut() {
            ctx.nodes.rollback_updated_nodes()?;
            ctx.nodes.rollback_removed_nodes()?;
            ctx.nodes.rollback_new_root_nodes();
        }
        Ok(())
    }

    /// Phase 2 commit for a writer transaction: the single all-or-
    /// nothing registry cut-over, then cleanup.
    pub async fn phase2_commit_writer(&mut self) -> Result<()> {
        self.require_phase(Phase::Phase1Done)?;

        let activated_ids: Vec<Uuid> = self.prepared_updated_handles.iter().map(|h| h.logical_id).collect();
        let removed_ids: Vec<Uuid> = self.prepared_removed_handles.iter().map(|h| h.logical_id).collect();
        let registry_table = self
            .stores
            .values()
            .next()
            .map(|ctx| ctx.nodes.store().registry_table.clone())
            .unwrap_or_default();

        self.log.add(
            Stage::FinalizeCommit,
            &FinalizeCommitPayload {
                table: registry_table.clone(),
                activated_logical_ids: activated_ids,
                removed_logical_ids: removed_ids,
            },
        )?;

        let deadline = Instant::now() + self.config.max_time;
        loop {
            let mut all_handles = self.prepared_updated_handles.clone();
            all_handles.extend(self.prepared_removed_handles.clone());
            if all_handles.is_empty() {
                break;
            }
            let registry = self.any_registry();
            match registry.update(&registry_table, true, &all_handles) {
                Ok(()) => break,
                Err(e) if e.is_retryable() => {
                    if Instant::now() > deadline || self.cancel.is_cancelled() {
                        self.rollback()?;
                        return Err(Error::Timeout("phase 2 retry budget exhausted".into()));
                    }
                    warn!("phase 2 all-or-nothing update rejected, retrying");
                    self.sleep_backoff().await;
                    continue;
                }
                Err(e) => {
                    self.rollback()?;
                    return Err(e);
                }
            }
        }
        self.committed_state = Stage::FinalizeCommit;

        let mut unlocked_ids = Vec::new();
        for ctx in self.stores.values_mut() {
            unlocked_ids.extend(ctx.items.entries().filter(|e| e.is_lock_owner).map(|e| e.item.id));
            ctx.items.unlock()?;
        }
        self.log.add(Stage::UnlockTrackedItems, &UnlockTrackedItemsPayload { item_ids: unlocked_ids })?;

        self.run_cleanup_tail();
        self.log.remove()?;
        self.committed_state = Stage::Unknown;
        self.phase = Phase::Finished;
        Ok(())
    }

    fn any_registry(&self) -> Arc<dyn cowtree_core::Registry> {
        // All stores in a single transaction share one registry backend
        // in this workspace's deployment model; any store's handle to it
        // will do.
        self.stores
            .values()
            .next()
            .expect("phase2 only reached when stores is non-empty")
            .nodes
            .registry_handle()
    }

    fn run_cleanup_tail(&mut self) {
        for ctx in self.stores.values_mut() {
            let table = ctx.nodes.store().registry_table.clone();
            let (deleted_registry_ids, unused_node_ids) = ctx.nodes.cleanup_obsolete_slots();
            if let Err(e) = self.log.add(
                Stage::DeleteObsoleteEntries,
                &DeleteObsoleteEntriesPayload { table, deleted_registry_ids, unused_node_ids },
            ) {
                error!(?e, "failed to log deleteObsoleteEntries payload");
            }
        }

        for ctx in self.stores.values_mut() {
            let blob_table = ctx.nodes.store().blob_table.clone();
            let item_ids = ctx.items.obsolete_values().to_vec();
            let globally_cached = ctx.items.is_globally_cached();
            if let Err(e) = ctx.items.delete_obsolete_values(&blob_table) {
                error!(?e, "failed to delete obsolete item values post-commit");
                continue;
            }
            if let Err(e) = self.log.add(
                Stage::DeleteTrackedItemsValues,
                &DeleteTrackedItemsValuesPayload { table: blob_table, item_ids, globally_cached },
            ) {
                error!(?e, "failed to log deleteTrackedItemsValues payload");
            }
        }
    }

    /// Phase 1 commit for a reader transaction: succeeds iff every
    /// fetched item still carries its observed version.
    pub async fn phase1_commit_reader(&mut self, callback: &mut dyn BTreeCallback<T>) -> Result<()> {
        self.require_phase(Phase::Begun)?;
        let deadline = Instant::now() + self.config.max_time;
        loop {
            let mut ok = true;
            for ctx in self.stores.values() {
                let tracked: Vec<TrackedItem> = ctx.items.entries().cloned().collect();
                if !tracked.is_empty() && !callback.check_item_versions(&tracked)? {
                    ok = false;
                    break;
                }
            }
            if ok {
                self.phase = Phase::Finished;
                return Ok(());
            }
            if Instant::now() > deadline || self.cancel.is_cancelled() {
                self.phase = Phase::Finished;
                return Err(Error::Conflict("reader observed a stale item version".into()));
            }
            self.sleep_backoff().await;
            for ctx in self.stores.values_mut() {
                callback.refetch_and_merge(&mut ctx.nodes, &mut ctx.items)?;
            }
        }
    }

    /// Roll back the transaction using `committed_state` to know which
    /// stages were entered. Refuses once Phase 2's `finalizeCommit` has
    /// run: the commit has already succeeded and cannot be undone.
    pub fn rollback(&mut self) -> Result<()> {
        if self.committed_state == Stage::FinalizeCommit {
            return Err(Error::IllegalTransition(
                "cannot roll back a transaction past finalize_commit".into(),
            ));
        }
        if self.phase == Phase::Finished {
            return Err(Error::IllegalTransition("transaction already finished".into()));
        }

        for ctx in self.stores.values_mut() {
            ctx.nodes.rollback_updated_nodes()?;
            ctx.nodes.rollback_removed_nodes()?;
            ctx.nodes.rollback_added_nodes();
            ctx.nodes.rollback_new_root_nodes();
            let table = ctx.nodes.store().blob_table.clone();
            ctx.items.delete_written_values(&table);
            ctx.items.unlock().ok();
        }
        self.log.remove()?;
        self.committed_state = Stage::Unknown;
        self.phase = Phase::Finished;
        Ok(())
    }
}
