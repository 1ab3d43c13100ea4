//! Item action tracker (C6): per-transaction item intents, item-level
//! locking, and separate-segment value-blob lifecycle.

use cowtree_core::{
    transition, Action, BlobEntry, BlobPayload, BlobRemovePayload, BlobStore, Cache, Error,
    Event, Item, LockOutcome, Result, StoreInfo, TrackedItem, Uuid,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

fn item_value_cache_key(id: Uuid) -> String {
    format!("V{id}")
}

/// Per-transaction record of every item touched, keyed by the item's
/// *current* ID (which changes under [`ItemActionTracker::commit_values`]
/// or an immediate active persist, either of which rewrites a
/// separate-segment value to a fresh UUID).
pub struct ItemActionTracker {
    entries: HashMap<Uuid, TrackedItem>,
    cache: Arc<dyn Cache>,
    blob_store: Arc<dyn BlobStore>,
    lock_id: Uuid,
    written_this_txn: Vec<Uuid>,
    for_deletion_items: Vec<Uuid>,
    blob_table: String,
    in_node_segment: bool,
    actively_persisted: bool,
    globally_cached: bool,
    value_cache_ttl: Duration,
    actively_persisted_ids: Vec<Uuid>,
    pending_active_persist: Vec<Uuid>,
}

impl ItemActionTracker {
    /// A fresh tracker for one transaction against `store`, identified by
    /// `lock_id` (the value written into every item-level lock record
    /// this transaction acquires). `value_cache_ttl` bounds the
    /// `"V"`-prefixed cache entries this tracker back-fills on a lazy
    /// fetch.
    pub fn new(
        store: &StoreInfo,
        cache: Arc<dyn Cache>,
        blob_store: Arc<dyn BlobStore>,
        lock_id: Uuid,
        value_cache_ttl: Duration,
    ) -> Self {
        ItemActionTracker {
            entries: HashMap::new(),
            cache,
            blob_store,
            lock_id,
            written_this_txn: Vec::new(),
            for_deletion_items: Vec::new(),
            blob_table: store.blob_table.clone(),
            in_node_segment: store.is_value_data_in_node_segment,
            actively_persisted: store.is_value_data_actively_persisted,
            globally_cached: store.is_value_data_globally_cached,
            value_cache_ttl,
            actively_persisted_ids: Vec::new(),
            pending_active_persist: Vec::new(),
        }
    }

    /// True if this store mirrors separate-segment item values in the
    /// shared cache (the `"V"`-prefixed entries).
    pub fn is_globally_cached(&self) -> bool {
        self.globally_cached
    }

    /// Every currently-tracked item.
    pub fn entries(&self) -> impl Iterator<Item = &TrackedItem> {
        self.entries.values()
    }

    /// True if nothing is tracked — the writer Phase 1 no-op case.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `event` against `item`. `version_in_db` is the version
    /// this transaction originally observed for this item (ignored for
    /// a repeat event against an already-tracked item). A `Remove`
    /// cancelling a same-transaction `Add` drops the tracked entry
    /// entirely.
    ///
    /// When the store actively persists separate-segment values, an
    /// `Add`/`Update` also writes the value blob here, immediately,
    /// rather than waiting for [`ItemActionTracker::commit_values`] —
    /// see [`ItemActionTracker::active_persist`].
    pub fn track(&mut self, event: Event, item: Item, version_in_db: u64) -> Result<()> {
        let id = item.id;
        let current_action = self.entries.get(&id).map(|e| e.action);
        match transition(current_action, event) {
            None => {
                self.entries.remove(&id);
            }
            Some(new_action) => {
                self.entries
                    .entry(id)
                    .and_modify(|e| {
                        e.action = new_action;
                        e.item = item.clone();
                    })
                    .or_insert_with(|| {
                        TrackedItem::new(item, self.lock_id, new_action, version_in_db)
                    });
                self.active_persist(id, new_action)?;
            }
        }
        Ok(())
    }

    /// `addActivelyPersistedItem`/`updateActivelyPersistedItem`: when
    /// this store's separate-segment values are actively persisted,
    /// write `id`'s value to the blob store right away under a fresh
    /// UUID and re-key the tracked entry onto it, rather than deferring
    /// the write to [`ItemActionTracker::commit_values`]. A same-
    /// transaction `Add` also bumps the item's version. No-op for
    /// in-node-segment stores, deferred-persist stores, or an entry with
    /// no in-memory value to write (already active-persisted, or a bare
    /// `Get`/`Remove`).
    fn active_persist(&mut self, id: Uuid, action: Action) -> Result<()> {
        if self.in_node_segment || !self.actively_persisted {
            return Ok(());
        }
        if !matches!(action, Action::Add | Action::Update) {
            return Ok(());
        }
        let Some(value) = self.entries.get(&id).and_then(|e| e.item.value.clone()) else {
            return Ok(());
        };

        let blob_id = Uuid::new_v4();
        self.blob_store.add(&[BlobPayload {
            table: self.blob_table.clone(),
            entries: vec![BlobEntry { id: blob_id, value }],
        }])?;

        if let Some(mut entry) = self.entries.remove(&id) {
            entry.item.id = blob_id;
            entry.item.value = None;
            entry.item.value_needs_fetch = true;
            entry.persisted = true;
            if action == Action::Add {
                entry.item.version += 1;
            }
            self.entries.insert(blob_id, entry);
        }
        self.written_this_txn.push(blob_id);
        self.actively_persisted_ids.push(blob_id);
        self.pending_active_persist.push(blob_id);
        Ok(())
    }

    /// Drain the blob IDs written by [`ItemActionTracker::active_persist`]
    /// since the last call, for the transaction manager to log one
    /// `Stage::AddActivelyPersistedItem` entry per ID.
    pub fn take_pending_active_persist(&mut self) -> Vec<Uuid> {
        std::mem::take(&mut self.pending_active_persist)
    }

    /// The blob table actively-persisted / lazily-fetched values live
    /// in, for the caller to build log payloads without re-deriving it.
    pub fn blob_table(&self) -> &str {
        &self.blob_table
    }

    /// `Get(item)`'s lazy value fetch: materialize a tracked item's
    /// value when it still lives in a separate blob segment. No-op if
    /// the value is already in memory. Consults the shared cache first
    /// (key prefix `"V"`) when this store globally caches item values,
    /// otherwise goes straight to the blob store; a successful blob
    /// fetch optionally back-fills the cache. Fetch failure surfaces;
    /// a cache back-fill failure is demoted to a warning.
    pub fn fetch_value(&mut self, id: Uuid) -> Result<Option<Vec<u8>>> {
        let needs_fetch = match self.entries.get(&id) {
            Some(entry) => entry.item.value_needs_fetch,
            None => return Ok(None),
        };
        if !needs_fetch {
            return Ok(self.entries.get(&id).and_then(|e| e.item.value.clone()));
        }

        let bytes = if self.globally_cached {
            let key = item_value_cache_key(id);
            match self.cache.get_struct(&key) {
                Ok(bytes) => bytes,
                Err(e) if e.is_not_found() => {
                    let bytes = self.blob_store.get_one(&self.blob_table, id)?;
                    if let Err(e) = self.cache.set_struct(&key, &bytes, Some(self.value_cache_ttl)) {
                        warn!(?e, "failed to back-fill item value cache");
                    }
                    bytes
                }
                Err(e) => return Err(e),
            }
        } else {
            self.blob_store.get_one(&self.blob_table, id)?
        };

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.item.value = Some(bytes.clone());
            entry.item.value_needs_fetch = false;
        }
        Ok(Some(bytes))
    }

    /// Conflict-detection pass (`checkTrackedItems`): for every tracked
    /// item not in `Add` and not already confirmed as our own lock,
    /// reject if the cache reports it locked by someone else.
    ///
    /// Two simultaneous `Get` intents are always compatible (the spec's
    /// closed compatibility rule); our [`Cache`] contract can only
    /// report "locked by someone else", not that someone else's intent,
    /// so a tracked `Get` never conflicts here regardless of what the
    /// foreign holder is doing with it.
    pub fn check_tracked_items(&self) -> Result<()> {
        for entry in self.entries.values() {
            if entry.action == Action::Add || entry.action == Action::Get {
                continue;
            }
            if entry.is_lock_owner {
                continue;
            }
            if self.cache.is_locked_by_others(&[entry.item.id], self.lock_id)? {
                return Err(Error::Conflict(format!(
                    "item {} is locked by another transaction",
                    entry.item.id
                )));
            }
        }
        Ok(())
    }

    /// Lock acquisition (`lock(duration)`): batch-acquire every tracked
    /// item not already confirmed owned. All-or-nothing per the
    /// underlying cache primitive.
    pub fn lock(&mut self, duration: Duration) -> Result<()> {
        let ids: Vec<Uuid> = self
            .entries
            .values()
            .filter(|e| !e.is_lock_owner)
            .map(|e| e.item.id)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        match self.cache.lock(duration, &ids, self.lock_id)? {
            LockOutcome::Acquired => {
                for entry in self.entries.values_mut() {
                    if ids.contains(&entry.item.id) {
                        entry.is_lock_owner = true;
                    }
                }
                Ok(())
            }
            LockOutcome::Conflict(owner) => {
                debug!(%owner, "lock acquisition conflicted");
                Err(Error::lock_held(owner))
            }
        }
    }

    /// Mark every tracked entry whose item ID is in `ids` as lock-owned,
    /// after a batch [`Cache::lock`] acquired them. Used by the
    /// transaction manager when it locks across every store touched by
    /// the transaction in a single call.
    pub fn mark_locked(&mut self, ids: &[Uuid]) {
        for entry in self.entries.values_mut() {
            if ids.contains(&entry.item.id) {
                entry.is_lock_owner = true;
            }
        }
    }

    /// Unlock: delete only the lock keys we own.
    pub fn unlock(&mut self) -> Result<()> {
        let ids: Vec<Uuid> = self
            .entries
            .values()
            .filter(|e| e.is_lock_owner)
            .map(|e| e.item.id)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.cache.unlock(&ids, self.lock_id)?;
        for entry in self.entries.values_mut() {
            if ids.contains(&entry.item.id) {
                entry.is_lock_owner = false;
            }
        }
        Ok(())
    }

    /// `commitTrackedItemsValues`: for stores with a separate value
    /// segment that is not actively persisted, batch-write every
    /// tracked `Add`/`Update` value to the blob store, rewriting the
    /// item's ID to a fresh UUID so readers of the old blob are
    /// undisturbed. Returns the set of freshly-written IDs (also
    /// accumulated for [`ItemActionTracker::rollback_written_values`]).
    pub fn commit_values(&mut self, table: &str) -> Result<Vec<Uuid>> {
        let mut entries_to_write = Vec::new();
        let mut rewrites: Vec<(Uuid, Uuid)> = Vec::new();

        for (old_id, entry) in self.entries.iter() {
            let writable = matches!(entry.action, Action::Add | Action::Update);
            if writable {
                if let Some(value) = entry.item.value.clone() {
                    let new_id = Uuid::new_v4();
                    entries_to_write.push(BlobEntry {
                        id: new_id,
                        value,
                    });
                    rewrites.push((*old_id, new_id));
                }
            }
            // A value already persisted this transaction by
            // `active_persist` is the item's final value, not one this
            // stage is superseding — only a genuinely prior (pre-
            // transaction) persisted value counts as obsolete here.
            let had_prior_value = entry.persisted && !self.actively_persisted_ids.contains(old_id);
            if had_prior_value && matches!(entry.action, Action::Update | Action::Remove) {
                self.for_deletion_items.push(*old_id);
            }
        }

        if !entries_to_write.is_empty() {
            self.blob_store.add(&[BlobPayload {
                table: table.to_string(),
                entries: entries_to_write,
            }])?;
        }

        let mut written = Vec::new();
        for (old_id, new_id) in rewrites {
            if let Some(mut entry) = self.entries.remove(&old_id) {
                entry.item.id = new_id;
                entry.item.value = None;
                entry.item.value_needs_fetch = true;
                entry.persisted = true;
                self.entries.insert(new_id, entry);
            }
            written.push(new_id);
        }
        self.written_this_txn.extend(written.iter().copied());
        Ok(written)
    }

    /// `getForRollbackTrackedItemsValues`: item UUIDs written this
    /// transaction, to be removed from the blob store on rollback.
    pub fn rollback_written_values(&self) -> &[Uuid] {
        &self.written_this_txn
    }

    /// `getObsoleteTrackedItemsValues`: item UUIDs whose blob is
    /// obsolete after a successful commit (superseded updates, and
    /// removes of previously-persisted values).
    pub fn obsolete_values(&self) -> &[Uuid] {
        &self.for_deletion_items
    }

    /// Best-effort delete of every value written this transaction;
    /// used by rollback. Errors are logged, not propagated — a leaked
    /// orphan blob is recovered later by the cleanup scanner.
    pub fn delete_written_values(&self, table: &str) {
        if self.written_this_txn.is_empty() {
            return;
        }
        if let Err(err) = self.blob_store.remove(&[BlobRemovePayload {
            table: table.to_string(),
            ids: self.written_this_txn.clone(),
        }]) {
            warn!(?err, "failed to delete rolled-back item values; will be swept by recovery");
        }
    }

    /// `deleteTrackedItemsValues`: remove the blobs superseded by a
    /// successful commit (see [`ItemActionTracker::obsolete_values`]).
    /// Propagates errors, unlike rollback's best-effort cleanup — a
    /// post-commit failure here still leaves the commit itself intact,
    /// so the caller may retry or leave it for the recovery scanner.
    pub fn delete_obsolete_values(&self, table: &str) -> Result<()> {
        if self.for_deletion_items.is_empty() {
            return Ok(());
        }
        self.blob_store.remove(&[BlobRemovePayload {
            table: table.to_string(),
            ids: self.for_deletion_items.clone(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowtree_backends::{MemoryBlobStore, MemoryCache};

    fn tracker() -> ItemActionTracker {
        ItemActionTracker::new(
            &StoreInfo::new("orders", 200, true),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryBlobStore::new()),
            Uuid::new_v4(),
            Duration::from_secs(3600),
        )
    }

    fn actively_persisted_tracker() -> (ItemActionTracker, Arc<MemoryBlobStore>) {
        let mut store = StoreInfo::new("orders", 200, true);
        store.is_value_data_in_node_segment = false;
        store.is_value_data_actively_persisted = true;
        let blobs = Arc::new(MemoryBlobStore::new());
        let t = ItemActionTracker::new(&store, Arc::new(MemoryCache::new()), blobs.clone(), Uuid::new_v4(), Duration::from_secs(3600));
        (t, blobs)
    }

    #[test]
    fn add_then_remove_drops_the_entry() {
        let mut t = tracker();
        let item = Item::new(Uuid::new_v4(), vec![1]);
        let id = item.id;
        t.track(Event::Add, item.clone(), 0).unwrap();
        t.track(Event::Remove, item, 0).unwrap();
        assert!(t.is_empty());
        assert!(t.entries().find(|e| e.item.id == id).is_none());
    }

    #[test]
    fn lock_then_unlock_round_trips() {
        let mut t = tracker();
        t.track(Event::Update, Item::new(Uuid::new_v4(), vec![1]), 1).unwrap();
        t.lock(Duration::from_secs(30)).unwrap();
        assert!(t.entries().all(|e| e.is_lock_owner));
        t.unlock().unwrap();
        assert!(t.entries().all(|e| !e.is_lock_owner));
    }

    #[test]
    fn commit_values_rewrites_id_and_clears_value() {
        let mut t = tracker();
        let item = Item::new(Uuid::new_v4(), vec![9, 9]);
        let old_id = item.id;
        t.track(Event::Add, item, 0).unwrap();
        let written = t.commit_values("orders_blobs").unwrap();
        assert_eq!(written.len(), 1);
        assert!(t.entries().find(|e| e.item.id == old_id).is_none());
        let rewritten = t.entries().find(|e| e.item.id == written[0]).unwrap();
        assert!(rewritten.item.value.is_none());
        assert!(rewritten.item.value_needs_fetch);
        assert!(rewritten.persisted);
    }

    #[test]
    fn two_concurrent_get_intents_never_conflict_locally() {
        let mut t = tracker();
        t.track(Event::Get, Item::new(Uuid::new_v4(), vec![]), 1).unwrap();
        assert!(t.check_tracked_items().is_ok());
    }

    #[test]
    fn add_actively_persists_and_rewrites_id_immediately() {
        let (mut t, blobs) = actively_persisted_tracker();
        let item = Item::new(Uuid::new_v4(), vec![4, 2]);
        let old_id = item.id;
        t.track(Event::Add, item, 0).unwrap();

        assert!(t.entries().find(|e| e.item.id == old_id).is_none());
        let pending = t.take_pending_active_persist();
        assert_eq!(pending.len(), 1);
        let new_id = pending[0];

        let rewritten = t.entries().find(|e| e.item.id == new_id).unwrap();
        assert!(rewritten.item.value.is_none());
        assert!(rewritten.item.value_needs_fetch);
        assert!(rewritten.persisted);
        assert_eq!(rewritten.item.version, 2, "Add increments the version on active persist");
        assert_eq!(blobs.get_one("orders_blobs", new_id).unwrap(), vec![4, 2]);
    }

    #[test]
    fn active_persist_does_not_mark_its_own_blob_obsolete() {
        let (mut t, _blobs) = actively_persisted_tracker();
        let item = Item::new(Uuid::new_v4(), vec![1]);
        t.track(Event::Add, item, 0).unwrap();
        let new_id = t.take_pending_active_persist()[0];

        // A same-transaction Update against the rewritten entry must not
        // make commit_values treat the just-written blob as superseded.
        t.track(Event::Update, Item::new(new_id, vec![1]), 1).unwrap();
        t.commit_values("orders_blobs").unwrap();
        assert!(t.obsolete_values().is_empty());
    }

    #[test]
    fn fetch_value_consults_cache_before_blob_store() {
        let mut store = StoreInfo::new("orders", 200, true);
        store.is_value_data_in_node_segment = false;
        store.is_value_data_globally_cached = true;
        let cache = Arc::new(MemoryCache::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let id = Uuid::new_v4();
        cache.set_struct(&item_value_cache_key(id), b"cached", None).unwrap();

        let mut t = ItemActionTracker::new(&store, cache, blobs, Uuid::new_v4(), Duration::from_secs(3600));
        let mut item = Item::new(id, vec![]);
        item.value = None;
        item.value_needs_fetch = true;
        t.track(Event::Get, item, 1).unwrap();

        let fetched = t.fetch_value(id).unwrap().unwrap();
        assert_eq!(fetched, b"cached");
        assert!(!t.entries().find(|e| e.item.id == id).unwrap().item.value_needs_fetch);
    }

    #[test]
    fn fetch_value_falls_back_to_blob_store_on_cache_miss() {
        let mut store = StoreInfo::new("orders", 200, true);
        store.is_value_data_in_node_segment = false;
        store.is_value_data_globally_cached = true;
        let cache = Arc::new(MemoryCache::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let id = Uuid::new_v4();
        blobs
            .add(&[BlobPayload { table: "orders_blobs".into(), entries: vec![BlobEntry { id, value: vec![7] }] }])
            .unwrap();

        let mut t = ItemActionTracker::new(&store, cache.clone(), blobs, Uuid::new_v4(), Duration::from_secs(3600));
        let mut item = Item::new(id, vec![]);
        item.value = None;
        item.value_needs_fetch = true;
        t.track(Event::Get, item, 1).unwrap();

        let fetched = t.fetch_value(id).unwrap().unwrap();
        assert_eq!(fetched, vec![7]);
        assert_eq!(cache.get_struct(&item_value_cache_key(id)).unwrap(), vec![7], "blob store hit should back-fill the cache");
    }
}
