//! Items, tracked items, cache nodes, and the item-action state machine.
//!
//! The action state machine is the heart of the item action tracker
//! (C6): it is a small, closed table that every pair of
//! events composes into a single new state. [`transition`] is the only
//! place that table is encoded; everything else calls it.

use crate::uuid::Uuid;
use serde::{Deserialize, Serialize};

/// Metadata every commit-path value (an [`Item`] or an external node
/// body) exposes, so the staged-commit code in `cowtree-txn` can operate
/// on `&dyn MetaData` without knowing the concrete key/value types the
/// (external, non-goal) B-tree layer uses.
pub trait MetaData {
    /// The UUID identifying this value (an item ID or a node's logical
    /// ID, depending on context).
    fn id(&self) -> Uuid;
    /// The value's current version.
    fn version(&self) -> u64;
    /// Overwrite the version, e.g. after a successful commit.
    fn set_version(&mut self, version: u64);
}

/// The intent a transaction has recorded against one tracked item or
/// node.
///
/// `Default` is distinct from `Get`: the node repository (C7) tags a
/// freshly-fetched, untouched node `Default`, and only upgrades it to
/// `Get` when the B-tree explicitly reads an item out of it via the
/// tracker callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Fetched but not yet explicitly read or mutated.
    Default,
    /// Explicitly read.
    Get,
    /// Newly inserted this transaction.
    Add,
    /// Modified this transaction.
    Update,
    /// Deleted this transaction.
    Remove,
}

/// The event an item-tracker or node-repository caller requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Read access.
    Get,
    /// Insert.
    Add,
    /// Modify.
    Update,
    /// Delete.
    Remove,
}

/// Apply one event to the item action state machine.
///
/// `current` is `None` for an item with no tracked entry yet (the table's
/// `∅` row). Returns `None` when the entry should be dropped entirely
/// (an `Add` cancelled by a same-transaction `Remove`).
///
/// This table is closed: composing any two events from any starting
/// state yields a state that is itself in the table.
pub fn transition(current: Option<Action>, event: Event) -> Option<Action> {
    use Action::*;
    use Event::*;
    match (current, event) {
        (None, Get) => Some(Get),
        (None, Add) => Some(Add),
        (None, Update) => Some(Update),
        (None, Remove) => Some(Remove),

        (Some(Add), Get) => Some(Add),
        (Some(Add), Add) => Some(Add),
        (Some(Add), Update) => Some(Add),
        (Some(Add), Remove) => None,

        (Some(Get), Get) => Some(Get),
        (Some(Get), Add) => Some(Get),
        (Some(Get), Update) => Some(Update),
        (Some(Get), Remove) => Some(Remove),

        (Some(Update), Get) => Some(Update),
        (Some(Update), Add) => Some(Update),
        (Some(Update), Update) => Some(Update),
        (Some(Update), Remove) => Some(Remove),

        (Some(Remove), Get) => Some(Remove),
        (Some(Remove), Add) => Some(Remove),
        (Some(Remove), Update) => Some(Remove),
        (Some(Remove), Remove) => Some(Remove),

        // `Default` never appears on the left of this table: it is a
        // node-repository-only tag, never a tracked-item
        // state. Treat it as `None` would be treated, defensively.
        (Some(Default), e) => transition(None, e),
    }
}

/// A key/value pair with a B-tree-assigned ID.
///
/// When a store's `is_value_data_in_node_segment` is `false`, `value`
/// lives in a separate blob keyed by `id`, and `value_needs_fetch`
/// tracks whether it has been pulled into memory yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// B-tree-assigned identity; the blob-store key when the value is
    /// stored out-of-node.
    pub id: Uuid,
    /// Current version.
    pub version: u64,
    /// True if `value` must still be fetched from cache/blob store.
    pub value_needs_fetch: bool,
    /// Opaque value bytes. `None` while `value_needs_fetch` is true and
    /// the lazy fetch hasn't run yet.
    pub value: Option<Vec<u8>>,
}

impl Item {
    /// A freshly added item: version 1, value present in memory.
    pub fn new(id: Uuid, value: Vec<u8>) -> Self {
        Item {
            id,
            version: 1,
            value_needs_fetch: false,
            value: Some(value),
        }
    }
}

impl MetaData for Item {
    fn id(&self) -> Uuid {
        self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// In-memory per-transaction record tracked by the item action tracker
/// (C6).
#[derive(Debug, Clone)]
pub struct TrackedItem {
    /// Lock identity this transaction uses (or would use) for this
    /// item, under cache key prefix `"L"`.
    pub lock_id: Uuid,
    /// Current intent.
    pub action: Action,
    /// The tracked item.
    pub item: Item,
    /// The version this transaction originally observed in the
    /// registry/blob store, used for the conflict-detection pass.
    pub version_in_db: u64,
    /// True once this transaction has confirmed it holds the lock.
    pub is_lock_owner: bool,
    /// True once this item's value has been persisted to the blob
    /// store (actively, or at `commit_tracked_items_values` time).
    pub persisted: bool,
    /// Cached in-flight value, when it differs from `item.value` (e.g.
    /// during an active-persist that has since cleared the item's own
    /// pointer).
    pub in_flight_value: Option<Vec<u8>>,
}

impl TrackedItem {
    /// Start tracking `item` under `event`, with no existing entry.
    pub fn new(item: Item, lock_id: Uuid, action: Action, version_in_db: u64) -> Self {
        TrackedItem {
            lock_id,
            action,
            item,
            version_in_db,
            is_lock_owner: false,
            persisted: false,
            in_flight_value: None,
        }
    }
}

/// In-memory per-transaction node record held by the node repository
/// (C7), wrapping the (externally owned) node body and its intent.
///
/// Generic over `T`, the B-tree's node body type — this crate never
/// inspects `T` beyond the [`MetaData`] bound, per the "dynamic dispatch
/// over value types" design note.
#[derive(Debug, Clone)]
pub struct CacheNode<T> {
    /// The node body.
    pub node: T,
    /// Current intent.
    pub action: Action,
}

impl<T> CacheNode<T> {
    /// Wrap a freshly fetched, untouched node.
    pub fn fetched(node: T) -> Self {
        CacheNode {
            node,
            action: Action::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::new_uuid;

    #[test]
    fn table_is_closed_for_every_pair_of_events() {
        let events = [Event::Get, Event::Add, Event::Update, Event::Remove];
        let mut state: Option<Action> = None;
        for &e1 in &events {
            state = transition(None, e1);
            for &e2 in &events {
                // Must not panic for any composition; every arm is handled.
                let _ = transition(state, e2);
            }
        }
    }

    #[test]
    fn add_then_remove_drops_the_entry() {
        assert_eq!(transition(Some(Action::Add), Event::Remove), None);
    }

    #[test]
    fn add_then_update_stays_add_no_version_semantics_here() {
        assert_eq!(transition(Some(Action::Add), Event::Update), Some(Action::Add));
    }

    #[test]
    fn get_then_get_is_compatible_stays_get() {
        assert_eq!(transition(Some(Action::Get), Event::Get), Some(Action::Get));
    }

    #[test]
    fn get_then_update_becomes_update() {
        assert_eq!(transition(Some(Action::Get), Event::Update), Some(Action::Update));
    }

    #[test]
    fn remove_is_sticky_except_initial_add_cancel() {
        assert_eq!(transition(Some(Action::Remove), Event::Get), Some(Action::Remove));
        assert_eq!(transition(Some(Action::Remove), Event::Add), Some(Action::Remove));
        assert_eq!(transition(Some(Action::Remove), Event::Update), Some(Action::Remove));
        assert_eq!(transition(Some(Action::Remove), Event::Remove), Some(Action::Remove));
    }

    #[test]
    fn fresh_events_from_nil_match_the_event_name() {
        assert_eq!(transition(None, Event::Get), Some(Action::Get));
        assert_eq!(transition(None, Event::Add), Some(Action::Add));
        assert_eq!(transition(None, Event::Update), Some(Action::Update));
        assert_eq!(transition(None, Event::Remove), Some(Action::Remove));
    }

    #[test]
    fn item_metadata_roundtrips() {
        let id = new_uuid();
        let mut item = Item::new(id, vec![1, 2, 3]);
        assert_eq!(item.id(), id);
        assert_eq!(item.version(), 1);
        item.set_version(2);
        assert_eq!(item.version, 2);
    }
}
