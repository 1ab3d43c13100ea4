//! Per-B-tree metadata.

use crate::uuid::{Uuid, NIL_UUID};
use crate::MillisTimestamp;
use serde::{Deserialize, Serialize};

/// Metadata for one named B-tree.
///
/// `count_delta` accumulates the net item-count change made by the
/// current transaction; the store repository (C5) reconciles it into
/// `count` atomically at `commit_store_info` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Store name; the registry/blob table naming is derived from it.
    pub name: String,
    /// Maximum number of items held in a single leaf/branch slot.
    pub slot_length: u32,
    /// Whether keys must be unique within the store.
    pub is_unique: bool,
    /// Whether item values are stored inline in the node segment, or
    /// kept in a separate blob keyed by the item's ID.
    pub is_value_data_in_node_segment: bool,
    /// Whether separate-segment values are written to the blob store
    /// immediately on add/update (`true`), or deferred to commit.
    pub is_value_data_actively_persisted: bool,
    /// Whether separate-segment values are mirrored in the shared
    /// cache.
    pub is_value_data_globally_cached: bool,
    /// Whether leaf load balancing is enabled for this store's B-tree.
    pub leaf_load_balancing: bool,
    /// Logical ID of the current root node.
    pub root_node_id: Uuid,
    /// Committed item count as of the last successful commit.
    pub count: i64,
    /// Net item-count delta accumulated by the in-flight transaction.
    pub count_delta: i64,
    /// Last successful commit time, millis.
    pub timestamp: MillisTimestamp,
    /// Registry table this store's handles live in.
    pub registry_table: String,
    /// Blob store table this store's node/value bodies live in.
    pub blob_table: String,
    /// Free-form human description.
    pub description: String,
}

impl StoreInfo {
    /// A brand-new, empty store: no root yet, zero count.
    pub fn new(name: impl Into<String>, slot_length: u32, is_unique: bool) -> Self {
        let name = name.into();
        let registry_table = format!("{name}_registry");
        let blob_table = format!("{name}_blobs");
        StoreInfo {
            name,
            slot_length,
            is_unique,
            is_value_data_in_node_segment: true,
            is_value_data_actively_persisted: false,
            is_value_data_globally_cached: false,
            leaf_load_balancing: false,
            root_node_id: NIL_UUID,
            count: 0,
            count_delta: 0,
            timestamp: 0,
            registry_table,
            blob_table,
            description: String::new(),
        }
    }

    /// True while this store has never had a successful commit against
    /// its root — the `commit_new_root_nodes` fast path in C7 only
    /// applies here.
    pub fn is_brand_new(&self) -> bool {
        self.count == 0 && self.root_node_id == NIL_UUID
    }

    /// Apply the accumulated `count_delta` into `count` and reset the
    /// delta, stamping `timestamp`. Called by the store repository at
    /// commit.
    pub fn reconcile_count(&mut self, now: MillisTimestamp) {
        self.count += self.count_delta;
        self.count_delta = 0;
        self.timestamp = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_brand_new() {
        let s = StoreInfo::new("orders", 200, true);
        assert!(s.is_brand_new());
        assert_eq!(s.registry_table, "orders_registry");
        assert_eq!(s.blob_table, "orders_blobs");
    }

    #[test]
    fn reconcile_count_applies_delta_and_resets_it() {
        let mut s = StoreInfo::new("orders", 200, true);
        s.count_delta = 3;
        s.reconcile_count(42);
        assert_eq!(s.count, 3);
        assert_eq!(s.count_delta, 0);
        assert_eq!(s.timestamp, 42);

        s.count_delta = -1;
        s.reconcile_count(43);
        assert_eq!(s.count, 2);
    }

    #[test]
    fn store_with_root_is_not_brand_new() {
        let mut s = StoreInfo::new("orders", 200, true);
        s.root_node_id = crate::uuid::new_uuid();
        assert!(!s.is_brand_new());
    }
}
