//! The handle / virtual-ID model (C1).
//!
//! A [`Handle`] is the registry record that maps one logical node
//! identity to up to two physical blob IDs. Reads always resolve
//! through the *active* slot; writes stage a new physical body in the
//! *inactive* slot and only become visible when [`Handle::flip_active_id`]
//! runs as part of the Phase 2 registry cut-over. This is the copy-on-write
//! discipline the rest of the engine is built on.

use crate::uuid::{new_uuid, Uuid, NIL_UUID};
use crate::MillisTimestamp;
use serde::{Deserialize, Serialize};

/// How long an inactive-slot reservation may sit unflipped before another
/// writer is allowed to reclaim it (see [`Handle::is_expired_inactive`]).
pub const DEFAULT_INACTIVE_EXPIRY_MILLIS: i64 = 60 * 60 * 1000; // 1 hour

/// Addresses one of a handle's two physical slots.
///
/// The source model carries this as a single `is_active_id_b: bool`
/// flag plus a pair of UUID fields; `SlotId` exists only to give the
/// slot-addressing code (`active_slot`, `inactive_slot`) a name instead
/// of a double negative, and changes no observable behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotId {
    /// Physical slot A.
    A,
    /// Physical slot B.
    B,
}

impl SlotId {
    /// The other slot.
    pub fn other(self) -> SlotId {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }
}

/// Per-logical-node identity record in the registry.
///
/// # Invariants
///
/// - For every node body stored in the blob store keyed by some physical
///   UUID, exactly one handle references that UUID via `physical_id_a`
///   or `physical_id_b`, or that UUID is scheduled for deletion.
/// - `is_deleted == true` implies `work_in_progress_timestamp != 0`.
/// - After a successful commit touching this handle, `version` strictly
///   increases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    /// Immutable logical identity; the registry key.
    pub logical_id: Uuid,
    /// Physical slot A.
    pub physical_id_a: Uuid,
    /// Physical slot B.
    pub physical_id_b: Uuid,
    /// Selects which of A/B is currently active.
    pub is_active_id_b: bool,
    /// Monotonically increasing on each commit touching this handle.
    pub version: u64,
    /// Logical tombstone.
    pub is_deleted: bool,
    /// Millis; non-zero means an inactive slot is reserved, or a
    /// tombstone is pending.
    pub work_in_progress_timestamp: MillisTimestamp,
    /// Last successful commit time, millis.
    pub timestamp: MillisTimestamp,
}

impl Handle {
    /// Build a brand-new handle for a freshly added node: version 1,
    /// active slot populated, inactive slot empty.
    pub fn new_for_add(logical_id: Uuid, physical_id: Uuid, now: MillisTimestamp) -> Self {
        Handle {
            logical_id,
            physical_id_a: physical_id,
            physical_id_b: NIL_UUID,
            is_active_id_b: false,
            version: 1,
            is_deleted: false,
            work_in_progress_timestamp: 0,
            timestamp: now,
        }
    }

    fn active_slot(&self) -> SlotId {
        if self.is_active_id_b {
            SlotId::B
        } else {
            SlotId::A
        }
    }

    fn slot_value(&self, slot: SlotId) -> Uuid {
        match slot {
            SlotId::A => self.physical_id_a,
            SlotId::B => self.physical_id_b,
        }
    }

    fn set_slot_value(&mut self, slot: SlotId, id: Uuid) {
        match slot {
            SlotId::A => self.physical_id_a = id,
            SlotId::B => self.physical_id_b = id,
        }
    }

    /// The physical ID readers should resolve. Never blocked by a
    /// pending writer.
    pub fn get_active_id(&self) -> Uuid {
        self.slot_value(self.active_slot())
    }

    /// The physical ID (if any) staged by an in-flight writer.
    pub fn get_inactive_id(&self) -> Uuid {
        self.slot_value(self.active_slot().other())
    }

    /// True if either physical slot equals `id`.
    pub fn has_id(&self, id: Uuid) -> bool {
        self.physical_id_a == id || self.physical_id_b == id
    }

    /// Reserve a fresh physical UUID in the inactive slot, for a writer
    /// about to stage a new node body.
    ///
    /// Fails (returns [`NIL_UUID`]) if the inactive slot is already
    /// reserved and not expired; the caller must wait-and-retry or, if
    /// [`Handle::is_expired_inactive`] is true, clear the stale slot
    /// first via [`Handle::clear_inactive_id`].
    pub fn allocate_id(&mut self, now: MillisTimestamp) -> Uuid {
        if self.get_inactive_id() != NIL_UUID {
            return NIL_UUID;
        }
        let id = new_uuid();
        self.set_slot_value(self.active_slot().other(), id);
        self.work_in_progress_timestamp = now;
        id
    }

    /// Swap active/inactive and increment `version`. The persisted
    /// cut-over (the Phase 2 registry update) is what makes this
    /// visible to other transactions; this method only performs the
    /// in-memory half of that preparation.
    pub fn flip_active_id(&mut self) {
        self.is_active_id_b = !self.is_active_id_b;
        self.version += 1;
    }

    /// Release an inactive-slot reservation without flipping it live.
    /// Used to abandon a staged write during rollback, or to reclaim an
    /// expired reservation before retrying.
    pub fn clear_inactive_id(&mut self) {
        self.set_slot_value(self.active_slot().other(), NIL_UUID);
        self.work_in_progress_timestamp = 0;
    }

    /// True if an inactive-slot reservation exists and is older than
    /// `bound_millis`, meaning a crashed or abandoned writer may be
    /// reclaimed by someone else.
    pub fn is_expired_inactive(&self, now: MillisTimestamp, bound_millis: i64) -> bool {
        self.get_inactive_id() != NIL_UUID
            && self.work_in_progress_timestamp != 0
            && now.saturating_sub(self.work_in_progress_timestamp) > bound_millis
    }

    /// Mark this handle as logically deleted: `is_deleted = true`,
    /// `work_in_progress_timestamp` stamped to `now` per the invariant
    /// that a pending tombstone always carries a nonzero WIP timestamp.
    pub fn mark_deleted(&mut self, now: MillisTimestamp) {
        self.is_deleted = true;
        self.work_in_progress_timestamp = now;
    }

    /// Bump `version` and clear the WIP timestamp without touching
    /// either slot — used by `touch_nodes` preparation for removed
    /// nodes ahead of the Phase 2 cut-over.
    pub fn touch(&mut self) {
        self.version += 1;
        self.work_in_progress_timestamp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Handle {
        Handle::new_for_add(new_uuid(), new_uuid(), 1_000)
    }

    #[test]
    fn new_handle_has_version_one_and_active_slot_a() {
        let h = handle();
        assert_eq!(h.version, 1);
        assert_eq!(h.get_active_id(), h.physical_id_a);
        assert_eq!(h.get_inactive_id(), NIL_UUID);
    }

    #[test]
    fn allocate_id_fails_when_inactive_already_held() {
        let mut h = handle();
        let first = h.allocate_id(2_000);
        assert_ne!(first, NIL_UUID);
        let second = h.allocate_id(2_100);
        assert_eq!(second, NIL_UUID, "second allocation must fail while first is pending");
    }

    #[test]
    fn allocate_id_returns_distinct_uuids_across_lifetime() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            let mut h = handle();
            let id = h.allocate_id(1_000 + i);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn flip_active_id_makes_previously_inactive_id_active_and_bumps_version() {
        let mut h = handle();
        let staged = h.allocate_id(2_000);
        let version_before = h.version;
        h.flip_active_id();
        assert_eq!(h.get_active_id(), staged);
        assert_eq!(h.version, version_before + 1);
    }

    #[test]
    fn clear_inactive_id_resets_reservation() {
        let mut h = handle();
        h.allocate_id(2_000);
        h.clear_inactive_id();
        assert_eq!(h.get_inactive_id(), NIL_UUID);
        assert_eq!(h.work_in_progress_timestamp, 0);
    }

    #[test]
    fn is_expired_inactive_respects_bound() {
        let mut h = handle();
        h.allocate_id(1_000);
        assert!(!h.is_expired_inactive(1_500, DEFAULT_INACTIVE_EXPIRY_MILLIS));
        assert!(h.is_expired_inactive(1_000 + DEFAULT_INACTIVE_EXPIRY_MILLIS + 1, DEFAULT_INACTIVE_EXPIRY_MILLIS));
    }

    #[test]
    fn is_expired_inactive_false_with_no_reservation() {
        let h = handle();
        assert!(!h.is_expired_inactive(i64::MAX, DEFAULT_INACTIVE_EXPIRY_MILLIS));
    }

    #[test]
    fn has_id_matches_either_slot() {
        let mut h = handle();
        let staged = h.allocate_id(2_000);
        assert!(h.has_id(h.physical_id_a));
        assert!(h.has_id(staged));
        assert!(!h.has_id(new_uuid()));
    }

    #[test]
    fn mark_deleted_sets_tombstone_invariant() {
        let mut h = handle();
        h.mark_deleted(5_000);
        assert!(h.is_deleted);
        assert_ne!(h.work_in_progress_timestamp, 0);
    }

    #[test]
    fn touch_bumps_version_and_clears_wip() {
        let mut h = handle();
        h.work_in_progress_timestamp = 123;
        let before = h.version;
        h.touch();
        assert_eq!(h.version, before + 1);
        assert_eq!(h.work_in_progress_timestamp, 0);
    }
}
