//! In-memory [`Registry`] reference implementation.

use cowtree_core::{Error, Handle, Registry, RegistryPayload, Result, Uuid};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;

/// An in-memory, process-local registry.
///
/// `update`'s all-or-nothing path is the one piece of real logic here:
/// it serializes under a single mutex so the check-then-apply over the
/// whole batch is actually atomic, matching the compare-and-swap
/// contract the real commit cut-over depends on.
#[derive(Default)]
pub struct MemoryRegistry {
    rows: DashMap<(String, Uuid), Handle>,
    update_guard: Mutex<()>,
}

impl MemoryRegistry {
    /// A fresh, empty registry.
    pub fn new() -> Self {
        MemoryRegistry::default()
    }
}

impl Registry for MemoryRegistry {
    fn get(&self, payloads: &[RegistryPayload]) -> Result<Vec<Handle>> {
        let mut out = Vec::new();
        for payload in payloads {
            for logical_id in &payload.logical_ids {
                if let Some(handle) = self.rows.get(&(payload.table.clone(), *logical_id)) {
                    out.push(handle.clone());
                }
            }
        }
        Ok(out)
    }

    fn add(&self, table: &str, handles: &[Handle]) -> Result<()> {
        for h in handles {
            self.rows.insert((table.to_string(), h.logical_id), h.clone());
        }
        Ok(())
    }

    fn update(&self, table: &str, all_or_nothing: bool, handles: &[Handle]) -> Result<()> {
        let _guard = self.update_guard.lock();
        if all_or_nothing {
            let mut staged: HashMap<(String, Uuid), Handle> = HashMap::new();
            for h in handles {
                let key = (table.to_string(), h.logical_id);
                let current_version = self.rows.get(&key).map(|r| r.version);
                let expected_prior = h.version.checked_sub(1);
                if current_version != expected_prior {
                    tracing::debug!(
                        table,
                        logical_id = %h.logical_id,
                        ?current_version,
                        "all-or-nothing update rejected: stale version"
                    );
                    return Err(Error::UpdateAllOrNothing);
                }
                staged.insert(key, h.clone());
            }
            for (key, handle) in staged {
                self.rows.insert(key, handle);
            }
        } else {
            for h in handles {
                let key = (table.to_string(), h.logical_id);
                if self.rows.contains_key(&key) {
                    self.rows.insert(key, h.clone());
                }
            }
        }
        Ok(())
    }

    fn remove(&self, table: &str, logical_ids: &[Uuid]) -> Result<()> {
        for id in logical_ids {
            self.rows.remove(&(table.to_string(), *id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(logical_id: Uuid, version: u64) -> Handle {
        Handle {
            logical_id,
            physical_id_a: Uuid::new_v4(),
            physical_id_b: cowtree_core::NIL_UUID,
            is_active_id_b: false,
            version,
            is_deleted: false,
            work_in_progress_timestamp: 0,
            timestamp: 0,
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let reg = MemoryRegistry::new();
        let id = Uuid::new_v4();
        reg.add("t", &[h(id, 1)]).unwrap();
        let got = reg
            .get(&[RegistryPayload {
                table: "t".into(),
                logical_ids: vec![id],
            }])
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].logical_id, id);
    }

    #[test]
    fn all_or_nothing_update_rejects_stale_version() {
        let reg = MemoryRegistry::new();
        let id = Uuid::new_v4();
        reg.add("t", &[h(id, 1)]).unwrap();
        // Stored version is 1; an update claiming version 3 skips version 2.
        let err = reg.update("t", true, &[h(id, 3)]).unwrap_err();
        assert!(matches!(err, Error::UpdateAllOrNothing));
    }

    #[test]
    fn all_or_nothing_update_applies_next_version() {
        let reg = MemoryRegistry::new();
        let id = Uuid::new_v4();
        reg.add("t", &[h(id, 1)]).unwrap();
        reg.update("t", true, &[h(id, 2)]).unwrap();
        let got = reg
            .get(&[RegistryPayload {
                table: "t".into(),
                logical_ids: vec![id],
            }])
            .unwrap();
        assert_eq!(got[0].version, 2);
    }

    #[test]
    fn all_or_nothing_update_applies_nothing_on_any_mismatch() {
        let reg = MemoryRegistry::new();
        let ok_id = Uuid::new_v4();
        let bad_id = Uuid::new_v4();
        reg.add("t", &[h(ok_id, 1), h(bad_id, 1)]).unwrap();
        let err = reg.update("t", true, &[h(ok_id, 2), h(bad_id, 5)]).unwrap_err();
        assert!(matches!(err, Error::UpdateAllOrNothing));
        let got = reg
            .get(&[RegistryPayload {
                table: "t".into(),
                logical_ids: vec![ok_id],
            }])
            .unwrap();
        assert_eq!(got[0].version, 1, "partial application must not occur");
    }
}
