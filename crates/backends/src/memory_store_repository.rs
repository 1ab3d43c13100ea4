//! In-memory [`StoreRepository`] reference implementation.

use cowtree_core::{now_millis, Error, StoreInfo, StoreRepository};
use cowtree_core::Result;
use dashmap::DashMap;

/// An in-memory, process-local per-store metadata repository.
#[derive(Default)]
pub struct MemoryStoreRepository {
    stores: DashMap<String, StoreInfo>,
}

impl MemoryStoreRepository {
    /// A fresh, empty repository.
    pub fn new() -> Self {
        MemoryStoreRepository::default()
    }
}

impl StoreRepository for MemoryStoreRepository {
    fn get(&self, name: &str) -> Result<StoreInfo> {
        self.stores
            .get(name)
            .map(|v| v.clone())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn add(&self, store: StoreInfo) -> Result<()> {
        self.stores.insert(store.name.clone(), store);
        Ok(())
    }

    fn update(&self, stores: &[StoreInfo]) -> Result<()> {
        let now = now_millis();
        for incoming in stores {
            let baseline_count = self
                .stores
                .get(&incoming.name)
                .map(|row| row.count)
                .unwrap_or(0);
            let mut reconciled = incoming.clone();
            reconciled.count = baseline_count + incoming.count_delta;
            reconciled.count_delta = 0;
            reconciled.timestamp = now;
            self.stores.insert(incoming.name.clone(), reconciled);
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.stores.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let repo = MemoryStoreRepository::new();
        repo.add(StoreInfo::new("orders", 200, true)).unwrap();
        let got = repo.get("orders").unwrap();
        assert_eq!(got.name, "orders");
        assert!(got.is_brand_new());
    }

    #[test]
    fn update_reconciles_count_delta_against_stored_baseline() {
        let repo = MemoryStoreRepository::new();
        repo.add(StoreInfo::new("orders", 200, true)).unwrap();

        let mut first = repo.get("orders").unwrap();
        first.count_delta = 3;
        repo.update(&[first]).unwrap();
        assert_eq!(repo.get("orders").unwrap().count, 3);

        let mut second = repo.get("orders").unwrap();
        second.count_delta = -1;
        repo.update(&[second]).unwrap();
        assert_eq!(repo.get("orders").unwrap().count, 2);
    }

    #[test]
    fn get_missing_store_is_not_found() {
        let repo = MemoryStoreRepository::new();
        assert!(repo.get("nope").unwrap_err().is_not_found());
    }
}
