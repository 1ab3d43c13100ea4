//! In-memory [`BlobStore`] reference implementation.

use cowtree_core::{BlobPayload, BlobRemovePayload, BlobStore, Error, Result, Uuid};
use dashmap::DashMap;

/// An in-memory, process-local blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<(String, Uuid), Vec<u8>>,
}

impl MemoryBlobStore {
    /// A fresh, empty blob store.
    pub fn new() -> Self {
        MemoryBlobStore::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get_one(&self, table: &str, id: Uuid) -> Result<Vec<u8>> {
        self.blobs
            .get(&(table.to_string(), id))
            .map(|v| v.clone())
            .ok_or_else(|| Error::NotFound(format!("{table}/{id}")))
    }

    fn add(&self, payloads: &[BlobPayload]) -> Result<()> {
        for payload in payloads {
            for entry in &payload.entries {
                self.blobs
                    .insert((payload.table.clone(), entry.id), entry.value.clone());
            }
        }
        Ok(())
    }

    fn update(&self, payloads: &[BlobPayload]) -> Result<()> {
        self.add(payloads)
    }

    fn remove(&self, payloads: &[BlobRemovePayload]) -> Result<()> {
        for payload in payloads {
            for id in &payload.ids {
                self.blobs.remove(&(payload.table.clone(), *id));
            }
        }
        Ok(())
    }
}
