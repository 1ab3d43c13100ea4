//! In-memory [`TransactionLogStore`] reference implementation.

use cowtree_core::{now_millis, Error, LogEntry, Result, TransactionLogStore, Uuid};
use dashmap::DashMap;

struct Log {
    last_touched_millis: i64,
    entries: Vec<LogEntry>,
}

/// An in-memory, process-local transaction log store.
#[derive(Default)]
pub struct MemoryTransactionLogStore {
    logs: DashMap<Uuid, Log>,
}

impl MemoryTransactionLogStore {
    /// A fresh, empty log store.
    pub fn new() -> Self {
        MemoryTransactionLogStore::default()
    }
}

impl TransactionLogStore for MemoryTransactionLogStore {
    fn initiate(&self, tid: Uuid, entry: LogEntry) -> Result<()> {
        self.logs.insert(
            tid,
            Log {
                last_touched_millis: now_millis(),
                entries: vec![entry],
            },
        );
        Ok(())
    }

    fn add(&self, tid: Uuid, entry: LogEntry) -> Result<()> {
        let mut log = self
            .logs
            .get_mut(&tid)
            .ok_or_else(|| Error::NotFound(tid.to_string()))?;
        log.entries.push(entry);
        log.last_touched_millis = now_millis();
        Ok(())
    }

    fn remove(&self, tid: Uuid) -> Result<()> {
        self.logs.remove(&tid);
        Ok(())
    }

    fn get_one_expired(&self, older_than_millis: i64) -> Result<Option<(Uuid, Vec<LogEntry>)>> {
        let candidate = self
            .logs
            .iter()
            .filter(|entry| entry.value().last_touched_millis < older_than_millis)
            .min_by_key(|entry| entry.value().last_touched_millis)
            .map(|entry| (*entry.key(), entry.value().entries.clone()));
        Ok(candidate)
    }
}
