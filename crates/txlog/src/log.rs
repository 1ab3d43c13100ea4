//! Per-transaction append-only log (C8).
//!
//! Wraps a [`TransactionLogStore`] with the encode/decode step and the
//! "logging may be disabled" rule: when disabled, the
//! manager above us still needs its in-memory `committedState`, but
//! nothing here hits the backing store, so a crash loses only crash
//! recoverability, never live rollback.

use cowtree_core::{LogEntry, Result, Stage, TransactionLogStore, Uuid};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::payload::encode;

/// A transaction's handle onto its own append-only log.
///
/// Cheap to clone; holds only an `Arc` to the backing store and the
/// transaction's own identity.
#[derive(Clone)]
pub struct TransactionLog {
    store: Arc<dyn TransactionLogStore>,
    tid: Uuid,
    logging_enabled: bool,
}

impl TransactionLog {
    /// Open a log handle for transaction `tid`. Does not write anything;
    /// call [`TransactionLog::initiate`] to start the log.
    pub fn new(store: Arc<dyn TransactionLogStore>, tid: Uuid, logging_enabled: bool) -> Self {
        TransactionLog {
            store,
            tid,
            logging_enabled,
        }
    }

    /// The generated transaction UUID this log is keyed on.
    pub fn tid(&self) -> Uuid {
        self.tid
    }

    /// Start the log with its first stage entry. No-op if logging is
    /// disabled for this transaction.
    pub fn initiate<P: Serialize>(&self, stage: Stage, payload: &P) -> Result<()> {
        if !self.logging_enabled {
            return Ok(());
        }
        let entry = LogEntry {
            stage,
            payload: encode(payload)?,
        };
        debug!(tid = %self.tid, ?stage, "initiating transaction log");
        self.store.initiate(self.tid, entry)
    }

    /// Append a stage entry. No-op if logging is disabled.
    pub fn add<P: Serialize>(&self, stage: Stage, payload: &P) -> Result<()> {
        if !self.logging_enabled {
            return Ok(());
        }
        let entry = LogEntry {
            stage,
            payload: encode(payload)?,
        };
        debug!(tid = %self.tid, ?stage, "appending transaction log entry");
        self.store.add(self.tid, entry)
    }

    /// Append a stage entry carrying no payload (e.g. `beforeFinalize`).
    pub fn add_marker(&self, stage: Stage) -> Result<()> {
        self.add(stage, &())
    }

    /// Delete this transaction's entire log. Always runs, even when
    /// logging was disabled, since a disabled log may still have been
    /// initiated by a prior, now-stale, configuration — deleting an
    /// absent log is a harmless no-op for any reasonable store.
    pub fn remove(&self) -> Result<()> {
        self.store.remove(self.tid)
    }
}

/// Find the oldest transaction whose log has gone quiet for longer than
/// `max_lifetime_millis`, for the recovery scanner (C10) to examine.
pub fn find_expired(
    store: &dyn TransactionLogStore,
    now_millis: i64,
    max_lifetime_millis: i64,
) -> Result<Option<(Uuid, Vec<LogEntry>)>> {
    store.get_one_expired(now_millis.saturating_sub(max_lifetime_millis))
}
