//! In-memory [`Cache`] reference implementation: TTL string/struct
//! storage plus the lock primitives the item action tracker (C6) relies
//! on.

use cowtree_core::{Cache, Error, LockOutcome, Result, Uuid};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

struct LockEntry {
    owner: Uuid,
    expires_at: Instant,
}

fn lock_key(id: Uuid) -> String {
    format!("L{id}")
}

/// An in-memory, process-local cache.
pub struct MemoryCache {
    values: DashMap<String, Entry>,
    locks: DashMap<String, LockEntry>,
    lock_guard: Mutex<()>,
    run_id: Mutex<Uuid>,
    last_seen_run_id: Mutex<Uuid>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        let run_id = Uuid::new_v4();
        MemoryCache {
            values: DashMap::new(),
            locks: DashMap::new(),
            lock_guard: Mutex::new(()),
            run_id: Mutex::new(run_id),
            last_seen_run_id: Mutex::new(run_id),
        }
    }
}

impl MemoryCache {
    /// A fresh, empty cache.
    pub fn new() -> Self {
        MemoryCache::default()
    }

    /// Simulate a backend restart: the next [`Cache::is_restarted`] call
    /// will return `true` exactly once.
    pub fn simulate_restart(&self) {
        *self.run_id.lock() = Uuid::new_v4();
    }

    fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.values.insert(key.to_string(), Entry { value, expires_at });
    }

    fn get_raw(&self, key: &str) -> Result<Vec<u8>> {
        let now = Instant::now();
        match self.values.get(key) {
            Some(entry) if entry.is_live(now) => Ok(entry.value.clone()),
            _ => Err(Error::NotFound(key.to_string())),
        }
    }
}

impl Cache for MemoryCache {
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.set_raw(key, value.as_bytes().to_vec(), ttl);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<String> {
        let bytes = self.get_raw(key)?;
        String::from_utf8(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn set_struct(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.set_raw(key, value.to_vec(), ttl);
        Ok(())
    }

    fn get_struct(&self, key: &str) -> Result<Vec<u8>> {
        self.get_raw(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.values.clear();
        self.locks.clear();
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn lock(&self, duration: Duration, keys: &[Uuid], owner: Uuid) -> Result<LockOutcome> {
        let _guard = self.lock_guard.lock();
        let now = Instant::now();
        for id in keys {
            if let Some(held) = self.locks.get(&lock_key(*id)) {
                if held.owner != owner && held.expires_at > now {
                    return Ok(LockOutcome::Conflict(held.owner));
                }
            }
        }
        let expires_at = now + duration;
        for id in keys {
            self.locks.insert(lock_key(*id), LockEntry { owner, expires_at });
        }
        Ok(LockOutcome::Acquired)
    }

    fn is_locked(&self, keys: &[Uuid]) -> Result<bool> {
        let now = Instant::now();
        Ok(keys.iter().all(|id| {
            self.locks
                .get(&lock_key(*id))
                .map(|e| e.expires_at > now)
                .unwrap_or(false)
        }))
    }

    fn is_locked_ttl(&self, duration: Duration, keys: &[Uuid]) -> Result<bool> {
        let now = Instant::now();
        let all_locked = keys.iter().all(|id| {
            self.locks
                .get(&lock_key(*id))
                .map(|e| e.expires_at > now)
                .unwrap_or(false)
        });
        if all_locked {
            let new_expiry = now + duration;
            for id in keys {
                if let Some(mut e) = self.locks.get_mut(&lock_key(*id)) {
                    e.expires_at = new_expiry;
                }
            }
        }
        Ok(all_locked)
    }

    fn unlock(&self, keys: &[Uuid], owner: Uuid) -> Result<()> {
        for id in keys {
            let key = lock_key(*id);
            let owned_by_us = self.locks.get(&key).map(|e| e.owner == owner).unwrap_or(false);
            if owned_by_us {
                self.locks.remove(&key);
            }
        }
        Ok(())
    }

    fn is_locked_by_others(&self, keys: &[Uuid], owner: Uuid) -> Result<bool> {
        let now = Instant::now();
        Ok(keys.iter().all(|id| {
            self.locks
                .get(&lock_key(*id))
                .map(|e| e.expires_at > now && e.owner != owner)
                .unwrap_or(false)
        }))
    }

    fn is_restarted(&self) -> Result<bool> {
        let current = *self.run_id.lock();
        let mut last = self.last_seen_run_id.lock();
        if *last != current {
            *last = current;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
