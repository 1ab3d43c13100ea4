//! Validated configuration shapes.
//!
//! Loading these from a file, environment, or CLI flags is client-side
//! sugar and out of scope for this crate; what's in scope is the
//! validated shape itself, with the same defaults and caps the spec
//! calls out.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the `new`/`with_*` constructors below when a field
/// violates one of the spec's stated bounds.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_time` exceeded the 1-hour cap.
    #[error("max_time {0:?} exceeds the 1 hour cap")]
    MaxTimeTooLarge(Duration),
    /// Node cache TTL fell below the 20-minute floor.
    #[error("node cache ttl {0:?} is below the 20 minute minimum")]
    NodeCacheTtlTooSmall(Duration),
}

/// Result alias local to config construction.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// `{address, password, db_index, tls_config?, default_ttl}` — the
/// shape a `Cache` implementation is constructed from.
#[derive(Debug, Clone)]
pub struct CacheConnectionConfig {
    /// Host:port (or similar) address of the cache cluster.
    pub address: String,
    /// Authentication secret, if any.
    pub password: Option<String>,
    /// Logical database/keyspace index within the cache.
    pub db_index: u32,
    /// Opaque TLS configuration blob; this crate does not interpret it.
    pub tls_config: Option<Vec<u8>>,
    /// Default TTL applied when a caller doesn't specify one.
    pub default_ttl: Duration,
}

impl CacheConnectionConfig {
    /// Build a connection config with no TLS and no password.
    pub fn new(address: impl Into<String>, default_ttl: Duration) -> Self {
        CacheConnectionConfig {
            address: address.into(),
            password: None,
            db_index: 0,
            tls_config: None,
            default_ttl,
        }
    }
}

/// `{cluster_hosts, keyspace, consistency}` — the shape a `Registry`
/// implementation is constructed from.
#[derive(Debug, Clone)]
pub struct RegistryConnectionConfig {
    /// Seed hosts for the registry's backing cluster.
    pub cluster_hosts: Vec<String>,
    /// Keyspace/namespace the registry tables live under.
    pub keyspace: String,
    /// Consistency level token; opaque to this crate, interpreted by
    /// the concrete `Registry` implementation.
    pub consistency: String,
}

/// The mode a transaction is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// No conflict checking at all (used by bulk/maintenance paths).
    NoCheck,
    /// Reader: checks fetched-item versions at commit, takes no locks.
    ForReading,
    /// Writer: takes item locks, stages a full commit.
    ForWriting,
}

/// Maximum `max_time` any transaction may request ("<= 1 h").
pub const MAX_TIME_CAP: Duration = Duration::from_secs(60 * 60);

/// Default `max_time` when a caller doesn't specify one ("default 15 min").
pub const DEFAULT_MAX_TIME: Duration = Duration::from_secs(15 * 60);

/// `{mode, max_time, logging_enabled}` — per-transaction configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Transaction mode.
    pub mode: TransactionMode,
    /// Upper bound on total commit time, including all retries.
    pub max_time: Duration,
    /// Whether commit stages are appended to the transaction log. When
    /// `false` the in-memory `committedState` still tracks progress for
    /// live-process rollback, but crash recovery loses visibility into
    /// this transaction.
    pub logging_enabled: bool,
}

impl TransactionConfig {
    /// Build a config, rejecting a `max_time` over the 1-hour cap.
    pub fn new(
        mode: TransactionMode,
        max_time: Duration,
        logging_enabled: bool,
    ) -> ConfigResult<Self> {
        if max_time > MAX_TIME_CAP {
            return Err(ConfigError::MaxTimeTooLarge(max_time));
        }
        Ok(TransactionConfig {
            mode,
            max_time,
            logging_enabled,
        })
    }

    /// `ForWriting`, default `max_time`, logging enabled.
    pub fn for_writing() -> Self {
        TransactionConfig {
            mode: TransactionMode::ForWriting,
            max_time: DEFAULT_MAX_TIME,
            logging_enabled: true,
        }
    }

    /// `ForReading`, default `max_time`, logging enabled.
    pub fn for_reading() -> Self {
        TransactionConfig {
            mode: TransactionMode::ForReading,
            max_time: DEFAULT_MAX_TIME,
            logging_enabled: true,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self::for_writing()
    }
}

/// Default node cache TTL ("default 1 h, min 20 min").
pub const DEFAULT_NODE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Minimum node cache TTL.
pub const MIN_NODE_CACHE_TTL: Duration = Duration::from_secs(20 * 60);

/// Node-cache TTL configuration (the `"N"`-prefixed cache entries C7
/// writes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCacheConfig {
    /// TTL applied to cached node bodies.
    pub ttl: Duration,
}

impl NodeCacheConfig {
    /// Build a config, rejecting a TTL under the 20-minute floor.
    pub fn new(ttl: Duration) -> ConfigResult<Self> {
        if ttl < MIN_NODE_CACHE_TTL {
            return Err(ConfigError::NodeCacheTtlTooSmall(ttl));
        }
        Ok(NodeCacheConfig { ttl })
    }
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        NodeCacheConfig {
            ttl: DEFAULT_NODE_CACHE_TTL,
        }
    }
}

/// Recovery/cleanup scanner cadence (C10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Interval between scans when the previous scan found nothing to
    /// do ("no more frequently than every 4 hours").
    pub idle_interval: Duration,
    /// Shortened interval used after a scan found expired transactions
    /// to roll forward/back ("5 minutes").
    pub pending_interval: Duration,
    /// A transaction log with no activity for longer than this is
    /// considered crashed and eligible for recovery.
    pub max_transaction_lifetime: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            idle_interval: Duration::from_secs(4 * 60 * 60),
            pending_interval: Duration::from_secs(5 * 60),
            max_transaction_lifetime: MAX_TIME_CAP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_config_rejects_max_time_over_cap() {
        let err = TransactionConfig::new(
            TransactionMode::ForWriting,
            Duration::from_secs(60 * 60 + 1),
            true,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::MaxTimeTooLarge(Duration::from_secs(60 * 60 + 1)));
    }

    #[test]
    fn transaction_config_accepts_max_time_at_cap() {
        assert!(TransactionConfig::new(TransactionMode::ForWriting, MAX_TIME_CAP, true).is_ok());
    }

    #[test]
    fn node_cache_config_rejects_ttl_below_floor() {
        assert!(NodeCacheConfig::new(Duration::from_secs(60)).is_err());
    }

    #[test]
    fn node_cache_config_accepts_default() {
        assert!(NodeCacheConfig::new(DEFAULT_NODE_CACHE_TTL).is_ok());
    }

    #[test]
    fn default_recovery_config_matches_spec_cadence() {
        let cfg = RecoveryConfig::default();
        assert_eq!(cfg.idle_interval, Duration::from_secs(4 * 60 * 60));
        assert_eq!(cfg.pending_interval, Duration::from_secs(5 * 60));
    }
}
