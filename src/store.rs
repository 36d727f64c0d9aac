use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Result;

/// Composite key for per-identifier quota state: one entry per
/// (rule, tenant + user/IP) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub rule_id: Uuid,
    pub identifier: String,
}

impl CounterKey {
    pub fn new(rule_id: Uuid, identifier: impl Into<String>) -> Self {
        Self {
            rule_id,
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tollgate:{}:{}", self.rule_id, self.identifier)
    }
}

/// Per-identifier quota state for one rule.
///
/// Created lazily on first matching request. Fixed/sliding windows use the
/// count and window fields; the token bucket uses `tokens` with continuous
/// refill since `last_request_at_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterEntry {
    pub current_count: u64,
    pub previous_count: u64,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub tokens: f64,
    pub burst_tokens_used: u64,
    pub last_request_at_ms: i64,
}

impl CounterEntry {
    /// Fresh entry for a window starting now, with a full token bucket.
    pub fn new(now_ms: i64, window_ms: i64, capacity: u64) -> Self {
        Self {
            current_count: 0,
            previous_count: 0,
            window_start_ms: now_ms,
            window_end_ms: now_ms + window_ms,
            tokens: capacity as f64,
            burst_tokens_used: 0,
            last_request_at_ms: now_ms,
        }
    }
}

/// A counter entry together with its store version, for CAS updates
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Contract the engine requires from counter storage.
///
/// The check-and-consume step in the limiter is a CAS loop: `load`, compute
/// the updated entry, `compare_and_store` with the observed version, retry on
/// conflict. Concurrent requests for one key can therefore never both consume
/// the last unit of capacity.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Load the entry for a key, if one exists.
    async fn load(&self, key: &CounterKey) -> Result<Option<Versioned<CounterEntry>>>;

    /// Store `entry` only if the current version equals `expected_version`
    /// (0 meaning "no entry yet"). Returns false on a version conflict.
    ///
    /// `ttl_secs` bounds how long an untouched entry survives; backends with
    /// native expiry use it directly, others honor it via `sweep_idle`.
    async fn compare_and_store(
        &self,
        key: &CounterKey,
        expected_version: u64,
        entry: CounterEntry,
        ttl_secs: u64,
    ) -> Result<bool>;

    /// Drop the entry for a key.
    async fn remove(&self, key: &CounterKey) -> Result<()>;

    /// Garbage-collect entries idle longer than `idle_for_ms`. Returns the
    /// number of entries removed.
    async fn sweep_idle(&self, now_ms: i64, idle_for_ms: i64) -> Result<usize>;

    async fn health_check(&self) -> Result<()>;
}

/// In-memory counter store backed by a sharded map.
///
/// Per-key atomicity comes from the map's entry locks: a compare_and_store
/// holds the entry exclusively for the duration of the version check.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: DashMap<CounterKey, Versioned<CounterEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn load(&self, key: &CounterKey) -> Result<Option<Versioned<CounterEntry>>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn compare_and_store(
        &self,
        key: &CounterKey,
        expected_version: u64,
        entry: CounterEntry,
        _ttl_secs: u64,
    ) -> Result<bool> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version != expected_version {
                    return Ok(false);
                }
                occupied.insert(Versioned {
                    version: expected_version + 1,
                    value: entry,
                });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Ok(false);
                }
                vacant.insert(Versioned {
                    version: 1,
                    value: entry,
                });
                Ok(true)
            }
        }
    }

    async fn remove(&self, key: &CounterKey) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn sweep_idle(&self, now_ms: i64, idle_for_ms: i64) -> Result<usize> {
        let before = self.entries.len();
        self.entries
            .retain(|_, v| now_ms - v.value.last_request_at_ms < idle_for_ms);
        Ok(before - self.entries.len())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
