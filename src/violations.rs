use dashmap::DashMap;
use moka::{future::Cache, Expiry};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::clock::TimeSource;

/// Escalation state for one identifier key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Normal,
    Warned,
    Blocked,
}

/// Tunables for the escalation state machine
#[derive(Debug, Clone)]
pub struct ViolationConfig {
    /// Violations within the observation window before a key is blocked
    pub block_threshold: u32,
    /// Rolling window over which violations accumulate
    pub observation_window: Duration,
    /// Base of the exponential block backoff
    pub backoff_multiplier: f64,
    /// Upper bound on a single block duration
    pub max_block_secs: u64,
}

impl Default for ViolationConfig {
    fn default() -> Self {
        Self {
            block_threshold: 5,
            observation_window: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            max_block_secs: 86_400,
        }
    }
}

#[derive(Debug)]
struct ViolationState {
    count: u32,
    first_at_ms: i64,
    blocked_until_ms: Option<i64>,
}

#[derive(Debug, Clone)]
struct BlockEntry {
    blocked_until_ms: i64,
    ttl: Duration,
}

struct BlockExpiry;

impl Expiry<String, BlockEntry> for BlockExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &BlockEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Escalates repeated rejections into temporary hard blocks.
///
/// Per identifier key: Normal → Warned on the first violation, Blocked once
/// the threshold is crossed within the observation window. Blocks carry
/// exponential backoff and auto-clear on expiry. The violation count ages
/// out with the observation window or resets on the first Allow after a
/// lapsed block; ordinary Allows interleaved with rejections do not erase
/// the streak.
pub struct ViolationTracker {
    config: ViolationConfig,
    clock: TimeSource,
    violations: DashMap<String, ViolationState>,
    blocked: Cache<String, BlockEntry>,
}

impl ViolationTracker {
    pub fn new(config: ViolationConfig, clock: TimeSource) -> Self {
        let blocked = Cache::builder()
            .max_capacity(100_000)
            .expire_after(BlockExpiry)
            .build();
        Self {
            config,
            clock,
            violations: DashMap::new(),
            blocked,
        }
    }

    /// If the key is currently blocked, its `blocked_until` timestamp (ms).
    ///
    /// An expired block clears on first observation.
    pub async fn blocked_until_ms(&self, identifier: &str) -> Option<i64> {
        let entry = self.blocked.get(identifier).await?;
        if self.clock.now_ms() >= entry.blocked_until_ms {
            self.blocked.invalidate(identifier).await;
            return None;
        }
        Some(entry.blocked_until_ms)
    }

    /// Record a rejection for the key. Returns the new `blocked_until`
    /// timestamp (ms) when this violation tips the key into Blocked.
    pub async fn record_rejection(
        &self,
        identifier: &str,
        retry_after_secs: u64,
    ) -> Option<i64> {
        let now_ms = self.clock.now_ms();
        let (count, block) = {
            let mut state = self
                .violations
                .entry(identifier.to_string())
                .or_insert(ViolationState {
                    count: 0,
                    first_at_ms: now_ms,
                    blocked_until_ms: None,
                });
            let window_ms = self.config.observation_window.as_millis() as i64;
            if now_ms - state.first_at_ms > window_ms {
                state.count = 0;
                state.first_at_ms = now_ms;
                state.blocked_until_ms = None;
            }
            state.count += 1;

            if state.count < self.config.block_threshold {
                (state.count, None)
            } else {
                let backoff_secs = (retry_after_secs as f64
                    * self.config.backoff_multiplier.powi(state.count as i32))
                .min(self.config.max_block_secs as f64) as u64;
                let blocked_until_ms = now_ms + backoff_secs as i64 * 1000;
                state.blocked_until_ms = Some(blocked_until_ms);
                (state.count, Some((blocked_until_ms, backoff_secs)))
            }
        };

        debug!(identifier, violations = count, "Violation recorded");

        let (blocked_until_ms, backoff_secs) = match block {
            Some(b) => b,
            None => return None,
        };

        warn!(
            identifier,
            violations = count,
            backoff_secs,
            "Key blocked after repeated violations"
        );
        self.blocked
            .insert(
                identifier.to_string(),
                BlockEntry {
                    blocked_until_ms,
                    ttl: Duration::from_secs(backoff_secs.max(1)),
                },
            )
            .await;
        Some(blocked_until_ms)
    }

    /// Record a successful admission. The streak survives ordinary Allows;
    /// it resets only once a block has lapsed, returning the key to Normal.
    pub async fn record_allow(&self, identifier: &str) {
        let now_ms = self.clock.now_ms();
        let block_lapsed = self
            .violations
            .get(identifier)
            .map(|state| matches!(state.blocked_until_ms, Some(until) if now_ms >= until))
            .unwrap_or(false);
        if block_lapsed {
            self.violations.remove(identifier);
        }
    }

    pub async fn state(&self, identifier: &str) -> KeyState {
        if self.blocked_until_ms(identifier).await.is_some() {
            return KeyState::Blocked;
        }
        match self.violations.get(identifier) {
            Some(state) if state.count > 0 => KeyState::Warned,
            _ => KeyState::Normal,
        }
    }
}
