use std::sync::Arc;
use tracing::trace;

use crate::clock::{aligned_window_start, secs_until, TimeSource};
use crate::error::{GateError, Result};
use crate::rules::{Algorithm, CompiledRule};
use crate::store::{CounterEntry, CounterKey, CounterStore};

/// Outcome of evaluating a single rule against current counter state
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow { remaining: u64 },
    Reject { retry_after_secs: u64 },
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }
}

/// Bound on CAS retries under pathological contention; a healthy store
/// resolves conflicts in one or two rounds.
const MAX_CAS_ATTEMPTS: usize = 64;

/// Evaluates requests against resolved rules and counter state.
///
/// Every check is a single atomic check-and-consume: load the versioned
/// entry, apply the rule's algorithm, and write back with compare_and_store.
/// Two concurrent requests observing one remaining unit of capacity race on
/// the version; the loser retries against the updated state and is rejected.
pub struct LimiterCore {
    store: Arc<dyn CounterStore>,
    clock: TimeSource,
}

impl LimiterCore {
    pub fn new(store: Arc<dyn CounterStore>, clock: TimeSource) -> Self {
        Self { store, clock }
    }

    pub fn clock(&self) -> &TimeSource {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Check-and-consume one unit of capacity under `rule` for `key`.
    pub async fn check(&self, rule: &CompiledRule, key: &CounterKey) -> Result<Verdict> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now_ms = self.clock.now_ms();
            let (version, mut entry) = match self.store.load(key).await? {
                Some(v) => (v.version, v.value),
                None => (
                    0,
                    CounterEntry::new(now_ms, rule.window_ms(), rule.capacity()),
                ),
            };

            let verdict = match rule.algorithm {
                Algorithm::Fixed => fixed_window(rule, &mut entry, now_ms),
                Algorithm::Sliding => sliding_window(rule, &mut entry, now_ms),
                Algorithm::TokenBucket => token_bucket(rule, &mut entry, now_ms),
            };
            entry.last_request_at_ms = now_ms;

            if self
                .store
                .compare_and_store(key, version, entry, entry_ttl_secs(rule))
                .await?
            {
                return Ok(verdict);
            }
            trace!(key = %key, "Counter CAS conflict, retrying");
        }
        Err(GateError::StoreUnavailable(format!(
            "Counter for {} contended beyond {} CAS attempts",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    /// Return one previously consumed unit of capacity, e.g. when a later
    /// rule in the same evaluation rejected the request. Best effort: a
    /// missing entry or store failure leaves the counter as-is.
    pub async fn refund(&self, rule: &CompiledRule, key: &CounterKey) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let versioned = match self.store.load(key).await {
                Ok(Some(v)) => v,
                Ok(None) => return,
                Err(e) => {
                    trace!(key = %key, error = %e, "Refund load failed");
                    return;
                }
            };
            let mut entry = versioned.value;
            match rule.algorithm {
                Algorithm::Fixed | Algorithm::Sliding => {
                    entry.current_count = entry.current_count.saturating_sub(1);
                    entry.burst_tokens_used =
                        entry.current_count.saturating_sub(rule.max_requests);
                }
                Algorithm::TokenBucket => {
                    entry.tokens = (entry.tokens + 1.0).min(rule.capacity() as f64);
                }
            }
            match self
                .store
                .compare_and_store(key, versioned.version, entry, entry_ttl_secs(rule))
                .await
            {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    trace!(key = %key, error = %e, "Refund store failed");
                    return;
                }
            }
        }
    }
}

/// Entries must outlive the previous window (sliding needs it for the
/// overlap term), after which they are garbage.
fn entry_ttl_secs(rule: &CompiledRule) -> u64 {
    (rule.window_seconds as u64) * 2
}

fn retry_after(rule: &CompiledRule, computed_secs: u64) -> u64 {
    if computed_secs > 0 {
        computed_secs
    } else {
        rule.retry_after_seconds
    }
}

fn fixed_window(rule: &CompiledRule, entry: &mut CounterEntry, now_ms: i64) -> Verdict {
    if now_ms >= entry.window_end_ms {
        entry.current_count = 0;
        entry.burst_tokens_used = 0;
        entry.window_start_ms = now_ms;
        entry.window_end_ms = now_ms + rule.window_ms();
    }

    if entry.current_count >= rule.capacity() {
        return Verdict::Reject {
            retry_after_secs: retry_after(rule, secs_until(now_ms, entry.window_end_ms)),
        };
    }

    entry.current_count += 1;
    if entry.current_count > rule.max_requests {
        entry.burst_tokens_used = entry.current_count - rule.max_requests;
    }
    Verdict::Allow {
        remaining: rule.capacity() - entry.current_count,
    }
}

fn sliding_window(rule: &CompiledRule, entry: &mut CounterEntry, now_ms: i64) -> Verdict {
    let window_ms = rule.window_ms();
    let current_start = aligned_window_start(now_ms, window_ms);

    if entry.window_start_ms != current_start {
        entry.previous_count = if entry.window_start_ms == current_start - window_ms {
            entry.current_count
        } else {
            0
        };
        entry.current_count = 0;
        entry.burst_tokens_used = 0;
        entry.window_start_ms = current_start;
        entry.window_end_ms = current_start + window_ms;
    }

    let overlap = 1.0 - (now_ms - current_start) as f64 / window_ms as f64;
    let effective = entry.previous_count as f64 * overlap + entry.current_count as f64;

    if effective + 1.0 > rule.capacity() as f64 {
        return Verdict::Reject {
            retry_after_secs: retry_after(rule, secs_until(now_ms, entry.window_end_ms)),
        };
    }

    entry.current_count += 1;
    if entry.current_count > rule.max_requests {
        entry.burst_tokens_used = entry.current_count - rule.max_requests;
    }
    Verdict::Allow {
        remaining: (rule.capacity() as f64 - effective - 1.0).max(0.0) as u64,
    }
}

fn token_bucket(rule: &CompiledRule, entry: &mut CounterEntry, now_ms: i64) -> Verdict {
    let capacity = rule.capacity() as f64;
    let refill_per_sec = rule.max_requests as f64 / rule.window_seconds as f64;
    let elapsed_secs = (now_ms - entry.last_request_at_ms).max(0) as f64 / 1000.0;

    entry.tokens = (entry.tokens + elapsed_secs * refill_per_sec).min(capacity);

    if entry.tokens >= 1.0 {
        entry.tokens -= 1.0;
        let used = (capacity - entry.tokens) as u64;
        entry.burst_tokens_used = used.saturating_sub(rule.max_requests);
        Verdict::Allow {
            remaining: entry.tokens as u64,
        }
    } else {
        let wait_secs = ((1.0 - entry.tokens) / refill_per_sec).ceil() as u64;
        Verdict::Reject {
            retry_after_secs: retry_after(rule, wait_secs.max(1)),
        }
    }
}
