use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::limiter::{LimiterCore, Verdict};
use crate::rules::CompiledRule;
use crate::store::CounterKey;

/// How a queued request ultimately resolved
#[derive(Debug, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Capacity freed before the deadline; the request was admitted.
    Admitted { waited_ms: u64 },
    /// The deadline passed first.
    TimedOut,
}

/// Drain poll cadence. Capacity can free between window boundaries (token
/// refill), so the head is re-probed on a short interval bounded by its
/// deadline.
const DRAIN_POLL: Duration = Duration::from_millis(20);

struct Ticket {
    enqueued_at: Instant,
    deadline: Instant,
    resolve: oneshot::Sender<QueueOutcome>,
}

struct QueueState {
    /// Rule governing admission, refreshed on every enqueue so a reloaded
    /// rule's quota and timeout apply to already-queued keys.
    rule: CompiledRule,
    tickets: VecDeque<Ticket>,
    draining: bool,
    /// Set by the drain when it removes the queue from the map; enqueuers
    /// holding a stale handle retry against the map.
    retired: bool,
}

struct KeyQueue {
    key: CounterKey,
    state: Mutex<QueueState>,
}

/// Per-identifier-key FIFO of requests awaiting delayed admission.
///
/// Tickets for one key resolve strictly in arrival order: only the head is
/// ever re-evaluated against the limiter. Every ticket resolves by its
/// deadline; a dropped receiver cancels its ticket. Drained-empty queues are
/// removed from the map, so the map tracks only keys with pending tickets.
pub struct QueueManager {
    limiter: Arc<LimiterCore>,
    queues: Arc<DashMap<CounterKey, Arc<KeyQueue>>>,
}

impl QueueManager {
    pub fn new(limiter: Arc<LimiterCore>) -> Self {
        Self {
            limiter,
            queues: Arc::new(DashMap::new()),
        }
    }

    /// Enqueue a request that failed immediate admission. The returned
    /// receiver resolves to the ticket's outcome no later than `timeout`
    /// from now.
    pub async fn enqueue(
        &self,
        rule: &CompiledRule,
        key: &CounterKey,
        timeout: Duration,
    ) -> oneshot::Receiver<QueueOutcome> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut ticket = Some(Ticket {
            enqueued_at: now,
            deadline: now + timeout,
            resolve: tx,
        });

        loop {
            let key_queue = self
                .queues
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(KeyQueue {
                        key: key.clone(),
                        state: Mutex::new(QueueState {
                            rule: rule.clone(),
                            tickets: VecDeque::new(),
                            draining: false,
                            retired: false,
                        }),
                    })
                })
                .clone();

            let mut state = key_queue.state.lock().await;
            if state.retired {
                // The drain retired this queue between the map lookup and
                // the lock; fetch the replacement.
                drop(state);
                continue;
            }
            state.rule = rule.clone();
            state
                .tickets
                .push_back(ticket.take().expect("ticket pending until pushed"));
            trace!(key = %key, depth = state.tickets.len(), "Ticket enqueued");
            let spawn_drain = !state.draining;
            state.draining = true;
            drop(state);

            if spawn_drain {
                let limiter = self.limiter.clone();
                let queues = self.queues.clone();
                tokio::spawn(drain(limiter, queues, key_queue));
            }
            return rx;
        }
    }

    /// Total tickets pending across all keys.
    pub async fn depth(&self) -> usize {
        let mut total = 0;
        for entry in self.queues.iter() {
            total += entry.value().state.lock().await.tickets.len();
        }
        total
    }
}

async fn drain(
    limiter: Arc<LimiterCore>,
    queues: Arc<DashMap<CounterKey, Arc<KeyQueue>>>,
    queue: Arc<KeyQueue>,
) {
    loop {
        let rule = {
            let mut state = queue.state.lock().await;
            expire_and_prune(&mut state.tickets);
            if state.tickets.is_empty() {
                state.draining = false;
                state.retired = true;
                queues.remove_if(&queue.key, |_, v| Arc::ptr_eq(v, &queue));
                return;
            }
            state.rule.clone()
        };

        match limiter.check(&rule, &queue.key).await {
            Ok(Verdict::Allow { .. }) => {
                let mut state = queue.state.lock().await;
                // The head may have been cancelled or expired while the
                // probe ran; the consumed slot then goes to the next ticket.
                expire_and_prune(&mut state.tickets);
                match state.tickets.pop_front() {
                    Some(ticket) => {
                        let waited_ms = ticket.enqueued_at.elapsed().as_millis() as u64;
                        debug!(key = %queue.key, waited_ms, "Queued request admitted");
                        let _ = ticket.resolve.send(QueueOutcome::Admitted { waited_ms });
                    }
                    None => {
                        drop(state);
                        limiter.refund(&rule, &queue.key).await;
                    }
                }
            }
            Ok(Verdict::Reject { .. }) => {
                let next_deadline = {
                    let state = queue.state.lock().await;
                    state.tickets.front().map(|t| t.deadline)
                };
                let wake_at = match next_deadline {
                    Some(deadline) => deadline.min(Instant::now() + DRAIN_POLL),
                    None => Instant::now() + DRAIN_POLL,
                };
                tokio::time::sleep_until(wake_at).await;
            }
            Err(e) => {
                // Store hiccups never strand tickets: deadlines still expire
                // on the next pass.
                debug!(key = %queue.key, error = %e, "Queue probe failed");
                tokio::time::sleep(DRAIN_POLL).await;
            }
        }
    }
}

fn expire_and_prune(tickets: &mut VecDeque<Ticket>) {
    let now = Instant::now();
    while let Some(front) = tickets.front() {
        if front.resolve.is_closed() {
            tickets.pop_front();
        } else if now >= front.deadline {
            let ticket = tickets.pop_front().expect("front exists");
            let _ = ticket.resolve.send(QueueOutcome::TimedOut);
        } else {
            break;
        }
    }
}
