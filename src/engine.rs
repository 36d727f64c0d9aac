use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::TimeSource;
use crate::config::{DefaultPolicy, EngineSettings, FailPolicy};
use crate::limiter::{LimiterCore, Verdict};
use crate::metrics::Metrics;
use crate::queue::{QueueManager, QueueOutcome};
use crate::rules::{CompiledRule, RequestDescriptor, RuleSnapshot};
use crate::store::{CounterKey, CounterStore};
use crate::usage::{UsageMeter, UsageSink};
use crate::violations::ViolationTracker;

/// Final disposition of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allow,
    Reject,
    Blocked,
    QueueTimeout,
}

/// Decision object returned synchronously to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub outcome: Outcome,
    pub retry_after_secs: Option<u64>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Most specific matched rule, for diagnostics
    pub matched_rule: Option<String>,
    /// True when the request was admitted after waiting in the queue
    pub queued: bool,
}

impl GateDecision {
    pub fn is_allow(&self) -> bool {
        self.outcome == Outcome::Allow
    }

    fn allow(matched_rule: Option<String>, queued: bool) -> Self {
        Self {
            outcome: Outcome::Allow,
            retry_after_secs: None,
            blocked_until: None,
            message: None,
            matched_rule,
            queued,
        }
    }

    fn reject(rule: &CompiledRule, retry_after_secs: u64) -> Self {
        Self {
            outcome: Outcome::Reject,
            retry_after_secs: Some(retry_after_secs),
            blocked_until: None,
            message: rule.custom_error_message.clone(),
            matched_rule: Some(rule.name.clone()),
            queued: false,
        }
    }

    fn queue_timeout(rule: &CompiledRule) -> Self {
        Self {
            outcome: Outcome::QueueTimeout,
            retry_after_secs: Some(rule.retry_after_seconds),
            blocked_until: None,
            message: Some(format!(
                "Request timed out after {}s waiting for capacity",
                rule.queue_timeout_seconds
            )),
            matched_rule: Some(rule.name.clone()),
            queued: false,
        }
    }

    fn blocked(blocked_until_ms: i64) -> Self {
        Self {
            outcome: Outcome::Blocked,
            retry_after_secs: None,
            blocked_until: Utc.timestamp_millis_opt(blocked_until_ms).single(),
            message: Some("Temporarily blocked after repeated violations".to_string()),
            matched_rule: None,
            queued: false,
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self.outcome {
            Outcome::Allow => "allow",
            Outcome::Reject => "reject",
            Outcome::Blocked => "blocked",
            Outcome::QueueTimeout => "queue_timeout",
        }
    }
}

/// The gating engine: resolves rules, enforces them with AND semantics,
/// escalates repeat offenders, and meters usage independent of the decision.
pub struct GateEngine {
    snapshot: RwLock<Arc<RuleSnapshot>>,
    limiter: Arc<LimiterCore>,
    queue: QueueManager,
    violations: ViolationTracker,
    meter: UsageMeter,
    metrics: Arc<Metrics>,
    settings: EngineSettings,
    clock: TimeSource,
}

impl GateEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        sink: Arc<dyn UsageSink>,
        settings: EngineSettings,
        clock: TimeSource,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limiter = Arc::new(LimiterCore::new(store, clock.clone()));
        let queue = QueueManager::new(limiter.clone());
        let violations = ViolationTracker::new(settings.violation_config(), clock.clone());
        let meter = UsageMeter::new(sink, clock.clone(), settings.meter_config());
        Self {
            snapshot: RwLock::new(Arc::new(RuleSnapshot::default())),
            limiter,
            queue,
            violations,
            meter,
            metrics,
            settings,
            clock,
        }
    }

    /// Swap in a freshly compiled rule snapshot. The request path picks it
    /// up on its next lookup; in-flight evaluations finish on the old one.
    pub fn install_snapshot(&self, snapshot: RuleSnapshot) {
        *self.snapshot.write().unwrap() = Arc::new(snapshot);
        self.metrics.record_config_load_success();
    }

    fn current_snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    pub fn limiter(&self) -> &Arc<LimiterCore> {
        &self.limiter
    }

    /// Wait for all pending usage records to reach the sink.
    pub async fn flush_usage(&self) {
        self.meter.flush().await;
    }

    pub async fn health_check(&self) -> crate::error::Result<()> {
        self.limiter.store().health_check().await
    }

    /// Decide whether to admit, delay, or reject a request, and meter it.
    pub async fn check(&self, descriptor: &RequestDescriptor) -> GateDecision {
        let timer = self.metrics.start_request_timer();
        let started_ms = self.clock.now_ms();

        let decision = self.evaluate(descriptor).await;

        let elapsed_ms = (self.clock.now_ms() - started_ms).max(0) as u64;
        if self.meter.meters(decision.is_allow()) {
            self.meter
                .record_request(descriptor, decision.is_allow(), elapsed_ms);
            self.metrics.record_usage_record();
        }

        drop(timer);
        self.metrics.record_decision(
            decision.outcome_label(),
            decision.matched_rule.as_deref().unwrap_or("none"),
        );
        decision
    }

    async fn evaluate(&self, descriptor: &RequestDescriptor) -> GateDecision {
        let identifier = descriptor.identifier();

        // Blocked keys short-circuit: no rule evaluation, no counter writes.
        if let Some(blocked_until_ms) = self.violations.blocked_until_ms(&identifier).await {
            debug!(identifier, "Request short-circuited by active block");
            return GateDecision::blocked(blocked_until_ms);
        }

        let snapshot = self.current_snapshot();
        let matched = snapshot.resolve(descriptor);

        if matched.is_empty() {
            self.metrics.record_no_rule_request();
            return match self.settings.default_policy {
                DefaultPolicy::Allow => GateDecision::allow(None, false),
                DefaultPolicy::Deny => GateDecision {
                    outcome: Outcome::Reject,
                    retry_after_secs: None,
                    blocked_until: None,
                    message: Some("No matching rule; default policy denies".to_string()),
                    matched_rule: None,
                    queued: false,
                },
            };
        }

        let most_specific = matched[0].name.clone();
        let mut queued = false;
        let mut consumed: Vec<(&CompiledRule, CounterKey)> = Vec::new();

        // Every matched rule must individually admit the request. When a
        // later rule rejects, units already consumed from earlier rules are
        // returned so rejected requests don't burn quota.
        for rule in &matched {
            let key = CounterKey::new(rule.id, identifier.clone());
            match self.limiter.check(rule, &key).await {
                Ok(Verdict::Allow { .. }) => consumed.push((*rule, key)),
                Ok(Verdict::Reject { retry_after_secs }) => {
                    if rule.queues_excess() {
                        match self.wait_in_queue(rule, &key).await {
                            QueueOutcome::Admitted { waited_ms } => {
                                self.metrics.record_queue_wait(waited_ms as f64 / 1000.0);
                                queued = true;
                                consumed.push((*rule, key));
                                continue;
                            }
                            QueueOutcome::TimedOut => {
                                self.metrics.record_queue_timeout();
                                self.refund_consumed(&consumed).await;
                                return self
                                    .escalate(&identifier, GateDecision::queue_timeout(rule))
                                    .await;
                            }
                        }
                    }
                    self.refund_consumed(&consumed).await;
                    return self
                        .escalate(&identifier, GateDecision::reject(rule, retry_after_secs))
                        .await;
                }
                Err(e) if e.is_store_failure() => {
                    self.metrics.record_store_failure();
                    warn!(rule = %rule.name, error = %e, "Counter store failure");
                    match self.settings.fail_policy {
                        FailPolicy::Open => {}
                        FailPolicy::Closed => {
                            self.refund_consumed(&consumed).await;
                            return GateDecision::reject(rule, rule.retry_after_seconds);
                        }
                    }
                }
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "Rule evaluation failed");
                    if self.settings.fail_policy == FailPolicy::Closed {
                        self.refund_consumed(&consumed).await;
                        return GateDecision::reject(rule, rule.retry_after_seconds);
                    }
                }
            }
        }

        self.violations.record_allow(&identifier).await;
        GateDecision::allow(Some(most_specific), queued)
    }

    async fn refund_consumed(&self, consumed: &[(&CompiledRule, CounterKey)]) {
        for (rule, key) in consumed {
            self.limiter.refund(rule, key).await;
        }
    }

    async fn wait_in_queue(&self, rule: &CompiledRule, key: &CounterKey) -> QueueOutcome {
        self.metrics.record_queued_request();
        let timeout = Duration::from_secs(rule.queue_timeout_seconds);
        let rx = self.queue.enqueue(rule, key, timeout).await;
        // The drain always resolves the ticket; a dropped sender is treated
        // as a timeout so no caller waits forever.
        rx.await.unwrap_or(QueueOutcome::TimedOut)
    }

    /// Record a rejection toward escalation and stamp the decision with the
    /// block if this violation tipped the key over the threshold.
    async fn escalate(&self, identifier: &str, decision: GateDecision) -> GateDecision {
        self.metrics.record_violation();
        let retry_after = decision.retry_after_secs.unwrap_or(1).max(1);
        match self.violations.record_rejection(identifier, retry_after).await {
            Some(blocked_until_ms) => {
                self.metrics.record_key_blocked();
                GateDecision {
                    blocked_until: Utc.timestamp_millis_opt(blocked_until_ms).single(),
                    ..decision
                }
            }
            None => decision,
        }
    }
}
