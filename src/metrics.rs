use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the gating engine
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    decisions: CounterVec,
    no_rule_requests: Counter,

    // Escalation metrics
    violations_recorded: Counter,
    keys_blocked: Counter,

    // Queue metrics
    queued_requests: Counter,
    queue_timeouts: Counter,
    queue_wait: Histogram,

    // Store metrics
    store_failures: Counter,

    // Usage metrics
    usage_records: Counter,

    // Service metrics
    config_load_success: Counter,
    config_load_error: Counter,
    request_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new("tollgate_decisions", "Gating decisions by outcome and rule"),
            &["outcome", "rule"],
        )?;

        let no_rule_requests = Counter::new(
            "tollgate_no_rule_requests",
            "Requests matched by no rule (default policy applied)",
        )?;

        let violations_recorded = Counter::new(
            "tollgate_violations_recorded",
            "Rejections counted toward escalation",
        )?;

        let keys_blocked = Counter::new(
            "tollgate_keys_blocked",
            "Identifier keys escalated into a temporary block",
        )?;

        let queued_requests = Counter::new(
            "tollgate_queued_requests",
            "Requests held for delayed admission",
        )?;

        let queue_timeouts = Counter::new(
            "tollgate_queue_timeouts",
            "Queued requests that expired before capacity freed",
        )?;

        let queue_wait = Histogram::with_opts(HistogramOpts::new(
            "tollgate_queue_wait_seconds",
            "Time queued requests spent waiting for admission",
        ))?;

        let store_failures = Counter::new(
            "tollgate_store_failures",
            "Counter store failures recovered via the fail policy",
        )?;

        let usage_records = Counter::new(
            "tollgate_usage_records",
            "Usage records emitted to the billing pipeline",
        )?;

        let config_load_success = Counter::new(
            "tollgate_config_load_success",
            "Number of successful rule snapshot loads",
        )?;

        let config_load_error = Counter::new(
            "tollgate_config_load_error",
            "Number of failed rule snapshot loads",
        )?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "tollgate_request_duration_seconds",
            "Duration of gating decisions in seconds",
        ))?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(no_rule_requests.clone()))?;
        registry.register(Box::new(violations_recorded.clone()))?;
        registry.register(Box::new(keys_blocked.clone()))?;
        registry.register(Box::new(queued_requests.clone()))?;
        registry.register(Box::new(queue_timeouts.clone()))?;
        registry.register(Box::new(queue_wait.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;
        registry.register(Box::new(usage_records.clone()))?;
        registry.register(Box::new(config_load_success.clone()))?;
        registry.register(Box::new(config_load_error.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            no_rule_requests,
            violations_recorded,
            keys_blocked,
            queued_requests,
            queue_timeouts,
            queue_wait,
            store_failures,
            usage_records,
            config_load_success,
            config_load_error,
            request_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_decision(&self, outcome: &str, rule: &str) {
        self.decisions.with_label_values(&[outcome, rule]).inc();
    }

    pub fn record_no_rule_request(&self) {
        self.no_rule_requests.inc();
    }

    pub fn record_violation(&self) {
        self.violations_recorded.inc();
    }

    pub fn record_key_blocked(&self) {
        self.keys_blocked.inc();
    }

    pub fn record_queued_request(&self) {
        self.queued_requests.inc();
    }

    pub fn record_queue_timeout(&self) {
        self.queue_timeouts.inc();
    }

    pub fn record_queue_wait(&self, seconds: f64) {
        self.queue_wait.observe(seconds);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.inc();
    }

    pub fn record_usage_record(&self) {
        self.usage_records.inc();
    }

    pub fn record_config_load_success(&self) {
        self.config_load_success.inc();
    }

    pub fn record_config_load_error(&self) {
        self.config_load_error.inc();
    }

    /// Create a timer for measuring decision duration
    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
