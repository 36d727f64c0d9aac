use std::sync::Arc;
use std::time::Duration;

use tollgate::{
    clock::TimeSource,
    config::{DefaultPolicy, EngineSettings},
    engine::{GateEngine, Outcome},
    metrics::Metrics,
    rules::{load_rules_from_yaml, BillingTier, RequestDescriptor, RuleSnapshot},
    store::MemoryCounterStore,
    usage::MemoryUsageSink,
};

fn descriptor(tenant: &str, tier: BillingTier, path: &str) -> RequestDescriptor {
    RequestDescriptor {
        tenant_id: Some(tenant.to_string()),
        user_id: Some("u1".to_string()),
        client_ip: None,
        billing_tier: Some(tier),
        endpoint_path: path.to_string(),
        http_method: "GET".to_string(),
    }
}

fn engine_with(
    settings: EngineSettings,
    clock: TimeSource,
    sink: Arc<MemoryUsageSink>,
    rules_yaml: &str,
) -> GateEngine {
    let engine = GateEngine::new(
        Arc::new(MemoryCounterStore::new()),
        sink,
        settings,
        clock,
        Arc::new(Metrics::new().unwrap()),
    );
    let defs = load_rules_from_yaml(rules_yaml).unwrap();
    engine.install_snapshot(RuleSnapshot::compile(&defs));
    engine
}

#[tokio::test]
async fn test_free_tier_hourly_quota_lifecycle() {
    let yaml = r#"
rules:
  - rule_name: free-hourly
    billing_tier: free
    endpoint_pattern: "^/api/.*"
    max_requests: 100
    time_window_seconds: 3600
"#;
    let clock = TimeSource::manual(0);
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = engine_with(EngineSettings::default(), clock.clone(), sink.clone(), yaml);
    let d = descriptor("acme", BillingTier::Free, "/api/orders");

    for _ in 0..100 {
        let decision = engine.check(&d).await;
        assert_eq!(decision.outcome, Outcome::Allow);
    }

    // Over quota: retry hint counts down toward the window end.
    clock.advance_ms(1_000_000);
    let decision = engine.check(&d).await;
    assert_eq!(decision.outcome, Outcome::Reject);
    assert_eq!(decision.retry_after_secs, Some(2_600));
    assert_eq!(decision.matched_rule.as_deref(), Some("free-hourly"));

    // A fresh window restores the full quota.
    clock.advance_ms(2_600_000);
    let decision = engine.check(&d).await;
    assert_eq!(decision.outcome, Outcome::Allow);

    // Only admitted requests were metered under the default policy.
    engine.flush_usage().await;
    assert_eq!(sink.records().await.len(), 101);
}

#[tokio::test]
async fn test_queued_request_admitted_when_capacity_frees() {
    // 20 tokens per second: the bucket refills one slot every 50ms,
    // comfortably inside the queue timeout.
    let yaml = r#"
rules:
  - rule_name: burst-queue
    endpoint_pattern: "^/api/.*"
    max_requests: 20
    time_window_seconds: 1
    rate_limit_type: token_bucket
    enable_queuing: true
    queue_timeout_seconds: 2
"#;
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = engine_with(
        EngineSettings::default(),
        TimeSource::system(),
        sink,
        yaml,
    );
    let d = descriptor("acme", BillingTier::Premium, "/api/orders");

    // Drain the bucket.
    loop {
        let decision = engine.check(&d).await;
        assert_eq!(decision.outcome, Outcome::Allow);
        if decision.queued {
            break;
        }
    }

    // The queued request resolved as an Allow after a real wait.
    let decision = engine.check(&d).await;
    assert_eq!(decision.outcome, Outcome::Allow);
}

#[tokio::test]
async fn test_queue_timeout_is_distinct_from_reject() {
    let yaml = r#"
rules:
  - rule_name: hard-cap
    endpoint_pattern: "^/api/.*"
    max_requests: 1
    time_window_seconds: 3600
    enable_queuing: true
    queue_timeout_seconds: 1
    retry_after_seconds: 120
"#;
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = engine_with(
        EngineSettings::default(),
        TimeSource::system(),
        sink,
        yaml,
    );
    let d = descriptor("acme", BillingTier::Premium, "/api/orders");

    assert_eq!(engine.check(&d).await.outcome, Outcome::Allow);

    // No capacity frees within the hour, so the ticket expires.
    let decision = engine.check(&d).await;
    assert_eq!(decision.outcome, Outcome::QueueTimeout);
    assert_eq!(decision.retry_after_secs, Some(120));
    assert!(decision
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
}

#[tokio::test]
async fn test_all_matching_rules_must_admit() {
    let yaml = r#"
rules:
  - rule_name: tenant-cap
    tenant_id: acme
    endpoint_pattern: "^/api/export"
    max_requests: 2
    time_window_seconds: 3600
  - rule_name: premium-cap
    billing_tier: premium
    endpoint_pattern: "^/api/.*"
    max_requests: 1000
    time_window_seconds: 3600
  - rule_name: global-floor
    endpoint_pattern: ".*"
    max_requests: 10000
    time_window_seconds: 3600
"#;
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = engine_with(
        EngineSettings::default(),
        TimeSource::manual(0),
        sink,
        yaml,
    );
    let d = descriptor("acme", BillingTier::Premium, "/api/export");

    assert_eq!(engine.check(&d).await.outcome, Outcome::Allow);
    assert_eq!(engine.check(&d).await.outcome, Outcome::Allow);

    // The broad tier and global rules still have capacity; the narrow
    // tenant rule alone forces the rejection.
    let decision = engine.check(&d).await;
    assert_eq!(decision.outcome, Outcome::Reject);
    assert_eq!(decision.matched_rule.as_deref(), Some("tenant-cap"));

    // A different endpoint under the same tenant only hits the broad rules.
    let other = descriptor("acme", BillingTier::Premium, "/api/orders");
    assert_eq!(engine.check(&other).await.outcome, Outcome::Allow);
}

#[tokio::test]
async fn test_repeat_offender_blocked_then_recovers() {
    let yaml = r#"
rules:
  - rule_name: tight
    endpoint_pattern: "^/api/.*"
    max_requests: 1
    time_window_seconds: 1
    retry_after_seconds: 1
"#;
    let settings = EngineSettings {
        violation_block_threshold: 3,
        ..Default::default()
    };
    let clock = TimeSource::manual(0);
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = engine_with(settings, clock.clone(), sink, yaml);
    let d = descriptor("acme", BillingTier::Basic, "/api/orders");

    assert_eq!(engine.check(&d).await.outcome, Outcome::Allow);
    for _ in 0..2 {
        assert_eq!(engine.check(&d).await.outcome, Outcome::Reject);
    }
    // Third rejection crosses the threshold and stamps the block.
    let decision = engine.check(&d).await;
    assert_eq!(decision.outcome, Outcome::Reject);
    assert!(decision.blocked_until.is_some());

    // While blocked, requests short-circuit with the block deadline.
    let decision = engine.check(&d).await;
    assert_eq!(decision.outcome, Outcome::Blocked);
    let blocked_until = decision.blocked_until.unwrap();
    assert!(blocked_until.timestamp_millis() > clock.now_ms());

    // After the block lapses the key is served again, and a successful
    // admission resets the violation streak.
    clock.advance_ms(3_600_000);
    assert_eq!(engine.check(&d).await.outcome, Outcome::Allow);
    clock.advance_ms(10);
    assert_eq!(engine.check(&d).await.outcome, Outcome::Reject);
}

#[tokio::test]
async fn test_default_deny_without_matching_rule() {
    let settings = EngineSettings {
        default_policy: DefaultPolicy::Deny,
        ..Default::default()
    };
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = engine_with(settings, TimeSource::manual(0), sink, "rules: []");

    let d = descriptor("acme", BillingTier::Free, "/internal/admin");
    let decision = engine.check(&d).await;
    assert_eq!(decision.outcome, Outcome::Reject);
    assert!(decision.matched_rule.is_none());
}

#[tokio::test]
async fn test_tenants_do_not_share_counters() {
    let yaml = r#"
rules:
  - rule_name: per-key
    endpoint_pattern: "^/api/.*"
    max_requests: 1
    time_window_seconds: 3600
"#;
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = engine_with(
        EngineSettings::default(),
        TimeSource::manual(0),
        sink,
        yaml,
    );

    let acme = descriptor("acme", BillingTier::Free, "/api/x");
    let globex = descriptor("globex", BillingTier::Free, "/api/x");

    assert_eq!(engine.check(&acme).await.outcome, Outcome::Allow);
    assert_eq!(engine.check(&acme).await.outcome, Outcome::Reject);

    // A different tenant tracks against its own counter.
    assert_eq!(engine.check(&globex).await.outcome, Outcome::Allow);
}

#[tokio::test]
async fn test_burst_allowance_extends_sustained_rate() {
    let yaml = r#"
rules:
  - rule_name: bursty
    endpoint_pattern: "^/api/.*"
    max_requests: 5
    time_window_seconds: 3600
    burst_allowance: 3
"#;
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = engine_with(
        EngineSettings::default(),
        TimeSource::manual(0),
        sink,
        yaml,
    );
    let d = descriptor("acme", BillingTier::Premium, "/api/orders");

    for _ in 0..8 {
        assert_eq!(engine.check(&d).await.outcome, Outcome::Allow);
    }
    assert_eq!(engine.check(&d).await.outcome, Outcome::Reject);
}

#[tokio::test]
async fn test_usage_metering_survives_queue_wait() {
    let yaml = r#"
rules:
  - rule_name: refill-queue
    endpoint_pattern: "^/api/.*"
    max_requests: 10
    time_window_seconds: 1
    rate_limit_type: token_bucket
    enable_queuing: true
    queue_timeout_seconds: 2
"#;
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = engine_with(
        EngineSettings::default(),
        TimeSource::system(),
        sink.clone(),
        yaml,
    );
    let d = descriptor("acme", BillingTier::Premium, "/api/orders");

    let mut admitted = 0;
    for _ in 0..12 {
        if engine.check(&d).await.outcome == Outcome::Allow {
            admitted += 1;
        }
    }
    engine.flush_usage().await;

    // Queued-then-admitted requests are billed exactly once.
    assert_eq!(sink.records().await.len(), admitted);
}

#[tokio::test]
async fn test_concurrent_checks_never_oversubscribe() {
    let yaml = r#"
rules:
  - rule_name: narrow
    endpoint_pattern: "^/api/.*"
    max_requests: 5
    time_window_seconds: 3600
"#;
    let sink = Arc::new(MemoryUsageSink::new());
    let engine = Arc::new(engine_with(
        EngineSettings::default(),
        TimeSource::manual(0),
        sink,
        yaml,
    ));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .check(&descriptor("acme", BillingTier::Premium, "/api/x"))
                .await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().outcome == Outcome::Allow {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);
}
