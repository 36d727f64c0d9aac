use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::TimeSource;
use crate::error::Result;
use crate::rules::{BillingTier, RequestDescriptor};

/// A billable consumption event, append-only.
///
/// Field names follow the `tenant_usage_tracking` schema. Records are
/// immutable once emitted; rollups happen in the external billing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub resource_type: String,
    pub resource_category: String,
    pub quantity_used: u64,
    pub unit_type: String,
    pub usage_period: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub endpoint_path: String,
    pub request_method: String,
    pub response_status: Option<u16>,
    pub processing_time_ms: Option<u64>,
    pub cost_per_unit: f64,
    pub total_cost: f64,
    pub billing_tier: Option<BillingTier>,
    pub recorded_at: DateTime<Utc>,
}

/// Destination for usage records (billing export pipeline, test buffer, ...)
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append(&self, record: UsageRecord) -> Result<()>;
}

/// Buffers records in memory; the default for tests and local export
#[derive(Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn append(&self, record: UsageRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

/// Emits each record as a structured JSON log line for downstream shipping
pub struct LogUsageSink;

#[async_trait]
impl UsageSink for LogUsageSink {
    async fn append(&self, record: UsageRecord) -> Result<()> {
        info!(target: "tollgate::usage", record = %serde_json::to_string(&record)?, "usage");
        Ok(())
    }
}

/// Billing knobs for the meter
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Whether rejected requests are still billable events
    pub count_rejected_requests: bool,
    /// Unit cost per billing tier; unmatched tiers fall back to `default_cost`
    pub unit_costs: HashMap<BillingTier, f64>,
    pub default_cost: f64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            count_rejected_requests: false,
            unit_costs: HashMap::new(),
            default_cost: 0.0,
        }
    }
}

enum MeterMessage {
    Record(UsageRecord),
    Flush(oneshot::Sender<()>),
}

/// Records resource consumption independent of the gating decision.
///
/// Appends go through an unbounded channel so the request path never waits
/// on the sink; ordering to the sink is preserved.
pub struct UsageMeter {
    tx: mpsc::UnboundedSender<MeterMessage>,
    clock: TimeSource,
    config: MeterConfig,
}

impl UsageMeter {
    pub fn new(sink: Arc<dyn UsageSink>, clock: TimeSource, config: MeterConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    MeterMessage::Record(record) => {
                        if let Err(e) = sink.append(record).await {
                            warn!(error = %e, "Failed to append usage record");
                        }
                    }
                    MeterMessage::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { tx, clock, config }
    }

    /// Whether an event with the given admission result is metered at all.
    pub fn meters(&self, allowed: bool) -> bool {
        allowed || self.config.count_rejected_requests
    }

    /// Append one API-request consumption event. Non-blocking.
    pub fn record_request(
        &self,
        descriptor: &RequestDescriptor,
        allowed: bool,
        processing_time_ms: u64,
    ) {
        if !self.meters(allowed) {
            return;
        }

        let now = self.clock.utc_now();
        let (period_start, period_end) = hourly_period(&now);
        let cost_per_unit = descriptor
            .billing_tier
            .and_then(|tier| self.config.unit_costs.get(&tier).copied())
            .unwrap_or(self.config.default_cost);

        let record = UsageRecord {
            id: Uuid::new_v4(),
            tenant_id: descriptor.tenant_id.clone(),
            user_id: descriptor.user_id.clone(),
            resource_type: "api_request".to_string(),
            resource_category: "traffic".to_string(),
            quantity_used: 1,
            unit_type: "request".to_string(),
            usage_period: "hourly".to_string(),
            period_start,
            period_end,
            endpoint_path: descriptor.endpoint_path.clone(),
            request_method: descriptor.http_method.clone(),
            response_status: None,
            processing_time_ms: Some(processing_time_ms),
            cost_per_unit,
            total_cost: cost_per_unit,
            billing_tier: descriptor.billing_tier,
            recorded_at: now,
        };

        if self.tx.send(MeterMessage::Record(record)).is_err() {
            warn!("Usage meter channel closed, dropping record");
        }
    }

    /// Wait for every previously submitted record to reach the sink.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(MeterMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

fn hourly_period(now: &DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let secs = now.timestamp();
    let start = secs - secs.rem_euclid(3600);
    let period_start = Utc.timestamp_opt(start, 0).single().unwrap_or(*now);
    let period_end = Utc.timestamp_opt(start + 3600, 0).single().unwrap_or(*now);
    (period_start, period_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> RequestDescriptor {
        RequestDescriptor {
            tenant_id: Some("acme".to_string()),
            user_id: Some("u1".to_string()),
            client_ip: None,
            billing_tier: Some(BillingTier::Premium),
            endpoint_path: "/api/orders".to_string(),
            http_method: "POST".to_string(),
        }
    }

    #[tokio::test]
    async fn test_allowed_requests_are_metered() {
        let sink = Arc::new(MemoryUsageSink::new());
        let meter = UsageMeter::new(
            sink.clone(),
            TimeSource::manual(7_200_000),
            MeterConfig::default(),
        );

        meter.record_request(&descriptor(), true, 12);
        meter.flush().await;

        let records = sink.records().await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.tenant_id.as_deref(), Some("acme"));
        assert_eq!(record.quantity_used, 1);
        assert_eq!(record.unit_type, "request");
        assert_eq!(record.processing_time_ms, Some(12));
        assert_eq!(record.period_start.timestamp(), 7_200);
        assert_eq!(record.period_end.timestamp(), 10_800);
    }

    #[tokio::test]
    async fn test_rejected_requests_follow_policy() {
        let sink = Arc::new(MemoryUsageSink::new());
        let meter = UsageMeter::new(
            sink.clone(),
            TimeSource::manual(0),
            MeterConfig::default(),
        );

        meter.record_request(&descriptor(), false, 1);
        meter.flush().await;
        assert!(sink.records().await.is_empty());

        let counting = UsageMeter::new(
            sink.clone(),
            TimeSource::manual(0),
            MeterConfig {
                count_rejected_requests: true,
                ..Default::default()
            },
        );
        counting.record_request(&descriptor(), false, 1);
        counting.flush().await;
        assert_eq!(sink.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_tier_costs_applied() {
        let sink = Arc::new(MemoryUsageSink::new());
        let mut unit_costs = HashMap::new();
        unit_costs.insert(BillingTier::Premium, 0.002);
        let meter = UsageMeter::new(
            sink.clone(),
            TimeSource::manual(0),
            MeterConfig {
                unit_costs,
                default_cost: 0.01,
                ..Default::default()
            },
        );

        meter.record_request(&descriptor(), true, 1);

        let mut free = descriptor();
        free.billing_tier = Some(BillingTier::Free);
        meter.record_request(&free, true, 1);
        meter.flush().await;

        let records = sink.records().await;
        assert_eq!(records[0].cost_per_unit, 0.002);
        assert_eq!(records[0].total_cost, 0.002);
        assert_eq!(records[1].cost_per_unit, 0.01);
    }

    #[tokio::test]
    async fn test_records_preserve_submission_order() {
        let sink = Arc::new(MemoryUsageSink::new());
        let meter = UsageMeter::new(
            sink.clone(),
            TimeSource::manual(0),
            MeterConfig::default(),
        );

        for i in 0..5 {
            let mut d = descriptor();
            d.endpoint_path = format!("/api/{}", i);
            meter.record_request(&d, true, i);
        }
        meter.flush().await;

        let paths: Vec<String> = sink
            .records()
            .await
            .iter()
            .map(|r| r.endpoint_path.clone())
            .collect();
        assert_eq!(paths, vec!["/api/0", "/api/1", "/api/2", "/api/3", "/api/4"]);
    }
}
