use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{GateError, Result};
use crate::rules::BillingTier;
use crate::usage::MeterConfig;
use crate::violations::ViolationConfig;

/// What happens when no rule matches a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    Allow,
    Deny,
}

/// How the engine behaves when the counter store is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Allow the request and log the failure
    Open,
    /// Reject the request
    Closed,
}

/// Engine-wide settings, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_policy")]
    pub default_policy: DefaultPolicy,
    #[serde(default = "default_fail_policy")]
    pub fail_policy: FailPolicy,
    #[serde(default = "default_block_threshold")]
    pub violation_block_threshold: u32,
    #[serde(default = "default_observation_seconds")]
    pub violation_observation_seconds: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_block_seconds")]
    pub max_block_seconds: u64,
    #[serde(default)]
    pub count_rejected_requests: bool,
    #[serde(default)]
    pub unit_costs: HashMap<BillingTier, f64>,
    #[serde(default)]
    pub default_unit_cost: f64,
    /// Counters idle longer than this are garbage-collected
    #[serde(default = "default_counter_idle_seconds")]
    pub counter_idle_seconds: u64,
}

fn default_policy() -> DefaultPolicy {
    DefaultPolicy::Allow
}

fn default_fail_policy() -> FailPolicy {
    FailPolicy::Open
}

fn default_block_threshold() -> u32 {
    5
}

fn default_observation_seconds() -> u64 {
    300
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_block_seconds() -> u64 {
    86_400
}

fn default_counter_idle_seconds() -> u64 {
    3_600
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_policy: default_policy(),
            fail_policy: default_fail_policy(),
            violation_block_threshold: default_block_threshold(),
            violation_observation_seconds: default_observation_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
            max_block_seconds: default_max_block_seconds(),
            count_rejected_requests: false,
            unit_costs: HashMap::new(),
            default_unit_cost: 0.0,
            counter_idle_seconds: default_counter_idle_seconds(),
        }
    }
}

impl EngineSettings {
    pub fn violation_config(&self) -> ViolationConfig {
        ViolationConfig {
            block_threshold: self.violation_block_threshold,
            observation_window: Duration::from_secs(self.violation_observation_seconds),
            backoff_multiplier: self.backoff_multiplier,
            max_block_secs: self.max_block_seconds,
        }
    }

    pub fn meter_config(&self) -> MeterConfig {
        MeterConfig {
            count_rejected_requests: self.count_rejected_requests,
            unit_costs: self.unit_costs.clone(),
            default_cost: self.default_unit_cost,
        }
    }
}

/// Load engine settings from a YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<EngineSettings> {
    serde_yaml::from_str(yaml)
        .map_err(|e| GateError::Config(format!("Failed to parse settings: {}", e)))
}

/// Load engine settings from a YAML file
pub fn load_settings_from_file(path: &str) -> Result<EngineSettings> {
    let content = std::fs::read_to_string(path)?;
    load_settings_from_yaml(&content)
}
