use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GateError, Result};

/// Rate limiting algorithm for a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Fixed,
    Sliding,
    TokenBucket,
}

/// What to do with traffic that exceeds the quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockAction {
    Reject,
    Queue,
    Throttle,
}

/// Service level determining default quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingTier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

/// A configured quota policy, as loaded from the rule file.
///
/// Field names follow the `api_rate_limiting_rules` schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub rule_name: String,
    #[serde(default)]
    pub rule_description: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub billing_tier: Option<BillingTier>,
    pub endpoint_pattern: String,
    #[serde(default)]
    pub http_methods: Vec<String>,
    pub max_requests: u64,
    pub time_window_seconds: i64,
    #[serde(default)]
    pub burst_allowance: i64,
    #[serde(default = "default_algorithm")]
    pub rate_limit_type: Algorithm,
    #[serde(default)]
    pub priority_level: i32,
    #[serde(default)]
    pub enable_queuing: bool,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_seconds: u64,
    #[serde(default = "default_block_action")]
    pub block_action: BlockAction,
    #[serde(default = "default_retry_after")]
    pub retry_after_seconds: u64,
    #[serde(default)]
    pub custom_error_message: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_algorithm() -> Algorithm {
    Algorithm::Fixed
}

fn default_queue_timeout() -> u64 {
    30
}

fn default_block_action() -> BlockAction {
    BlockAction::Reject
}

fn default_retry_after() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// A validated rule with its endpoint pattern compiled, ready for the
/// request path. Rule ids are generated here, never by the storage layer,
/// and derive deterministically from the unique rule name so counter state
/// keyed on the id survives snapshot reloads.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: Uuid,
    pub name: String,
    pub tenant_id: Option<String>,
    pub billing_tier: Option<BillingTier>,
    pub endpoint: Regex,
    /// Uppercased method set; empty means any method
    pub http_methods: Vec<String>,
    pub max_requests: u64,
    pub window_seconds: i64,
    pub burst_allowance: u64,
    pub algorithm: Algorithm,
    pub priority_level: i32,
    pub enable_queuing: bool,
    pub queue_timeout_seconds: u64,
    pub block_action: BlockAction,
    pub retry_after_seconds: u64,
    pub custom_error_message: Option<String>,
}

impl CompiledRule {
    /// Validate and compile a rule definition.
    pub fn compile(def: &RuleDefinition) -> Result<Self> {
        if def.time_window_seconds <= 0 {
            return Err(GateError::Config(format!(
                "Rule '{}' has non-positive window: {}",
                def.rule_name, def.time_window_seconds
            )));
        }
        if def.burst_allowance < 0 {
            return Err(GateError::Config(format!(
                "Rule '{}' has negative burst allowance: {}",
                def.rule_name, def.burst_allowance
            )));
        }
        if def.max_requests == 0 {
            return Err(GateError::Config(format!(
                "Rule '{}' has zero max_requests",
                def.rule_name
            )));
        }
        let endpoint = Regex::new(&def.endpoint_pattern).map_err(|e| {
            GateError::Config(format!(
                "Rule '{}' has invalid endpoint pattern: {}",
                def.rule_name, e
            ))
        })?;

        Ok(Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, def.rule_name.as_bytes()),
            name: def.rule_name.clone(),
            tenant_id: def.tenant_id.clone(),
            billing_tier: def.billing_tier,
            endpoint,
            http_methods: def
                .http_methods
                .iter()
                .map(|m| m.to_ascii_uppercase())
                .collect(),
            max_requests: def.max_requests,
            window_seconds: def.time_window_seconds,
            burst_allowance: def.burst_allowance as u64,
            algorithm: def.rate_limit_type,
            priority_level: def.priority_level,
            enable_queuing: def.enable_queuing,
            queue_timeout_seconds: def.queue_timeout_seconds,
            block_action: def.block_action,
            retry_after_seconds: def.retry_after_seconds,
            custom_error_message: def.custom_error_message.clone(),
        })
    }

    /// Total admissible requests per window, burst included
    pub fn capacity(&self) -> u64 {
        self.max_requests + self.burst_allowance
    }

    pub fn window_ms(&self) -> i64 {
        self.window_seconds * 1000
    }

    /// Whether delayed admission applies to over-quota traffic on this rule
    pub fn queues_excess(&self) -> bool {
        self.enable_queuing
            || matches!(self.block_action, BlockAction::Queue | BlockAction::Throttle)
    }

    /// Whether this rule applies to the given request.
    pub fn matches(&self, descriptor: &RequestDescriptor) -> bool {
        if let Some(tenant) = &self.tenant_id {
            if descriptor.tenant_id.as_deref() != Some(tenant.as_str()) {
                return false;
            }
        }
        if let Some(tier) = self.billing_tier {
            if descriptor.billing_tier != Some(tier) {
                return false;
            }
        }
        if !self.http_methods.is_empty() {
            let method = descriptor.http_method.to_ascii_uppercase();
            if !self.http_methods.iter().any(|m| *m == method) {
                return false;
            }
        }
        self.endpoint.is_match(&descriptor.endpoint_path)
    }

    /// Specificity rank for diagnostics: tenant+endpoint > tier+endpoint >
    /// endpoint-only > global (catch-all pattern, no scope).
    pub fn specificity(&self) -> u8 {
        if self.tenant_id.is_some() {
            3
        } else if self.billing_tier.is_some() {
            2
        } else if is_catch_all(self.endpoint.as_str()) {
            0
        } else {
            1
        }
    }
}

fn is_catch_all(pattern: &str) -> bool {
    matches!(pattern, ".*" | "^.*$" | ".+" | "^.+$")
}

/// Descriptor for one incoming request, supplied by the upstream auth layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDescriptor {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub billing_tier: Option<BillingTier>,
    pub endpoint_path: String,
    pub http_method: String,
}

impl RequestDescriptor {
    /// Identifier under which quota state is tracked: tenant plus user
    /// (falling back to client IP).
    pub fn identifier(&self) -> String {
        let tenant = self.tenant_id.as_deref().unwrap_or("-");
        let subject = self
            .user_id
            .as_deref()
            .or(self.client_ip.as_deref())
            .unwrap_or("-");
        format!("{}:{}", tenant, subject)
    }
}

/// Immutable, validated rule set distributed to the request path.
///
/// Built once at load (or reload) time; never mutated mid-evaluation.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    rules: Vec<CompiledRule>,
}

impl RuleSnapshot {
    /// Compile a set of definitions into a snapshot. Invalid rules are
    /// excluded with a warning; inactive rules are skipped.
    pub fn compile(definitions: &[RuleDefinition]) -> Self {
        let mut rules = Vec::with_capacity(definitions.len());
        for def in definitions {
            if !def.is_active {
                continue;
            }
            match CompiledRule::compile(def) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    warn!(rule = %def.rule_name, error = %e, "Excluding invalid rule");
                }
            }
        }
        // Most specific first; priority breaks ties within a class.
        rules.sort_by(|a, b| {
            b.specificity()
                .cmp(&a.specificity())
                .then(b.priority_level.cmp(&a.priority_level))
                .then(a.name.cmp(&b.name))
        });
        info!(active_rules = rules.len(), "Compiled rule snapshot");
        Self { rules }
    }

    /// All active rules matching the descriptor, most specific first.
    ///
    /// Every returned rule must individually permit the request; the first
    /// one doubles as the diagnostic "most specific" match.
    pub fn resolve(&self, descriptor: &RequestDescriptor) -> Vec<&CompiledRule> {
        self.rules.iter().filter(|r| r.matches(descriptor)).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<RuleDefinition>,
}

/// Load rule definitions from a YAML string
pub fn load_rules_from_yaml(yaml: &str) -> Result<Vec<RuleDefinition>> {
    let file: RuleFile = serde_yaml::from_str(yaml)
        .map_err(|e| GateError::Config(format!("Failed to parse rule file: {}", e)))?;
    Ok(file.rules)
}

/// Load rule definitions from a YAML file
pub fn load_rules_from_file(path: &str) -> Result<Vec<RuleDefinition>> {
    let content = std::fs::read_to_string(path)?;
    load_rules_from_yaml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn rule_def(name: &str) -> RuleDefinition {
        RuleDefinition {
            rule_name: name.to_string(),
            rule_description: None,
            tenant_id: None,
            billing_tier: None,
            endpoint_pattern: "^/api/.*".to_string(),
            http_methods: vec![],
            max_requests: 100,
            time_window_seconds: 60,
            burst_allowance: 0,
            rate_limit_type: Algorithm::Fixed,
            priority_level: 0,
            enable_queuing: false,
            queue_timeout_seconds: 30,
            block_action: BlockAction::Reject,
            retry_after_seconds: 60,
            custom_error_message: None,
            is_active: true,
        }
    }

    fn descriptor(path: &str, method: &str) -> RequestDescriptor {
        RequestDescriptor {
            tenant_id: Some("acme".to_string()),
            user_id: Some("u1".to_string()),
            client_ip: None,
            billing_tier: Some(BillingTier::Premium),
            endpoint_path: path.to_string(),
            http_method: method.to_string(),
        }
    }

    #[test]
    fn test_rule_id_stable_across_recompiles() {
        let def = rule_def("api-default");
        let first = CompiledRule::compile(&def).unwrap();
        let second = CompiledRule::compile(&def).unwrap();
        assert_eq!(first.id, second.id);

        let other = CompiledRule::compile(&rule_def("other")).unwrap();
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn test_compile_rejects_bad_regex() {
        let mut def = rule_def("bad");
        def.endpoint_pattern = "([unclosed".to_string();
        assert!(matches!(
            CompiledRule::compile(&def),
            Err(GateError::Config(_))
        ));
    }

    #[test]
    fn test_compile_rejects_non_positive_window() {
        let mut def = rule_def("bad");
        def.time_window_seconds = 0;
        assert!(CompiledRule::compile(&def).is_err());
    }

    #[test]
    fn test_compile_rejects_negative_burst() {
        let mut def = rule_def("bad");
        def.burst_allowance = -5;
        assert!(CompiledRule::compile(&def).is_err());
    }

    #[test]
    fn test_invalid_rule_excluded_from_snapshot() {
        let mut bad = rule_def("bad");
        bad.endpoint_pattern = "([".to_string();
        let good = rule_def("good");
        let snapshot = RuleSnapshot::compile(&[bad, good]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.rules()[0].name, "good");
    }

    #[test]
    fn test_inactive_rule_skipped() {
        let mut def = rule_def("dormant");
        def.is_active = false;
        let snapshot = RuleSnapshot::compile(&[def]);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_method_filter() {
        let mut def = rule_def("writes");
        def.http_methods = vec!["post".to_string(), "PUT".to_string()];
        let rule = CompiledRule::compile(&def).unwrap();

        assert!(rule.matches(&descriptor("/api/orders", "POST")));
        assert!(rule.matches(&descriptor("/api/orders", "put")));
        assert!(!rule.matches(&descriptor("/api/orders", "GET")));
    }

    #[test]
    fn test_tenant_scope() {
        let mut def = rule_def("tenant-scoped");
        def.tenant_id = Some("acme".to_string());
        let rule = CompiledRule::compile(&def).unwrap();

        assert!(rule.matches(&descriptor("/api/x", "GET")));

        let mut other = descriptor("/api/x", "GET");
        other.tenant_id = Some("globex".to_string());
        assert!(!rule.matches(&other));
    }

    #[test]
    fn test_tier_scope() {
        let mut def = rule_def("premium-only");
        def.billing_tier = Some(BillingTier::Premium);
        let rule = CompiledRule::compile(&def).unwrap();

        assert!(rule.matches(&descriptor("/api/x", "GET")));

        let mut free = descriptor("/api/x", "GET");
        free.billing_tier = Some(BillingTier::Free);
        assert!(!rule.matches(&free));
    }

    #[test]
    fn test_resolve_returns_all_matches_most_specific_first() {
        let mut tenant_rule = rule_def("tenant");
        tenant_rule.tenant_id = Some("acme".to_string());
        let mut tier_rule = rule_def("tier");
        tier_rule.billing_tier = Some(BillingTier::Premium);
        let endpoint_rule = rule_def("endpoint");
        let mut global_rule = rule_def("global");
        global_rule.endpoint_pattern = ".*".to_string();

        let snapshot =
            RuleSnapshot::compile(&[global_rule, endpoint_rule, tier_rule, tenant_rule]);
        let matches = snapshot.resolve(&descriptor("/api/x", "GET"));

        let names: Vec<&str> = matches.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["tenant", "tier", "endpoint", "global"]);
    }

    #[test]
    fn test_priority_breaks_ties() {
        let mut low = rule_def("low");
        low.priority_level = 1;
        let mut high = rule_def("high");
        high.priority_level = 10;

        let snapshot = RuleSnapshot::compile(&[low, high]);
        let matches = snapshot.resolve(&descriptor("/api/x", "GET"));
        assert_eq!(matches[0].name, "high");
    }

    #[test]
    fn test_identifier_falls_back_to_client_ip() {
        let mut d = descriptor("/api/x", "GET");
        assert_eq!(d.identifier(), "acme:u1");
        d.user_id = None;
        d.client_ip = Some("10.0.0.1".to_string());
        assert_eq!(d.identifier(), "acme:10.0.0.1");
    }

    #[test]
    fn test_load_rules_from_yaml() {
        let yaml = r#"
rules:
  - rule_name: api-default
    endpoint_pattern: "^/api/.*"
    max_requests: 100
    time_window_seconds: 3600
    rate_limit_type: token_bucket
    burst_allowance: 20
    http_methods: [GET, POST]
  - rule_name: search-heavy
    endpoint_pattern: "^/api/search"
    billing_tier: free
    max_requests: 10
    time_window_seconds: 60
    enable_queuing: true
    queue_timeout_seconds: 5
"#;
        let defs = load_rules_from_yaml(yaml).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].rate_limit_type, Algorithm::TokenBucket);
        assert_eq!(defs[0].burst_allowance, 20);
        assert_eq!(defs[1].billing_tier, Some(BillingTier::Free));
        assert!(defs[1].enable_queuing);

        let snapshot = RuleSnapshot::compile(&defs);
        assert_eq!(snapshot.len(), 2);
    }
}
