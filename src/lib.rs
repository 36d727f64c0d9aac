//! Tollgate
//!
//! A multi-tenant API gating engine: per-tenant and per-tier rate limiting
//! rules, delayed admission queues for over-quota traffic, escalation of
//! repeat offenders into temporary blocks, and usage metering for billing.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod queue;
pub mod redis;
pub mod rules;
pub mod store;
pub mod usage;
pub mod violations;

// Re-export main types
pub use engine::{GateDecision, GateEngine, Outcome};
pub use error::{GateError, Result};
pub use rules::{RequestDescriptor, RuleSnapshot};
pub use store::CounterStore;
