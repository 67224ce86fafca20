//! # Stage: Declarative Router Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that describes a router instance: wire
//! protocol limits, routing strategy, the arm catalogue, the prewarm
//! scheduler, and per-stream orchestration limits.
//! ```text
//! stream-router --config router.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RouterConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Defaulted: every section and field except the arm identities is optional
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the runtime from config (that belongs to `orchestrator`)
//! - Routing semantics of the values (that belongs to `routing`)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::prewarm::PrewarmConfig;
use crate::protocol::{DEFAULT_MAX_FRAME_BYTES, PROTOCOL_VERSION};
use crate::routing::{ArmSpec, RoutingConfig};

// ── Default value functions ──────────────────────────────────────────────

/// Default heartbeat interval: 30 s.
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_protocol_version() -> u16 {
    PROTOCOL_VERSION
}

/// Default latency SLO when a request does not carry one: 30 s.
fn default_latency_slo_ms() -> u64 {
    30_000
}

/// Default hard per-stream timeout: 2 min.
fn default_hard_timeout_ms() -> u64 {
    120_000
}

/// Default channel capacity for session inbound/outbound queues.
fn default_buffer() -> usize {
    256
}

/// Default characters per token when estimating prompt size.
fn default_chars_per_token() -> u64 {
    4
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a router instance.
///
/// # Example
///
/// ```toml
/// [routing]
/// policy = "ucb"
///
/// [[arms]]
/// id = "small"
/// resource_class = "gpu-small"
/// backend = "echo"
/// usd_micros_per_1k_tokens = 200
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterConfig {
    /// Wire protocol limits.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Arm selection strategy and bookkeeping.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Arms available at startup.
    #[serde(default)]
    pub arms: Vec<ArmSpec>,
    /// Predictive prewarm scheduler.
    #[serde(default)]
    pub prewarm: PrewarmConfig,
    /// Per-stream orchestration limits.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Protocol ─────────────────────────────────────────────────────────────

/// Wire protocol limits.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// A session with no inbound frame for longer than this is expired.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Inbound frames larger than this are rejected. Default: 1 MiB.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Accepted value of the frame `v` field.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            protocol_version: default_protocol_version(),
        }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Per-stream orchestration limits.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Latency SLO applied when the request metadata has none.
    #[serde(default = "default_latency_slo_ms")]
    pub default_latency_slo_ms: u64,
    /// A stream still running after this long fails with `BACKEND_ERROR`.
    #[serde(default = "default_hard_timeout_ms")]
    pub hard_timeout_ms: u64,
    /// Outbound frame queue per session.
    #[serde(default = "default_buffer")]
    pub outbound_buffer: usize,
    /// Inbound frame queue per session.
    #[serde(default = "default_buffer")]
    pub inbound_buffer: usize,
    /// Prompt characters per estimated token.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_latency_slo_ms: default_latency_slo_ms(),
            hard_timeout_ms: default_hard_timeout_ms(),
            outbound_buffer: default_buffer(),
            inbound_buffer: default_buffer(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Logging and metrics settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// Log output format. `LOG_FORMAT` overrides it at startup.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Port the demo binary prints metrics for. `None` disables it.
    pub metrics_port: Option<u16>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// Value understood by `LOG_FORMAT`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

/// Export the JSON Schema for `RouterConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RouterConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::PolicyKind;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: RouterConfig = toml::from_str("").unwrap();
        assert_eq!(config, RouterConfig::default());
        assert_eq!(config.protocol.heartbeat_interval_ms, 30_000);
        assert_eq!(config.orchestrator.hard_timeout_ms, 120_000);
        assert!(config.arms.is_empty());
    }

    #[test]
    fn test_full_toml_parses() {
        let config: RouterConfig = toml::from_str(
            r#"
[protocol]
heartbeat_interval_ms = 5000

[routing]
policy = "contextual"
contextual_base = "ucb"
challenger_fraction = 0.1
seed = 7

[[arms]]
id = "small"
resource_class = "gpu-small"
backend = "echo"
usd_micros_per_1k_tokens = 200

[[arms]]
id = "large"
resource_class = "gpu-large"
backend = "echo"
quality = 0.9
challenger = true

[prewarm]
lead_time_s = 60

[orchestrator]
chars_per_token = 3

[observability]
log_format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.protocol.heartbeat_interval_ms, 5000);
        assert_eq!(config.routing.policy, PolicyKind::Contextual);
        assert_eq!(config.routing.contextual_base, PolicyKind::Ucb);
        assert_eq!(config.routing.seed, Some(7));
        assert_eq!(config.arms.len(), 2);
        assert_eq!(config.arms[0].expected_latency_ms, 1000);
        assert!(config.arms[1].challenger);
        assert_eq!(config.prewarm.lead_time_s, 60);
        assert_eq!(config.prewarm.min_observations, 10);
        assert_eq!(config.orchestrator.chars_per_token, 3);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn test_log_format_as_str_matches_env_values() {
        assert_eq!(LogFormat::Json.as_str(), "json");
        assert_eq!(LogFormat::Pretty.as_str(), "pretty");
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().unwrap();
        let value: serde_json::Value = serde_json::from_str(&schema).unwrap();
        assert!(value.get("properties").is_some());
    }
}
