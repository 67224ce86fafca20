//! Routing configuration types.
//!
//! [`RoutingConfig`] tunes the selection policy, reward shaping, dedupe
//! retention, and arm health. [`ArmSpec`] describes one routable arm. All
//! fields have defaults and are (de)serialisable for TOML config files.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ArmId, ResourceClass};

// ── Default value functions ────────────────────────────────────────────

/// Default UCB exploration constant.
fn default_ucb_c() -> f64 {
    2.0
}

/// Default minimum trials before a contextual bucket is trusted.
fn default_min_context_trials() -> u64 {
    20
}

/// Default score tolerance under which two arms count as tied.
fn default_tie_epsilon() -> f64 {
    1e-9
}

/// Default duplicate-id retention: one hour.
fn default_dedup_retention_s() -> u64 {
    3600
}

/// Default maximum remembered request ids.
fn default_dedup_max_entries() -> usize {
    100_000
}

/// Default consecutive failures before an arm is retired.
fn default_retire_after_failures() -> u32 {
    5
}

/// Default weight of the latency penalty in reward shaping.
fn default_latency_weight() -> f64 {
    0.2
}

/// Default weight of the cost penalty in reward shaping.
fn default_cost_weight() -> f64 {
    0.2
}

/// Default time a resource class stays warm after serving a request.
fn default_warm_after_use_s() -> u64 {
    60
}

fn default_quality() -> f64 {
    0.5
}

fn default_expected_latency_ms() -> u64 {
    1000
}

fn default_max_in_flight() -> u32 {
    64
}

// ── Policy selection ───────────────────────────────────────────────────

/// Which selection strategy the engine is built with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Beta-posterior Thompson sampling.
    #[default]
    Thompson,
    /// Upper confidence bound.
    Ucb,
    /// Per-context buckets over a Thompson or UCB base.
    Contextual,
}

// ── RoutingConfig ──────────────────────────────────────────────────────

/// Configuration for the routing decision engine.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingConfig {
    /// Selection strategy. Default: `thompson`.
    #[serde(default)]
    pub policy: PolicyKind,

    /// Base strategy inside each context bucket when `policy = "contextual"`.
    /// Must be `thompson` or `ucb`. Default: `thompson`.
    #[serde(default)]
    pub contextual_base: PolicyKind,

    /// UCB exploration constant `c`. Default: `2.0`.
    #[serde(default = "default_ucb_c")]
    pub ucb_c: f64,

    /// Trials a context bucket needs before it is used instead of the
    /// global bucket. Default: `20`.
    #[serde(default = "default_min_context_trials")]
    pub min_context_trials: u64,

    /// Scores within this distance are ties. Default: `1e-9`.
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f64,

    /// Fraction of non-gold traffic mirrored to a challenger arm.
    ///
    /// Range: `0.0..=1.0`. Default: `0.0`.
    #[serde(default)]
    pub challenger_fraction: f64,

    /// How long request ids are remembered for outcome and charge dedupe.
    /// Default: `3600`.
    #[serde(default = "default_dedup_retention_s")]
    pub dedup_retention_s: u64,

    /// Upper bound on remembered request ids. Default: `100000`.
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,

    /// Consecutive failures that retire an arm. Default: `5`.
    #[serde(default = "default_retire_after_failures")]
    pub retire_after_failures: u32,

    /// Weight of `latency / slo` subtracted from a successful reward.
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,

    /// Weight of `cost / max_cost` subtracted from a successful reward.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,

    /// Seconds a resource class counts as warm after serving a request.
    #[serde(default = "default_warm_after_use_s")]
    pub warm_after_use_s: u64,

    /// Fixed RNG seed. `None` seeds from OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            contextual_base: PolicyKind::default(),
            ucb_c: default_ucb_c(),
            min_context_trials: default_min_context_trials(),
            tie_epsilon: default_tie_epsilon(),
            challenger_fraction: 0.0,
            dedup_retention_s: default_dedup_retention_s(),
            dedup_max_entries: default_dedup_max_entries(),
            retire_after_failures: default_retire_after_failures(),
            latency_weight: default_latency_weight(),
            cost_weight: default_cost_weight(),
            warm_after_use_s: default_warm_after_use_s(),
            seed: None,
        }
    }
}

// ── ArmSpec ────────────────────────────────────────────────────────────

/// Static description of one routable arm.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ArmSpec {
    /// Unique arm id.
    pub id: ArmId,
    /// Resource class (model tier) the arm runs on.
    pub resource_class: ResourceClass,
    /// Name of the backend adapter that serves this arm.
    pub backend: String,
    /// Price per 1 000 tokens in micro-USD.
    #[serde(default)]
    pub usd_micros_per_1k_tokens: u64,
    /// Latency assumed before any observation, in milliseconds.
    #[serde(default = "default_expected_latency_ms")]
    pub expected_latency_ms: u64,
    /// Static quality score in `[0, 1]`, compared against quality targets.
    #[serde(default = "default_quality")]
    pub quality: f64,
    /// Extra latency predicted when the resource class is cold.
    #[serde(default)]
    pub cold_start_penalty_ms: u64,
    /// Preferred as a challenger for shadow traffic.
    #[serde(default)]
    pub challenger: bool,
    /// Concurrent requests the arm accepts before it is excluded for capacity.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
}

impl ArmSpec {
    /// Build a spec with defaults for everything but identity.
    pub fn new(id: impl Into<String>, resource_class: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            id: ArmId::new(id),
            resource_class: ResourceClass::new(resource_class),
            backend: backend.into(),
            usd_micros_per_1k_tokens: 0,
            expected_latency_ms: default_expected_latency_ms(),
            quality: default_quality(),
            cold_start_penalty_ms: 0,
            challenger: false,
            max_in_flight: default_max_in_flight(),
        }
    }

    /// Set the per-1k-token price.
    pub fn with_price(mut self, usd_micros_per_1k_tokens: u64) -> Self {
        self.usd_micros_per_1k_tokens = usd_micros_per_1k_tokens;
        self
    }

    /// Set the static quality score.
    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    /// Set the prior latency.
    pub fn with_latency(mut self, expected_latency_ms: u64) -> Self {
        self.expected_latency_ms = expected_latency_ms;
        self
    }

    /// Set the cold-start penalty.
    pub fn with_cold_start_penalty(mut self, cold_start_penalty_ms: u64) -> Self {
        self.cold_start_penalty_ms = cold_start_penalty_ms;
        self
    }

    /// Mark as a preferred challenger.
    pub fn as_challenger(mut self) -> Self {
        self.challenger = true;
        self
    }

    /// Estimated cost of `tokens` tokens, rounded up, in micro-USD.
    pub fn estimate_cost(&self, tokens: u64) -> u64 {
        let product = u128::from(tokens) * u128::from(self.usd_micros_per_1k_tokens);
        u64::try_from(product.div_ceil(1000)).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_config_defaults_match_documented_values() {
        let cfg = RoutingConfig::default();
        assert_eq!(cfg.policy, PolicyKind::Thompson);
        assert_eq!(cfg.ucb_c, 2.0);
        assert_eq!(cfg.min_context_trials, 20);
        assert_eq!(cfg.dedup_retention_s, 3600);
        assert_eq!(cfg.retire_after_failures, 5);
    }

    #[test]
    fn test_routing_config_deserializes_partial_toml() {
        let cfg: RoutingConfig = toml::from_str("policy = \"ucb\"\nucb_c = 1.5").unwrap();
        assert_eq!(cfg.policy, PolicyKind::Ucb);
        assert_eq!(cfg.ucb_c, 1.5);
        assert_eq!(cfg.tie_epsilon, 1e-9);
    }

    #[test]
    fn test_estimate_cost_rounds_up() {
        let arm = ArmSpec::new("a", "c", "echo").with_price(3);
        assert_eq!(arm.estimate_cost(1000), 3);
        assert_eq!(arm.estimate_cost(1), 1);
        assert_eq!(arm.estimate_cost(0), 0);
    }

    #[test]
    fn test_arm_spec_defaults_from_toml() {
        let arm: ArmSpec =
            toml::from_str("id = \"x\"\nresource_class = \"slm\"\nbackend = \"echo\"").unwrap();
        assert_eq!(arm.quality, 0.5);
        assert_eq!(arm.max_in_flight, 64);
        assert!(!arm.challenger);
    }
}
