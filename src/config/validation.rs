//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RouterConfig`] that the type
//! system cannot express: ranges, arm uniqueness, cross-field limits.
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::RouterConfig;
use crate::routing::PolicyKind;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "routing.ucb_c").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on a [`RouterConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RouterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Protocol ─────────────────────────────────────────────────────
    if config.protocol.heartbeat_interval_ms == 0 {
        errors.push(invalid("protocol.heartbeat_interval_ms", 0, "must be at least 1"));
    }
    if config.protocol.max_frame_bytes == 0 {
        errors.push(invalid("protocol.max_frame_bytes", 0, "must be at least 1"));
    }

    // ── Routing ──────────────────────────────────────────────────────
    let routing = &config.routing;
    if routing.contextual_base == PolicyKind::Contextual {
        errors.push(invalid(
            "routing.contextual_base",
            "contextual",
            "must be thompson or ucb",
        ));
    }
    if !routing.ucb_c.is_finite() || routing.ucb_c < 0.0 {
        errors.push(invalid("routing.ucb_c", routing.ucb_c, "must be finite and \u{2265} 0"));
    }
    if !routing.tie_epsilon.is_finite() || routing.tie_epsilon < 0.0 {
        errors.push(invalid(
            "routing.tie_epsilon",
            routing.tie_epsilon,
            "must be finite and \u{2265} 0",
        ));
    }
    if !(0.0..=1.0).contains(&routing.challenger_fraction) {
        errors.push(invalid(
            "routing.challenger_fraction",
            routing.challenger_fraction,
            "must be between 0.0 and 1.0",
        ));
    }
    for (field, weight) in [
        ("routing.latency_weight", routing.latency_weight),
        ("routing.cost_weight", routing.cost_weight),
    ] {
        if !(0.0..=1.0).contains(&weight) {
            errors.push(invalid(field, weight, "must be between 0.0 and 1.0"));
        }
    }
    if routing.dedup_retention_s == 0 {
        errors.push(invalid("routing.dedup_retention_s", 0, "must be at least 1 second"));
    }
    if routing.dedup_max_entries == 0 {
        errors.push(invalid("routing.dedup_max_entries", 0, "must be at least 1"));
    }
    if routing.retire_after_failures == 0 {
        errors.push(invalid("routing.retire_after_failures", 0, "must be at least 1"));
    }

    // ── Arms ─────────────────────────────────────────────────────────
    let mut seen = HashSet::new();
    for (i, arm) in config.arms.iter().enumerate() {
        if arm.id.as_str().trim().is_empty() {
            errors.push(invalid(format!("arms[{i}].id"), "\"\"", "must not be empty"));
        } else if !seen.insert(arm.id.as_str()) {
            errors.push(invalid(format!("arms[{i}].id"), &arm.id, "duplicate arm id"));
        }
        if arm.resource_class.as_str().trim().is_empty() {
            errors.push(invalid(
                format!("arms[{i}].resource_class"),
                "\"\"",
                "must not be empty",
            ));
        }
        if arm.backend.trim().is_empty() {
            errors.push(invalid(format!("arms[{i}].backend"), "\"\"", "must not be empty"));
        }
        if !(0.0..=1.0).contains(&arm.quality) {
            errors.push(invalid(
                format!("arms[{i}].quality"),
                arm.quality,
                "must be between 0.0 and 1.0",
            ));
        }
        if arm.max_in_flight == 0 {
            errors.push(invalid(format!("arms[{i}].max_in_flight"), 0, "must be at least 1"));
        }
    }

    // ── Prewarm ──────────────────────────────────────────────────────
    let prewarm = &config.prewarm;
    if prewarm.series_capacity < 2 {
        errors.push(invalid(
            "prewarm.series_capacity",
            prewarm.series_capacity,
            "must be at least 2",
        ));
    }
    if prewarm.min_observations > prewarm.series_capacity {
        errors.push(invalid(
            "prewarm.min_observations",
            prewarm.min_observations,
            "must be \u{2264} series_capacity",
        ));
    }
    if prewarm.lead_time_s > prewarm.horizon_s {
        errors.push(invalid(
            "prewarm.lead_time_s",
            prewarm.lead_time_s,
            "must be \u{2264} horizon_s",
        ));
    }
    if prewarm.ticket_ttl_s == 0 {
        errors.push(invalid("prewarm.ticket_ttl_s", 0, "must be at least 1 second"));
    }

    // ── Orchestrator ─────────────────────────────────────────────────
    let orch = &config.orchestrator;
    if orch.chars_per_token == 0 {
        errors.push(invalid("orchestrator.chars_per_token", 0, "must be at least 1"));
    }
    if orch.outbound_buffer == 0 {
        errors.push(invalid("orchestrator.outbound_buffer", 0, "must be at least 1"));
    }
    if orch.inbound_buffer == 0 {
        errors.push(invalid("orchestrator.inbound_buffer", 0, "must be at least 1"));
    }
    if orch.hard_timeout_ms < orch.default_latency_slo_ms {
        errors.push(invalid(
            "orchestrator.hard_timeout_ms",
            orch.hard_timeout_ms,
            "must be \u{2265} default_latency_slo_ms",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ArmSpec;

    fn fields(config: &RouterConfig) -> Vec<String> {
        match validate(config) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .into_iter()
                .filter_map(|e| match e {
                    ConfigError::InvalidField { field, .. } => Some(field),
                    _ => None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&RouterConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = RouterConfig::default();
        config.routing.challenger_fraction = 1.5;
        config.routing.ucb_c = -1.0;
        config.orchestrator.chars_per_token = 0;
        let found = fields(&config);
        assert_eq!(found.len(), 3);
        assert!(found.contains(&"routing.challenger_fraction".to_string()));
        assert!(found.contains(&"routing.ucb_c".to_string()));
        assert!(found.contains(&"orchestrator.chars_per_token".to_string()));
    }

    #[test]
    fn test_duplicate_arm_id_rejected() {
        let mut config = RouterConfig::default();
        config.arms = vec![ArmSpec::new("a", "gpu", "echo"), ArmSpec::new("a", "cpu", "echo")];
        assert_eq!(fields(&config), vec!["arms[1].id".to_string()]);
    }

    #[test]
    fn test_arm_quality_out_of_range_rejected() {
        let mut config = RouterConfig::default();
        config.arms = vec![ArmSpec::new("a", "gpu", "echo").with_quality(1.2)];
        assert_eq!(fields(&config), vec!["arms[0].quality".to_string()]);
    }

    #[test]
    fn test_empty_backend_rejected() {
        let mut config = RouterConfig::default();
        config.arms = vec![ArmSpec::new("a", "gpu", " ")];
        assert_eq!(fields(&config), vec!["arms[0].backend".to_string()]);
    }

    #[test]
    fn test_contextual_base_cannot_nest() {
        let mut config = RouterConfig::default();
        config.routing.contextual_base = PolicyKind::Contextual;
        assert_eq!(fields(&config), vec!["routing.contextual_base".to_string()]);
    }

    #[test]
    fn test_lead_time_beyond_horizon_rejected() {
        let mut config = RouterConfig::default();
        config.prewarm.lead_time_s = 600;
        assert_eq!(fields(&config), vec!["prewarm.lead_time_s".to_string()]);
    }

    #[test]
    fn test_min_observations_above_capacity_rejected() {
        let mut config = RouterConfig::default();
        config.prewarm.series_capacity = 5;
        assert_eq!(fields(&config), vec!["prewarm.min_observations".to_string()]);
    }

    #[test]
    fn test_hard_timeout_below_slo_rejected() {
        let mut config = RouterConfig::default();
        config.orchestrator.hard_timeout_ms = 1000;
        assert_eq!(fields(&config), vec!["orchestrator.hard_timeout_ms".to_string()]);
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let mut config = RouterConfig::default();
        config.protocol.heartbeat_interval_ms = 0;
        assert_eq!(fields(&config), vec!["protocol.heartbeat_interval_ms".to_string()]);
    }

    #[test]
    fn test_error_message_includes_field_and_value() {
        let err = invalid("routing.ucb_c", -1.0, "must be finite and \u{2265} 0");
        let msg = err.to_string();
        assert!(msg.contains("routing.ucb_c"));
        assert!(msg.contains("-1"));
    }
}
