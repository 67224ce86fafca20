//! Metrics sink for the router.
//!
//! ## Usage
//!
//! Build a [`PrometheusSink`] (or use [`NoopSink`]) and hand it to the
//! orchestrator builder as an `Arc<dyn MetricsSink>`. The core only ever
//! writes to the sink; writes are fire-and-forget and never fail the caller.
//! Each sink owns a private registry, so several routers (or tests) can run in
//! one process without colliding.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `prewarm_hits_total` | Counter | `resource_class` |
//! | `prewarm_wasted_total` | Counter | `resource_class` |
//! | `prewarm_issued_total` | Counter | `resource_class` |
//! | `prewarm_waste_ms` | Histogram | `resource_class` |
//! | `routing_decisions_total` | Counter | `arm`, `rationale` |
//! | `duplicate_outcomes_total` | Counter | none |
//! | `stream_outcomes_total` | Counter | `outcome` |
//! | `frames_emitted_total` | Counter | `kind` |
//! | `backend_latency_ms` | Histogram | `arm` |
//! | `usage_usd_micros_total` | Counter | `arm` |

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::routing::RoutingDecision;
use crate::OrchestratorError;

// ── Metric names ───────────────────────────────────────────────────────────

/// Prewarm tickets claimed by a matching request.
pub const PREWARM_HITS_TOTAL: &str = "prewarm_hits_total";
/// Prewarm tickets that expired unclaimed.
pub const PREWARM_WASTED_TOTAL: &str = "prewarm_wasted_total";
/// Prewarm tickets issued.
pub const PREWARM_ISSUED_TOTAL: &str = "prewarm_issued_total";
/// Warm time spent on tickets that expired unclaimed.
pub const PREWARM_WASTE_MS: &str = "prewarm_waste_ms";
/// Routing decisions by arm and rationale.
pub const ROUTING_DECISIONS_TOTAL: &str = "routing_decisions_total";
/// Outcome recordings ignored as duplicates.
pub const DUPLICATE_OUTCOMES_TOTAL: &str = "duplicate_outcomes_total";
/// Stream terminal outcomes.
pub const STREAM_OUTCOMES_TOTAL: &str = "stream_outcomes_total";
/// Outbound frames by payload type.
pub const FRAMES_EMITTED_TOTAL: &str = "frames_emitted_total";
/// Backend call latency by arm.
pub const BACKEND_LATENCY_MS: &str = "backend_latency_ms";
/// Charged spend by arm.
pub const USAGE_USD_MICROS_TOTAL: &str = "usage_usd_micros_total";

const COUNTERS: &[(&str, &str, &[&str])] = &[
    (PREWARM_HITS_TOTAL, "Prewarm tickets claimed by a matching request", &["resource_class"]),
    (PREWARM_WASTED_TOTAL, "Prewarm tickets expired unclaimed", &["resource_class"]),
    (PREWARM_ISSUED_TOTAL, "Prewarm tickets issued", &["resource_class"]),
    (ROUTING_DECISIONS_TOTAL, "Routing decisions", &["arm", "rationale"]),
    (DUPLICATE_OUTCOMES_TOTAL, "Duplicate outcome recordings ignored", &[]),
    (STREAM_OUTCOMES_TOTAL, "Stream terminal outcomes", &["outcome"]),
    (FRAMES_EMITTED_TOTAL, "Outbound frames by payload type", &["kind"]),
    (USAGE_USD_MICROS_TOTAL, "Charged spend in micro-USD", &["arm"]),
];

const HISTOGRAMS: &[(&str, &str, &[&str])] = &[
    (PREWARM_WASTE_MS, "Warm time wasted by unclaimed prewarm tickets", &["resource_class"]),
    (BACKEND_LATENCY_MS, "Backend call latency", &["arm"]),
];

/// Millisecond buckets from 10 ms to roughly 10 minutes.
const MS_BUCKETS: &[f64] = &[
    10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
    120_000.0, 300_000.0, 600_000.0,
];

// ── Sink trait ─────────────────────────────────────────────────────────────

/// Write-only metrics destination.
///
/// Implementations must not block and must not fail; unknown metric names
/// are dropped.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Add `value` to a counter.
    fn add_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);

    /// Add one to a counter.
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.add_counter(name, 1, labels);
    }

    /// Record one histogram observation.
    fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Record a routing decision event.
    fn routing_event(&self, decision: &RoutingDecision) {
        self.inc_counter(
            ROUTING_DECISIONS_TOTAL,
            &[
                ("arm", decision.arm_id().as_str()),
                ("rationale", decision.rationale().as_str()),
            ],
        );
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn add_counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}

    fn observe(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

// ── Prometheus sink ────────────────────────────────────────────────────────

/// Prometheus-backed sink owning a private [`Registry`].
pub struct PrometheusSink {
    registry: Registry,
    counters: HashMap<&'static str, (IntCounterVec, &'static [&'static str])>,
    histograms: HashMap<&'static str, (HistogramVec, &'static [&'static str])>,
}

impl fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusSink")
            .field("counters", &self.counters.len())
            .field("histograms", &self.histograms.len())
            .finish()
    }
}

impl PrometheusSink {
    /// Build the sink and register every metric.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Metrics`] if metric construction or
    /// registration fails.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new() -> Result<Self, OrchestratorError> {
        let registry = Registry::new();
        let mut counters = HashMap::new();
        for (name, help, labels) in COUNTERS {
            let vec = IntCounterVec::new(Opts::new(*name, *help), labels)
                .map_err(|e| OrchestratorError::Metrics(format!("metrics init failed: {e}")))?;
            registry
                .register(Box::new(vec.clone()))
                .map_err(|e| OrchestratorError::Metrics(format!("metrics registration failed: {e}")))?;
            counters.insert(*name, (vec, *labels));
        }
        let mut histograms = HashMap::new();
        for (name, help, labels) in HISTOGRAMS {
            let vec = HistogramVec::new(
                HistogramOpts::new(*name, *help).buckets(MS_BUCKETS.to_vec()),
                labels,
            )
            .map_err(|e| OrchestratorError::Metrics(format!("metrics init failed: {e}")))?;
            registry
                .register(Box::new(vec.clone()))
                .map_err(|e| OrchestratorError::Metrics(format!("metrics registration failed: {e}")))?;
            histograms.insert(*name, (vec, *labels));
        }
        Ok(Self {
            registry,
            counters,
            histograms,
        })
    }

    /// Encode all metrics in the Prometheus text exposition format.
    ///
    /// Returns an empty string if encoding fails.
    pub fn gather(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Current value of a counter series; `0` if absent.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(name)
            .and_then(|(vec, names)| {
                vec.get_metric_with_label_values(&label_values(names, labels))
                    .ok()
            })
            .map_or(0, |c| c.get())
    }

    /// `(sample_count, sample_sum)` of a histogram series; zeros if absent.
    pub fn histogram_totals(&self, name: &str, labels: &[(&str, &str)]) -> (u64, f64) {
        self.histograms
            .get(name)
            .and_then(|(vec, names)| {
                vec.get_metric_with_label_values(&label_values(names, labels))
                    .ok()
            })
            .map_or((0, 0.0), |h| (h.get_sample_count(), h.get_sample_sum()))
    }
}

/// Order label values by the metric's declared names; missing ones become `"unknown"`.
fn label_values<'a>(names: &[&str], labels: &[(&str, &'a str)]) -> Vec<&'a str> {
    names
        .iter()
        .map(|n| {
            labels
                .iter()
                .find(|(k, _)| k == n)
                .map_or("unknown", |(_, v)| *v)
        })
        .collect()
}

impl MetricsSink for PrometheusSink {
    fn add_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        match self.counters.get(name) {
            Some((vec, names)) => {
                if let Ok(c) = vec.get_metric_with_label_values(&label_values(names, labels)) {
                    c.inc_by(value);
                }
            }
            None => debug!(metric = name, "unknown counter dropped"),
        }
    }

    fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        match self.histograms.get(name) {
            Some((vec, names)) => {
                if let Ok(h) = vec.get_metric_with_label_values(&label_values(names, labels)) {
                    h.observe(value);
                }
            }
            None => debug!(metric = name, "unknown histogram dropped"),
        }
    }
}
