//! Per-arm running statistics.

use serde::Serialize;

use super::config::ArmSpec;

/// Reward statistics for one arm in one bucket (global or one context).
///
/// Rewards are clamped to `[0, 1]`. A reward counts as a success when the
/// backend call itself succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ArmStats {
    /// Recorded outcomes.
    pub trials: u64,
    /// Outcomes whose backend call succeeded.
    pub successes: u64,
    /// Outcomes whose backend call failed.
    pub failures: u64,
    /// Sum of rewards.
    pub reward_sum: f64,
}

impl ArmStats {
    /// Stats with `successes` reward-1 outcomes and `failures` reward-0 outcomes.
    pub fn with_counts(successes: u64, failures: u64) -> Self {
        let s = successes as f64;
        Self {
            trials: successes + failures,
            successes,
            failures,
            reward_sum: s,
        }
    }

    /// Fold one outcome into the statistics.
    pub fn record(&mut self, reward: f64, success: bool) {
        let r = reward.clamp(0.0, 1.0);
        self.trials += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.reward_sum += r;
    }

    /// Mean reward, `0.0` when untried.
    pub fn mean(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.reward_sum / self.trials as f64
        }
    }

    /// Beta posterior `(alpha, beta)` under a uniform prior with fractional
    /// reward accumulation.
    pub fn beta_params(&self) -> (f64, f64) {
        let alpha = 1.0 + self.reward_sum;
        let beta = 1.0 + (self.trials as f64 - self.reward_sum).max(0.0);
        (alpha, beta)
    }
}

/// Streaming latency mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    count: u64,
    mean: f64,
}

impl LatencyStats {
    /// Fold one latency observation in milliseconds.
    pub fn observe(&mut self, latency_ms: f64) {
        self.count += 1;
        self.mean += (latency_ms - self.mean) / self.count as f64;
    }

    /// Observation count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean latency, `None` before the first observation.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }
}

/// Whether an arm may receive traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmHealth {
    /// Eligible for routing.
    Live,
    /// Excluded from routing; statistics retained.
    Retired,
}

/// Point-in-time view of one arm, as seen by the selection policy.
#[derive(Debug, Clone, Serialize)]
pub struct ArmSnapshot {
    /// Static description.
    pub spec: ArmSpec,
    /// Global bucket statistics.
    pub global: ArmStats,
    /// Statistics of the request's context bucket, if it has any.
    pub context: Option<ArmStats>,
    /// Observed latency distribution.
    pub latency: LatencyStats,
    /// Health state.
    pub health: ArmHealth,
    /// Requests currently executing on the arm.
    pub in_flight: u32,
    /// Whether the arm's resource class is currently warm.
    pub warm: bool,
}

impl ArmSnapshot {
    /// Predicted latency: observed mean (or the prior), plus the cold-start
    /// penalty when the resource class is cold.
    pub fn predicted_latency_ms(&self) -> f64 {
        let base = self
            .latency
            .mean()
            .unwrap_or(self.spec.expected_latency_ms as f64);
        if self.warm {
            base
        } else {
            base + self.spec.cold_start_penalty_ms as f64
        }
    }

    /// Statistics the contextual policy should use: the context bucket once
    /// it has `min_trials`, otherwise the global bucket.
    pub fn bucket(&self, min_trials: u64) -> ArmStats {
        match self.context {
            Some(ctx) if ctx.trials >= min_trials => ctx,
            _ => self.global,
        }
    }
}
