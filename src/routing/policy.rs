//! Arm selection strategies.
//!
//! A closed set of strategies behind one [`SelectionPolicy::select_arm`]
//! entry point, chosen from configuration when the engine is built.
//!
//! Ties: scores within `tie_epsilon` of the best are tied; among tied arms
//! the one with more trials wins, then the lexicographically smallest id.

use rand::Rng;
use rand_distr::{Beta, Distribution};
use tracing::warn;

use super::arm::{ArmSnapshot, ArmStats};
use super::config::{PolicyKind, RoutingConfig};
use crate::ArmId;

/// Strategy used inside a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BasePolicy {
    /// Sample each arm's Beta posterior, take the largest draw.
    Thompson,
    /// `mean + c * sqrt(ln(total) / trials)`, untried arms score `+inf`.
    Ucb {
        /// Exploration constant.
        c: f64,
    },
}

/// Selection strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionPolicy {
    /// Thompson sampling over global statistics.
    Thompson,
    /// UCB over global statistics.
    Ucb {
        /// Exploration constant.
        c: f64,
    },
    /// Base strategy over the request's context bucket, falling back to the
    /// global bucket while the context has fewer than `min_trials` trials.
    Contextual {
        /// Strategy applied inside the chosen bucket.
        base: BasePolicy,
        /// Trials a context bucket needs before it is used.
        min_trials: u64,
    },
}

/// Result of one selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Chosen arm.
    pub arm_id: ArmId,
    /// Winning score (sampled value for Thompson, bound for UCB).
    pub score: f64,
}

impl SelectionPolicy {
    /// Build the policy named by `config`.
    pub fn from_config(config: &RoutingConfig) -> Self {
        let base = match config.contextual_base {
            PolicyKind::Ucb => BasePolicy::Ucb { c: config.ucb_c },
            PolicyKind::Thompson | PolicyKind::Contextual => BasePolicy::Thompson,
        };
        match config.policy {
            PolicyKind::Thompson => Self::Thompson,
            PolicyKind::Ucb => Self::Ucb { c: config.ucb_c },
            PolicyKind::Contextual => Self::Contextual {
                base,
                min_trials: config.min_context_trials,
            },
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Thompson => "thompson",
            Self::Ucb { .. } => "ucb",
            Self::Contextual { .. } => "contextual",
        }
    }

    /// Statistics this policy scores `arm` on.
    pub fn stats_for(&self, arm: &ArmSnapshot) -> ArmStats {
        match self {
            Self::Thompson | Self::Ucb { .. } => arm.global,
            Self::Contextual { min_trials, .. } => arm.bucket(*min_trials),
        }
    }

    /// Choose one arm from `eligible`.
    ///
    /// Returns `None` only when `eligible` is empty.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn select_arm<R: Rng + ?Sized>(
        &self,
        eligible: &[ArmSnapshot],
        tie_epsilon: f64,
        rng: &mut R,
    ) -> Option<Selection> {
        if eligible.is_empty() {
            return None;
        }
        let stats: Vec<ArmStats> = eligible.iter().map(|a| self.stats_for(a)).collect();
        let base = match self {
            Self::Thompson => BasePolicy::Thompson,
            Self::Ucb { c } => BasePolicy::Ucb { c: *c },
            Self::Contextual { base, .. } => *base,
        };
        let scores: Vec<f64> = match base {
            BasePolicy::Thompson => stats.iter().map(|s| thompson_draw(s, rng)).collect(),
            BasePolicy::Ucb { c } => {
                let total: u64 = stats.iter().map(|s| s.trials).sum();
                stats.iter().map(|s| ucb_score(s, total, c)).collect()
            }
        };
        let idx = best_index(eligible, &stats, &scores, tie_epsilon)?;
        Some(Selection {
            arm_id: eligible[idx].spec.id.clone(),
            score: scores[idx],
        })
    }
}

/// UCB bound. Untried arms score `+inf`.
pub fn ucb_score(stats: &ArmStats, total_trials: u64, c: f64) -> f64 {
    if stats.trials == 0 {
        return f64::INFINITY;
    }
    let ln_total = (total_trials.max(1) as f64).ln();
    stats.mean() + c * (ln_total / stats.trials as f64).sqrt()
}

fn thompson_draw<R: Rng + ?Sized>(stats: &ArmStats, rng: &mut R) -> f64 {
    let (alpha, beta) = stats.beta_params();
    match Beta::new(alpha, beta) {
        Ok(dist) => dist.sample(rng),
        Err(e) => {
            warn!(alpha, beta, error = %e, "invalid beta parameters; scoring by mean");
            stats.mean()
        }
    }
}

fn tied(a: f64, b: f64, eps: f64) -> bool {
    if a.is_infinite() || b.is_infinite() {
        a == b
    } else {
        (a - b).abs() <= eps
    }
}

/// Index of the winning arm under the tie-break rule. NaN scores never win.
fn best_index(
    arms: &[ArmSnapshot],
    stats: &[ArmStats],
    scores: &[f64],
    eps: f64,
) -> Option<usize> {
    let top = scores
        .iter()
        .copied()
        .filter(|s| !s.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    (0..arms.len())
        .filter(|&i| !scores[i].is_nan() && tied(scores[i], top, eps))
        .min_by(|&a, &b| {
            stats[b]
                .trials
                .cmp(&stats[a].trials)
                .then_with(|| arms[a].spec.id.cmp(&arms[b].spec.id))
        })
}
