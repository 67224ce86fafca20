//! Prewarming configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::secs;

// ── Default value functions ────────────────────────────────────────────

/// Default demand history per resource class.
fn default_series_capacity() -> usize {
    1000
}

/// Default observations required before a class is forecast.
fn default_min_observations() -> usize {
    10
}

/// Default forecast horizon: five minutes.
fn default_horizon_s() -> u64 {
    300
}

/// Default lead time: two minutes.
fn default_lead_time_s() -> u64 {
    120
}

/// Default ticket lifetime: three minutes.
fn default_ticket_ttl_s() -> u64 {
    180
}

/// Default prediction loop period.
fn default_predict_interval_s() -> u64 {
    5
}

/// Default expiry sweep period.
fn default_sweep_interval_s() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

// ── PrewarmConfig ──────────────────────────────────────────────────────

/// Configuration for the predictive prewarming scheduler.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PrewarmConfig {
    /// Run the background loops. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Timestamps kept per resource class (oldest evicted). Default: `1000`.
    #[serde(default = "default_series_capacity")]
    pub series_capacity: usize,
    /// Observations needed before a class is forecast. Default: `10`.
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    /// Forecasts further out than this are discarded. Default: `300`.
    #[serde(default = "default_horizon_s")]
    pub horizon_s: u64,
    /// A class is prewarmed once its forecast is this close. Default: `120`.
    #[serde(default = "default_lead_time_s")]
    pub lead_time_s: u64,
    /// Lifetime of an issued ticket. Default: `180`.
    #[serde(default = "default_ticket_ttl_s")]
    pub ticket_ttl_s: u64,
    /// Prediction loop period. Default: `5`.
    #[serde(default = "default_predict_interval_s")]
    pub predict_interval_s: u64,
    /// Expiry sweep period. Default: `30`.
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,
}

impl Default for PrewarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            series_capacity: default_series_capacity(),
            min_observations: default_min_observations(),
            horizon_s: default_horizon_s(),
            lead_time_s: default_lead_time_s(),
            ticket_ttl_s: default_ticket_ttl_s(),
            predict_interval_s: default_predict_interval_s(),
            sweep_interval_s: default_sweep_interval_s(),
        }
    }
}

impl PrewarmConfig {
    /// Horizon in milliseconds.
    pub fn horizon_ms(&self) -> u64 {
        secs(self.horizon_s)
    }

    /// Lead time in milliseconds.
    pub fn lead_time_ms(&self) -> u64 {
        secs(self.lead_time_s)
    }

    /// Ticket lifetime in milliseconds.
    pub fn ticket_ttl_ms(&self) -> u64 {
        secs(self.ticket_ttl_s)
    }

    /// Prediction loop period, at least one second.
    pub fn predict_interval(&self) -> Duration {
        Duration::from_secs(self.predict_interval_s.max(1))
    }

    /// Sweep loop period, at least one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_s.max(1))
    }
}
