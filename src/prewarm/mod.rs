//! # Stage: Predictive Prewarming
//!
//! ## Responsibility
//! Forecast per-resource-class demand from request timestamps and warm
//! backend resources ahead of it, so that predictable traffic avoids cold
//! starts.
//!
//! ## Guarantees
//! - Non-blocking hot path: `observe()` appends to a per-class bounded FIFO
//! - Independent loops: prediction and expiry sweep run as separate tasks
//! - Accountable: every ticket closes once, as a hit or as waste, and both
//!   outcomes reach the metrics sink
//!
//! ## NOT Responsible For
//! - Routing (that belongs to `routing`)
//! - Backend-specific warm-up (that belongs to the [`WarmPool`] implementor)

pub mod config;
pub mod runner;
pub mod scheduler;
pub mod series;
pub mod ticket;

use thiserror::Error;

use crate::clock::UnixMillis;
use crate::ResourceClass;

pub use config::PrewarmConfig;
pub use runner::{spawn_loops, PrewarmLoops};
pub use scheduler::{Prediction, PrewarmScheduler};
pub use series::ResourceDemandSeries;
pub use ticket::{PrewarmTicket, TicketState};

/// Internal forecasting errors. Never surfaced to callers; a class that
/// cannot be forecast is simply not prewarmed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrewarmError {
    /// Too few observations to forecast.
    #[error("insufficient history for {class}: need {needed} observations, have {have}")]
    InsufficientHistory {
        /// Resource class.
        class: String,
        /// Observations required.
        needed: usize,
        /// Observations stored.
        have: usize,
    },
}

/// Something that can warm a resource class.
///
/// Called from the prediction loop; implementations must not block and
/// should spawn any slow work.
pub trait WarmPool: Send + Sync + std::fmt::Debug {
    /// Warm `class` and keep it warm until `until`.
    fn prewarm(&self, class: &ResourceClass, until: UnixMillis);
}
