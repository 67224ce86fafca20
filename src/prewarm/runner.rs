//! Background loops driving the scheduler.
//!
//! Two independent tasks: the prediction loop (forecast and issue) and the
//! expiry sweep. Neither shares a lock with request handling beyond the
//! per-class series mutexes, and both stop on the shutdown signal.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::scheduler::PrewarmScheduler;
use super::WarmPool;
use crate::clock::now_millis;

/// Handles to the two scheduler loops.
#[derive(Debug)]
pub struct PrewarmLoops {
    /// Prediction/trigger loop.
    pub predict: JoinHandle<()>,
    /// Expiry sweep loop.
    pub sweep: JoinHandle<()>,
}

impl PrewarmLoops {
    /// Wait for both loops to finish.
    pub async fn join(self) {
        let _ = self.predict.await;
        let _ = self.sweep.await;
    }

    /// Abort both loops.
    pub fn abort(&self) {
        self.predict.abort();
        self.sweep.abort();
    }
}

/// Spawn the prediction and sweep loops.
///
/// Both run until `shutdown` flips to `true` or its sender is dropped.
///
/// # Panics
///
/// This function never panics, but must be called inside a Tokio runtime.
pub fn spawn_loops(
    scheduler: Arc<PrewarmScheduler>,
    pool: Arc<dyn WarmPool>,
    shutdown: watch::Receiver<bool>,
) -> PrewarmLoops {
    let predict = {
        let scheduler = Arc::clone(&scheduler);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config().predict_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let issued = scheduler.run_prediction_cycle(now_millis(), pool.as_ref());
                        if !issued.is_empty() {
                            debug!(issued = issued.len(), "prediction cycle issued tickets");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("prewarm prediction loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    };

    let sweep = {
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config().sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let wasted = scheduler.sweep_expired(now_millis());
                        if !wasted.is_empty() {
                            debug!(wasted = wasted.len(), "sweep closed expired tickets");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("prewarm sweep loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    };

    PrewarmLoops { predict, sweep }
}
