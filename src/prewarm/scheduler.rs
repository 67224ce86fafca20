//! # Predictive Prewarming Scheduler
//!
//! ## Responsibility
//!
//! Record demand per resource class, forecast the next request with the
//! median inter-arrival interval, issue prewarm tickets ahead of forecast
//! demand, and close tickets as hits (claimed by a real request) or waste
//! (expired unclaimed).
//!
//! ## Guarantees
//!
//! - **Per-class locking**: each demand series has its own mutex; `observe`
//!   is O(1) amortized and never awaits
//! - **One open ticket per class**: issuing is an atomic check-and-insert
//! - **Exactly one close**: a ticket is removed from the open set before it
//!   is marked hit or wasted, so it is counted once
//! - **Silent on thin history**: classes below `min_observations` are
//!   skipped without error
//!
//! ## NOT Responsible For
//!
//! - Actually warming anything (see [`WarmPool`](super::WarmPool))
//! - Running the periodic loops (see [`runner`](super::runner))

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::PrewarmConfig;
use super::series::ResourceDemandSeries;
use super::ticket::PrewarmTicket;
use super::WarmPool;
use crate::clock::UnixMillis;
use crate::metrics::{
    MetricsSink, PREWARM_HITS_TOTAL, PREWARM_ISSUED_TOTAL, PREWARM_WASTED_TOTAL, PREWARM_WASTE_MS,
};
use crate::ResourceClass;

/// Closed tickets kept for inspection.
const CLOSED_HISTORY: usize = 256;

/// A retained demand forecast for one class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// Forecast resource class.
    pub class: ResourceClass,
    /// Expected time of the next request.
    pub forecast_at: UnixMillis,
    /// Median inter-arrival interval the forecast is based on.
    pub median_interval_ms: f64,
    /// When the forecast was made.
    pub made_at: UnixMillis,
}

/// Demand forecaster and ticket registry.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug)]
pub struct PrewarmScheduler {
    config: PrewarmConfig,
    series: DashMap<ResourceClass, Arc<Mutex<ResourceDemandSeries>>>,
    predictions: DashMap<ResourceClass, Prediction>,
    tickets: DashMap<ResourceClass, PrewarmTicket>,
    closed: Mutex<VecDeque<PrewarmTicket>>,
    metrics: Arc<dyn MetricsSink>,
}

impl PrewarmScheduler {
    /// Create an empty scheduler.
    pub fn new(config: PrewarmConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            series: DashMap::new(),
            predictions: DashMap::new(),
            tickets: DashMap::new(),
            closed: Mutex::new(VecDeque::with_capacity(CLOSED_HISTORY)),
            metrics,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &PrewarmConfig {
        &self.config
    }

    /// Record one demand event for `class` at `ts`.
    pub fn observe(&self, class: &ResourceClass, ts: UnixMillis) {
        let series = self
            .series
            .entry(class.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ResourceDemandSeries::new(
                    class.clone(),
                    self.config.series_capacity,
                )))
            })
            .clone();
        series.lock().observe(ts);
    }

    /// Stored observation count for `class`.
    pub fn observation_count(&self, class: &ResourceClass) -> usize {
        self.series
            .get(class)
            .map(|s| s.value().lock().len())
            .unwrap_or(0)
    }

    /// Forecast every class with enough history.
    ///
    /// A forecast is retained only when `now < forecast < now + horizon`.
    /// Retained forecasts replace the previous set; classes that no longer
    /// qualify lose theirs. Returned predictions are sorted by class.
    pub fn predict(&self, now: UnixMillis) -> Vec<Prediction> {
        let horizon_end = now.saturating_add(self.config.horizon_ms());
        let handles: Vec<(ResourceClass, Arc<Mutex<ResourceDemandSeries>>)> = self
            .series
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut out = Vec::new();
        for (class, series) in handles {
            let (forecast, median) = {
                let s = series.lock();
                (s.forecast(self.config.min_observations), s.median_interval())
            };
            match forecast {
                Ok(at) if at > now && at < horizon_end => {
                    let prediction = Prediction {
                        class: class.clone(),
                        forecast_at: at,
                        median_interval_ms: median.unwrap_or(0.0),
                        made_at: now,
                    };
                    self.predictions.insert(class, prediction.clone());
                    out.push(prediction);
                }
                Ok(at) => {
                    debug!(resource_class = %class, forecast_at = at, now, "forecast outside horizon");
                    self.predictions.remove(&class);
                }
                Err(e) => {
                    debug!(resource_class = %class, error = %e, "class not forecast");
                    self.predictions.remove(&class);
                }
            }
        }
        out.sort_by(|a, b| a.class.cmp(&b.class));
        out
    }

    /// Retained prediction for `class`.
    pub fn prediction(&self, class: &ResourceClass) -> Option<Prediction> {
        self.predictions.get(class).map(|p| p.value().clone())
    }

    /// Return `true` if `class` has a retained prediction that is still ahead
    /// of `now` by no more than the lead time and no open ticket.
    pub fn should_prewarm(&self, class: &ResourceClass, now: UnixMillis) -> bool {
        let Some(prediction) = self.prediction(class) else {
            return false;
        };
        let ahead = prediction.forecast_at > now
            && prediction.forecast_at - now <= self.config.lead_time_ms();
        ahead && !self.tickets.contains_key(class)
    }

    /// Issue a ticket for `class` if [`should_prewarm`](Self::should_prewarm)
    /// holds. Returns the issued ticket.
    pub fn try_issue(&self, class: &ResourceClass, now: UnixMillis) -> Option<PrewarmTicket> {
        if !self.should_prewarm(class, now) {
            return None;
        }
        let prediction = self.prediction(class)?;
        let ticket = PrewarmTicket::issue(
            class.clone(),
            prediction.forecast_at,
            now,
            self.config.ticket_ttl_ms(),
        );
        match self.tickets.entry(class.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(e) => {
                e.insert(ticket.clone());
            }
        }
        info!(
            resource_class = %class,
            forecast_at = prediction.forecast_at,
            expires_at = ticket.expires_at,
            "prewarm ticket issued"
        );
        self.metrics
            .inc_counter(PREWARM_ISSUED_TOTAL, &[("resource_class", class.as_str())]);
        Some(ticket)
    }

    /// Open ticket for `class`.
    pub fn active_ticket(&self, class: &ResourceClass) -> Option<PrewarmTicket> {
        self.tickets.get(class).map(|t| t.value().clone())
    }

    /// Close the open ticket for `class` as a hit, if one is claimable at `now`.
    ///
    /// An open ticket past its expiry is left for the sweep.
    pub fn claim_ticket(&self, class: &ResourceClass, now: UnixMillis) -> Option<PrewarmTicket> {
        let (_, mut ticket) = self
            .tickets
            .remove_if(class, |_, t| t.is_open() && !t.is_expired(now))?;
        ticket.claim(now);
        self.predictions.remove(class);
        debug!(resource_class = %class, issued_at = ticket.issued_at, "prewarm hit");
        self.metrics
            .inc_counter(PREWARM_HITS_TOTAL, &[("resource_class", class.as_str())]);
        self.push_closed(ticket.clone());
        Some(ticket)
    }

    /// Close every open ticket expired at `now` as wasted.
    ///
    /// Records the wasted duration in `prewarm_waste_ms`. Returns the closed
    /// tickets, sorted by class.
    pub fn sweep_expired(&self, now: UnixMillis) -> Vec<PrewarmTicket> {
        let expired: Vec<ResourceClass> = self
            .tickets
            .iter()
            .filter(|t| t.value().is_expired(now))
            .map(|t| t.key().clone())
            .collect();
        let mut out = Vec::new();
        for class in expired {
            let Some((_, mut ticket)) = self.tickets.remove_if(&class, |_, t| t.is_expired(now)) else {
                continue;
            };
            let Some(wasted_ms) = ticket.waste() else {
                continue;
            };
            warn!(resource_class = %class, wasted_ms, "prewarm ticket wasted");
            let labels = [("resource_class", class.as_str())];
            self.metrics.inc_counter(PREWARM_WASTED_TOTAL, &labels);
            self.metrics
                .observe(PREWARM_WASTE_MS, wasted_ms as f64, &labels);
            self.push_closed(ticket.clone());
            out.push(ticket);
        }
        out.sort_by(|a, b| a.class.cmp(&b.class));
        out
    }

    /// One prediction cycle: forecast, then issue and warm every class that
    /// should be prewarmed. Returns the tickets issued.
    pub fn run_prediction_cycle(&self, now: UnixMillis, pool: &dyn WarmPool) -> Vec<PrewarmTicket> {
        let mut issued = Vec::new();
        for prediction in self.predict(now) {
            if let Some(ticket) = self.try_issue(&prediction.class, now) {
                pool.prewarm(&ticket.class, ticket.expires_at);
                issued.push(ticket);
            }
        }
        issued
    }

    /// Recently closed tickets, oldest first.
    pub fn closed_tickets(&self) -> Vec<PrewarmTicket> {
        self.closed.lock().iter().cloned().collect()
    }

    fn push_closed(&self, ticket: PrewarmTicket) {
        let mut closed = self.closed.lock();
        if closed.len() >= CLOSED_HISTORY {
            closed.pop_front();
        }
        closed.push_back(ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::secs;
    use crate::metrics::{NoopSink, PrometheusSink};
    use crate::prewarm::ticket::TicketState;

    fn scheduler(min_observations: usize) -> PrewarmScheduler {
        let config = PrewarmConfig {
            min_observations,
            ..PrewarmConfig::default()
        };
        PrewarmScheduler::new(config, Arc::new(NoopSink))
    }

    fn class() -> ResourceClass {
        ResourceClass::new("slm_balanced")
    }

    fn observe_all(s: &PrewarmScheduler, ts: &[u64]) {
        for t in ts {
            s.observe(&class(), secs(*t));
        }
    }

    #[test]
    fn test_predict_none_below_min_observations() {
        let s = scheduler(10);
        observe_all(&s, &[0, 10, 20, 30, 40, 50, 60, 70, 80]);
        assert!(s.predict(secs(80)).is_empty());
        s.observe(&class(), secs(90));
        let p = s.predict(secs(90));
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].forecast_at, secs(100));
    }

    #[test]
    fn test_predict_drops_forecast_not_after_now() {
        let s = scheduler(5);
        observe_all(&s, &[0, 60, 122, 181, 239]);
        assert!(s.predict(secs(299)).is_empty());
        assert!(s.prediction(&class()).is_none());
    }

    #[test]
    fn test_predict_drops_forecast_beyond_horizon() {
        let s = scheduler(3);
        observe_all(&s, &[0, 1000, 2000]);
        assert!(s.predict(secs(2000)).is_empty());
    }

    #[test]
    fn test_should_prewarm_scenario() {
        let s = scheduler(5);
        observe_all(&s, &[0, 60, 122, 181, 239]);
        let p = s.predict(secs(239));
        assert_eq!(p[0].forecast_at, 298_500);
        assert!(s.should_prewarm(&class(), secs(296)));
        // Beyond the forecast the prediction is stale.
        assert!(!s.should_prewarm(&class(), secs(299)));
    }

    #[test]
    fn test_should_prewarm_false_outside_lead() {
        let config = PrewarmConfig {
            min_observations: 3,
            lead_time_s: 10,
            ..PrewarmConfig::default()
        };
        let s = PrewarmScheduler::new(config, Arc::new(NoopSink));
        observe_all(&s, &[0, 100, 200]);
        s.predict(secs(200));
        assert!(!s.should_prewarm(&class(), secs(250)));
        assert!(s.should_prewarm(&class(), secs(295)));
    }

    #[test]
    fn test_only_one_open_ticket_per_class() {
        let s = scheduler(5);
        observe_all(&s, &[0, 60, 122, 181, 239]);
        s.predict(secs(239));
        assert!(s.try_issue(&class(), secs(240)).is_some());
        assert!(!s.should_prewarm(&class(), secs(241)));
        assert!(s.try_issue(&class(), secs(241)).is_none());
    }

    #[test]
    fn test_claim_marks_hit_and_counts() {
        let sink = Arc::new(PrometheusSink::new().unwrap());
        let config = PrewarmConfig {
            min_observations: 5,
            ..PrewarmConfig::default()
        };
        let s = PrewarmScheduler::new(config, sink.clone());
        observe_all(&s, &[0, 60, 122, 181, 239]);
        s.predict(secs(239));
        s.try_issue(&class(), secs(240)).unwrap();
        let hit = s.claim_ticket(&class(), secs(298)).unwrap();
        assert_eq!(hit.state, TicketState::Hit { at: secs(298) });
        assert!(s.active_ticket(&class()).is_none());
        assert_eq!(
            sink.counter_value(PREWARM_HITS_TOTAL, &[("resource_class", "slm_balanced")]),
            1
        );
        assert!(s.claim_ticket(&class(), secs(299)).is_none());
    }

    #[test]
    fn test_sweep_marks_expired_wasted() {
        let sink = Arc::new(PrometheusSink::new().unwrap());
        let config = PrewarmConfig {
            min_observations: 5,
            ticket_ttl_s: 60,
            ..PrewarmConfig::default()
        };
        let s = PrewarmScheduler::new(config, sink.clone());
        observe_all(&s, &[0, 60, 122, 181, 239]);
        s.predict(secs(239));
        s.try_issue(&class(), secs(240)).unwrap();
        assert!(s.sweep_expired(secs(299)).is_empty());
        let wasted = s.sweep_expired(secs(301));
        assert_eq!(wasted.len(), 1);
        assert_eq!(wasted[0].state, TicketState::Wasted { wasted_ms: 60_000 });
        assert_eq!(
            sink.histogram_totals(PREWARM_WASTE_MS, &[("resource_class", "slm_balanced")]),
            (1, 60_000.0)
        );
        assert!(s.sweep_expired(secs(400)).is_empty());
        assert_eq!(s.closed_tickets().len(), 1);
    }

    #[test]
    fn test_claim_after_expiry_leaves_ticket_for_sweep() {
        let s = scheduler(5);
        observe_all(&s, &[0, 60, 122, 181, 239]);
        s.predict(secs(239));
        let t = s.try_issue(&class(), secs(240)).unwrap();
        assert!(s.claim_ticket(&class(), t.expires_at).is_none());
        assert_eq!(s.sweep_expired(t.expires_at).len(), 1);
    }
}
