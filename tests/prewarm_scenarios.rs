//! Integration tests for the predictive prewarming scheduler.
//!
//! Timestamps are explicit unix milliseconds so every scenario is
//! deterministic; the periodic loops are covered by the runner's own tests.

use parking_lot::Mutex;
use std::sync::Arc;

use tokio_stream_router::clock::secs;
use tokio_stream_router::metrics::{
    NoopSink, PrometheusSink, PREWARM_HITS_TOTAL, PREWARM_ISSUED_TOTAL, PREWARM_WASTED_TOTAL,
    PREWARM_WASTE_MS,
};
use tokio_stream_router::prewarm::{PrewarmConfig, PrewarmScheduler, TicketState, WarmPool};
use tokio_stream_router::ResourceClass;

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug, Default)]
struct RecordingPool {
    warmed: Mutex<Vec<(ResourceClass, u64)>>,
}

impl WarmPool for RecordingPool {
    fn prewarm(&self, class: &ResourceClass, until: u64) {
        self.warmed.lock().push((class.clone(), until));
    }
}

fn slm() -> ResourceClass {
    ResourceClass::new("slm_balanced")
}

fn observe_secs(s: &PrewarmScheduler, class: &ResourceClass, ts: &[u64]) {
    for t in ts {
        s.observe(class, secs(*t));
    }
}

/// Ten observations 10 s apart ending at `last`; forecast is `last + 10 s`.
fn regular_series(s: &PrewarmScheduler, class: &ResourceClass, last: u64) {
    let ts: Vec<u64> = (0..10).map(|i| last - 90 + i * 10).collect();
    observe_secs(s, class, &ts);
}

// ============================================================================
// Forecasting
// ============================================================================

#[test]
fn test_median_interval_forecast_and_lead_window() {
    // Five observations; the default threshold of ten is lowered to match.
    let s = PrewarmScheduler::new(
        PrewarmConfig {
            min_observations: 5,
            ..PrewarmConfig::default()
        },
        Arc::new(NoopSink),
    );
    observe_secs(&s, &slm(), &[0, 60, 122, 181, 239]);

    let predictions = s.predict(secs(239));
    assert_eq!(predictions.len(), 1);
    assert_eq!(predictions[0].median_interval_ms, 59_500.0);
    assert_eq!(predictions[0].forecast_at, 298_500);

    assert!(s.should_prewarm(&slm(), secs(296)));
}

#[test]
fn test_predict_needs_ten_observations_by_default() {
    let s = PrewarmScheduler::new(PrewarmConfig::default(), Arc::new(NoopSink));
    let class = ResourceClass::new("llm_large");
    for n in 1..=9u64 {
        s.observe(&class, secs(n * 10));
        assert!(
            s.predict(secs(n * 10)).is_empty(),
            "forecast made from only {n} observations"
        );
    }
    s.observe(&class, secs(100));
    let p = s.predict(secs(100));
    assert_eq!(p.len(), 1);
    assert!(p[0].forecast_at > secs(100));
}

#[test]
fn test_forecasts_are_strictly_after_now() {
    let s = PrewarmScheduler::new(PrewarmConfig::default(), Arc::new(NoopSink));
    regular_series(&s, &slm(), 100);
    // Forecast is exactly 110 s: not retained at or after that instant.
    assert!(s.predict(secs(110)).is_empty());
    assert!(s.predict(secs(150)).is_empty());
    for p in s.predict(secs(109)) {
        assert!(p.forecast_at > secs(109));
    }
}

#[test]
fn test_classes_are_forecast_independently() {
    let s = PrewarmScheduler::new(PrewarmConfig::default(), Arc::new(NoopSink));
    let thin = ResourceClass::new("thin");
    regular_series(&s, &slm(), 100);
    observe_secs(&s, &thin, &[10, 20, 30]);
    let p = s.predict(secs(100));
    assert_eq!(p.len(), 1);
    assert_eq!(p[0].class, slm());
    assert!(!s.should_prewarm(&thin, secs(100)));
}

#[test]
fn test_series_is_bounded() {
    let s = PrewarmScheduler::new(PrewarmConfig::default(), Arc::new(NoopSink));
    for i in 0..1_500u64 {
        s.observe(&slm(), i * 1_000);
    }
    assert_eq!(s.observation_count(&slm()), 1_000);
}

// ============================================================================
// Tickets
// ============================================================================

#[test]
fn test_unclaimed_ticket_is_wasted_after_expiry() {
    let sink = Arc::new(PrometheusSink::new().unwrap());
    let s = PrewarmScheduler::new(
        PrewarmConfig {
            ticket_ttl_s: 180,
            ..PrewarmConfig::default()
        },
        sink.clone(),
    );
    // Forecast at 130 s; issued at 120 s, so the ticket expires at 300 s.
    regular_series(&s, &slm(), 120);
    let pool = RecordingPool::default();
    let issued = s.run_prediction_cycle(secs(120), &pool);
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].expires_at, secs(300));
    assert_eq!(pool.warmed.lock().as_slice(), &[(slm(), secs(300))]);

    // Nothing claims it; still open just before expiry.
    assert!(s.sweep_expired(secs(299)).is_empty());
    let wasted = s.sweep_expired(secs(301));
    assert_eq!(wasted.len(), 1);
    assert_eq!(
        wasted[0].state,
        TicketState::Wasted {
            wasted_ms: secs(180)
        }
    );
    assert!(s.active_ticket(&slm()).is_none());

    let labels = [("resource_class", "slm_balanced")];
    assert_eq!(sink.counter_value(PREWARM_WASTED_TOTAL, &labels), 1);
    assert_eq!(
        sink.histogram_totals(PREWARM_WASTE_MS, &labels),
        (1, secs(180) as f64)
    );
    // A second sweep does not count it again.
    assert!(s.sweep_expired(secs(400)).is_empty());
    assert_eq!(sink.counter_value(PREWARM_WASTED_TOTAL, &labels), 1);
}

#[test]
fn test_matching_request_marks_ticket_hit() {
    let sink = Arc::new(PrometheusSink::new().unwrap());
    let s = PrewarmScheduler::new(PrewarmConfig::default(), sink.clone());
    regular_series(&s, &slm(), 120);
    let pool = RecordingPool::default();
    s.run_prediction_cycle(secs(120), &pool);

    let hit = s.claim_ticket(&slm(), secs(131)).unwrap();
    assert_eq!(hit.state, TicketState::Hit { at: secs(131) });
    assert!(s.claim_ticket(&slm(), secs(132)).is_none());
    assert!(s.sweep_expired(secs(10_000)).is_empty());

    let labels = [("resource_class", "slm_balanced")];
    assert_eq!(sink.counter_value(PREWARM_ISSUED_TOTAL, &labels), 1);
    assert_eq!(sink.counter_value(PREWARM_HITS_TOTAL, &labels), 1);
    assert_eq!(sink.counter_value(PREWARM_WASTED_TOTAL, &labels), 0);
}

#[test]
fn test_at_most_one_open_ticket_per_class() {
    let s = PrewarmScheduler::new(PrewarmConfig::default(), Arc::new(NoopSink));
    regular_series(&s, &slm(), 120);
    let pool = RecordingPool::default();
    assert_eq!(s.run_prediction_cycle(secs(120), &pool).len(), 1);
    assert!(s.run_prediction_cycle(secs(121), &pool).is_empty());
    assert!(!s.should_prewarm(&slm(), secs(122)));
    assert_eq!(pool.warmed.lock().len(), 1);
}

#[test]
fn test_concurrent_observers_and_claims_close_ticket_once() {
    let s = Arc::new(PrewarmScheduler::new(PrewarmConfig::default(), Arc::new(NoopSink)));
    regular_series(&s, &slm(), 120);
    let pool = RecordingPool::default();
    s.run_prediction_cycle(secs(120), &pool);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                s.observe(&slm(), secs(125) + i);
                s.claim_ticket(&slm(), secs(125) + i).is_some()
            })
        })
        .collect();
    let hits = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|hit| *hit)
        .count();
    assert_eq!(hits, 1);
    assert_eq!(s.closed_tickets().len(), 1);
}
