//! Usage and spend accounting.
//!
//! Tracks per-arm token usage and spend, charging each request id at most
//! once so that caller retries, retried deliveries, and cancellation races
//! never double-bill.
//!
//! Costs are stored as micro-dollars (1 USD = 1 000 000 micro-dollars) to
//! avoid floating-point drift in long-running aggregations.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::dedup::RetentionMap;
use crate::backend::Usage;
use crate::clock::UnixMillis;
use crate::{ArmId, RequestId};

#[derive(Debug, Default)]
struct ArmUsage {
    requests: AtomicU64,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    usd_micros: AtomicU64,
}

/// Point-in-time usage of one arm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArmUsageSnapshot {
    /// Charged requests.
    pub requests: u64,
    /// Input tokens.
    pub tokens_in: u64,
    /// Output tokens.
    pub tokens_out: u64,
    /// Spend in micro-USD.
    pub usd_micros: u64,
}

/// Point-in-time usage across all arms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    /// Per-arm usage, ordered by arm id.
    pub per_arm: BTreeMap<ArmId, ArmUsageSnapshot>,
    /// Total spend in micro-USD.
    pub total_usd_micros: u64,
    /// Total charged requests.
    pub total_requests: u64,
}

/// Exactly-once usage ledger.
///
/// Counters are lock-free atomics; the charged-id set is bounded by the
/// same retention window as outcome dedupe.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug)]
pub struct UsageLedger {
    per_arm: DashMap<ArmId, ArmUsage>,
    charged: RetentionMap<RequestId, ArmId>,
}

impl UsageLedger {
    /// Create an empty ledger.
    pub fn new(retention_ms: u64, max_entries: usize) -> Self {
        Self {
            per_arm: DashMap::new(),
            charged: RetentionMap::new(retention_ms, max_entries),
        }
    }

    /// Charge `usage` to `arm_id` under `request_id`.
    ///
    /// Returns `false` if the request id was already charged; nothing changes.
    pub fn record(&self, request_id: &RequestId, arm_id: &ArmId, usage: &Usage, now: UnixMillis) -> bool {
        if let Err(prev) = self.charged.insert_if_absent(request_id.clone(), arm_id.clone(), now) {
            debug!(request_id = %request_id, arm_id = %prev, "duplicate usage charge ignored");
            return false;
        }
        let entry = self.per_arm.entry(arm_id.clone()).or_default();
        entry.requests.fetch_add(1, Ordering::Relaxed);
        entry.tokens_in.fetch_add(usage.tokens_in, Ordering::Relaxed);
        entry.tokens_out.fetch_add(usage.tokens_out, Ordering::Relaxed);
        entry
            .usd_micros
            .fetch_add(usage.cost_usd_micros, Ordering::Relaxed);
        true
    }

    /// Return `true` if `request_id` has been charged and is still remembered.
    pub fn is_charged(&self, request_id: &RequestId) -> bool {
        self.charged.contains(request_id)
    }

    /// Usage of one arm.
    pub fn arm_usage(&self, arm_id: &ArmId) -> ArmUsageSnapshot {
        self.per_arm
            .get(arm_id)
            .map(|u| snapshot_of(u.value()))
            .unwrap_or_default()
    }

    /// Usage across all arms.
    pub fn snapshot(&self) -> UsageSnapshot {
        let per_arm: BTreeMap<ArmId, ArmUsageSnapshot> = self
            .per_arm
            .iter()
            .map(|e| (e.key().clone(), snapshot_of(e.value())))
            .collect();
        UsageSnapshot {
            total_usd_micros: per_arm.values().map(|u| u.usd_micros).sum(),
            total_requests: per_arm.values().map(|u| u.requests).sum(),
            per_arm,
        }
    }
}

fn snapshot_of(u: &ArmUsage) -> ArmUsageSnapshot {
    ArmUsageSnapshot {
        requests: u.requests.load(Ordering::Relaxed),
        tokens_in: u.tokens_in.load(Ordering::Relaxed),
        tokens_out: u.tokens_out.load(Ordering::Relaxed),
        usd_micros: u.usd_micros.load(Ordering::Relaxed),
    }
}
