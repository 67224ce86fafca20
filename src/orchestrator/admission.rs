//! QoS-ordered stream admission.
//!
//! Each session admits at most `window.maxParallel` streams at a time.
//! Streams that must wait are queued by QoS, gold before silver before
//! bronze, and in arrival order within a class. A waiter that gives up
//! (its stream was cancelled or expired while queued) is skipped.
//!
//! Capacity follows the most recent request's window: growing it admits
//! waiters immediately, shrinking it takes effect as running streams finish.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::QosClass;

struct Waiter {
    priority: u8,
    sequence: u64,
    tx: oneshot::Sender<AdmissionPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (FIFO).
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

struct AdmissionState {
    capacity: usize,
    in_use: usize,
    sequence: u64,
    waiters: BinaryHeap<Waiter>,
}

/// Per-session admission gate.
pub(crate) struct Admission {
    state: Mutex<AdmissionState>,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Admission")
            .field("capacity", &state.capacity)
            .field("in_use", &state.in_use)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// Held by a running stream; dropping it admits the next waiter.
#[derive(Debug)]
pub(crate) struct AdmissionPermit {
    admission: Option<Arc<Admission>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            admission.release();
        }
    }
}

impl Admission {
    /// Gate admitting `capacity` streams at once (at least one).
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AdmissionState {
                capacity: capacity.max(1),
                in_use: 0,
                sequence: 0,
                waiters: BinaryHeap::new(),
            }),
        })
    }

    /// Change the number of concurrently admitted streams.
    pub(crate) fn resize(self: &Arc<Self>, capacity: usize) {
        let mut state = self.state.lock();
        let capacity = capacity.max(1);
        if state.capacity != capacity {
            debug!(from = state.capacity, to = capacity, "admission capacity changed");
            state.capacity = capacity;
        }
        self.grant(&mut state);
    }

    /// Wait for admission. Returns `None` if the gate was dropped while
    /// waiting.
    pub(crate) async fn acquire(self: &Arc<Self>, qos: QosClass) -> Option<AdmissionPermit> {
        let rx = {
            let mut state = self.state.lock();
            if state.waiters.is_empty() && state.in_use < state.capacity {
                state.in_use += 1;
                return Some(AdmissionPermit {
                    admission: Some(Arc::clone(self)),
                });
            }
            let (tx, rx) = oneshot::channel();
            state.sequence += 1;
            let sequence = state.sequence;
            state.waiters.push(Waiter {
                priority: qos.priority(),
                sequence,
                tx,
            });
            debug!(qos = qos.as_str(), waiting = state.waiters.len(), "stream queued for admission");
            rx
        };
        rx.await.ok()
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        self.grant(&mut state);
    }

    /// Hand free slots to the best waiters still listening.
    fn grant(self: &Arc<Self>, state: &mut AdmissionState) {
        while state.in_use < state.capacity {
            let Some(waiter) = state.waiters.pop() else {
                break;
            };
            state.in_use += 1;
            let permit = AdmissionPermit {
                admission: Some(Arc::clone(self)),
            };
            if let Err(mut unclaimed) = waiter.tx.send(permit) {
                // The waiter gave up; take the slot back without re-entering.
                unclaimed.admission = None;
                state.in_use -= 1;
            }
        }
    }
}
