//! Prewarm tickets.

use serde::Serialize;

use crate::clock::UnixMillis;
use crate::ResourceClass;

/// Lifecycle state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketState {
    /// Issued and waiting for a matching request.
    Open,
    /// Claimed by a matching request.
    Hit {
        /// Claim time.
        at: UnixMillis,
    },
    /// Expired unclaimed.
    Wasted {
        /// Warm time spent for nothing: `expires_at - issued_at`.
        wasted_ms: u64,
    },
}

/// A record that a resource class was proactively warmed.
///
/// At most one open ticket exists per class. An open ticket closes exactly
/// once, as a hit or as wasted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrewarmTicket {
    /// Warmed resource class.
    pub class: ResourceClass,
    /// Forecast demand time that triggered the ticket.
    pub predicted_at: UnixMillis,
    /// Issue time.
    pub issued_at: UnixMillis,
    /// Time after which the ticket can no longer be claimed.
    pub expires_at: UnixMillis,
    /// Lifecycle state.
    pub state: TicketState,
}

impl PrewarmTicket {
    /// Open a ticket valid for `ttl_ms` from `issued_at`.
    pub fn issue(class: ResourceClass, predicted_at: UnixMillis, issued_at: UnixMillis, ttl_ms: u64) -> Self {
        Self {
            class,
            predicted_at,
            issued_at,
            expires_at: issued_at.saturating_add(ttl_ms),
            state: TicketState::Open,
        }
    }

    /// Return `true` while the ticket is open.
    pub fn is_open(&self) -> bool {
        self.state == TicketState::Open
    }

    /// Return `true` if the ticket can no longer be claimed at `now`.
    pub fn is_expired(&self, now: UnixMillis) -> bool {
        now >= self.expires_at
    }

    /// Close the ticket as a hit. Returns `false` if not claimable at `now`.
    pub fn claim(&mut self, now: UnixMillis) -> bool {
        if !self.is_open() || self.is_expired(now) {
            return false;
        }
        self.state = TicketState::Hit { at: now };
        true
    }

    /// Close the ticket as wasted and return the wasted duration. Returns
    /// `None` if the ticket was already closed.
    pub fn waste(&mut self) -> Option<u64> {
        if !self.is_open() {
            return None;
        }
        let wasted_ms = self.expires_at.saturating_sub(self.issued_at);
        self.state = TicketState::Wasted { wasted_ms };
        Some(wasted_ms)
    }
}
