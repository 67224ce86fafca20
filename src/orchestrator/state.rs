//! Per-stream lifecycle.
//!
//! ```text
//! OPEN ──► ROUTING ──► STREAMING ──► FINAL ──► CLOSED
//!   │         │  ▲         │                     ▲
//!   │         │  └─retry───┤                     │
//!   │         ├────────────┴──► CANCELLED ───────┤
//!   └─────────┴──── error frame ─────────────────┘
//! ```

use serde::Serialize;
use std::fmt;

/// Lifecycle state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    /// Request accepted, not yet routed.
    Open,
    /// Policy, budget, and arm selection.
    Routing,
    /// Backend call in progress.
    Streaming,
    /// Terminal success frame emitted.
    Final,
    /// Stopped by cancel, TTL, heartbeat timeout, or shutdown.
    Cancelled,
    /// Nothing more will be emitted.
    Closed,
}

impl StreamState {
    /// Upper-case label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Routing => "ROUTING",
            Self::Streaming => "STREAMING",
            Self::Final => "FINAL",
            Self::Cancelled => "CANCELLED",
            Self::Closed => "CLOSED",
        }
    }

    /// Return `true` if `self -> next` is a legal transition.
    ///
    /// Any non-terminal state may go straight to `Closed` after an error
    /// frame. `Streaming -> Routing` is the single alternate-arm retry.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Open, Routing)
                | (Open, Cancelled)
                | (Open, Closed)
                | (Routing, Streaming)
                | (Routing, Cancelled)
                | (Routing, Closed)
                | (Streaming, Routing)
                | (Streaming, Final)
                | (Streaming, Cancelled)
                | (Streaming, Closed)
                | (Final, Closed)
                | (Cancelled, Closed)
        )
    }

    /// Return `true` once nothing can follow.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks a stream's state and the path it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLifecycle {
    history: Vec<StreamState>,
}

impl Default for StreamLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamLifecycle {
    /// Start in `Open`.
    pub fn new() -> Self {
        Self {
            history: vec![StreamState::Open],
        }
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.history
            .last()
            .copied()
            .unwrap_or(StreamState::Open)
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[StreamState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns the rejected `(from, to)` pair if the transition is illegal;
    /// the state is unchanged.
    pub fn advance(&mut self, next: StreamState) -> Result<(), (StreamState, StreamState)> {
        let from = self.state();
        if from.can_transition_to(next) {
            self.history.push(next);
            Ok(())
        } else {
            Err((from, next))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let mut lc = StreamLifecycle::new();
        for s in [
            StreamState::Routing,
            StreamState::Streaming,
            StreamState::Final,
            StreamState::Closed,
        ] {
            lc.advance(s).unwrap();
        }
        assert!(lc.state().is_terminal());
        assert_eq!(lc.history().len(), 5);
    }

    #[test]
    fn test_cancel_only_from_open_routing_streaming() {
        assert!(StreamState::Routing.can_transition_to(StreamState::Cancelled));
        assert!(StreamState::Streaming.can_transition_to(StreamState::Cancelled));
        assert!(!StreamState::Final.can_transition_to(StreamState::Cancelled));
        assert!(!StreamState::Closed.can_transition_to(StreamState::Cancelled));
    }

    #[test]
    fn test_illegal_transition_leaves_state_unchanged() {
        let mut lc = StreamLifecycle::new();
        assert_eq!(
            lc.advance(StreamState::Final),
            Err((StreamState::Open, StreamState::Final))
        );
        assert_eq!(lc.state(), StreamState::Open);
    }

    #[test]
    fn test_retry_returns_to_routing() {
        let mut lc = StreamLifecycle::new();
        lc.advance(StreamState::Routing).unwrap();
        lc.advance(StreamState::Streaming).unwrap();
        lc.advance(StreamState::Routing).unwrap();
        lc.advance(StreamState::Streaming).unwrap();
        assert_eq!(lc.state(), StreamState::Streaming);
        assert!(!lc.history().contains(&StreamState::Cancelled));
    }
}
