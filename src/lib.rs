//! # tokio-stream-router
//!
//! Session-oriented router for inference backends over Tokio.
//!
//! ## Architecture
//!
//! Four subsystems, leaf first:
//! ```text
//! protocol (frames, codec, session ledger)
//!    ├── routing  (arm registry, bandit policies, decision engine, usage ledger)
//!    ├── prewarm  (demand series, median-interval forecasting, tickets, loops)
//!    └── orchestrator (session loop → per-stream state machine → backend stream)
//! ```
//!
//! Callers talk JSON frames over any transport; the orchestrator exposes a
//! [`orchestrator::SessionHandle`] with an inbound and an outbound channel of
//! wire text.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod audit;
pub mod backend;
pub mod clock;
pub mod config;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod policy;
pub mod prewarm;
pub mod protocol;
pub mod routing;

// Re-exports for convenience
pub use backend::{BackendAdapter, EchoBackend};
pub use config::{LogFormat, RouterConfig};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, SessionHandle};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    init_tracing_with(format)
}

/// Initialise the global tracing subscriber with an explicit format.
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set.
pub fn init_tracing_with(format: LogFormat) -> Result<(), OrchestratorError> {
    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };
    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors surfaced while building or driving an [`Orchestrator`].
///
/// Request-scoped failures never reach this type; they terminate a single
/// stream with an `error` frame (see [`orchestrator::StreamError`]).
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A channel closed unexpectedly, indicating task shutdown.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than on the first routed request.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Metrics registry construction failed.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Return the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a long-lived caller session.
    SessionId
);

string_id!(
    /// Identifier of one stream within a session. Stream `"0"` is the
    /// control stream used for heartbeats and undecodable-frame errors.
    StreamId
);

string_id!(
    /// Identifier of a routable backend/model configuration.
    ArmId
);

string_id!(
    /// Resource class (model tier) that demand is forecast for.
    ResourceClass
);

string_id!(
    /// Opaque principal/tenant identity attached to a session.
    PrincipalId
);

string_id!(
    /// Key used for decision archival, reward attribution, and usage
    /// charging. One logical request maps to exactly one id.
    RequestId
);

impl StreamId {
    /// The reserved control stream.
    pub fn control() -> Self {
        Self("0".to_string())
    }

    /// Return `true` if this is the reserved control stream.
    pub fn is_control(&self) -> bool {
        self.0 == "0"
    }
}

impl RequestId {
    /// Derive the request id of the logical request carried by a stream.
    ///
    /// Caller retries of the same stream map to the same id, which is what
    /// makes reward attribution and charging idempotent.
    pub fn for_stream(session: &SessionId, stream: &StreamId) -> Self {
        Self(format!("{}/{}", session.0, stream.0))
    }

    /// Id for the alternate-arm attempt after a backend failure.
    pub fn retry(&self) -> Self {
        Self(format!("{}#retry", self.0))
    }

    /// Id for the shadow (challenger) execution of this request.
    pub fn shadow(&self) -> Self {
        Self(format!("{}#shadow", self.0))
    }
}
