//! Append-only audit trail.
//!
//! Every finalized routing decision and every usage charge is appended to
//! an [`AuditSink`]. The default sink writes structured `tracing` events on
//! the `audit` target so they can be split out by the subscriber.

use serde::Serialize;
use std::fmt;
use tracing::info;

use crate::backend::Usage;
use crate::clock::UnixMillis;
use crate::routing::Rationale;
use crate::{ArmId, RequestId, SessionId};

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    /// A routing decision was finalized for a stream.
    Decision {
        /// Owning session.
        session_id: SessionId,
        /// Request id.
        request_id: RequestId,
        /// Chosen arm.
        arm_id: ArmId,
        /// Selection rationale.
        rationale: Rationale,
        /// Challenger mirrored in shadow, if any.
        challenger: Option<ArmId>,
        /// Decision time.
        at: UnixMillis,
    },
    /// Usage was charged.
    Charge {
        /// Owning session.
        session_id: SessionId,
        /// Request id.
        request_id: RequestId,
        /// Charged arm.
        arm_id: ArmId,
        /// Charged usage.
        usage: Usage,
        /// Whether the stream ended early (cancel, expiry, or failure).
        partial: bool,
        /// Charge time.
        at: UnixMillis,
    },
}

/// Append-only audit destination. Implementations must not block.
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Append one record.
    fn append(&self, record: AuditRecord);
}

/// Writes audit records as `tracing` events on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => info!(target: "audit", record = %json, "audit"),
            Err(e) => info!(target: "audit", error = %e, "audit record not serializable"),
        }
    }
}
