//! Caller-visible stream errors.
//!
//! Every way a stream can end badly maps to exactly one [`ErrorCode`]. The
//! error frame sent to the caller carries the code and a fixed public
//! message; inner error text stays in the logs.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::backend::BackendError;
use crate::protocol::ProtocolError;
use crate::routing::{ExclusionCounts, RoutingError};

/// Stable error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or out-of-order frame.
    ProtocolError,
    /// Routing found no arm satisfying the constraints.
    NoEligibleArm,
    /// The policy collaborator denied the request.
    PolicyDenied,
    /// The request would exceed its resource window.
    BudgetExceeded,
    /// The backend failed and no retry was possible.
    BackendError,
    /// The stream outlived its TTL.
    SessionExpired,
    /// The stream was cancelled.
    Cancelled,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    /// Wire value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::NoEligibleArm => "NO_ELIGIBLE_ARM",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::BackendError => "BACKEND_ERROR",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Fixed caller-facing message.
    pub fn public_message(self) -> &'static str {
        match self {
            Self::ProtocolError => "frame rejected by protocol validation",
            Self::NoEligibleArm => "no backend satisfies the request constraints",
            Self::PolicyDenied => "request denied by policy",
            Self::BudgetExceeded => "request exceeds its resource window",
            Self::BackendError => "backend failed to complete the request",
            Self::SessionExpired => "stream expired before completion",
            Self::Cancelled => "stream cancelled",
            Self::Internal => "internal error",
        }
    }
}

/// Why a stream terminated without success.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StreamError {
    /// Inbound frame violated the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Routing exhausted every arm.
    #[error("no eligible arm ({0:?})")]
    NoEligibleArm(ExclusionCounts),

    /// Policy collaborator said no.
    #[error("policy denied: {reason_code}")]
    PolicyDenied {
        /// Caller-safe reason code from the policy.
        reason_code: String,
    },

    /// Estimated consumption exceeds the request's window.
    #[error("budget exceeded: estimated {estimated}, limit {limit}")]
    BudgetExceeded {
        /// Estimated cost (micro-USD) or tokens, whichever tripped.
        estimated: u64,
        /// The window limit it was compared against.
        limit: u64,
    },

    /// Backend failed after the retry budget was spent.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// TTL elapsed.
    #[error("stream expired")]
    SessionExpired,

    /// The router shut down while the stream was open.
    #[error("stream cancelled")]
    Cancelled,

    /// The router could not run the selected arm; the arm is retired.
    #[error("internal: {0}")]
    Internal(String),
}

impl StreamError {
    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::NoEligibleArm(_) => ErrorCode::NoEligibleArm,
            Self::PolicyDenied { .. } => ErrorCode::PolicyDenied,
            Self::BudgetExceeded { .. } => ErrorCode::BudgetExceeded,
            Self::Backend(_) => ErrorCode::BackendError,
            Self::SessionExpired => ErrorCode::SessionExpired,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Content of the `error` frame sent to the caller.
    ///
    /// Only the policy reason code is passed through; it is defined by the
    /// policy collaborator as caller-safe.
    pub fn frame_content(&self) -> Value {
        let code = self.code();
        let mut content = json!({
            "code": code.as_str(),
            "message": code.public_message(),
        });
        if let Self::PolicyDenied { reason_code } = self {
            content["reasonCode"] = Value::String(reason_code.clone());
        }
        content
    }

    /// Map a routing failure.
    ///
    /// When cost was the only reason arms were excluded the request was over
    /// budget, not unroutable.
    pub fn from_routing(err: RoutingError, limit: u64) -> Self {
        match err {
            RoutingError::NoEligibleArm { excluded, .. } if excluded.only_cost() => {
                Self::BudgetExceeded {
                    estimated: limit.saturating_add(1),
                    limit,
                }
            }
            RoutingError::NoEligibleArm { excluded, .. } => Self::NoEligibleArm(excluded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RequestId;

    #[test]
    fn test_every_variant_maps_to_one_code() {
        let cases = [
            (StreamError::Protocol(ProtocolError::MissingField("streamId")), "PROTOCOL_ERROR"),
            (StreamError::NoEligibleArm(ExclusionCounts::default()), "NO_ELIGIBLE_ARM"),
            (
                StreamError::PolicyDenied {
                    reason_code: "x".into(),
                },
                "POLICY_DENIED",
            ),
            (
                StreamError::BudgetExceeded {
                    estimated: 2,
                    limit: 1,
                },
                "BUDGET_EXCEEDED",
            ),
            (StreamError::Backend(BackendError::Timeout(5)), "BACKEND_ERROR"),
            (StreamError::SessionExpired, "SESSION_EXPIRED"),
            (StreamError::Cancelled, "CANCELLED"),
            (StreamError::Internal("x".into()), "INTERNAL"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code().as_str(), code);
        }
    }

    #[test]
    fn test_frame_content_hides_inner_error_text() {
        let err = StreamError::Backend(BackendError::Stream("secret upstream detail".into()));
        let content = err.frame_content();
        assert_eq!(content["code"], "BACKEND_ERROR");
        assert!(!content.to_string().contains("secret"));
    }

    #[test]
    fn test_policy_denied_carries_reason_code() {
        let err = StreamError::PolicyDenied {
            reason_code: "tool_denied:shell".into(),
        };
        assert_eq!(err.frame_content()["reasonCode"], "tool_denied:shell");
    }

    #[test]
    fn test_cost_only_exclusion_maps_to_budget_exceeded() {
        let err = RoutingError::NoEligibleArm {
            request_id: RequestId::new("r"),
            excluded: ExclusionCounts {
                cost: 2,
                ..ExclusionCounts::default()
            },
        };
        assert_eq!(StreamError::from_routing(err, 1000).code(), ErrorCode::BudgetExceeded);

        let err = RoutingError::NoEligibleArm {
            request_id: RequestId::new("r"),
            excluded: ExclusionCounts {
                cost: 1,
                latency: 1,
                ..ExclusionCounts::default()
            },
        };
        assert_eq!(StreamError::from_routing(err, 1000).code(), ErrorCode::NoEligibleArm);
    }
}
