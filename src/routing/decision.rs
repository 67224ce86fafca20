//! Routing requests, constraints, and archived decisions.

use serde::Serialize;
use std::fmt;

use crate::clock::UnixMillis;
use crate::protocol::{Frame, QosClass};
use crate::{ArmId, RequestId, ResourceClass};

/// Features that select a contextual bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct RoutingContext {
    /// Task type (e.g. `"code"`).
    pub task_type: Option<String>,
    /// Primary language.
    pub language: Option<String>,
    /// Risk tier label.
    pub risk: Option<String>,
}

impl RoutingContext {
    /// Extract the routing context from a request frame's metadata.
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            task_type: frame.meta.task_type.clone(),
            language: frame.meta.languages.first().cloned(),
            risk: frame.meta.risk.map(|r| r.as_str().to_string()),
        }
    }

    /// Bucket key, or `None` when no feature is set.
    pub fn key(&self) -> Option<ContextKey> {
        if self.task_type.is_none() && self.language.is_none() && self.risk.is_none() {
            return None;
        }
        Some(ContextKey(format!(
            "{}/{}/{}",
            self.task_type.as_deref().unwrap_or("*"),
            self.language.as_deref().unwrap_or("*"),
            self.risk.as_deref().unwrap_or("*"),
        )))
    }
}

/// Key of a contextual statistics bucket, `task/language/risk`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextKey(String);

impl ContextKey {
    /// Key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical request to be routed.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRequest {
    /// Id the decision is archived and rewarded under.
    pub request_id: RequestId,
    /// Contextual features.
    pub context: RoutingContext,
    /// Estimated total tokens, used to predict cost.
    pub estimated_tokens: u64,
    /// Priority tier.
    pub qos: QosClass,
}

impl RoutingRequest {
    /// Request with an empty context and silver QoS.
    pub fn new(request_id: impl Into<String>, estimated_tokens: u64) -> Self {
        Self {
            request_id: RequestId::new(request_id),
            context: RoutingContext::default(),
            estimated_tokens,
            qos: QosClass::Silver,
        }
    }

    /// Replace the context.
    pub fn with_context(mut self, context: RoutingContext) -> Self {
        self.context = context;
        self
    }

    /// Replace the QoS class.
    pub fn with_qos(mut self, qos: QosClass) -> Self {
        self.qos = qos;
        self
    }
}

/// Hard eligibility constraints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constraints {
    /// Minimum static arm quality.
    pub quality_target: f64,
    /// Maximum predicted cost in micro-USD.
    pub max_cost_usd_micros: u64,
    /// Maximum predicted latency in milliseconds.
    pub latency_slo_ms: u64,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            quality_target: 0.0,
            max_cost_usd_micros: u64::MAX,
            latency_slo_ms: u64::MAX,
        }
    }
}

/// Why an arm was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Rationale {
    /// The arm with the best mean reward won.
    Exploitation,
    /// An arm other than the best-mean arm won (uncertainty bonus or sample).
    Exploration,
    /// The arm is the champion and a challenger was mirrored alongside it.
    Champion,
    /// Alternate arm after a backend failure.
    Retry,
}

impl Rationale {
    /// Lowercase label for logs, metrics, and event frames.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exploitation => "exploitation",
            Self::Exploration => "exploration",
            Self::Champion => "champion",
            Self::Retry => "retry",
        }
    }
}

/// Immutable record of one routing decision.
///
/// At most one exists per request id; it is archived for reward attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub(crate) request_id: RequestId,
    pub(crate) arm_id: ArmId,
    pub(crate) resource_class: ResourceClass,
    pub(crate) backend: String,
    pub(crate) rationale: Rationale,
    pub(crate) challenger: Option<ArmId>,
    pub(crate) predicted_cost_usd_micros: u64,
    pub(crate) predicted_latency_ms: f64,
    pub(crate) score: f64,
    pub(crate) context_key: Option<ContextKey>,
    pub(crate) qos: QosClass,
    pub(crate) decided_at: UnixMillis,
    pub(crate) attempt: u32,
}

impl RoutingDecision {
    /// Request id the decision is archived under.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Chosen arm.
    pub fn arm_id(&self) -> &ArmId {
        &self.arm_id
    }

    /// Resource class of the chosen arm.
    pub fn resource_class(&self) -> &ResourceClass {
        &self.resource_class
    }

    /// Backend adapter name of the chosen arm.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Selection rationale.
    pub fn rationale(&self) -> Rationale {
        self.rationale
    }

    /// Challenger arm mirrored in shadow, if any.
    pub fn challenger(&self) -> Option<&ArmId> {
        self.challenger.as_ref()
    }

    /// Predicted cost in micro-USD.
    pub fn predicted_cost_usd_micros(&self) -> u64 {
        self.predicted_cost_usd_micros
    }

    /// Predicted latency in milliseconds.
    pub fn predicted_latency_ms(&self) -> f64 {
        self.predicted_latency_ms
    }

    /// Policy score of the chosen arm.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Context bucket the decision was made in.
    pub fn context_key(&self) -> Option<&ContextKey> {
        self.context_key.as_ref()
    }

    /// QoS class of the request.
    pub fn qos(&self) -> QosClass {
        self.qos
    }

    /// Decision time.
    pub fn decided_at(&self) -> UnixMillis {
        self.decided_at
    }

    /// `1` for the first attempt, `2` for the alternate-arm retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
