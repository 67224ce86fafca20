//! Frame data model.
//!
//! A [`Frame`] is one protocol message. The JSON field names are the wire
//! names (`sessionId`, `msgSeq`, `maxUsdMicros`, ...). Every optional field
//! survives a serialize/deserialize round trip unchanged, including unknown
//! `meta` keys which are kept in [`FrameMeta::extra`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::{SessionId, StreamId};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Per-frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    /// More frames follow for the same logical message or response.
    Partial,
    /// Terminal frame; no further frames are valid on the stream.
    Final,
    /// Caller requests cancellation of the stream.
    Cancel,
}

/// Scheduling priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosClass {
    /// Highest priority; never mirrored to challenger arms.
    Gold,
    /// Default tier.
    #[default]
    Silver,
    /// Best-effort tier.
    Bronze,
}

impl QosClass {
    /// Lowercase label used in spans and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gold => "gold",
            Self::Silver => "silver",
            Self::Bronze => "bronze",
        }
    }

    /// Admission priority; higher is served first.
    pub fn priority(self) -> u8 {
        match self {
            Self::Gold => 2,
            Self::Silver => 1,
            Self::Bronze => 0,
        }
    }
}

/// Risk tier declared by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// Low-risk content.
    Low,
    /// Medium-risk content.
    Medium,
    /// High-risk content.
    High,
}

impl RiskTier {
    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Upper bounds on what one request may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceWindow {
    /// Maximum parallel sub-requests.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    /// Maximum tokens (input + output).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    /// Maximum spend in micro-USD.
    #[serde(default = "default_max_usd_micros")]
    pub max_usd_micros: u64,
}

fn default_max_parallel() -> u32 {
    1
}

fn default_max_tokens() -> u64 {
    4096
}

fn default_max_usd_micros() -> u64 {
    1_000_000
}

impl Default for ResourceWindow {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_tokens: default_max_tokens(),
            max_usd_micros: default_max_usd_micros(),
        }
    }
}

/// Distributed trace context propagated with the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    /// Trace identifier.
    pub trace_id: String,
    /// Parent span identifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

/// Request metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    /// Task type (e.g. `"code"`, `"chat"`), used as a routing context key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Languages involved; the first one is used as a routing context key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    /// Declared risk tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskTier>,
    /// Data scope label, passed to the policy collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_scope: Option<String>,
    /// Trace context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
    /// Tools the caller asks permission to use.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_permissions: Vec<String>,
    /// Any other metadata keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// Inbound request (or a fragment of one).
    Request,
    /// Outbound partial output.
    Chunk,
    /// Outbound lifecycle notice (route selected, model switch, ...).
    Event,
    /// Outbound terminal error with a stable code.
    Error,
    /// Outbound terminal success with usage metrics.
    Final,
    /// Keepalive in either direction.
    Heartbeat,
    /// Inbound cancellation.
    Cancel,
}

impl PayloadKind {
    /// Lowercase wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Chunk => "chunk",
            Self::Event => "event",
            Self::Error => "error",
            Self::Final => "final",
            Self::Heartbeat => "heartbeat",
            Self::Cancel => "cancel",
        }
    }
}

/// Typed frame content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Payload type.
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    /// Content; shape depends on `kind`.
    #[serde(default)]
    pub content: Value,
    /// Producer confidence in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Estimated cost of serving this request in micro-USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_est: Option<u64>,
    /// Hex SHA-256 of the serialized `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Relative expiry of this payload in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_ms: Option<u64>,
}

impl Payload {
    /// Create a payload with the given type and content and no optional fields.
    pub fn new(kind: PayloadKind, content: Value) -> Self {
        Self {
            kind,
            content,
            confidence: None,
            cost_est: None,
            checksum: None,
            expiry_ms: None,
        }
    }

    /// Hex SHA-256 over the compact JSON serialization of `content`.
    pub fn compute_checksum(content: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Attach a checksum computed from the current content.
    pub fn with_checksum(mut self) -> Self {
        self.checksum = Some(Self::compute_checksum(&self.content));
        self
    }

    /// Return `true` if no checksum is present or it matches the content.
    pub fn checksum_matches(&self) -> bool {
        match &self.checksum {
            None => true,
            Some(sum) => sum.eq_ignore_ascii_case(&Self::compute_checksum(&self.content)),
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Protocol version.
    pub v: u16,
    /// Owning session.
    pub session_id: SessionId,
    /// Stream within the session.
    pub stream_id: StreamId,
    /// Per-stream, per-direction message sequence number.
    pub msg_seq: u64,
    /// Fragment index within one logical message.
    #[serde(default)]
    pub frag_seq: u32,
    /// Frame flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<Flag>,
    /// Scheduling priority tier.
    #[serde(default)]
    pub qos: QosClass,
    /// Time-to-live of the stream in milliseconds, set on the request frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Consumption bounds.
    #[serde(default)]
    pub window: ResourceWindow,
    /// Request metadata.
    #[serde(default)]
    pub meta: FrameMeta,
    /// Content.
    pub payload: Payload,
    /// Optional caller signature; opaque to the router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl Frame {
    /// Build a frame with default window/meta and no flags.
    pub fn new(
        session_id: SessionId,
        stream_id: StreamId,
        msg_seq: u64,
        payload: Payload,
    ) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            session_id,
            stream_id,
            msg_seq,
            frag_seq: 0,
            flags: Vec::new(),
            qos: QosClass::default(),
            ttl: None,
            window: ResourceWindow::default(),
            meta: FrameMeta::default(),
            payload,
            sig: None,
        }
    }

    /// Add a flag (idempotent).
    pub fn with_flag(mut self, flag: Flag) -> Self {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        self
    }

    /// Set the fragment index.
    pub fn with_frag_seq(mut self, frag_seq: u32) -> Self {
        self.frag_seq = frag_seq;
        self
    }

    /// Return `true` if the frame carries `flag`.
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Return `true` if the frame terminates its stream.
    pub fn is_final(&self) -> bool {
        self.has_flag(Flag::Final)
    }

    /// Return `true` if the frame asks to cancel its stream.
    pub fn is_cancel(&self) -> bool {
        self.has_flag(Flag::Cancel) || self.payload.kind == PayloadKind::Cancel
    }
}
