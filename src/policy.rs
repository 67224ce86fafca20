//! Policy collaborator interface.
//!
//! The router never interprets permissions itself: it hands a
//! [`PermissionRequest`] to a [`PolicyEvaluator`] and treats `Deny` as a
//! terminal `POLICY_DENIED` error for the stream.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::protocol::Frame;
use crate::PrincipalId;

/// Input to a policy decision, built from the request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRequest {
    /// Session principal.
    pub principal: PrincipalId,
    /// Tools the caller asks to use.
    pub tool_permissions: Vec<String>,
    /// Data scope label.
    pub data_scope: Option<String>,
    /// Risk tier label.
    pub risk: Option<String>,
    /// Task type.
    pub task_type: Option<String>,
}

impl PermissionRequest {
    /// Build from a request frame's metadata.
    pub fn from_frame(principal: &PrincipalId, frame: &Frame) -> Self {
        Self {
            principal: principal.clone(),
            tool_permissions: frame.meta.tool_permissions.clone(),
            data_scope: frame.meta.data_scope.clone(),
            risk: frame.meta.risk.map(|r| r.as_str().to_string()),
            task_type: frame.meta.task_type.clone(),
        }
    }
}

/// Allow/deny verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// The request may proceed.
    Allow,
    /// The request is refused.
    Deny {
        /// Stable, caller-safe reason code.
        reason_code: String,
    },
}

/// Opaque policy engine.
///
/// Evaluation is synchronous and must be cheap: it runs on the stream task
/// before routing.
pub trait PolicyEvaluator: Send + Sync + fmt::Debug {
    /// Decide whether `request` may proceed.
    fn evaluate(&self, request: &PermissionRequest) -> PolicyVerdict;
}

/// Allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PolicyEvaluator for AllowAll {
    fn evaluate(&self, _request: &PermissionRequest) -> PolicyVerdict {
        PolicyVerdict::Allow
    }
}

/// Denies any request asking for a listed tool.
#[derive(Debug, Default, Clone)]
pub struct ToolDenyList {
    denied: BTreeSet<String>,
}

impl ToolDenyList {
    /// Deny the given tools.
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: tools.into_iter().map(Into::into).collect(),
        }
    }
}

impl PolicyEvaluator for ToolDenyList {
    fn evaluate(&self, request: &PermissionRequest) -> PolicyVerdict {
        match request
            .tool_permissions
            .iter()
            .find(|t| self.denied.contains(t.as_str()))
        {
            Some(tool) => PolicyVerdict::Deny {
                reason_code: format!("tool_denied:{tool}"),
            },
            None => PolicyVerdict::Allow,
        }
    }
}
