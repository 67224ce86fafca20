//! Session loop.
//!
//! One task per session. It decodes and validates every inbound frame,
//! assembles request fragments, spawns one stream task per request, answers
//! heartbeats on the control stream, and tears the session down on heartbeat
//! timeout, caller hang-up, or shutdown.
//!
//! Suspends only on the next inbound frame, bounded by the heartbeat
//! interval.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::admission::Admission;
use super::error::StreamError;
use super::stream::{emit_frame, run_stream, Services, StopReason, StreamReport, StreamRequest};
use crate::clock::now_millis;
use crate::protocol::{CloseReason, Flag, Frame, Payload, PayloadKind, ProtocolError};
use crate::{PrincipalId, SessionId, StreamId};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The caller dropped its inbound sender.
    CallerClosed,
    /// No inbound frame within the heartbeat interval.
    HeartbeatTimeout,
    /// Every stream expired on TTL and the ledger expired the session.
    Expired,
    /// The orchestrator shut down.
    Shutdown,
}

/// Summary returned when a session task finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Session id.
    pub session_id: SessionId,
    /// Why the loop stopped.
    pub end: SessionEnd,
    /// Reports of every stream that ran, in completion order.
    pub streams: Vec<StreamReport>,
}

enum Slot {
    /// Request fragments received so far.
    Assembling { header: Frame, text: String, ttl_deadline: Option<Instant> },
    /// Stream task running.
    Running { stop: watch::Sender<Option<StopReason>> },
}

pub(crate) struct SessionLoop {
    svc: Arc<Services>,
    session_id: SessionId,
    principal: PrincipalId,
    outbound: mpsc::Sender<String>,
    slots: HashMap<StreamId, Slot>,
    tasks: JoinSet<StreamReport>,
    admission: Option<Arc<Admission>>,
    opened: bool,
    reports: Vec<StreamReport>,
}

impl SessionLoop {
    pub(crate) fn new(
        svc: Arc<Services>,
        session_id: SessionId,
        principal: PrincipalId,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            svc,
            session_id,
            principal,
            outbound,
            slots: HashMap::new(),
            tasks: JoinSet::new(),
            admission: None,
            opened: false,
            reports: Vec::new(),
        }
    }

    /// Drive the session until it ends.
    pub(crate) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SessionSummary {
        let span = info_span!("session", session_id = %self.session_id, principal = %self.principal);
        async move {
            let heartbeat = Duration::from_millis(self.svc.ledger.heartbeat_interval_ms());
            let mut deadline = Instant::now() + heartbeat;
            let end = loop {
                tokio::select! {
                    text = inbound.recv() => match text {
                        Some(text) => {
                            if self.handle_text(&text).await {
                                deadline = Instant::now() + heartbeat;
                            }
                        }
                        None => break SessionEnd::CallerClosed,
                    },
                    Some(joined) = self.tasks.join_next() => {
                        if self.on_stream_finished(joined) {
                            break SessionEnd::Expired;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break SessionEnd::HeartbeatTimeout,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break SessionEnd::Shutdown;
                        }
                    }
                }
            };
            self.teardown(end).await
        }
        .instrument(span)
        .await
    }

    /// Handle one inbound wire text. Returns `true` if it was a valid frame,
    /// which counts as proof of life.
    async fn handle_text(&mut self, text: &str) -> bool {
        if !self.opened {
            self.svc
                .ledger
                .open_session(&self.session_id, &self.principal, now_millis());
            self.opened = true;
        }

        let frame = match self.svc.codec.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject(&StreamId::control(), e).await;
                return false;
            }
        };
        if frame.session_id != self.session_id {
            let e = ProtocolError::SessionMismatch {
                expected: self.session_id.to_string(),
                got: frame.session_id.to_string(),
            };
            self.reject(&StreamId::control(), e).await;
            return false;
        }
        if let Err(e) = self.svc.ledger.validate_frame(&frame, now_millis()) {
            self.reject(&frame.stream_id, e).await;
            return false;
        }

        if frame.stream_id.is_control() {
            self.handle_control(frame).await;
        } else if frame.is_cancel() {
            self.handle_cancel(&frame.stream_id);
        } else {
            match frame.payload.kind {
                PayloadKind::Request => self.handle_request(frame).await,
                PayloadKind::Heartbeat => self.answer_heartbeat().await,
                kind => {
                    let e = ProtocolError::UnexpectedPayload {
                        stream_id: frame.stream_id.to_string(),
                        kind: kind.as_str().to_string(),
                    };
                    self.reject(&frame.stream_id, e).await;
                }
            }
        }
        true
    }

    async fn handle_control(&mut self, frame: Frame) {
        match frame.payload.kind {
            PayloadKind::Heartbeat => self.answer_heartbeat().await,
            kind => {
                let e = ProtocolError::UnexpectedPayload {
                    stream_id: frame.stream_id.to_string(),
                    kind: kind.as_str().to_string(),
                };
                self.reject(&frame.stream_id, e).await;
            }
        }
    }

    async fn answer_heartbeat(&mut self) {
        if let Err(e) = self.svc.ledger.heartbeat(&self.session_id) {
            debug!(error = %e, "heartbeat on a session the ledger no longer holds");
            return;
        }
        emit_frame(
            &self.svc,
            &self.outbound,
            &self.session_id,
            &StreamId::control(),
            PayloadKind::Heartbeat,
            json!({ "at": now_millis() }),
            None,
        )
        .await;
    }

    fn handle_cancel(&mut self, stream_id: &StreamId) {
        match self.slots.remove(stream_id) {
            Some(Slot::Running { stop }) => {
                let _ = stop.send(Some(StopReason::CancelFrame));
                self.slots.insert(stream_id.clone(), Slot::Running { stop });
            }
            Some(Slot::Assembling { .. }) | None => {
                debug!(stream_id = %stream_id, "cancel before dispatch");
                self.svc
                    .ledger
                    .close_stream(&self.session_id, stream_id, CloseReason::Cancelled);
            }
        }
    }

    async fn handle_request(&mut self, frame: Frame) {
        let stream_id = frame.stream_id.clone();
        let fragment = fragment_text(&frame.payload);
        let more = frame.has_flag(Flag::Partial);

        let (header, text, ttl_deadline) = match self.slots.remove(&stream_id) {
            Some(Slot::Running { stop }) => {
                self.slots.insert(stream_id.clone(), Slot::Running { stop });
                let e = ProtocolError::DuplicateRequest(stream_id.to_string());
                self.reject(&stream_id, e).await;
                return;
            }
            Some(Slot::Assembling {
                header,
                mut text,
                ttl_deadline,
            }) => {
                text.push_str(&fragment);
                (header, text, ttl_deadline)
            }
            None => {
                let ttl = match (frame.ttl, frame.payload.expiry_ms) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                let deadline = ttl.map(|ms| Instant::now() + Duration::from_millis(ms));
                (frame, fragment, deadline)
            }
        };

        if more {
            self.slots.insert(
                stream_id,
                Slot::Assembling {
                    header,
                    text,
                    ttl_deadline,
                },
            );
            return;
        }

        let admission = self.admission_for(&header);
        let (stop_tx, stop_rx) = watch::channel(None);
        let request = StreamRequest {
            session_id: self.session_id.clone(),
            principal: self.principal.clone(),
            stream_id: stream_id.clone(),
            header,
            prompt: text,
            ttl_deadline,
        };
        self.tasks.spawn(run_stream(
            Arc::clone(&self.svc),
            request,
            self.outbound.clone(),
            stop_rx,
            admission,
        ));
        self.slots.insert(stream_id, Slot::Running { stop: stop_tx });
    }

    /// The session's admission gate, sized by the latest request's window.
    fn admission_for(&mut self, header: &Frame) -> Arc<Admission> {
        let n = usize::try_from(header.window.max_parallel.max(1)).unwrap_or(usize::MAX);
        match &self.admission {
            Some(admission) => {
                admission.resize(n);
                Arc::clone(admission)
            }
            None => {
                let admission = Admission::new(n);
                self.admission = Some(Arc::clone(&admission));
                admission
            }
        }
    }

    /// Reject a frame on `stream_id`. A running stream is told to fail
    /// itself so that it stays the only writer of its frames.
    async fn reject(&mut self, stream_id: &StreamId, err: ProtocolError) {
        warn!(stream_id = %stream_id, error = %err, "frame rejected");
        if let Some(Slot::Running { stop }) = self.slots.get(stream_id) {
            let _ = stop.send(Some(StopReason::Protocol(err)));
            return;
        }
        let stream_error = StreamError::Protocol(err);
        if stream_id.is_control() {
            emit_frame(
                &self.svc,
                &self.outbound,
                &self.session_id,
                stream_id,
                PayloadKind::Error,
                stream_error.frame_content(),
                None,
            )
            .await;
            return;
        }
        self.slots.remove(stream_id);
        let sent = emit_frame(
            &self.svc,
            &self.outbound,
            &self.session_id,
            stream_id,
            PayloadKind::Error,
            stream_error.frame_content(),
            Some(Flag::Final),
        )
        .await;
        if !sent {
            // The stream is already sealed; report on the control stream.
            emit_frame(
                &self.svc,
                &self.outbound,
                &self.session_id,
                &StreamId::control(),
                PayloadKind::Error,
                stream_error.frame_content(),
                None,
            )
            .await;
        }
        self.svc
            .ledger
            .close_stream(&self.session_id, stream_id, CloseReason::Failed);
    }

    /// Record a finished stream. Returns `true` if the ledger expired the
    /// session as a result.
    fn on_stream_finished(&mut self, joined: Result<StreamReport, tokio::task::JoinError>) -> bool {
        match joined {
            Ok(report) => {
                self.slots.remove(&report.stream_id);
                self.reports.push(report);
                !self.svc.ledger.contains(&self.session_id)
            }
            Err(e) => {
                warn!(error = %e, "stream task aborted");
                false
            }
        }
    }

    async fn teardown(mut self, end: SessionEnd) -> SessionSummary {
        let reason = match end {
            SessionEnd::CallerClosed => StopReason::CallerGone,
            SessionEnd::HeartbeatTimeout => StopReason::HeartbeatTimeout,
            SessionEnd::Expired | SessionEnd::Shutdown => StopReason::Shutdown,
        };
        for (stream_id, slot) in self.slots.drain() {
            match slot {
                Slot::Running { stop } => {
                    let _ = stop.send(Some(reason.clone()));
                }
                Slot::Assembling { .. } => {
                    self.svc
                        .ledger
                        .close_stream(&self.session_id, &stream_id, CloseReason::Cancelled);
                }
            }
        }
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(report) => self.reports.push(report),
                Err(e) => warn!(error = %e, "stream task aborted during teardown"),
            }
        }
        match end {
            SessionEnd::HeartbeatTimeout => {
                info!("heartbeat timeout");
                self.svc.ledger.expire_session(&self.session_id);
            }
            SessionEnd::Expired => {}
            SessionEnd::CallerClosed | SessionEnd::Shutdown => {
                self.svc.ledger.close_session(&self.session_id);
            }
        }
        SessionSummary {
            session_id: self.session_id,
            end,
            streams: self.reports,
        }
    }
}

/// Text carried by one request fragment: a string content as-is, or the
/// `prompt` field of an object content.
fn fragment_text(payload: &Payload) -> String {
    match &payload.content {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
