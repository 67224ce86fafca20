//! One stream's request/response exchange.
//!
//! A stream task owns its outbound `msgSeq` counter: it is the only writer
//! of frames on its stream, so frames leave in strict order. The session
//! loop talks to it only through the stop signal.
//!
//! ## Span Fields
//!
//! | Field | Description |
//! |-------|-------------|
//! | `session_id`, `stream_id`, `request_id` | correlation |
//! | `qos` | gold / silver / bronze |
//! | `arm_id` | recorded once routed |
//! | `outcome` | `completed`, `failed`, `cancelled`, `expired` |
//! | `final_state` | always `CLOSED` unless a transition was rejected |
//! | `duration_ms` | wall time of the stream |
//!
//! Prompt text and model output are never logged.

use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use super::admission::Admission;
use super::error::{ErrorCode, StreamError};
use super::state::{StreamLifecycle, StreamState};
use crate::audit::{AuditRecord, AuditSink};
use crate::backend::{BackendAdapter, BackendChunk, BackendError, BackendRequest, Usage};
use crate::clock::{now_millis, secs};
use crate::config::OrchestratorConfig;
use crate::metrics::{
    MetricsSink, BACKEND_LATENCY_MS, FRAMES_EMITTED_TOTAL, STREAM_OUTCOMES_TOTAL,
    USAGE_USD_MICROS_TOTAL,
};
use crate::policy::{PermissionRequest, PolicyEvaluator, PolicyVerdict};
use crate::prewarm::PrewarmScheduler;
use crate::protocol::{
    CloseReason, Flag, Frame, FrameCodec, Payload, PayloadKind, ProtocolError, SessionLedger,
};
use crate::routing::{
    Constraints, Outcome, RoutingContext, RoutingDecision, RoutingEngine, RoutingRequest,
    UsageLedger,
};
use crate::{ArmId, PrincipalId, RequestId, SessionId, StreamId};

/// Everything a stream task needs, shared by all sessions.
#[derive(Debug)]
pub(crate) struct Services {
    pub(crate) ledger: SessionLedger,
    pub(crate) codec: FrameCodec,
    pub(crate) engine: Arc<RoutingEngine>,
    pub(crate) scheduler: Arc<PrewarmScheduler>,
    pub(crate) usage: Arc<UsageLedger>,
    pub(crate) backends: HashMap<String, Arc<dyn BackendAdapter>>,
    pub(crate) policy: Arc<dyn PolicyEvaluator>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) config: OrchestratorConfig,
}

/// Why the session asked a stream to stop.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The caller sent a cancel frame.
    CancelFrame,
    /// The session missed its heartbeat.
    HeartbeatTimeout,
    /// The router is shutting down.
    Shutdown,
    /// The caller's transport went away.
    CallerGone,
    /// A later inbound frame on this stream violated the protocol.
    Protocol(ProtocolError),
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `final` frame emitted.
    Completed,
    /// `error` frame emitted with this code.
    Failed(ErrorCode),
    /// Stopped early; only a router shutdown emits a `CANCELLED` frame.
    Cancelled,
    /// TTL elapsed; one `SESSION_EXPIRED` error frame emitted.
    Expired,
}

impl StreamOutcome {
    /// Metric / span label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

/// Summary of a finished stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    /// Stream id.
    pub stream_id: StreamId,
    /// Request id the stream was routed and charged under.
    pub request_id: RequestId,
    /// Terminal outcome.
    pub outcome: StreamOutcome,
    /// States visited.
    pub states: Vec<StreamState>,
    /// Arm that served (or last tried to serve) the request.
    pub arm_id: Option<ArmId>,
    /// Usage of the last attempt, partial when the stream stopped early.
    pub usage: Option<Usage>,
}

/// A fully assembled request, ready to run.
#[derive(Debug, Clone)]
pub(crate) struct StreamRequest {
    pub(crate) session_id: SessionId,
    pub(crate) principal: PrincipalId,
    pub(crate) stream_id: StreamId,
    /// First request fragment; carries window, qos, ttl, and meta.
    pub(crate) header: Frame,
    pub(crate) prompt: String,
    pub(crate) ttl_deadline: Option<Instant>,
}

enum Interrupt {
    Stop(StopReason),
    Expired,
    HardTimeout,
}

enum AttemptEnd {
    Done(Usage),
    Failed(BackendError, Option<Usage>),
    Interrupted(Interrupt, Option<Usage>),
    /// The engine cannot run the arm at all.
    Fault(String),
}

/// Run one stream to completion and report how it ended.
pub(crate) async fn run_stream(
    svc: Arc<Services>,
    req: StreamRequest,
    outbound: mpsc::Sender<String>,
    stop: watch::Receiver<Option<StopReason>>,
    admission: Arc<Admission>,
) -> StreamReport {
    let request_id = RequestId::for_stream(&req.session_id, &req.stream_id);
    let span = info_span!(
        "stream",
        session_id = %req.session_id,
        stream_id = %req.stream_id,
        request_id = %request_id,
        qos = req.header.qos.as_str(),
        arm_id = field::Empty,
        outcome = field::Empty,
        final_state = field::Empty,
        duration_ms = field::Empty,
    );
    async move {
        let hard_deadline = Instant::now() + Duration::from_millis(svc.config.hard_timeout_ms);
        let mut run = StreamRun {
            prompt_tokens: estimate_tokens(&req.prompt, svc.config.chars_per_token),
            svc,
            req,
            request_id,
            outbound,
            stop,
            lifecycle: StreamLifecycle::new(),
            started: Instant::now(),
            hard_deadline,
            arm_id: None,
        };
        let report = run.execute(admission).await;
        let span = Span::current();
        span.record("outcome", report.outcome.as_str());
        span.record("final_state", run.lifecycle.state().as_str());
        span.record("duration_ms", run.started.elapsed().as_millis() as u64);
        run.svc
            .metrics
            .inc_counter(STREAM_OUTCOMES_TOTAL, &[("outcome", report.outcome.as_str())]);
        info!(outcome = report.outcome.as_str(), "stream finished");
        report
    }
    .instrument(span)
    .await
}

struct StreamRun {
    svc: Arc<Services>,
    req: StreamRequest,
    request_id: RequestId,
    outbound: mpsc::Sender<String>,
    stop: watch::Receiver<Option<StopReason>>,
    lifecycle: StreamLifecycle,
    started: Instant,
    hard_deadline: Instant,
    prompt_tokens: u64,
    arm_id: Option<ArmId>,
}

impl StreamRun {
    async fn execute(&mut self, admission: Arc<Admission>) -> StreamReport {
        let _permit = tokio::select! {
            biased;
            interrupt = interrupted(&mut self.stop, self.req.ttl_deadline, self.hard_deadline) => {
                return self.interrupted_before_dispatch(interrupt).await;
            }
            permit = admission.acquire(self.req.header.qos) => match permit {
                Some(p) => p,
                None => return self.interrupted_before_dispatch(Interrupt::Stop(StopReason::Shutdown)).await,
            },
        };

        self.advance(StreamState::Routing);
        let header = self.req.header.clone();
        let window = header.window;

        // Policy first; a denied request never reaches routing.
        let permission = PermissionRequest::from_frame(&self.req.principal, &header);
        if let PolicyVerdict::Deny { reason_code } = self.svc.policy.evaluate(&permission) {
            info!(reason_code = %reason_code, "policy denied");
            return self.fail(StreamError::PolicyDenied { reason_code }, None).await;
        }

        // Budget before routing: nothing is dispatched past this point unless it fits.
        if self.prompt_tokens > window.max_tokens {
            return self
                .fail(
                    StreamError::BudgetExceeded {
                        estimated: self.prompt_tokens,
                        limit: window.max_tokens,
                    },
                    None,
                )
                .await;
        }
        if let Some(estimate) = header.payload.cost_est {
            if estimate > window.max_usd_micros {
                return self
                    .fail(
                        StreamError::BudgetExceeded {
                            estimated: estimate,
                            limit: window.max_usd_micros,
                        },
                        None,
                    )
                    .await;
            }
        }

        let constraints = Constraints {
            quality_target: meta_f64(&header, "qualityTarget").unwrap_or(0.0),
            max_cost_usd_micros: window.max_usd_micros,
            latency_slo_ms: meta_u64(&header, "latencySloMs")
                .unwrap_or(self.svc.config.default_latency_slo_ms),
        };
        let routing_request = RoutingRequest {
            request_id: self.request_id.clone(),
            context: RoutingContext::from_frame(&header),
            estimated_tokens: window.max_tokens,
            qos: header.qos,
        };

        let mut decision = match self.svc.engine.route(&routing_request, &constraints) {
            Ok(d) => d,
            Err(e) => {
                info!(error = %e, "routing failed");
                return self
                    .fail(StreamError::from_routing(e, window.max_usd_micros), None)
                    .await;
            }
        };
        self.on_routed(&decision);
        if !self
            .emit(
                PayloadKind::Event,
                json!({
                    "event": "route.selected",
                    "armId": decision.arm_id(),
                    "rationale": decision.rationale(),
                    "challenger": decision.challenger(),
                }),
                None,
            )
            .await
        {
            return self.cancel(StopReason::CallerGone, None).await;
        }
        if let Some(challenger) = decision.challenger() {
            spawn_shadow(
                Arc::clone(&self.svc),
                decision.request_id().shadow(),
                challenger.clone(),
                self.backend_request(&decision),
                constraints,
            );
        }

        loop {
            self.advance(StreamState::Streaming);
            match self.attempt(&decision).await {
                AttemptEnd::Done(usage) => return self.complete(&decision, usage, &constraints).await,
                AttemptEnd::Fault(detail) => {
                    self.svc.engine.registry().retire(decision.arm_id());
                    return self.fail(StreamError::Internal(detail), None).await;
                }
                AttemptEnd::Failed(err, partial) => {
                    warn!(arm_id = %decision.arm_id(), error = %err, attempt = decision.attempt(), "backend attempt failed");
                    if let Some(usage) = partial {
                        self.charge(&decision, &usage, true);
                    }
                    self.svc
                        .engine
                        .record_outcome(decision.request_id(), decision.arm_id(), Outcome::failure());

                    let elapsed_ms = self.started.elapsed().as_millis() as u64;
                    if decision.attempt() == 1 && elapsed_ms < constraints.latency_slo_ms {
                        if let Ok(next) = self.svc.engine.reroute(
                            &routing_request,
                            &constraints,
                            decision.arm_id(),
                            now_millis(),
                        ) {
                            self.advance(StreamState::Routing);
                            info!(from = %decision.arm_id(), to = %next.arm_id(), "switching arm after backend failure");
                            let from = decision.arm_id().clone();
                            decision = next;
                            self.on_routed(&decision);
                            if !self
                                .emit(
                                    PayloadKind::Event,
                                    json!({
                                        "event": "route.switched",
                                        "fromArmId": from,
                                        "armId": decision.arm_id(),
                                        "rationale": decision.rationale(),
                                    }),
                                    None,
                                )
                                .await
                            {
                                return self.cancel(StopReason::CallerGone, None).await;
                            }
                            continue;
                        }
                    }
                    return self.fail(StreamError::Backend(err), None).await;
                }
                AttemptEnd::Interrupted(interrupt, partial) => {
                    if let Some(usage) = partial {
                        self.charge(&decision, &usage, true);
                    }
                    return match interrupt {
                        Interrupt::Stop(reason) => self.cancel(reason, partial).await,
                        Interrupt::Expired => self.expire(partial).await,
                        Interrupt::HardTimeout => {
                            self.svc.engine.record_outcome(
                                decision.request_id(),
                                decision.arm_id(),
                                Outcome::failure(),
                            );
                            let err = BackendError::Timeout(self.svc.config.hard_timeout_ms);
                            self.fail(StreamError::Backend(err), None).await
                        }
                    };
                }
            }
        }
    }

    /// Bookkeeping on every (re)route: demand observation, ticket claim, audit.
    fn on_routed(&mut self, decision: &RoutingDecision) {
        let now = now_millis();
        let class = decision.resource_class();
        self.svc.scheduler.observe(class, now);
        if self.svc.scheduler.claim_ticket(class, now).is_some() {
            debug!(resource_class = %class, "served by prewarmed class");
        }
        self.svc.audit.append(AuditRecord::Decision {
            session_id: self.req.session_id.clone(),
            request_id: decision.request_id().clone(),
            arm_id: decision.arm_id().clone(),
            rationale: decision.rationale(),
            challenger: decision.challenger().cloned(),
            at: now,
        });
        Span::current().record("arm_id", decision.arm_id().as_str());
        self.arm_id = Some(decision.arm_id().clone());
    }

    fn backend_request(&self, decision: &RoutingDecision) -> BackendRequest {
        BackendRequest {
            request_id: decision.request_id().clone(),
            arm_id: decision.arm_id().clone(),
            prompt: self.req.prompt.clone(),
            max_tokens: self
                .req
                .header
                .window
                .max_tokens
                .saturating_sub(self.prompt_tokens),
        }
    }

    async fn attempt(&mut self, decision: &RoutingDecision) -> AttemptEnd {
        let Some(backend) = self.svc.backends.get(decision.backend()).cloned() else {
            error!(backend = decision.backend(), "arm references an unregistered backend");
            return AttemptEnd::Fault(format!(
                "arm '{}' has no backend '{}'",
                decision.arm_id(),
                decision.backend()
            ));
        };
        let registry = Arc::clone(self.svc.engine.registry());
        let keep_warm_ms = secs(self.svc.engine.config().warm_after_use_s);
        registry.begin(decision.arm_id());
        let end = self.pump(backend, decision).await;
        registry.end(decision.arm_id(), now_millis(), keep_warm_ms);
        end
    }

    async fn pump(&mut self, backend: Arc<dyn BackendAdapter>, decision: &RoutingDecision) -> AttemptEnd {
        let started = Instant::now();
        let request = self.backend_request(decision);
        let mut chunks = tokio::select! {
            biased;
            interrupt = interrupted(&mut self.stop, self.req.ttl_deadline, self.hard_deadline) => {
                return AttemptEnd::Interrupted(interrupt, None);
            }
            generated = backend.generate(request) => match generated {
                Ok(chunks) => chunks,
                Err(e) => return AttemptEnd::Failed(e, None),
            },
        };

        let mut tokens_out = 0u64;
        loop {
            tokio::select! {
                biased;
                interrupt = interrupted(&mut self.stop, self.req.ttl_deadline, self.hard_deadline) => {
                    let partial = self.partial_usage(decision, tokens_out, started);
                    return AttemptEnd::Interrupted(interrupt, Some(partial));
                }
                next = chunks.next() => match next {
                    Some(Ok(BackendChunk::Partial { text, tokens_out: n })) => {
                        tokens_out = tokens_out.saturating_add(n);
                        if !self.emit(PayloadKind::Chunk, json!({ "text": text }), Some(Flag::Partial)).await {
                            let partial = self.partial_usage(decision, tokens_out, started);
                            return AttemptEnd::Interrupted(Interrupt::Stop(StopReason::CallerGone), Some(partial));
                        }
                    }
                    Some(Ok(BackendChunk::Done(usage))) => return AttemptEnd::Done(usage),
                    Some(Err(e)) => {
                        let partial = self.partial_usage(decision, tokens_out, started);
                        return AttemptEnd::Failed(e, Some(partial));
                    }
                    None => {
                        let partial = self.partial_usage(decision, tokens_out, started);
                        let err = BackendError::Stream("stream ended without usage".into());
                        return AttemptEnd::Failed(err, Some(partial));
                    }
                },
            }
        }
    }

    /// Usage incurred by an attempt that stopped early, priced at the arm's rate.
    fn partial_usage(&self, decision: &RoutingDecision, tokens_out: u64, started: Instant) -> Usage {
        let tokens_in = self.prompt_tokens;
        let cost = self
            .svc
            .engine
            .registry()
            .spec(decision.arm_id())
            .map(|spec| spec.estimate_cost(tokens_in.saturating_add(tokens_out)))
            .unwrap_or(0);
        Usage {
            tokens_in,
            tokens_out,
            latency_ms: started.elapsed().as_millis() as u64,
            cost_usd_micros: cost,
        }
    }

    async fn complete(
        &mut self,
        decision: &RoutingDecision,
        usage: Usage,
        constraints: &Constraints,
    ) -> StreamReport {
        let latency = usage.latency_ms as f64;
        let reward = self
            .svc
            .engine
            .shape_reward(true, latency, usage.cost_usd_micros, constraints);
        self.svc.engine.record_outcome(
            decision.request_id(),
            decision.arm_id(),
            Outcome::success(reward, latency),
        );
        self.svc.metrics.observe(
            BACKEND_LATENCY_MS,
            latency,
            &[("arm", decision.arm_id().as_str())],
        );
        self.charge(decision, &usage, false);

        self.emit(
            PayloadKind::Final,
            json!({
                "usage": usage,
                "armId": decision.arm_id(),
                "rationale": decision.rationale(),
            }),
            Some(Flag::Final),
        )
        .await;
        self.seal(CloseReason::Completed);
        self.advance(StreamState::Final);
        self.advance(StreamState::Closed);
        self.report(StreamOutcome::Completed, Some(usage))
    }

    async fn fail(&mut self, err: StreamError, usage: Option<Usage>) -> StreamReport {
        let code = err.code();
        info!(code = code.as_str(), error = %err, "stream failed");
        self.emit(PayloadKind::Error, err.frame_content(), Some(Flag::Final))
            .await;
        self.seal(CloseReason::Failed);
        self.advance(StreamState::Closed);
        self.report(StreamOutcome::Failed(code), usage)
    }

    /// Stop the stream on `reason`.
    ///
    /// Partial usage is charged, but no bandit outcome is recorded: the arm
    /// did not fail, the caller or router stopped it. A router shutdown tells
    /// the still-connected caller with a `CANCELLED` error frame; the other
    /// reasons end the stream silently.
    async fn cancel(&mut self, reason: StopReason, usage: Option<Usage>) -> StreamReport {
        if let StopReason::Protocol(err) = &reason {
            return self.fail(StreamError::Protocol(err.clone()), usage).await;
        }
        info!(reason = ?reason, "stream cancelled");
        self.advance(StreamState::Cancelled);
        if reason == StopReason::Shutdown {
            self.emit(
                PayloadKind::Error,
                StreamError::Cancelled.frame_content(),
                Some(Flag::Final),
            )
            .await;
        }
        self.seal(CloseReason::Cancelled);
        self.advance(StreamState::Closed);
        self.report(StreamOutcome::Cancelled, usage)
    }

    async fn expire(&mut self, usage: Option<Usage>) -> StreamReport {
        info!("stream ttl elapsed");
        self.advance(StreamState::Cancelled);
        self.emit(
            PayloadKind::Error,
            StreamError::SessionExpired.frame_content(),
            Some(Flag::Final),
        )
        .await;
        self.seal(CloseReason::Expired);
        self.advance(StreamState::Closed);
        self.report(StreamOutcome::Expired, usage)
    }

    async fn interrupted_before_dispatch(&mut self, interrupt: Interrupt) -> StreamReport {
        match interrupt {
            Interrupt::Stop(reason) => self.cancel(reason, None).await,
            Interrupt::Expired => self.expire(None).await,
            Interrupt::HardTimeout => {
                let err = BackendError::Timeout(self.svc.config.hard_timeout_ms);
                self.fail(StreamError::Backend(err), None).await
            }
        }
    }

    fn charge(&self, decision: &RoutingDecision, usage: &Usage, partial: bool) {
        let now = now_millis();
        if !self
            .svc
            .usage
            .record(decision.request_id(), decision.arm_id(), usage, now)
        {
            return;
        }
        self.svc.metrics.add_counter(
            USAGE_USD_MICROS_TOTAL,
            usage.cost_usd_micros,
            &[("arm", decision.arm_id().as_str())],
        );
        self.svc.audit.append(AuditRecord::Charge {
            session_id: self.req.session_id.clone(),
            request_id: decision.request_id().clone(),
            arm_id: decision.arm_id().clone(),
            usage: *usage,
            partial,
            at: now,
        });
    }

    /// Encode and send one frame. Returns `false` if the stream is sealed or
    /// the caller is gone.
    async fn emit(&self, kind: PayloadKind, content: Value, flag: Option<Flag>) -> bool {
        emit_frame(
            &self.svc,
            &self.outbound,
            &self.req.session_id,
            &self.req.stream_id,
            kind,
            content,
            flag,
        )
        .await
    }

    fn seal(&self, reason: CloseReason) {
        self.svc
            .ledger
            .mark_final_outbound(&self.req.session_id, &self.req.stream_id);
        self.svc
            .ledger
            .close_stream(&self.req.session_id, &self.req.stream_id, reason);
    }

    fn advance(&mut self, next: StreamState) {
        if let Err((from, to)) = self.lifecycle.advance(next) {
            error!(from = %from, to = %to, "illegal stream transition ignored");
        }
    }

    fn report(&self, outcome: StreamOutcome, usage: Option<Usage>) -> StreamReport {
        StreamReport {
            stream_id: self.req.stream_id.clone(),
            request_id: self.request_id.clone(),
            outcome,
            states: self.lifecycle.history().to_vec(),
            arm_id: self.arm_id.clone(),
            usage,
        }
    }
}

/// Encode and send one outbound frame on `stream_id`.
pub(crate) async fn emit_frame(
    svc: &Services,
    outbound: &mpsc::Sender<String>,
    session_id: &SessionId,
    stream_id: &StreamId,
    kind: PayloadKind,
    content: Value,
    flag: Option<Flag>,
) -> bool {
    let seq = match svc.ledger.next_seq(session_id, stream_id) {
        Ok(seq) => seq,
        Err(e) => {
            debug!(stream_id = %stream_id, error = %e, "outbound sealed; frame dropped");
            return false;
        }
    };
    let mut frame = Frame::new(
        session_id.clone(),
        stream_id.clone(),
        seq,
        Payload::new(kind, content).with_checksum(),
    );
    if let Some(flag) = flag {
        frame = frame.with_flag(flag);
    }
    let text = match svc.codec.encode(&frame) {
        Ok(text) => text,
        Err(e) => {
            error!(stream_id = %stream_id, error = %e, "frame encode failed");
            return false;
        }
    };
    if outbound.send(text).await.is_err() {
        return false;
    }
    svc.metrics
        .inc_counter(FRAMES_EMITTED_TOTAL, &[("kind", kind.as_str())]);
    true
}

async fn wait_stop(stop: &mut watch::Receiver<Option<StopReason>>) -> StopReason {
    loop {
        if let Some(reason) = stop.borrow_and_update().clone() {
            return reason;
        }
        if stop.changed().await.is_err() {
            return StopReason::Shutdown;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn interrupted(
    stop: &mut watch::Receiver<Option<StopReason>>,
    ttl: Option<Instant>,
    hard: Instant,
) -> Interrupt {
    tokio::select! {
        biased;
        reason = wait_stop(stop) => Interrupt::Stop(reason),
        _ = sleep_until_opt(ttl) => Interrupt::Expired,
        _ = tokio::time::sleep_until(hard) => Interrupt::HardTimeout,
    }
}

/// Mirror a request to a challenger arm for reward observation only.
///
/// Nothing reaches the caller. The outcome and usage are recorded under the
/// shadow request id so they never collide with the champion's.
fn spawn_shadow(
    svc: Arc<Services>,
    shadow_id: RequestId,
    challenger: ArmId,
    mut request: BackendRequest,
    constraints: Constraints,
) {
    let span = info_span!("shadow", request_id = %shadow_id, arm_id = %challenger);
    tokio::spawn(
        async move {
            let registry = Arc::clone(svc.engine.registry());
            let Some(spec) = registry.spec(&challenger) else {
                return;
            };
            let Some(backend) = svc.backends.get(&spec.backend).cloned() else {
                warn!(backend = %spec.backend, "challenger backend not registered");
                return;
            };
            request.request_id = shadow_id.clone();
            request.arm_id = challenger.clone();
            let keep_warm_ms = secs(svc.engine.config().warm_after_use_s);
            let timeout = Duration::from_millis(svc.config.hard_timeout_ms);

            registry.begin(&challenger);
            let result = tokio::time::timeout(timeout, drain(backend, request)).await;
            registry.end(&challenger, now_millis(), keep_warm_ms);

            match result {
                Ok(Ok(usage)) => {
                    let latency = usage.latency_ms as f64;
                    let reward =
                        svc.engine
                            .shape_reward(true, latency, usage.cost_usd_micros, &constraints);
                    svc.engine
                        .record_outcome(&shadow_id, &challenger, Outcome::success(reward, latency));
                    if svc.usage.record(&shadow_id, &challenger, &usage, now_millis()) {
                        svc.metrics.add_counter(
                            USAGE_USD_MICROS_TOTAL,
                            usage.cost_usd_micros,
                            &[("arm", challenger.as_str())],
                        );
                    }
                    debug!(reward, "shadow request completed");
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "shadow request failed");
                    svc.engine
                        .record_outcome(&shadow_id, &challenger, Outcome::failure());
                }
                Err(_) => {
                    warn!("shadow request timed out");
                    svc.engine
                        .record_outcome(&shadow_id, &challenger, Outcome::failure());
                }
            }
        }
        .instrument(span),
    );
}

async fn drain(backend: Arc<dyn BackendAdapter>, request: BackendRequest) -> Result<Usage, BackendError> {
    let mut chunks = backend.generate(request).await?;
    while let Some(chunk) = chunks.next().await {
        if let BackendChunk::Done(usage) = chunk? {
            return Ok(usage);
        }
    }
    Err(BackendError::Stream("stream ended without usage".into()))
}

/// Estimated prompt tokens: characters divided by `chars_per_token`, rounded up.
pub(crate) fn estimate_tokens(prompt: &str, chars_per_token: u64) -> u64 {
    let chars = prompt.chars().count() as u64;
    chars.div_ceil(chars_per_token.max(1))
}

fn meta_f64(frame: &Frame, key: &str) -> Option<f64> {
    frame.meta.extra.get(key).and_then(Value::as_f64)
}

fn meta_u64(frame: &Frame, key: &str) -> Option<u64> {
    frame.meta.extra.get(key).and_then(Value::as_u64)
}
