//! # Stage: Stream Orchestrator
//!
//! ## Responsibility
//! Bind protocol, routing, and prewarming together: accept a session, run
//! one task per stream through `OPEN → ROUTING → STREAMING → FINAL →
//! CLOSED`, and drive the prewarm scheduler's background loops.
//!
//! ## Guarantees
//! - Isolation: a protocol or request error ends only the offending stream
//! - Ordering: frames within a stream leave in strict `msgSeq` order
//! - Accounting: usage is charged exactly once per request id, including
//!   partial usage of cancelled and expired streams
//! - Stable errors: callers only ever see `error` frames with a fixed code
//!
//! ## NOT Responsible For
//! - Transport (callers move wire text in and out of a [`SessionHandle`])
//! - Authentication (the principal is an opaque id supplied by the caller)

mod admission;
pub mod error;
pub mod session;
pub mod state;
pub mod stream;

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditSink, TracingAuditSink};
use crate::backend::BackendAdapter;
use crate::clock::{secs, UnixMillis};
use crate::config::validation;
use crate::config::RouterConfig;
use crate::metrics::{MetricsSink, NoopSink};
use crate::policy::{AllowAll, PolicyEvaluator};
use crate::prewarm::{spawn_loops, PrewarmLoops, PrewarmScheduler, WarmPool};
use crate::protocol::{Frame, FrameCodec, SessionLedger};
use crate::routing::{ArmRegistry, RoutingEngine, UsageLedger};
use crate::{ArmId, OrchestratorError, PrincipalId, ResourceClass, SessionId};

pub use error::{ErrorCode, StreamError};
pub use session::{SessionEnd, SessionSummary};
pub use state::{StreamLifecycle, StreamState};
pub use stream::{StopReason, StreamOutcome, StreamReport};

use session::SessionLoop;
use stream::Services;

/// Builder for an [`Orchestrator`].
///
/// Policy, audit, and metrics default to [`AllowAll`], [`TracingAuditSink`],
/// and [`NoopSink`].
#[derive(Debug)]
pub struct OrchestratorBuilder {
    config: RouterConfig,
    backends: HashMap<String, Arc<dyn BackendAdapter>>,
    policy: Arc<dyn PolicyEvaluator>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl OrchestratorBuilder {
    /// Start from a configuration.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            backends: HashMap::new(),
            policy: Arc::new(AllowAll),
            audit: Arc::new(TracingAuditSink),
            metrics: Arc::new(NoopSink),
        }
    }

    /// Register a backend under its [`BackendAdapter::name`].
    pub fn backend(mut self, backend: Arc<dyn BackendAdapter>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    /// Set the policy collaborator.
    pub fn policy(mut self, policy: Arc<dyn PolicyEvaluator>) -> Self {
        self.policy = policy;
        self
    }

    /// Set the audit sink.
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Set the metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate the configuration and wire everything together.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ConfigError`] if validation fails or an
    /// arm names a backend that was not registered.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        if let Err(errors) = validation::validate(&self.config) {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(OrchestratorError::ConfigError(joined));
        }
        if let Some(arm) = self
            .config
            .arms
            .iter()
            .find(|arm| !self.backends.contains_key(&arm.backend))
        {
            return Err(OrchestratorError::ConfigError(format!(
                "arm '{}' references unregistered backend '{}'",
                arm.id, arm.backend
            )));
        }

        let config = self.config;
        let registry = Arc::new(ArmRegistry::with_arms(
            config.arms.iter().cloned(),
            config.routing.retire_after_failures,
        ));
        let engine = Arc::new(RoutingEngine::new(
            Arc::clone(&registry),
            config.routing.clone(),
            Arc::clone(&self.metrics),
        ));
        let scheduler = Arc::new(PrewarmScheduler::new(
            config.prewarm.clone(),
            Arc::clone(&self.metrics),
        ));
        let usage = Arc::new(UsageLedger::new(
            secs(config.routing.dedup_retention_s),
            config.routing.dedup_max_entries,
        ));
        let ledger = SessionLedger::new(
            config.protocol.protocol_version,
            config.protocol.heartbeat_interval_ms,
        );
        let codec = FrameCodec::new(
            config.protocol.max_frame_bytes,
            config.protocol.protocol_version,
        );
        let pool = Arc::new(ResourcePool {
            registry,
            backends: self.backends.clone(),
        });

        info!(
            arms = config.arms.len(),
            backends = self.backends.len(),
            policy = engine.policy().name(),
            "orchestrator built"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Orchestrator {
            services: Arc::new(Services {
                ledger,
                codec,
                engine,
                scheduler,
                usage,
                backends: self.backends,
                policy: self.policy,
                audit: self.audit,
                metrics: self.metrics,
                config: config.orchestrator.clone(),
            }),
            pool,
            prewarm_enabled: config.prewarm.enabled,
            shutdown,
            loops: Mutex::new(None),
        })
    }
}

/// The running router.
#[derive(Debug)]
pub struct Orchestrator {
    services: Arc<Services>,
    pool: Arc<ResourcePool>,
    prewarm_enabled: bool,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Option<PrewarmLoops>>,
}

impl Orchestrator {
    /// Start a builder.
    pub fn builder(config: RouterConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Accept a new session for `principal` under a fresh id.
    ///
    /// # Panics
    ///
    /// This function never panics, but must be called inside a Tokio runtime.
    pub fn open_session(&self, principal: PrincipalId) -> SessionHandle {
        self.open_session_with_id(SessionId::new(uuid::Uuid::new_v4().to_string()), principal)
    }

    /// Accept a session under a caller-chosen id.
    ///
    /// # Panics
    ///
    /// This function never panics, but must be called inside a Tokio runtime.
    pub fn open_session_with_id(&self, session_id: SessionId, principal: PrincipalId) -> SessionHandle {
        let (in_tx, in_rx) = mpsc::channel(self.services.config.inbound_buffer.max(1));
        let (out_tx, out_rx) = mpsc::channel(self.services.config.outbound_buffer.max(1));
        let session = SessionLoop::new(
            Arc::clone(&self.services),
            session_id.clone(),
            principal,
            out_tx,
        );
        let task = tokio::spawn(session.run(in_rx, self.shutdown.subscribe()));
        debug!(session_id = %session_id, "session accepted");
        SessionHandle {
            session_id,
            inbound: in_tx,
            outbound: out_rx,
            task,
        }
    }

    /// Start the prewarm prediction and sweep loops.
    ///
    /// Returns `false` if prewarming is disabled or the loops already run.
    ///
    /// # Panics
    ///
    /// This function never panics, but must be called inside a Tokio runtime.
    pub fn spawn_background(&self) -> bool {
        if !self.prewarm_enabled {
            info!("prewarming disabled");
            return false;
        }
        let mut loops = self.loops.lock();
        if loops.is_some() {
            return false;
        }
        let pool: Arc<dyn WarmPool> = Arc::clone(&self.pool) as Arc<dyn WarmPool>;
        *loops = Some(spawn_loops(
            Arc::clone(&self.services.scheduler),
            pool,
            self.shutdown.subscribe(),
        ));
        info!("prewarm loops started");
        true
    }

    /// Signal every session and background loop to stop, and wait for the
    /// background loops.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let loops = self.loops.lock().take();
        if let Some(loops) = loops {
            loops.join().await;
        }
        info!("orchestrator shut down");
    }

    /// Session ledger.
    pub fn ledger(&self) -> &SessionLedger {
        &self.services.ledger
    }

    /// Routing engine.
    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.services.engine
    }

    /// Arm registry.
    pub fn registry(&self) -> &Arc<ArmRegistry> {
        self.services.engine.registry()
    }

    /// Prewarm scheduler.
    pub fn scheduler(&self) -> &Arc<PrewarmScheduler> {
        &self.services.scheduler
    }

    /// Usage ledger.
    pub fn usage(&self) -> &Arc<UsageLedger> {
        &self.services.usage
    }

    /// Frame codec configured for this router.
    pub fn codec(&self) -> FrameCodec {
        self.services.codec
    }

    /// Return a retired arm to rotation with its failure streak cleared.
    /// Statistics are kept. Returns `false` if the arm is unknown.
    pub fn revive_arm(&self, arm_id: &ArmId) -> bool {
        self.registry().revive(arm_id)
    }
}

/// Caller side of one session.
///
/// Send wire text on `inbound`, read wire text from `outbound`. Dropping
/// `inbound` ends the session.
#[derive(Debug)]
pub struct SessionHandle {
    /// Session id frames must carry.
    pub session_id: SessionId,
    /// Frames from the caller.
    pub inbound: mpsc::Sender<String>,
    /// Frames to the caller.
    pub outbound: mpsc::Receiver<String>,
    /// The session task.
    pub task: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    /// Serialize and send a frame.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Other`] if the frame cannot be serialized,
    /// [`OrchestratorError::ChannelClosed`] if the session has ended.
    pub async fn send(&self, frame: &Frame) -> Result<(), OrchestratorError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| OrchestratorError::Other(format!("frame serialization failed: {e}")))?;
        self.send_text(text).await
    }

    /// Send raw wire text.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ChannelClosed`] if the session has ended.
    pub async fn send_text(&self, text: String) -> Result<(), OrchestratorError> {
        self.inbound
            .send(text)
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)
    }

    /// Receive and decode the next outbound frame. `None` once the session
    /// has ended and every frame was read.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Other`] if the text is not a frame.
    pub async fn recv(&mut self) -> Result<Option<Frame>, OrchestratorError> {
        match self.outbound.recv().await {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| OrchestratorError::Other(format!("undecodable outbound frame: {e}"))),
            None => Ok(None),
        }
    }

    /// Hang up and wait for the session summary.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Other`] if the session task panicked or was
    /// aborted.
    pub async fn close(self) -> Result<SessionSummary, OrchestratorError> {
        let Self {
            inbound,
            mut outbound,
            task,
            ..
        } = self;
        drop(inbound);
        // Keep draining so stream tasks never block on a full outbound queue.
        let drain = tokio::spawn(async move { while outbound.recv().await.is_some() {} });
        let summary = task
            .await
            .map_err(|e| OrchestratorError::Other(format!("session task failed: {e}")));
        drain.abort();
        summary
    }
}

/// Warms resource classes on behalf of the prewarm scheduler.
///
/// Marks the class warm in the registry until the ticket expires, then asks
/// every backend serving an arm of that class to warm up.
#[derive(Debug)]
pub struct ResourcePool {
    registry: Arc<ArmRegistry>,
    backends: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl ResourcePool {
    /// Pool over `registry`, warming through `backends`.
    pub fn new(registry: Arc<ArmRegistry>, backends: HashMap<String, Arc<dyn BackendAdapter>>) -> Self {
        Self { registry, backends }
    }

    fn backends_for(&self, class: &ResourceClass) -> Vec<Arc<dyn BackendAdapter>> {
        let names: BTreeSet<String> = self
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.spec(id))
            .filter(|spec| &spec.resource_class == class)
            .map(|spec| spec.backend)
            .collect();
        names
            .iter()
            .filter_map(|name| self.backends.get(name).cloned())
            .collect()
    }
}

impl WarmPool for ResourcePool {
    fn prewarm(&self, class: &ResourceClass, until: UnixMillis) {
        self.registry.mark_warm(class, until);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(resource_class = %class, "no runtime; class marked warm without backend warm-up");
            return;
        };
        for backend in self.backends_for(class) {
            let class = class.clone();
            runtime.spawn(async move {
                if let Err(e) = backend.warm().await {
                    warn!(resource_class = %class, backend = backend.name(), error = %e, "backend warm-up failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoBackend;
    use crate::routing::ArmSpec;
    use std::time::Duration;

    fn config() -> RouterConfig {
        RouterConfig {
            arms: vec![ArmSpec::new("a", "gpu", "echo")],
            ..RouterConfig::default()
        }
    }

    #[test]
    fn test_build_rejects_unregistered_backend() {
        let err = Orchestrator::builder(config()).build().unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigError(msg) if msg.contains("echo")));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut cfg = config();
        cfg.routing.challenger_fraction = 3.0;
        let err = Orchestrator::builder(cfg)
            .backend(Arc::new(EchoBackend::new("echo")))
            .build()
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigError(msg) if msg.contains("challenger_fraction")));
    }

    #[tokio::test]
    async fn test_resource_pool_marks_warm_and_warms_backends() {
        let echo = EchoBackend::new("echo");
        let registry = Arc::new(ArmRegistry::with_arms([ArmSpec::new("a", "gpu", "echo")], 5));
        let mut backends: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
        backends.insert("echo".into(), Arc::new(echo.clone()));
        let pool = ResourcePool::new(Arc::clone(&registry), backends);
        let class = ResourceClass::new("gpu");
        pool.prewarm(&class, 10_000);
        assert!(registry.is_warm(&class, 9_999));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(echo.warms(), 1);
    }

    #[tokio::test]
    async fn test_spawn_background_respects_disabled_flag() {
        let mut cfg = config();
        cfg.prewarm.enabled = false;
        let orch = Orchestrator::builder(cfg)
            .backend(Arc::new(EchoBackend::new("echo")))
            .build()
            .unwrap();
        assert!(!orch.spawn_background());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_background_starts_once() {
        let orch = Orchestrator::builder(config())
            .backend(Arc::new(EchoBackend::new("echo")))
            .build()
            .unwrap();
        assert!(orch.spawn_background());
        assert!(!orch.spawn_background());
        tokio::time::timeout(Duration::from_secs(5), orch.shutdown())
            .await
            .unwrap();
    }
}
