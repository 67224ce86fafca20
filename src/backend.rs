//! Backend adapter interface.
//!
//! Defines the trait every inference backend implements, plus:
//! - [`EchoBackend`]: deterministic local backend for tests and demos
//!
//! A backend turns one request into a lazy, finite, non-restartable stream
//! of chunks: zero or more partials followed by exactly one `Done` carrying
//! usage. Cancellation is the consumer dropping the stream early.

use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::{ArmId, RequestId};

/// Token, latency, and cost accounting for one backend call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// Prompt tokens.
    pub tokens_in: u64,
    /// Generated tokens.
    pub tokens_out: u64,
    /// Wall-clock latency of the call.
    pub latency_ms: u64,
    /// Spend in micro-USD.
    pub cost_usd_micros: u64,
}

/// One unit of backend output.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendChunk {
    /// Partial output.
    Partial {
        /// Output text.
        text: String,
        /// Tokens in this chunk.
        tokens_out: u64,
    },
    /// Terminal chunk with final usage.
    Done(Usage),
}

/// Failures surfaced by a backend.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer in time.
    #[error("backend timed out after {0} ms")]
    Timeout(u64),
    /// The stream failed after it started.
    #[error("backend stream failed: {0}")]
    Stream(String),
    /// The backend refused the request.
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

/// Lazy backend output.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<BackendChunk, BackendError>> + Send>>;

/// One generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    /// Request id (for backend-side logging only).
    pub request_id: RequestId,
    /// Arm the request was routed to.
    pub arm_id: ArmId,
    /// Prompt text.
    pub prompt: String,
    /// Upper bound on generated tokens.
    pub max_tokens: u64,
}

/// Inference backend.
///
/// Implementations must be `Send + Sync` so one instance can serve many
/// concurrent streams.
#[async_trait]
pub trait BackendAdapter: Send + Sync + fmt::Debug {
    /// Name arms refer to in their `backend` field.
    fn name(&self) -> &str;

    /// Start generating.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the call cannot be started. Errors after
    /// the first chunk are delivered inside the stream.
    async fn generate(&self, request: BackendRequest) -> Result<ChunkStream, BackendError>;

    /// Bring the backend's resources up ahead of demand. Default: no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if warming fails.
    async fn warm(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

// ============================================================================
// Echo Backend
// ============================================================================

/// Echoes the prompt back one whitespace-separated word per chunk.
///
/// Each word counts as one token. Useful for tests: delay, price, and
/// failures are configurable, and every `generate` call is counted.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    name: String,
    /// Delay before each chunk.
    pub delay_ms: u64,
    /// Price per 1 000 tokens in micro-USD.
    pub usd_micros_per_1k_tokens: u64,
    /// Fail the stream after this many chunks.
    pub fail_after: Option<usize>,
    /// Fail before producing a stream.
    pub unavailable: bool,
    calls: Arc<AtomicU64>,
    warms: Arc<AtomicU64>,
}

impl EchoBackend {
    /// Echo backend registered under `name` with a 10 ms chunk delay.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay_ms: 10,
            usd_micros_per_1k_tokens: 0,
            fail_after: None,
            unavailable: false,
            calls: Arc::new(AtomicU64::new(0)),
            warms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the per-chunk delay.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Set the price per 1 000 tokens.
    pub fn with_price(mut self, usd_micros_per_1k_tokens: u64) -> Self {
        self.usd_micros_per_1k_tokens = usd_micros_per_1k_tokens;
        self
    }

    /// Fail the stream after `chunks` partials.
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Fail every call before it starts.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Number of `generate` calls so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of `warm` calls so far.
    pub fn warms(&self) -> u64 {
        self.warms.load(Ordering::Relaxed)
    }

    fn cost(&self, tokens: u64) -> u64 {
        let product = u128::from(tokens) * u128::from(self.usd_micros_per_1k_tokens);
        u64::try_from(product.div_ceil(1000)).unwrap_or(u64::MAX)
    }
}

struct EchoState {
    words: Vec<String>,
    next: usize,
    tokens_in: u64,
    started: Instant,
    delay: Duration,
    fail_after: Option<usize>,
    finished: bool,
    backend: EchoBackend,
}

#[async_trait]
impl BackendAdapter for EchoBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: BackendRequest) -> Result<ChunkStream, BackendError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.unavailable {
            return Err(BackendError::Unavailable(self.name.clone()));
        }
        let words: Vec<String> = request
            .prompt
            .split_whitespace()
            .take(usize::try_from(request.max_tokens).unwrap_or(usize::MAX))
            .map(str::to_string)
            .collect();
        let state = EchoState {
            tokens_in: request.prompt.split_whitespace().count() as u64,
            words,
            next: 0,
            started: Instant::now(),
            delay: Duration::from_millis(self.delay_ms),
            fail_after: self.fail_after,
            finished: false,
            backend: self.clone(),
        };
        let chunks = stream::unfold(state, |mut st| async move {
            if st.finished {
                return None;
            }
            if st.fail_after == Some(st.next) {
                st.finished = true;
                let err = BackendError::Stream(format!("injected failure after {} chunks", st.next));
                return Some((Err(err), st));
            }
            if st.next < st.words.len() {
                tokio::time::sleep(st.delay).await;
                let text = st.words[st.next].clone();
                st.next += 1;
                return Some((Ok(BackendChunk::Partial { text, tokens_out: 1 }), st));
            }
            st.finished = true;
            let tokens_out = st.next as u64;
            let usage = Usage {
                tokens_in: st.tokens_in,
                tokens_out,
                latency_ms: st.started.elapsed().as_millis() as u64,
                cost_usd_micros: st.backend.cost(st.tokens_in + tokens_out),
            };
            Some((Ok(BackendChunk::Done(usage)), st))
        });
        Ok(Box::pin(chunks))
    }

    async fn warm(&self) -> Result<(), BackendError> {
        self.warms.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
