//! # Session Ledger
//!
//! ## Responsibility
//!
//! Owns per-session, per-stream sequencing state. Hands out outbound
//! `msgSeq` values, validates inbound frames, tracks heartbeats, and
//! publishes session/stream lifecycle events.
//!
//! ## Guarantees
//!
//! - **Strict ordering**: outbound `msgSeq` starts at 0 and increments by one
//!   per call; inbound `msgSeq` must strictly increase per stream
//! - **No side effects on rejection**: a frame that fails validation leaves
//!   the ledger untouched
//! - **Per-key locking**: each stream's counters sit behind their own mutex;
//!   sessions live in a sharded map
//! - **Bounded memory**: a closed stream leaves the session's stream map and
//!   only its id is remembered, for the most recent
//!   [`MAX_TOMBSTONES`] closures, so late frames on it are still rejected
//!
//! ## NOT Responsible For
//!
//! - Decoding wire text (see [`FrameCodec`](super::FrameCodec))
//! - Driving stream state machines (see `orchestrator`)

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::error::ProtocolError;
use super::frame::{Flag, Frame, PayloadKind};
use crate::clock::{now_millis, UnixMillis};
use crate::{PrincipalId, SessionId, StreamId};

/// Capacity of the lifecycle event channel. Slow subscribers lag and skip.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Closed stream ids remembered per session. An id closed longer ago than
/// this many closures may be reused as a new stream.
pub const MAX_TOMBSTONES: usize = 1024;

/// Why a stream was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Terminal success frame emitted.
    Completed,
    /// Caller cancel or heartbeat timeout.
    Cancelled,
    /// Stream TTL elapsed.
    Expired,
    /// Terminal error frame emitted.
    Failed,
}

impl CloseReason {
    /// Lowercase label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }
}

/// Session and stream lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    /// A session received its first frame.
    SessionOpened {
        /// Session id.
        session_id: SessionId,
        /// Principal bound to the session.
        principal: PrincipalId,
    },
    /// A session was closed by the caller or the router.
    SessionClosed {
        /// Session id.
        session_id: SessionId,
    },
    /// A session was torn down by heartbeat timeout or TTL expiry of all streams.
    SessionExpired {
        /// Session id.
        session_id: SessionId,
    },
    /// A stream accepted its first inbound frame.
    StreamOpened {
        /// Owning session.
        session_id: SessionId,
        /// Stream id.
        stream_id: StreamId,
    },
    /// A stream reached a terminal state.
    StreamClosed {
        /// Owning session.
        session_id: SessionId,
        /// Stream id.
        stream_id: StreamId,
        /// Terminal reason.
        reason: CloseReason,
    },
}

#[derive(Debug, Default)]
struct StreamSeq {
    next_outbound: u64,
    last_inbound: Option<u64>,
    inbound_final: bool,
    outbound_closed: bool,
    next_fragment: u32,
    closed: Option<CloseReason>,
}

/// Ids of closed streams, oldest evicted first.
#[derive(Debug, Default)]
struct Tombstones {
    ids: HashSet<StreamId>,
    order: VecDeque<StreamId>,
}

impl Tombstones {
    fn insert(&mut self, stream_id: &StreamId) {
        if !self.ids.insert(stream_id.clone()) {
            return;
        }
        self.order.push_back(stream_id.clone());
        while self.order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    principal: PrincipalId,
    created_at: UnixMillis,
    last_heartbeat: AtomicU64,
    /// Open streams only.
    streams: DashMap<StreamId, Arc<Mutex<StreamSeq>>>,
    /// Held while a stream is created or buried, so a closed id is never
    /// re-created.
    tombstones: Mutex<Tombstones>,
}

impl SessionEntry {
    fn existing(&self, stream_id: &StreamId) -> Option<Arc<Mutex<StreamSeq>>> {
        self.streams.get(stream_id).map(|s| Arc::clone(s.value()))
    }

    fn is_buried(&self, stream_id: &StreamId) -> bool {
        self.tombstones.lock().ids.contains(stream_id)
    }

    /// Counters for `stream_id`, created on first use. `None` once the
    /// stream has closed.
    fn stream(&self, stream_id: &StreamId) -> Option<Arc<Mutex<StreamSeq>>> {
        if let Some(stream) = self.existing(stream_id) {
            return Some(stream);
        }
        let tombstones = self.tombstones.lock();
        if tombstones.ids.contains(stream_id) {
            return None;
        }
        let stream = self
            .streams
            .entry(stream_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(StreamSeq::default())))
            .clone();
        Some(stream)
    }

    fn bury(&self, stream_id: &StreamId) {
        let mut tombstones = self.tombstones.lock();
        tombstones.insert(stream_id);
        self.streams.remove(stream_id);
    }
}

/// Read-only view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session id.
    pub session_id: SessionId,
    /// Principal bound to the session.
    pub principal: PrincipalId,
    /// Creation time.
    pub created_at: UnixMillis,
    /// Last heartbeat (or accepted frame).
    pub last_heartbeat: UnixMillis,
    /// Streams that have not reached a terminal state, sorted.
    pub active_streams: Vec<StreamId>,
}

/// Per-session sequencing and liveness registry.
///
/// Clone is cheap and all clones share state.
#[derive(Debug, Clone)]
pub struct SessionLedger {
    sessions: Arc<DashMap<SessionId, Arc<SessionEntry>>>,
    events: broadcast::Sender<LedgerEvent>,
    version: u16,
    heartbeat_interval_ms: u64,
}

impl SessionLedger {
    /// Create an empty ledger.
    ///
    /// # Arguments
    ///
    /// * `version`: protocol version inbound frames must carry.
    /// * `heartbeat_interval_ms`: silence after which a session is expired.
    pub fn new(version: u16, heartbeat_interval_ms: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: Arc::new(DashMap::new()),
            events,
            version,
            heartbeat_interval_ms,
        }
    }

    /// Subscribe to lifecycle events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Configured heartbeat interval in milliseconds.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms
    }

    fn emit(&self, event: LedgerEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn entry(&self, session_id: &SessionId) -> Result<Arc<SessionEntry>, ProtocolError> {
        self.sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ProtocolError::UnknownSession(session_id.to_string()))
    }

    /// Open `session_id` for `principal` if it does not exist yet.
    ///
    /// Returns `true` if the session was created by this call. Emits
    /// [`LedgerEvent::SessionOpened`] on creation.
    pub fn open_session(&self, session_id: &SessionId, principal: &PrincipalId, now: UnixMillis) -> bool {
        let mut created = false;
        self.sessions.entry(session_id.clone()).or_insert_with(|| {
            created = true;
            Arc::new(SessionEntry {
                principal: principal.clone(),
                created_at: now,
                last_heartbeat: AtomicU64::new(now),
                streams: DashMap::new(),
                tombstones: Mutex::new(Tombstones::default()),
            })
        });
        if created {
            info!(session_id = %session_id, principal = %principal, "session opened");
            self.emit(LedgerEvent::SessionOpened {
                session_id: session_id.clone(),
                principal: principal.clone(),
            });
        }
        created
    }

    /// Return `true` if the session exists.
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove a session and emit [`LedgerEvent::SessionClosed`].
    ///
    /// Returns `false` if the session was unknown.
    pub fn close_session(&self, session_id: &SessionId) -> bool {
        if self.sessions.remove(session_id).is_some() {
            info!(session_id = %session_id, "session closed");
            self.emit(LedgerEvent::SessionClosed {
                session_id: session_id.clone(),
            });
            true
        } else {
            false
        }
    }

    /// Remove a session and emit [`LedgerEvent::SessionExpired`].
    ///
    /// Returns `false` if the session was unknown.
    pub fn expire_session(&self, session_id: &SessionId) -> bool {
        if self.sessions.remove(session_id).is_some() {
            info!(session_id = %session_id, "session expired");
            self.emit(LedgerEvent::SessionExpired {
                session_id: session_id.clone(),
            });
            true
        } else {
            false
        }
    }

    /// Return the next outbound `msgSeq` for a stream and advance the counter.
    ///
    /// The first call for a stream returns `0`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnknownSession`] if the session does not exist.
    /// - [`ProtocolError::StreamClosed`] if the stream already emitted `final`.
    pub fn next_seq(&self, session_id: &SessionId, stream_id: &StreamId) -> Result<u64, ProtocolError> {
        let stream = self
            .entry(session_id)?
            .stream(stream_id)
            .ok_or_else(|| ProtocolError::StreamClosed(stream_id.to_string()))?;
        let mut seq = stream.lock();
        if seq.outbound_closed {
            return Err(ProtocolError::StreamClosed(stream_id.to_string()));
        }
        let n = seq.next_outbound;
        seq.next_outbound += 1;
        Ok(n)
    }

    /// Seal the outbound direction of a stream after its terminal frame.
    ///
    /// Later [`next_seq`](Self::next_seq) calls fail with `StreamClosed`.
    pub fn mark_final_outbound(&self, session_id: &SessionId, stream_id: &StreamId) {
        if let Some(stream) = self.entry(session_id).ok().and_then(|e| e.stream(stream_id)) {
            stream.lock().outbound_closed = true;
        }
    }

    /// Validate an inbound frame and, if valid, record its sequence number.
    ///
    /// Accepting a frame also refreshes the session heartbeat. The first
    /// accepted frame on a stream emits [`LedgerEvent::StreamOpened`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for a wrong version, missing ids, an unknown
    /// session, a checksum mismatch, a frame after `final`, a non-increasing
    /// `msgSeq`, or an out-of-order request fragment. On error nothing is
    /// recorded.
    pub fn validate_frame(&self, frame: &Frame, now: UnixMillis) -> Result<(), ProtocolError> {
        if frame.v != self.version {
            return Err(ProtocolError::UnsupportedVersion {
                got: frame.v,
                expected: self.version,
            });
        }
        if frame.session_id.as_str().is_empty() {
            return Err(ProtocolError::MissingField("sessionId"));
        }
        if frame.stream_id.as_str().is_empty() {
            return Err(ProtocolError::MissingField("streamId"));
        }
        let entry = self.entry(&frame.session_id)?;
        if !frame.payload.checksum_matches() {
            return Err(ProtocolError::ChecksumMismatch(frame.stream_id.to_string()));
        }

        let is_request = frame.payload.kind == PayloadKind::Request;
        let existing = entry.existing(&frame.stream_id);
        if existing.is_none() {
            if entry.is_buried(&frame.stream_id) {
                return Err(ProtocolError::FrameAfterFinal(frame.stream_id.to_string()));
            }
            if is_request && frame.frag_seq != 0 {
                return Err(ProtocolError::FragmentOutOfOrder {
                    stream_id: frame.stream_id.to_string(),
                    expected: 0,
                    got: frame.frag_seq,
                });
            }
        }
        let stream = existing
            .or_else(|| entry.stream(&frame.stream_id))
            .ok_or_else(|| ProtocolError::FrameAfterFinal(frame.stream_id.to_string()))?;
        let first = {
            let mut seq = stream.lock();
            if seq.inbound_final || seq.closed.is_some() {
                return Err(ProtocolError::FrameAfterFinal(frame.stream_id.to_string()));
            }
            if let Some(last) = seq.last_inbound {
                if frame.msg_seq <= last {
                    return Err(ProtocolError::NonIncreasingSeq {
                        stream_id: frame.stream_id.to_string(),
                        got: frame.msg_seq,
                        last,
                    });
                }
            }
            if is_request && frame.frag_seq != seq.next_fragment {
                return Err(ProtocolError::FragmentOutOfOrder {
                    stream_id: frame.stream_id.to_string(),
                    expected: seq.next_fragment,
                    got: frame.frag_seq,
                });
            }

            let first = seq.last_inbound.is_none();
            seq.last_inbound = Some(frame.msg_seq);
            if is_request {
                seq.next_fragment = if frame.has_flag(Flag::Partial) {
                    seq.next_fragment.saturating_add(1)
                } else {
                    0
                };
            }
            if frame.is_final() {
                seq.inbound_final = true;
            }
            first
        };

        entry.last_heartbeat.fetch_max(now, Ordering::Relaxed);
        if first && !frame.stream_id.is_control() {
            debug!(session_id = %frame.session_id, stream_id = %frame.stream_id, "stream opened");
            self.emit(LedgerEvent::StreamOpened {
                session_id: frame.session_id.clone(),
                stream_id: frame.stream_id.clone(),
            });
        }
        Ok(())
    }

    /// Refresh a session's heartbeat to the current wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownSession`] if the session does not exist.
    pub fn heartbeat(&self, session_id: &SessionId) -> Result<(), ProtocolError> {
        self.heartbeat_at(session_id, now_millis())
    }

    /// Refresh a session's heartbeat to `now`. Heartbeats never move backwards.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownSession`] if the session does not exist.
    pub fn heartbeat_at(&self, session_id: &SessionId, now: UnixMillis) -> Result<(), ProtocolError> {
        let entry = self.entry(session_id)?;
        entry.last_heartbeat.fetch_max(now, Ordering::Relaxed);
        Ok(())
    }

    /// Mark a stream terminal, drop its counters, and emit
    /// [`LedgerEvent::StreamClosed`].
    ///
    /// When the stream closes on TTL expiry and no other stream of the session
    /// is still active, the session itself is expired.
    pub fn close_stream(&self, session_id: &SessionId, stream_id: &StreamId, reason: CloseReason) {
        let Ok(entry) = self.entry(session_id) else {
            return;
        };
        let Some(stream) = entry.stream(stream_id) else {
            return;
        };
        {
            let mut seq = stream.lock();
            if seq.closed.is_some() {
                return;
            }
            seq.closed = Some(reason);
            seq.outbound_closed = true;
        }
        entry.bury(stream_id);
        debug!(
            session_id = %session_id,
            stream_id = %stream_id,
            reason = reason.as_str(),
            "stream closed"
        );
        self.emit(LedgerEvent::StreamClosed {
            session_id: session_id.clone(),
            stream_id: stream_id.clone(),
            reason,
        });

        if reason == CloseReason::Expired && active_streams(&entry).is_empty() {
            warn!(session_id = %session_id, "all streams expired; expiring session");
            self.expire_session(session_id);
        }
    }

    /// Snapshot one session.
    pub fn snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        let entry = self.entry(session_id).ok()?;
        Some(SessionSnapshot {
            session_id: session_id.clone(),
            principal: entry.principal.clone(),
            created_at: entry.created_at,
            last_heartbeat: entry.last_heartbeat.load(Ordering::Relaxed),
            active_streams: active_streams(&entry),
        })
    }
}

fn active_streams(entry: &SessionEntry) -> Vec<StreamId> {
    let mut ids: Vec<StreamId> = entry
        .streams
        .iter()
        .filter(|s| !s.key().is_control() && s.value().lock().closed.is_none())
        .map(|s| s.key().clone())
        .collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Payload, PayloadKind, PROTOCOL_VERSION};
    use serde_json::json;

    fn ledger() -> (SessionLedger, SessionId) {
        let ledger = SessionLedger::new(PROTOCOL_VERSION, 30_000);
        let sid = SessionId::new("s1");
        ledger.open_session(&sid, &PrincipalId::new("tenant"), 1_000);
        (ledger, sid)
    }

    fn frame(sid: &SessionId, stream: &str, seq: u64, kind: PayloadKind) -> Frame {
        Frame::new(
            sid.clone(),
            StreamId::new(stream),
            seq,
            Payload::new(kind, json!({"prompt": "x"})),
        )
    }

    #[test]
    fn test_next_seq_starts_at_zero_and_increments() {
        let (ledger, sid) = ledger();
        let st = StreamId::new("1");
        assert_eq!(ledger.next_seq(&sid, &st).unwrap(), 0);
        assert_eq!(ledger.next_seq(&sid, &st).unwrap(), 1);
        assert_eq!(ledger.next_seq(&sid, &StreamId::new("2")).unwrap(), 0);
    }

    #[test]
    fn test_next_seq_after_final_fails() {
        let (ledger, sid) = ledger();
        let st = StreamId::new("1");
        ledger.next_seq(&sid, &st).unwrap();
        ledger.mark_final_outbound(&sid, &st);
        assert!(matches!(
            ledger.next_seq(&sid, &st),
            Err(ProtocolError::StreamClosed(_))
        ));
    }

    #[test]
    fn test_next_seq_unknown_session_fails() {
        let (ledger, _) = ledger();
        assert!(matches!(
            ledger.next_seq(&SessionId::new("nope"), &StreamId::new("1")),
            Err(ProtocolError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_validate_rejects_non_increasing_seq_without_side_effect() {
        let (ledger, sid) = ledger();
        ledger
            .validate_frame(&frame(&sid, "1", 5, PayloadKind::Heartbeat), 2_000)
            .unwrap();
        let err = ledger
            .validate_frame(&frame(&sid, "1", 5, PayloadKind::Heartbeat), 3_000)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NonIncreasingSeq { got: 5, last: 5, .. }));
        // Rejected frame did not refresh the heartbeat.
        assert_eq!(ledger.snapshot(&sid).unwrap().last_heartbeat, 2_000);
        ledger
            .validate_frame(&frame(&sid, "1", 6, PayloadKind::Heartbeat), 3_000)
            .unwrap();
    }

    #[test]
    fn test_validate_rejects_frame_after_final() {
        let (ledger, sid) = ledger();
        let f = frame(&sid, "1", 0, PayloadKind::Request).with_flag(Flag::Final);
        ledger.validate_frame(&f, 1_000).unwrap();
        let err = ledger
            .validate_frame(&frame(&sid, "1", 1, PayloadKind::Cancel), 1_000)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameAfterFinal(_)));
    }

    #[test]
    fn test_validate_rejects_missing_session_id() {
        let (ledger, _) = ledger();
        let f = frame(&SessionId::new(""), "1", 0, PayloadKind::Request);
        assert_eq!(
            ledger.validate_frame(&f, 0),
            Err(ProtocolError::MissingField("sessionId"))
        );
    }

    #[test]
    fn test_validate_rejects_checksum_mismatch() {
        let (ledger, sid) = ledger();
        let mut f = frame(&sid, "1", 0, PayloadKind::Request);
        f.payload.checksum = Some("00".repeat(32));
        assert!(matches!(
            ledger.validate_frame(&f, 0),
            Err(ProtocolError::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_validate_enforces_fragment_order() {
        let (ledger, sid) = ledger();
        let f0 = frame(&sid, "1", 0, PayloadKind::Request).with_flag(Flag::Partial);
        ledger.validate_frame(&f0, 0).unwrap();
        let f2 = frame(&sid, "1", 1, PayloadKind::Request).with_frag_seq(2);
        assert!(matches!(
            ledger.validate_frame(&f2, 0),
            Err(ProtocolError::FragmentOutOfOrder { expected: 1, got: 2, .. })
        ));
        let f1 = frame(&sid, "1", 1, PayloadKind::Request).with_frag_seq(1);
        ledger.validate_frame(&f1, 0).unwrap();
    }

    #[test]
    fn test_heartbeat_never_moves_backwards() {
        let (ledger, sid) = ledger();
        ledger.heartbeat_at(&sid, 31_001).unwrap();
        ledger.heartbeat_at(&sid, 20_000).unwrap();
        assert_eq!(ledger.snapshot(&sid).unwrap().last_heartbeat, 31_001);
    }

    #[test]
    fn test_closed_streams_leave_only_bounded_tombstones() {
        let (ledger, sid) = ledger();
        let total = MAX_TOMBSTONES + 10;
        for i in 1..=total {
            let id = i.to_string();
            ledger
                .validate_frame(&frame(&sid, &id, 0, PayloadKind::Request), 0)
                .unwrap();
            ledger.close_stream(&sid, &StreamId::new(id), CloseReason::Completed);
        }
        let entry = ledger.entry(&sid).unwrap();
        assert!(entry.streams.is_empty());
        assert_eq!(entry.tombstones.lock().order.len(), MAX_TOMBSTONES);
        assert_eq!(entry.tombstones.lock().ids.len(), MAX_TOMBSTONES);
        assert!(!entry.is_buried(&StreamId::new("1")));

        // A recently closed stream still rejects late frames both ways.
        let last = total.to_string();
        assert!(matches!(
            ledger.validate_frame(&frame(&sid, &last, 1, PayloadKind::Cancel), 0),
            Err(ProtocolError::FrameAfterFinal(_))
        ));
        assert!(matches!(
            ledger.next_seq(&sid, &StreamId::new(last.clone())),
            Err(ProtocolError::StreamClosed(_))
        ));
        ledger.mark_final_outbound(&sid, &StreamId::new(last));
        assert!(entry.streams.is_empty());
        assert!(ledger.snapshot(&sid).unwrap().active_streams.is_empty());
    }

    #[test]
    fn test_lifecycle_events_emitted_in_order() {
        let ledger = SessionLedger::new(PROTOCOL_VERSION, 30_000);
        let mut rx = ledger.subscribe();
        let sid = SessionId::new("s");
        ledger.open_session(&sid, &PrincipalId::new("p"), 0);
        ledger
            .validate_frame(&frame(&sid, "1", 0, PayloadKind::Request), 0)
            .unwrap();
        ledger.close_stream(&sid, &StreamId::new("1"), CloseReason::Completed);
        ledger.close_session(&sid);

        assert!(matches!(rx.try_recv().unwrap(), LedgerEvent::SessionOpened { .. }));
        assert!(matches!(rx.try_recv().unwrap(), LedgerEvent::StreamOpened { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            LedgerEvent::StreamClosed { reason: CloseReason::Completed, .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), LedgerEvent::SessionClosed { .. }));
    }

    #[test]
    fn test_last_stream_expiry_expires_session() {
        let (ledger, sid) = ledger();
        let mut rx = ledger.subscribe();
        ledger
            .validate_frame(&frame(&sid, "1", 0, PayloadKind::Request), 0)
            .unwrap();
        ledger.close_stream(&sid, &StreamId::new("1"), CloseReason::Expired);
        assert!(!ledger.contains(&sid));
        let mut saw_expired = false;
        while let Ok(ev) = rx.try_recv() {
            saw_expired |= matches!(ev, LedgerEvent::SessionExpired { .. });
        }
        assert!(saw_expired);
    }

    #[test]
    fn test_open_session_is_idempotent() {
        let (ledger, sid) = ledger();
        assert!(!ledger.open_session(&sid, &PrincipalId::new("other"), 5));
        assert_eq!(ledger.snapshot(&sid).unwrap().principal.as_str(), "tenant");
    }
}
