//! Integration tests for the frame codec and session ledger.
//!
//! Covers the wire round trip, strict `msgSeq` handling in both directions,
//! and the lifecycle events the ledger publishes.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use tokio_stream_router::protocol::{
    CloseReason, Flag, Frame, FrameCodec, LedgerEvent, Payload, PayloadKind, ProtocolError,
    QosClass, ResourceWindow, RiskTier, SessionLedger, PROTOCOL_VERSION,
};
use tokio_stream_router::{PrincipalId, SessionId, StreamId};

// ============================================================================
// Helpers
// ============================================================================

fn sid() -> SessionId {
    SessionId::new("sess-1")
}

fn ledger() -> SessionLedger {
    let ledger = SessionLedger::new(PROTOCOL_VERSION, 30_000);
    ledger.open_session(&sid(), &PrincipalId::new("tenant-a"), 1_000);
    ledger
}

fn request(stream: &str, seq: u64) -> Frame {
    Frame::new(
        sid(),
        StreamId::new(stream),
        seq,
        Payload::new(PayloadKind::Request, json!({ "prompt": "hello" })),
    )
}

// ============================================================================
// Codec
// ============================================================================

#[test]
fn test_codec_round_trip_preserves_every_field() {
    let codec = FrameCodec::default();
    let mut frame = request("7", 3).with_flag(Flag::Partial).with_frag_seq(0);
    frame.qos = QosClass::Gold;
    frame.ttl = Some(5_000);
    frame.window = ResourceWindow {
        max_parallel: 2,
        max_tokens: 800,
        max_usd_micros: 1_000,
    };
    frame.meta.task_type = Some("code".into());
    frame.meta.languages = vec!["en".into(), "de".into()];
    frame.meta.risk = Some(RiskTier::Medium);
    frame.meta.tool_permissions = vec!["search".into()];
    frame.payload.cost_est = Some(900);
    frame.payload.confidence = Some(0.5);
    frame.payload.expiry_ms = Some(4_000);
    frame.payload = frame.payload.with_checksum();
    frame.sig = Some("opaque".into());

    let text = codec.encode(&frame).unwrap();
    assert!(text.contains("\"sessionId\""));
    assert!(text.contains("\"maxUsdMicros\""));
    let decoded = codec.decode(&text).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn test_codec_rejects_oversized_text() {
    let codec = FrameCodec::new(64, PROTOCOL_VERSION);
    let text = FrameCodec::default().encode(&request("1", 0)).unwrap();
    assert!(matches!(
        codec.decode(&text),
        Err(ProtocolError::FrameTooLarge { limit: 64, .. })
    ));
}

#[test]
fn test_codec_rejects_missing_required_field() {
    let codec = FrameCodec::default();
    let text = r#"{"v":1,"sessionId":"s","msgSeq":0,"payload":{"type":"request"}}"#;
    assert!(matches!(codec.decode(text), Err(ProtocolError::Malformed(_))));
}

#[test]
fn test_codec_rejects_other_protocol_version() {
    let codec = FrameCodec::default();
    let mut frame = request("1", 0);
    frame.v = PROTOCOL_VERSION + 1;
    let text = serde_json::to_string(&frame).unwrap();
    assert!(matches!(
        codec.decode(&text),
        Err(ProtocolError::UnsupportedVersion { .. })
    ));
}

// ============================================================================
// Outbound sequencing
// ============================================================================

#[test]
fn test_next_seq_starts_at_zero_and_is_per_stream() {
    let ledger = ledger();
    let a = StreamId::new("a");
    let b = StreamId::new("b");
    assert_eq!(ledger.next_seq(&sid(), &a).unwrap(), 0);
    assert_eq!(ledger.next_seq(&sid(), &a).unwrap(), 1);
    assert_eq!(ledger.next_seq(&sid(), &b).unwrap(), 0);
    assert_eq!(ledger.next_seq(&sid(), &a).unwrap(), 2);
}

#[test]
fn test_next_seq_is_gapless_under_contention() {
    let ledger = Arc::new(ledger());
    let stream = StreamId::new("hot");
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let stream = stream.clone();
            std::thread::spawn(move || {
                (0..500)
                    .map(|_| ledger.next_seq(&sid(), &stream).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut all = HashSet::new();
    for h in handles {
        for seq in h.join().unwrap() {
            assert!(all.insert(seq), "sequence {seq} handed out twice");
        }
    }
    assert_eq!(all.len(), 4_000);
    assert_eq!(all.iter().max().copied(), Some(3_999));
}

#[test]
fn test_next_seq_fails_after_final_outbound() {
    let ledger = ledger();
    let s = StreamId::new("1");
    ledger.next_seq(&sid(), &s).unwrap();
    ledger.mark_final_outbound(&sid(), &s);
    assert!(matches!(
        ledger.next_seq(&sid(), &s),
        Err(ProtocolError::StreamClosed(_))
    ));
}

// ============================================================================
// Inbound validation
// ============================================================================

#[test]
fn test_validate_rejects_non_increasing_msg_seq() {
    let ledger = ledger();
    ledger.validate_frame(&request("1", 4).with_flag(Flag::Partial), 1_000).unwrap();
    let mut dup = request("1", 4);
    dup.frag_seq = 1;
    assert!(matches!(
        ledger.validate_frame(&dup, 1_000),
        Err(ProtocolError::NonIncreasingSeq { got: 4, last: 4, .. })
    ));
    let mut back = request("1", 2);
    back.frag_seq = 1;
    assert!(matches!(
        ledger.validate_frame(&back, 1_000),
        Err(ProtocolError::NonIncreasingSeq { .. })
    ));
}

#[test]
fn test_validate_rejection_leaves_ledger_untouched() {
    let ledger = ledger();
    ledger.validate_frame(&request("1", 1).with_flag(Flag::Partial), 1_000).unwrap();
    // Wrong fragment index: rejected, and msgSeq 2 is not consumed.
    let mut bad = request("1", 2);
    bad.frag_seq = 5;
    assert!(ledger.validate_frame(&bad, 1_000).is_err());
    let mut good = request("1", 2);
    good.frag_seq = 1;
    ledger.validate_frame(&good, 1_000).unwrap();
}

#[test]
fn test_validate_rejects_frame_after_final() {
    let ledger = ledger();
    ledger
        .validate_frame(&request("1", 0).with_flag(Flag::Final), 1_000)
        .unwrap();
    let next = Frame::new(
        sid(),
        StreamId::new("1"),
        1,
        Payload::new(PayloadKind::Cancel, json!(null)),
    );
    assert!(matches!(
        ledger.validate_frame(&next, 1_000),
        Err(ProtocolError::FrameAfterFinal(_))
    ));
}

#[test]
fn test_validate_rejects_frames_on_closed_stream() {
    let ledger = ledger();
    ledger.validate_frame(&request("1", 0), 1_000).unwrap();
    ledger.close_stream(&sid(), &StreamId::new("1"), CloseReason::Completed);
    assert!(matches!(
        ledger.validate_frame(&request("1", 1), 1_000),
        Err(ProtocolError::FrameAfterFinal(_))
    ));
}

#[test]
fn test_validate_rejects_missing_ids_and_unknown_session() {
    let ledger = ledger();
    let mut frame = request("1", 0);
    frame.stream_id = StreamId::new("");
    assert_eq!(
        ledger.validate_frame(&frame, 1_000),
        Err(ProtocolError::MissingField("streamId"))
    );
    let mut frame = request("1", 0);
    frame.session_id = SessionId::new("");
    assert_eq!(
        ledger.validate_frame(&frame, 1_000),
        Err(ProtocolError::MissingField("sessionId"))
    );
    let mut frame = request("1", 0);
    frame.session_id = SessionId::new("nobody");
    assert!(matches!(
        ledger.validate_frame(&frame, 1_000),
        Err(ProtocolError::UnknownSession(_))
    ));
}

#[test]
fn test_validate_rejects_checksum_mismatch() {
    let ledger = ledger();
    let mut frame = request("1", 0);
    frame.payload = frame.payload.with_checksum();
    frame.payload.content = json!({ "prompt": "tampered" });
    assert!(matches!(
        ledger.validate_frame(&frame, 1_000),
        Err(ProtocolError::ChecksumMismatch(_))
    ));
}

#[test]
fn test_validate_requires_first_fragment_first() {
    let ledger = ledger();
    let frame = request("9", 0).with_frag_seq(1);
    assert!(matches!(
        ledger.validate_frame(&frame, 1_000),
        Err(ProtocolError::FragmentOutOfOrder { expected: 0, got: 1, .. })
    ));
}

// ============================================================================
// Heartbeats and lifecycle events
// ============================================================================

#[test]
fn test_heartbeat_refreshes_last_seen() {
    let ledger = ledger();
    assert_eq!(ledger.snapshot(&sid()).unwrap().last_heartbeat, 1_000);
    ledger.heartbeat_at(&sid(), 35_000).unwrap();
    assert_eq!(ledger.snapshot(&sid()).unwrap().last_heartbeat, 35_000);
    assert!(matches!(
        ledger.heartbeat_at(&SessionId::new("gone"), 35_000),
        Err(ProtocolError::UnknownSession(_))
    ));
}

#[test]
fn test_accepted_frame_counts_as_heartbeat() {
    let ledger = ledger();
    ledger.validate_frame(&request("1", 0), 25_000).unwrap();
    assert_eq!(ledger.snapshot(&sid()).unwrap().last_heartbeat, 25_000);
}

#[test]
fn test_closed_stream_rejects_late_frames_after_leaving_active_set() {
    let ledger = ledger();
    ledger.validate_frame(&request("1", 0), 1_000).unwrap();
    ledger.validate_frame(&request("2", 0), 1_000).unwrap();
    ledger.close_stream(&sid(), &StreamId::new("1"), CloseReason::Cancelled);

    let snapshot = ledger.snapshot(&sid()).unwrap();
    assert_eq!(snapshot.active_streams, vec![StreamId::new("2")]);
    assert!(matches!(
        ledger.validate_frame(&request("1", 1), 2_000),
        Err(ProtocolError::FrameAfterFinal(_))
    ));
    assert!(matches!(
        ledger.next_seq(&sid(), &StreamId::new("1")),
        Err(ProtocolError::StreamClosed(_))
    ));
}

#[test]
fn test_lifecycle_events_in_order() {
    let ledger = SessionLedger::new(PROTOCOL_VERSION, 30_000);
    let mut events = ledger.subscribe();
    ledger.open_session(&sid(), &PrincipalId::new("p"), 0);
    ledger.validate_frame(&request("1", 0), 0).unwrap();
    ledger.close_stream(&sid(), &StreamId::new("1"), CloseReason::Completed);
    ledger.close_session(&sid());

    assert!(matches!(events.try_recv().unwrap(), LedgerEvent::SessionOpened { .. }));
    assert!(matches!(events.try_recv().unwrap(), LedgerEvent::StreamOpened { .. }));
    assert_eq!(
        events.try_recv().unwrap(),
        LedgerEvent::StreamClosed {
            session_id: sid(),
            stream_id: StreamId::new("1"),
            reason: CloseReason::Completed,
        }
    );
    assert!(matches!(events.try_recv().unwrap(), LedgerEvent::SessionClosed { .. }));
}

#[test]
fn test_session_expires_when_last_stream_expires() {
    let ledger = ledger();
    let mut events = ledger.subscribe();
    ledger.validate_frame(&request("1", 0), 1_000).unwrap();
    ledger.validate_frame(&request("2", 0), 1_000).unwrap();

    ledger.close_stream(&sid(), &StreamId::new("1"), CloseReason::Expired);
    assert!(ledger.contains(&sid()));
    ledger.close_stream(&sid(), &StreamId::new("2"), CloseReason::Expired);
    assert!(!ledger.contains(&sid()));

    let mut saw_expired = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, LedgerEvent::SessionExpired { .. }) {
            saw_expired = true;
        }
    }
    assert!(saw_expired);
}
