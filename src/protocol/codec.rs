//! JSON frame codec.
//!
//! Decoding is the first gate an inbound frame passes: size limit, JSON
//! shape, then protocol version. Sequencing checks happen later in the
//! [`SessionLedger`](super::SessionLedger).

use super::error::ProtocolError;
use super::frame::{Frame, PROTOCOL_VERSION};

/// Default maximum inbound frame size (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Stateless encoder/decoder for wire frames.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    version: u16,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES, PROTOCOL_VERSION)
    }
}

impl FrameCodec {
    /// Create a codec with an explicit size limit and protocol version.
    pub fn new(max_frame_bytes: usize, version: u16) -> Self {
        Self {
            max_frame_bytes,
            version,
        }
    }

    /// Protocol version this codec accepts and stamps.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Decode one frame from wire text.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FrameTooLarge`] if `text` exceeds the size limit.
    /// - [`ProtocolError::Malformed`] if `text` is not a valid frame object.
    /// - [`ProtocolError::UnsupportedVersion`] if `v` differs from the codec version.
    pub fn decode(&self, text: &str) -> Result<Frame, ProtocolError> {
        if text.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                limit: self.max_frame_bytes,
            });
        }
        let frame: Frame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if frame.v != self.version {
            return Err(ProtocolError::UnsupportedVersion {
                got: frame.v,
                expected: self.version,
            });
        }
        Ok(frame)
    }

    /// Encode a frame to wire text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails, which only
    /// happens for non-finite floats in `payload.content`.
    pub fn encode(&self, frame: &Frame) -> Result<String, ProtocolError> {
        serde_json::to_string(frame).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Flag, Payload, PayloadKind, QosClass};
    use crate::{SessionId, StreamId};
    use serde_json::json;

    fn sample() -> Frame {
        let mut frame = Frame::new(
            SessionId::new("sess"),
            StreamId::new("1"),
            4,
            Payload::new(PayloadKind::Chunk, json!({"text": "abc"})).with_checksum(),
        )
        .with_flag(Flag::Partial)
        .with_frag_seq(2);
        frame.qos = QosClass::Gold;
        frame.ttl = Some(5_000);
        frame.sig = Some("sig".into());
        frame.payload.confidence = Some(0.25);
        frame.payload.cost_est = Some(77);
        frame
    }

    #[test]
    fn test_decode_inverts_encode() {
        let codec = FrameCodec::default();
        let frame = sample();
        let text = codec.encode(&frame).unwrap();
        assert_eq!(codec.decode(&text).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_oversized_text() {
        let codec = FrameCodec::new(16, PROTOCOL_VERSION);
        let text = codec.encode(&sample()).unwrap();
        assert!(matches!(
            codec.decode(&text),
            Err(ProtocolError::FrameTooLarge { limit: 16, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let codec = FrameCodec::default();
        let mut frame = sample();
        frame.v = 9;
        let text = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            codec.decode(&text),
            Err(ProtocolError::UnsupportedVersion {
                got: 9,
                expected: PROTOCOL_VERSION
            })
        );
    }

    #[test]
    fn test_decode_rejects_missing_payload() {
        let codec = FrameCodec::default();
        let err = codec
            .decode(r#"{"v":1,"sessionId":"s","streamId":"1","msgSeq":0}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let codec = FrameCodec::default();
        assert!(matches!(
            codec.decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
