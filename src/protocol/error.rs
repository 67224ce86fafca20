//! Protocol violation errors.

use thiserror::Error;

/// A malformed, out-of-order, or otherwise invalid frame.
///
/// Protocol errors are fatal for the offending stream only; the session and
/// its other streams keep running.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// The wire text could not be decoded into a frame.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The wire text exceeds the configured maximum frame size.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Size of the rejected frame in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The frame declares a protocol version this router does not speak.
    #[error("unsupported protocol version {got}, expected {expected}")]
    UnsupportedVersion {
        /// Version carried by the frame.
        got: u16,
        /// Version the router speaks.
        expected: u16,
    },

    /// A required field is absent or empty.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// `msgSeq` did not increase relative to the last accepted frame.
    #[error("non-increasing msgSeq on stream {stream_id}: got {got}, last accepted {last}")]
    NonIncreasingSeq {
        /// Stream the frame arrived on.
        stream_id: String,
        /// Sequence number carried by the frame.
        got: u64,
        /// Last accepted sequence number on the stream.
        last: u64,
    },

    /// A frame arrived on a stream that was already terminated by `final`.
    #[error("frame after final on stream {0}")]
    FrameAfterFinal(String),

    /// A fragment arrived out of order within one logical message.
    #[error("fragment out of order on stream {stream_id}: expected {expected}, got {got}")]
    FragmentOutOfOrder {
        /// Stream the fragment arrived on.
        stream_id: String,
        /// Expected fragment index.
        expected: u32,
        /// Fragment index carried by the frame.
        got: u32,
    },

    /// The payload checksum does not match its content.
    #[error("payload checksum mismatch on stream {0}")]
    ChecksumMismatch(String),

    /// The frame references a session the ledger does not know.
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// The frame's session id does not match the session it arrived on.
    #[error("frame for session {got} arrived on session {expected}")]
    SessionMismatch {
        /// Session the transport is bound to.
        expected: String,
        /// Session id carried by the frame.
        got: String,
    },

    /// An outbound sequence number was requested for a stream that has
    /// already emitted its terminal frame.
    #[error("stream {0} is closed")]
    StreamClosed(String),

    /// The payload type is not valid in this direction or position.
    #[error("unexpected payload type '{kind}' on stream {stream_id}")]
    UnexpectedPayload {
        /// Stream the frame arrived on.
        stream_id: String,
        /// Offending payload type.
        kind: String,
    },

    /// A request arrived on a stream that already carries one.
    #[error("stream {0} already carries a request")]
    DuplicateRequest(String),

    /// Encoding a frame failed.
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_increasing_seq_display_includes_values() {
        let err = ProtocolError::NonIncreasingSeq {
            stream_id: "s-1".into(),
            got: 3,
            last: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("s-1") && msg.contains('3') && msg.contains('5'));
    }

    #[test]
    fn test_missing_field_display_names_field() {
        assert!(ProtocolError::MissingField("sessionId")
            .to_string()
            .contains("sessionId"));
    }
}
