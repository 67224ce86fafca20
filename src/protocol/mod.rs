//! Wire protocol: frame model, JSON codec, and the per-session sequencing
//! ledger.
//!
//! Inbound text goes through [`FrameCodec::decode`] and then
//! [`SessionLedger::validate_frame`] before the orchestrator sees it.
//! Outbound frames take their `msgSeq` from [`SessionLedger::next_seq`].

pub mod codec;
pub mod error;
pub mod frame;
pub mod ledger;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_BYTES};
pub use error::ProtocolError;
pub use frame::{
    Flag, Frame, FrameMeta, Payload, PayloadKind, QosClass, ResourceWindow, RiskTier,
    TraceContext, PROTOCOL_VERSION,
};
pub use ledger::{CloseReason, LedgerEvent, SessionLedger, SessionSnapshot, MAX_TOMBSTONES};
