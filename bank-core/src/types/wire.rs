//! Wire vocabulary shared between bus peers.
//!
//! Frame kind codes, flag bits, and the typed payload carried by each
//! frame. Payloads serialize deterministically with postcard behind a
//! 2-byte big-endian schema version; the framing itself (length, kind,
//! flags) lives in the bus codec.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{IntentCapability, Pattern, PatternId, StrategyStats};

/// Bus protocol version exchanged in `Hello`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Schema version prefixed to every frame payload.
pub const WIRE_SCHEMA_VERSION: u16 = 1;

/// Hard cap on a frame's payload length.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Frame flag bits. All bits not named here are reserved and must be zero.
pub mod flags {
    /// Final frame on this stream
    pub const END_OF_STREAM: u16 = 1 << 0;
    /// Sender asks for acknowledgement
    pub const REQUIRES_ACK: u16 = 1 << 1;
    /// Mask of the bits a conforming sender may set
    pub const KNOWN: u16 = END_OF_STREAM | REQUIRES_ACK;
}

/// Typed frame kinds, grouped by stream in the 0xNN00 code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum FrameKind {
    /// Session opener; first frame on the control stream
    Hello = 0x0001,
    /// Orderly session shutdown; last frame on the control stream
    Goodbye = 0x0002,
    /// Keep-alive probe
    Ping = 0x0003,
    /// Keep-alive response
    Pong = 0x0004,
    /// Atomically replace the session capability
    CapabilityRotate = 0x0005,
    /// Grant additional flow-control credit for one stream
    CreditGrant = 0x0006,
    /// Abort a single stream, leaving the session up
    StreamAbort = 0x0007,

    /// Summary of a pattern available from the sender
    PatternOffered = 0x0100,
    /// Ask the peer for the full pattern behind an offer
    PatternRequested = 0x0101,
    /// Full pattern record
    PatternFull = 0x0102,

    /// Opens a reasoning stream and declares its sub-kind
    ReasoningOpen = 0x0200,
    /// One chunk of relayed reasoning data
    ReasoningChunk = 0x0201,
    /// Ends a reasoning stream
    ReasoningEnd = 0x0202,

    /// Opens a snapshot stream; carries the low-water timestamp
    SnapshotRequest = 0x0300,
    /// One self-describing slice of the sender's store
    SnapshotChunk = 0x0301,
}

impl FrameKind {
    /// Decode a wire code into a known kind.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(FrameKind::Hello),
            0x0002 => Some(FrameKind::Goodbye),
            0x0003 => Some(FrameKind::Ping),
            0x0004 => Some(FrameKind::Pong),
            0x0005 => Some(FrameKind::CapabilityRotate),
            0x0006 => Some(FrameKind::CreditGrant),
            0x0007 => Some(FrameKind::StreamAbort),
            0x0100 => Some(FrameKind::PatternOffered),
            0x0101 => Some(FrameKind::PatternRequested),
            0x0102 => Some(FrameKind::PatternFull),
            0x0200 => Some(FrameKind::ReasoningOpen),
            0x0201 => Some(FrameKind::ReasoningChunk),
            0x0202 => Some(FrameKind::ReasoningEnd),
            0x0300 => Some(FrameKind::SnapshotRequest),
            0x0301 => Some(FrameKind::SnapshotChunk),
            _ => None,
        }
    }

    /// Wire code for this kind.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Which stream kind a stream is classified as when this is its first
    /// frame; `None` for kinds that never open a stream.
    #[must_use]
    pub fn opens_stream(self) -> Option<StreamKind> {
        match self {
            FrameKind::Hello => Some(StreamKind::Control),
            FrameKind::PatternOffered | FrameKind::PatternRequested | FrameKind::PatternFull => {
                Some(StreamKind::PatternSync)
            }
            FrameKind::ReasoningOpen => Some(StreamKind::Reasoning),
            FrameKind::SnapshotRequest | FrameKind::SnapshotChunk => Some(StreamKind::Snapshot),
            _ => None,
        }
    }
}

/// The four stream classes a session multiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Exactly one per session; `Hello`, `Goodbye`, keep-alive, rotation
    Control,
    /// Unidirectional offer/request/full pattern exchange
    PatternSync,
    /// Unidirectional live reasoning relay
    Reasoning,
    /// Bulk store transfer to a joining peer
    Snapshot,
}

impl StreamKind {
    /// Extensible streams skip unknown frame kinds instead of closing.
    #[must_use]
    pub fn is_extensible(self) -> bool {
        matches!(self, StreamKind::Reasoning)
    }
}

/// Sub-kinds a reasoning stream declares in its opening frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningKind {
    /// Raw model tokens
    Tokens,
    /// Structured trace events
    Trace,
    /// Rubric evaluations
    Rubric,
    /// Verification transcripts
    Verify,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `Hello`: first frame of the session, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Bus protocol version the sender speaks
    pub protocol_version: u16,
    /// Sender's long-term public signing key
    pub issuer_key: [u8; 32],
    /// Opening capability governing the sender's actions
    pub capability: IntentCapability,
    /// Flow-control credit (in frames) the sender grants per stream
    pub credit_per_stream: u32,
    /// Embedding dimension of the sender's store; 0 while still unfixed
    pub embedding_dim: u32,
    /// Signature by `issuer_key` over the rest of this payload, proving
    /// possession of the key the capability names
    pub signature: Vec<u8>,
}

impl HelloPayload {
    /// Canonical byte string the hello signature covers.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 32 + 64 + 8);
        out.extend_from_slice(&self.protocol_version.to_be_bytes());
        out.extend_from_slice(&self.issuer_key);
        out.extend_from_slice(&self.capability.signature);
        out.extend_from_slice(&self.credit_per_stream.to_be_bytes());
        out.extend_from_slice(&self.embedding_dim.to_be_bytes());
        out
    }
}

/// `Goodbye`: carries a short reason code; detail stays local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodbyePayload {
    /// Short stable reason code
    pub reason: String,
}

/// `Ping` / `Pong`: sequence echo for keep-alive accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Sequence number echoed back in the matching pong
    pub seq: u64,
}

/// `CapabilityRotate`: replaces the session capability atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRotatePayload {
    /// Capability governing all subsequent frames
    pub capability: IntentCapability,
}

/// `CreditGrant`: replenishes one stream's flow-control credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditGrantPayload {
    /// Stream the grant applies to
    pub stream_id: u32,
    /// Additional frames the sender may emit
    pub credits: u32,
}

/// `StreamAbort`: stop one stream without touching the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAbortPayload {
    /// Stream being aborted
    pub stream_id: u32,
    /// Short stable reason code
    pub reason: String,
}

/// `PatternOffered`: gossip summary of one locally held pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternOfferedPayload {
    /// Pattern id
    pub id: PatternId,
    /// Context tag
    pub context: String,
    /// Strategy identifier
    pub strategy: String,
    /// Commit timestamp at the sender
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: DateTime<Utc>,
    /// blake3 over the full record including outcome
    pub content_hash: [u8; 32],
}

/// `PatternRequested`: ask for the full record behind an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRequestedPayload {
    /// Id the receiver wants in full
    pub id: PatternId,
}

/// `PatternFull`: complete pattern record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternFullPayload {
    /// The pattern being transferred
    pub pattern: Pattern,
}

/// `ReasoningOpen`: declares the stream's sub-kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningOpenPayload {
    /// What the stream carries
    pub sub_kind: ReasoningKind,
    /// Free-form label for the receiving side's logs
    pub label: String,
}

/// `ReasoningChunk`: opaque relayed data; the bus never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningChunkPayload {
    /// Opaque bytes
    pub data: Vec<u8>,
}

/// `SnapshotRequest`: opens a snapshot stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequestPayload {
    /// Low-water mark; the sender streams every pattern with
    /// `created_at >= since`
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub since: DateTime<Utc>,
}

/// `SnapshotChunk`: one self-describing slice of the sender's store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotChunkPayload {
    /// Patterns in this slice, in commit order
    pub patterns: Vec<Pattern>,
    /// Stats rows for the contexts covered by this slice
    pub stats: Vec<StrategyStats>,
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

/// Failures while decoding a frame payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// The 2-byte schema version prefix names a version this build does
    /// not speak
    #[error("unsupported payload schema version {0}")]
    UnsupportedVersion(u16),
    /// The body is not a valid encoding of the expected type
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Encode a payload: 2-byte big-endian schema version, then the postcard
/// body. Postcard's encoding is canonical, so identical values always
/// produce identical bytes.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    let body =
        postcard::to_allocvec(value).map_err(|e| PayloadError::Malformed(e.to_string()))?;
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&WIRE_SCHEMA_VERSION.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a payload encoded by [`encode_payload`].
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    if bytes.len() < 2 {
        return Err(PayloadError::Malformed("payload shorter than version prefix".into()));
    }
    let version = u16::from_be_bytes([bytes[0], bytes[1]]);
    if version != WIRE_SCHEMA_VERSION {
        return Err(PayloadError::UnsupportedVersion(version));
    }
    postcard::from_bytes(&bytes[2..]).map_err(|e| PayloadError::Malformed(e.to_string()))
}
