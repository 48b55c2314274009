use bank_core::capability::CapabilityError;

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Error types for the neural bus.
///
/// Propagation follows the severity of the kind: capability and resource
/// errors abort the offending stream, protocol errors abort the session,
/// and core errors surface to the immediate caller.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Peer violated the framing or session rules; fatal for the session
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame announced a payload above the 16 MiB cap
    #[error("frame too large: {len} bytes")]
    FrameTooLarge {
        /// Announced payload length
        len: u32,
    },

    /// Unknown frame kind on a non-extensible stream
    #[error("unknown frame kind 0x{0:04x}")]
    UnknownFrameKind(u16),

    /// Payload schema version this build does not speak
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u16),

    /// Peer's store dimension disagrees with ours
    #[error("embedding dimension mismatch: ours {ours}, peer {theirs}")]
    DimensionMismatch {
        /// Local store dimension
        ours: u32,
        /// Dimension announced by the peer
        theirs: u32,
    },

    /// Receiver could not keep up and refused to grant more credit
    #[error("stream aborted under backpressure")]
    BackpressureAbort,

    /// Per-session stream limit reached
    #[error("too many streams")]
    TooManyStreams,

    /// Per-process session limit reached
    #[error("too many sessions")]
    TooManySessions,

    /// The peer aborted this stream
    #[error("stream aborted by peer: {0}")]
    StreamAborted(String),

    /// The session is closed (or closing) and took no more work
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Handshake did not complete within the deadline
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A capability check refused the action
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// Store or learner failure underneath a bus action
    #[error(transparent)]
    Core(#[from] bank_core::Error),

    /// Socket-level failure
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled; never a failure
    #[error("operation cancelled")]
    Cancelled,
}

impl BusError {
    /// True when the error ends the whole session rather than one stream.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            BusError::Protocol(_)
                | BusError::UnsupportedVersion(_)
                | BusError::DimensionMismatch { .. }
                | BusError::HandshakeTimeout
                | BusError::Io(_)
        )
    }

    /// Short stable code exposed to the remote peer on stream or session
    /// close. Local detail never crosses the wire.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BusError::Protocol(_) => "protocol_error",
            BusError::FrameTooLarge { .. } => "frame_too_large",
            BusError::UnknownFrameKind(_) => "unknown_frame_kind",
            BusError::UnsupportedVersion(_) => "unsupported_version",
            BusError::DimensionMismatch { .. } => "dimension_mismatch",
            BusError::BackpressureAbort => "backpressure_abort",
            BusError::TooManyStreams => "too_many_streams",
            BusError::TooManySessions => "too_many_sessions",
            BusError::StreamAborted(_) => "stream_aborted",
            BusError::SessionClosed(_) => "session_closed",
            BusError::HandshakeTimeout => "handshake_timeout",
            BusError::Capability(e) => e.reason_code(),
            BusError::Core(e) => e.reason_code(),
            BusError::Io(_) => "transport_error",
            BusError::Cancelled => "cancelled",
        }
    }
}
