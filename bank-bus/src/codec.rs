//! Length-delimited frame codec with stream multiplexing.
//!
//! Each wire record is one frame addressed to one stream:
//!
//! ```text
//! +-----------+-----------+----------+-----------+---------------+
//! | stream_id | len       | kind     | flags     | payload       |
//! | 4 (BE)    | 4 (BE)    | 2 (BE)   | 2 (BE)    | len bytes     |
//! +-----------+-----------+----------+-----------+---------------+
//! ```
//!
//! `len` counts payload bytes only and is capped at 16 MiB. An oversize
//! announcement is surfaced as [`MuxItem::Oversize`] the moment the header
//! is read; the payload is consumed and discarded without buffering, so
//! the stream can be aborted while the session stays up. Reserved flag
//! bits are a protocol error and kill the session.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use bank_core::types::wire::{self, flags, FrameKind};

use crate::error::BusError;

/// Header bytes per record: stream id + len + kind + flags.
const HEADER_LEN: usize = 4 + 4 + 2 + 2;

/// One typed, length-delimited unit of transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type code
    pub kind: u16,
    /// Flag bits; only [`flags::KNOWN`] may be set
    pub flags: u16,
    /// Schema-versioned payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Frame carrying an encodable payload.
    pub fn new<T: serde::Serialize>(kind: FrameKind, value: &T) -> Result<Self, BusError> {
        Ok(Self {
            kind: kind.code(),
            flags: 0,
            payload: Bytes::from(
                wire::encode_payload(value)
                    .map_err(|e| BusError::Protocol(format!("payload encoding failed: {e}")))?,
            ),
        })
    }

    /// Same as [`Frame::new`] with `END_OF_STREAM` set.
    pub fn final_frame<T: serde::Serialize>(kind: FrameKind, value: &T) -> Result<Self, BusError> {
        let mut frame = Self::new(kind, value)?;
        frame.flags |= flags::END_OF_STREAM;
        Ok(frame)
    }

    /// Decode the payload into its typed form.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, BusError> {
        wire::decode_payload(&self.payload).map_err(|e| match e {
            wire::PayloadError::UnsupportedVersion(v) => BusError::UnsupportedVersion(v),
            wire::PayloadError::Malformed(msg) => {
                BusError::Protocol(format!("malformed payload: {msg}"))
            }
        })
    }

    /// True when the `END_OF_STREAM` flag is set.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.flags & flags::END_OF_STREAM != 0
    }
}

/// One decoded record, or an oversize announcement.
#[derive(Debug)]
pub enum MuxItem {
    /// A complete frame for `stream_id`
    Frame {
        /// Stream the frame belongs to
        stream_id: u32,
        /// The frame itself
        frame: Frame,
    },
    /// A header announced a payload above the cap; the bytes are being
    /// discarded as they arrive
    Oversize {
        /// Stream the offending frame targeted
        stream_id: u32,
        /// Announced payload length
        len: u32,
    },
}

enum DecodeState {
    Header,
    Payload { stream_id: u32, len: u32, kind: u16, frame_flags: u16 },
    Discard { remaining: u64 },
}

/// Codec for the multiplexed frame layer.
pub struct MuxCodec {
    max_frame_bytes: u32,
    state: DecodeState,
}

impl MuxCodec {
    /// Codec enforcing `max_frame_bytes` (never above the protocol cap).
    #[must_use]
    pub fn new(max_frame_bytes: u32) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.min(wire::MAX_FRAME_BYTES),
            state: DecodeState::Header,
        }
    }
}

impl Decoder for MuxCodec {
    type Item = MuxItem;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MuxItem>, BusError> {
        loop {
            match &mut self.state {
                DecodeState::Header => {
                    if src.len() < HEADER_LEN {
                        src.reserve(HEADER_LEN - src.len());
                        return Ok(None);
                    }
                    let stream_id = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                    let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
                    let kind = u16::from_be_bytes([src[8], src[9]]);
                    let frame_flags = u16::from_be_bytes([src[10], src[11]]);
                    src.advance(HEADER_LEN);

                    if frame_flags & !flags::KNOWN != 0 {
                        return Err(BusError::Protocol(format!(
                            "reserved flag bits set: 0x{frame_flags:04x}"
                        )));
                    }
                    if len > self.max_frame_bytes {
                        self.state = DecodeState::Discard {
                            remaining: u64::from(len),
                        };
                        return Ok(Some(MuxItem::Oversize { stream_id, len }));
                    }
                    self.state = DecodeState::Payload {
                        stream_id,
                        len,
                        kind,
                        frame_flags,
                    };
                }
                DecodeState::Payload { stream_id, len, kind, frame_flags } => {
                    let needed = *len as usize;
                    if src.len() < needed {
                        src.reserve(needed - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(needed).freeze();
                    let item = MuxItem::Frame {
                        stream_id: *stream_id,
                        frame: Frame {
                            kind: *kind,
                            flags: *frame_flags,
                            payload,
                        },
                    };
                    self.state = DecodeState::Header;
                    return Ok(Some(item));
                }
                DecodeState::Discard { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let chunk = (src.len() as u64).min(*remaining);
                    src.advance(chunk as usize);
                    *remaining -= chunk;
                    if *remaining == 0 {
                        self.state = DecodeState::Header;
                    } else {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl Encoder<(u32, Frame)> for MuxCodec {
    type Error = BusError;

    fn encode(&mut self, item: (u32, Frame), dst: &mut BytesMut) -> Result<(), BusError> {
        let (stream_id, frame) = item;
        let len = frame.payload.len();
        if len > self.max_frame_bytes as usize {
            return Err(BusError::FrameTooLarge { len: len as u32 });
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_u32(stream_id);
        dst.put_u32(len as u32);
        dst.put_u16(frame.kind);
        dst.put_u16(frame.flags);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
