//! Frame codec for the pairing stream.
//!
//! A frame is a one-byte tag followed by the tag's payload; the payload runs to the
//! end of the message and has no length prefix. The tag table is fixed per
//! [`ProtocolVersion`] and unknown tags are rejected, never skipped.

use thiserror::Error;

use crate::messages::{PairDeviceResponse, ProtocolVersion};

/// Terminal structured pairing response (CBOR payload).
pub const TAG_PAIR_DEVICE_RESPONSE: u8 = 1;
/// Informational UTF-8 text. `V1` only.
pub const TAG_INFO: u8 = 2;

/// Errors raised while decoding or encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("payload: {0}")]
    Payload(String),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    PairDeviceResponse(PairDeviceResponse),
    Info(String),
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::PairDeviceResponse(_) => TAG_PAIR_DEVICE_RESPONSE,
            Frame::Info(_) => TAG_INFO,
        }
    }

    /// The terminal frame ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::PairDeviceResponse(_))
    }
}

/// Returns the tags accepted under `version`.
pub fn tag_table(version: ProtocolVersion) -> &'static [u8] {
    match version {
        ProtocolVersion::V1 => &[TAG_PAIR_DEVICE_RESPONSE, TAG_INFO],
        ProtocolVersion::V2 => &[TAG_PAIR_DEVICE_RESPONSE],
    }
}

/// Decodes a single frame using the tag table of `version`.
pub fn decode(bytes: &[u8], version: ProtocolVersion) -> Result<Frame, FrameError> {
    let (&tag, payload) = bytes.split_first().ok_or(FrameError::Empty)?;
    if !tag_table(version).contains(&tag) {
        return Err(FrameError::UnknownType(tag));
    }
    match tag {
        TAG_PAIR_DEVICE_RESPONSE => serde_cbor::from_slice(payload)
            .map(Frame::PairDeviceResponse)
            .map_err(|e| FrameError::Payload(format!("pair device response: {e}"))),
        TAG_INFO => String::from_utf8(payload.to_vec())
            .map(Frame::Info)
            .map_err(|e| FrameError::Payload(format!("info text: {e}"))),
        other => Err(FrameError::UnknownType(other)),
    }
}

/// Encodes a frame. Checking it against a tag table is the caller's concern.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let mut out = vec![frame.tag()];
    match frame {
        Frame::PairDeviceResponse(response) => {
            let payload = serde_cbor::to_vec(response)
                .map_err(|e| FrameError::Payload(format!("pair device response: {e}")))?;
            out.extend_from_slice(&payload);
        }
        Frame::Info(text) => out.extend_from_slice(text.as_bytes()),
    }
    Ok(out)
}
