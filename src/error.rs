use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::FrameError;
use crate::messages::ProtocolVersion;

/// Errors surfaced by the pairing clients, transports and service.
///
/// Every variant is fatal for the current pairing attempt. Only
/// [`PairingError::Transport`] and [`PairingError::Timeout`] may be retried,
/// and a retry always opens a fresh session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PairingError {
    /// Connection or channel failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The frame was empty or its payload could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// The tag is not part of the active tag table.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session already resolved: {0}")]
    SessionAlreadyResolved(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The waiting party gave up or the server expired the session.
    #[error("pairing timed out")]
    Timeout,
    #[error("protocol mismatch: requested {requested:?}, server answered {offered:?}")]
    ProtocolMismatch {
        requested: ProtocolVersion,
        offered: ProtocolVersion,
    },
    /// The attestation device rejected the pairing request.
    #[error("pairing rejected: {0}")]
    Rejected(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("malformed exchange payload: {0}")]
    MalformedExchangePayload(String),
    #[error("invalid session state: {0}")]
    InvalidState(String),
}

impl PairingError {
    /// Returns `true` when reopening a connection and starting a new session may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PairingError::Transport(_) | PairingError::Timeout)
    }

    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        PairingError::Codec(err.to_string())
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        PairingError::Transport(err.to_string())
    }
}

impl From<FrameError> for PairingError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Empty => PairingError::MalformedFrame("empty frame".into()),
            FrameError::UnknownType(tag) => PairingError::UnknownFrameType(tag),
            FrameError::Payload(reason) => PairingError::MalformedFrame(reason),
        }
    }
}

/// Error codes carried across the wire so the remote side can rebuild the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Transport,
    MalformedFrame,
    UnknownFrameType,
    SessionNotFound,
    SessionAlreadyResolved,
    Unauthorized,
    Timeout,
    ProtocolMismatch,
    Rejected,
    Codec,
    InvalidRequest,
    InvalidState,
}

/// Serializable form of [`PairingError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&PairingError> for WireError {
    fn from(err: &PairingError) -> Self {
        let (code, message) = match err {
            PairingError::Transport(m) => (ErrorCode::Transport, m.clone()),
            PairingError::MalformedFrame(m) => (ErrorCode::MalformedFrame, m.clone()),
            PairingError::UnknownFrameType(tag) => (ErrorCode::UnknownFrameType, tag.to_string()),
            PairingError::SessionNotFound(id) => (ErrorCode::SessionNotFound, id.clone()),
            PairingError::SessionAlreadyResolved(id) => {
                (ErrorCode::SessionAlreadyResolved, id.clone())
            }
            PairingError::Unauthorized(m) => (ErrorCode::Unauthorized, m.clone()),
            PairingError::Timeout => (ErrorCode::Timeout, String::new()),
            PairingError::ProtocolMismatch { requested, offered } => (
                ErrorCode::ProtocolMismatch,
                format!("{}:{}", requested.as_u8(), offered.as_u8()),
            ),
            PairingError::Rejected(m) => (ErrorCode::Rejected, m.clone()),
            PairingError::Codec(m) => (ErrorCode::Codec, m.clone()),
            PairingError::Config(e) => (ErrorCode::InvalidRequest, e.to_string()),
            PairingError::MalformedExchangePayload(m) => (ErrorCode::InvalidRequest, m.clone()),
            PairingError::InvalidState(m) => (ErrorCode::InvalidState, m.clone()),
        };
        WireError { code, message }
    }
}

impl From<WireError> for PairingError {
    fn from(err: WireError) -> Self {
        match err.code {
            ErrorCode::Transport => PairingError::Transport(err.message),
            ErrorCode::MalformedFrame => PairingError::MalformedFrame(err.message),
            ErrorCode::UnknownFrameType => err
                .message
                .parse()
                .map(PairingError::UnknownFrameType)
                .unwrap_or(PairingError::MalformedFrame(err.message)),
            ErrorCode::SessionNotFound => PairingError::SessionNotFound(err.message),
            ErrorCode::SessionAlreadyResolved => PairingError::SessionAlreadyResolved(err.message),
            ErrorCode::Unauthorized => PairingError::Unauthorized(err.message),
            ErrorCode::Timeout => PairingError::Timeout,
            ErrorCode::ProtocolMismatch => parse_mismatch(&err.message)
                .unwrap_or(PairingError::Codec(format!("protocol mismatch: {}", err.message))),
            ErrorCode::Rejected => PairingError::Rejected(err.message),
            ErrorCode::Codec | ErrorCode::InvalidRequest => PairingError::Codec(err.message),
            ErrorCode::InvalidState => PairingError::InvalidState(err.message),
        }
    }
}

fn parse_mismatch(message: &str) -> Option<PairingError> {
    let (requested, offered) = message.split_once(':')?;
    Some(PairingError::ProtocolMismatch {
        requested: ProtocolVersion::from_u8(requested.parse().ok()?)?,
        offered: ProtocolVersion::from_u8(offered.parse().ok()?)?,
    })
}
