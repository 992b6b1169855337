//! Request and response types exchanged between the pairing clients and the service.
//!
//! Structured payloads are encoded as CBOR. Field names are part of the wire format.

use serde::{Deserialize, Serialize};

use crate::crypto::identity::DeviceCertificate;
use crate::error::PairingError;

/// URI scheme used for the out-of-band exchange payload.
pub const EXCHANGE_SCHEME: &str = "pairing";

/// Selects the frame tag table and how the exchange payload reaches the new device.
///
/// * `V1`: tags `{1: PairDeviceResponse, 2: text}`; the first text frame is the
///   exchange payload.
/// * `V2`: tag `{1: PairDeviceResponse}` only; the exchange payload is returned in
///   [`PairingOpened`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn as_u8(&self) -> u8 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolVersion::V1),
            2 => Some(ProtocolVersion::V2),
            _ => None,
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V2
    }
}

/// Anonymous request opening a pairing session.
///
/// `device_public_key` plays the role of a signing request: the certificate issued on
/// approval binds exactly this key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairDeviceRequest {
    pub name: String,
    pub description: String,
    pub restrictions: String,
    pub device_public_key: [u8; 32],
    pub protocol_version: ProtocolVersion,
}

/// Sent by the server before any frame of the pairing stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingOpened {
    pub session_id: String,
    pub protocol_version: ProtocolVersion,
    /// Present for `V2` only; `V1` delivers it as the first text frame.
    pub exchange_payload: Option<String>,
}

/// Terminal payload of a pairing stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairDeviceResponse {
    pub session_id: String,
    pub outcome: PairingOutcome,
}

impl PairDeviceResponse {
    pub fn is_approved(&self) -> bool {
        matches!(self.outcome, PairingOutcome::Approved(_))
    }
}

/// Decision recorded for a session. Rejection is carried here rather than as a
/// transport failure, so callers must inspect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingOutcome {
    Approved(IssuedCredentials),
    Rejected { reason: String },
}

/// Credential material issued to the new device on approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredentials {
    pub certificate: DeviceCertificate,
    /// Verifying key of the node authority that signed `certificate`.
    pub authority_key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPairingDataRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPairingDataResponse {
    pub session_id: String,
    pub exchange_payload: String,
    pub name: String,
    pub description: String,
    pub restrictions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovePairingRequest {
    pub session_id: String,
    pub node_id: Vec<u8>,
    pub device_name: String,
    pub restrictions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectPairingRequest {
    pub session_id: String,
    pub reason: String,
}

/// Builds the exchange payload shown to the attestation device, e.g. as a QR code.
pub fn exchange_payload_for(session_id: &str) -> String {
    format!("{EXCHANGE_SCHEME}:{session_id}")
}

/// Extracts the session id from a scanned exchange payload.
pub fn session_id_from_exchange(payload: &str) -> Result<String, PairingError> {
    let (scheme, session_id) = payload
        .trim()
        .split_once(':')
        .ok_or_else(|| PairingError::MalformedExchangePayload(payload.to_string()))?;
    if scheme != EXCHANGE_SCHEME || session_id.is_empty() {
        return Err(PairingError::MalformedExchangePayload(payload.to_string()));
    }
    Ok(session_id.to_string())
}
