//! Device identity and request signing.
//!
//! Authenticated calls are wrapped in a [`SignedRequest`]: the body is CBOR, and the
//! signature covers the operation and the body so a signature for one call cannot be
//! replayed as another.

pub mod identity;

use ed25519_dalek::{Signature, Verifier};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PairingError;
use identity::{Credentials, DeviceCertificate};

const REQUEST_DOMAIN: &[u8] = b"PAIRING-REQUEST-v1:";

/// Authenticated operations.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOp {
    GetPairingData = 1,
    ApprovePairing = 2,
    RejectPairing = 3,
}

/// Request body signed by a paired device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    pub op: RequestOp,
    pub certificate: DeviceCertificate,
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedRequest {
    fn signing_message(op: RequestOp, body: &[u8]) -> Vec<u8> {
        let mut message = Vec::with_capacity(REQUEST_DOMAIN.len() + 1 + body.len());
        message.extend_from_slice(REQUEST_DOMAIN);
        message.push(op as u8);
        message.extend_from_slice(body);
        message
    }

    /// Encodes `body` and signs it with the device key held by `credentials`.
    pub fn seal<T: Serialize>(
        credentials: &Credentials,
        op: RequestOp,
        body: &T,
    ) -> Result<Self, PairingError> {
        let body = serde_cbor::to_vec(body).map_err(PairingError::codec)?;
        let signature = credentials.sign(&Self::signing_message(op, &body));
        Ok(Self {
            op,
            certificate: credentials.certificate().clone(),
            body,
            signature: signature.to_bytes().to_vec(),
        })
    }

    /// Verifies the signature against the certified device key and decodes the body.
    ///
    /// The certificate itself is not checked here; the caller must verify it against
    /// a trusted authority.
    pub fn open<T: DeserializeOwned>(&self, expected: RequestOp) -> Result<T, PairingError> {
        if self.op != expected {
            return Err(PairingError::Unauthorized(format!(
                "request signed for {:?}, used for {:?}",
                self.op, expected
            )));
        }
        let key = self.certificate.device_key()?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| PairingError::Unauthorized("malformed request signature".into()))?;
        key.verify(&Self::signing_message(self.op, &self.body), &signature)
            .map_err(|_| PairingError::Unauthorized("request signature invalid".into()))?;
        serde_cbor::from_slice(&self.body).map_err(PairingError::codec)
    }
}
