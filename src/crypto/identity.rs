use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PairingError;
use crate::messages::IssuedCredentials;

/// Domain separation prefix for certificate signatures.
const CERT_DOMAIN: &[u8] = b"PAIRING-DEVICE-CERT-v1:";

/// Generates a fresh Ed25519 device key from the OS RNG.
pub fn generate_device_key() -> SigningKey {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    SigningKey::from_bytes(&secret)
}

/// Hex-encoded SHA-256 of a public key, used in logs and for display.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    Sha256::digest(public_key)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Binds a device key to a node, a device name and a restriction policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCertificate {
    pub node_id: Vec<u8>,
    pub device_name: String,
    pub restrictions: String,
    pub device_public_key: [u8; 32],
    /// Unix seconds.
    pub issued_at: u64,
    pub signature: Vec<u8>,
}

impl DeviceCertificate {
    fn signing_message(
        node_id: &[u8],
        device_name: &str,
        restrictions: &str,
        device_public_key: &[u8; 32],
        issued_at: u64,
    ) -> Vec<u8> {
        let mut message = Vec::with_capacity(
            CERT_DOMAIN.len() + node_id.len() + device_name.len() + restrictions.len() + 60,
        );
        message.extend_from_slice(CERT_DOMAIN);
        for field in [node_id, device_name.as_bytes(), restrictions.as_bytes()] {
            message.extend_from_slice(&(field.len() as u32).to_be_bytes());
            message.extend_from_slice(field);
        }
        message.extend_from_slice(device_public_key);
        message.extend_from_slice(&issued_at.to_be_bytes());
        message
    }

    /// Checks the authority signature over every field.
    pub fn verify(&self, authority_key: &[u8; 32]) -> Result<(), PairingError> {
        let authority = VerifyingKey::from_bytes(authority_key)
            .map_err(|_| PairingError::Unauthorized("invalid authority key".into()))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| PairingError::Unauthorized("malformed certificate signature".into()))?;
        let message = Self::signing_message(
            &self.node_id,
            &self.device_name,
            &self.restrictions,
            &self.device_public_key,
            self.issued_at,
        );
        authority
            .verify(&message, &signature)
            .map_err(|_| PairingError::Unauthorized("certificate signature invalid".into()))
    }

    pub fn device_key(&self) -> Result<VerifyingKey, PairingError> {
        VerifyingKey::from_bytes(&self.device_public_key)
            .map_err(|_| PairingError::Unauthorized("invalid device key".into()))
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.device_public_key)
    }
}

/// Per-node signing authority that certifies device keys.
pub struct NodeAuthority {
    node_id: Vec<u8>,
    signing: SigningKey,
}

impl NodeAuthority {
    pub fn generate(node_id: Vec<u8>) -> Self {
        Self {
            node_id,
            signing: generate_device_key(),
        }
    }

    pub fn from_secret(node_id: Vec<u8>, secret: [u8; 32]) -> Self {
        Self {
            node_id,
            signing: SigningKey::from_bytes(&secret),
        }
    }

    pub fn node_id(&self) -> &[u8] {
        &self.node_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Signs a certificate for `device_public_key`.
    pub fn issue(
        &self,
        device_public_key: [u8; 32],
        device_name: &str,
        restrictions: &str,
    ) -> DeviceCertificate {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let message = DeviceCertificate::signing_message(
            &self.node_id,
            device_name,
            restrictions,
            &device_public_key,
            issued_at,
        );
        DeviceCertificate {
            node_id: self.node_id.clone(),
            device_name: device_name.to_string(),
            restrictions: restrictions.to_string(),
            device_public_key,
            issued_at,
            signature: self.signing.sign(&message).to_bytes().to_vec(),
        }
    }

    /// Issued credential material for a device key, as carried in an approval.
    pub fn issue_credentials(
        &self,
        device_public_key: [u8; 32],
        device_name: &str,
        restrictions: &str,
    ) -> IssuedCredentials {
        IssuedCredentials {
            certificate: self.issue(device_public_key, device_name, restrictions),
            authority_key: self.public_key(),
        }
    }

    /// Mints credentials for a device directly, without a pairing session.
    ///
    /// This is how the first device of a node obtains credentials; it is the
    /// in-process counterpart of registration.
    pub fn enroll_device(&self, device_name: &str, restrictions: &str) -> Credentials {
        let key = generate_device_key();
        let issued =
            self.issue_credentials(key.verifying_key().to_bytes(), device_name, restrictions);
        Credentials {
            signing: key,
            certificate: issued.certificate,
            authority_key: issued.authority_key,
        }
    }
}

impl fmt::Debug for NodeAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeAuthority")
            .field("node_id", &self.node_id)
            .field("public_key", &fingerprint(&self.public_key()))
            .finish()
    }
}

/// Device-bound credentials. Owned by the caller and never mutated.
#[derive(Clone)]
pub struct Credentials {
    signing: SigningKey,
    certificate: DeviceCertificate,
    authority_key: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct CredentialsBlob {
    device_key: [u8; 32],
    certificate: DeviceCertificate,
    authority_key: [u8; 32],
}

impl Credentials {
    /// Combines a locally generated device key with issued material.
    ///
    /// # Errors
    /// `Unauthorized` if the certificate does not verify or certifies another key.
    pub fn new(signing: SigningKey, issued: IssuedCredentials) -> Result<Self, PairingError> {
        issued.certificate.verify(&issued.authority_key)?;
        if issued.certificate.device_public_key != signing.verifying_key().to_bytes() {
            return Err(PairingError::Unauthorized(
                "certificate does not bind this device key".into(),
            ));
        }
        Ok(Self {
            signing,
            certificate: issued.certificate,
            authority_key: issued.authority_key,
        })
    }

    pub fn node_id(&self) -> &[u8] {
        &self.certificate.node_id
    }

    pub fn certificate(&self) -> &DeviceCertificate {
        &self.certificate
    }

    pub fn authority_key(&self) -> &[u8; 32] {
        &self.authority_key
    }

    pub fn restrictions(&self) -> &str {
        &self.certificate.restrictions
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Serializes the credentials into a single opaque blob for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PairingError> {
        serde_cbor::to_vec(&CredentialsBlob {
            device_key: self.signing.to_bytes(),
            certificate: self.certificate.clone(),
            authority_key: self.authority_key,
        })
        .map_err(PairingError::codec)
    }

    /// Restores credentials written by [`Credentials::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, PairingError> {
        let blob: CredentialsBlob = serde_cbor::from_slice(data).map_err(PairingError::codec)?;
        Self::new(
            SigningKey::from_bytes(&blob.device_key),
            IssuedCredentials {
                certificate: blob.certificate,
                authority_key: blob.authority_key,
            },
        )
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("node_id", &self.certificate.node_id)
            .field("device_name", &self.certificate.device_name)
            .field("device", &self.certificate.fingerprint())
            .finish()
    }
}
