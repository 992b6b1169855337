use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::crypto::identity::Credentials;
use crate::crypto::{RequestOp, SignedRequest};
use crate::error::PairingError;
use crate::messages::{
    ApprovePairingRequest, GetPairingDataRequest, GetPairingDataResponse, RejectPairingRequest,
};
use crate::transport::{PairingTransport, TcpTransport, TimeoutTransport};

pub use crate::messages::session_id_from_exchange;

/// Client for an already paired device that vouches for new ones.
///
/// # Guarantees
/// * Every request is signed with the device key and carries its certificate.
/// * The credentials are never mutated.
#[derive(Debug)]
pub struct AttestationDeviceClient<T> {
    credentials: Credentials,
    transport: T,
}

impl AttestationDeviceClient<TimeoutTransport<TcpTransport>> {
    /// Resolves the server address from `config` and connects over TCP, bounding
    /// every call with the configured request timeout.
    pub fn connect(config: &ClientConfig, credentials: Credentials) -> Result<Self, PairingError> {
        let transport = TimeoutTransport::new(
            TcpTransport::from_config(config)?,
            config.request_timeout(),
        );
        Ok(Self::new(credentials, transport))
    }
}

impl<T> AttestationDeviceClient<T>
where
    T: PairingTransport,
{
    pub fn new(credentials: Credentials, transport: T) -> Self {
        Self {
            credentials,
            transport,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Looks up the pairing data of a pending session.
    ///
    /// # Errors
    /// `SessionNotFound` if the session is unknown, resolved or expired;
    /// `Unauthorized` if the credentials are not valid for any known node.
    pub async fn get_pairing_data(
        &self,
        session_id: &str,
    ) -> Result<GetPairingDataResponse, PairingError> {
        let request = SignedRequest::seal(
            &self.credentials,
            RequestOp::GetPairingData,
            &GetPairingDataRequest {
                session_id: session_id.to_string(),
            },
        )?;
        debug!(session_id, "fetching pairing data");
        self.transport.get_pairing_data(request).await
    }

    /// Approves a pending session. The new device receives a certificate bound to
    /// `node_id`, `device_name` and `restrictions`.
    ///
    /// # Errors
    /// `SessionAlreadyResolved` if a decision was already recorded, `SessionNotFound`
    /// for unknown or expired sessions, `Unauthorized` if these credentials have no
    /// rights over `node_id`.
    pub async fn approve_pairing(
        &self,
        session_id: &str,
        node_id: &[u8],
        device_name: &str,
        restrictions: &str,
    ) -> Result<(), PairingError> {
        let request = SignedRequest::seal(
            &self.credentials,
            RequestOp::ApprovePairing,
            &ApprovePairingRequest {
                session_id: session_id.to_string(),
                node_id: node_id.to_vec(),
                device_name: device_name.to_string(),
                restrictions: restrictions.to_string(),
            },
        )?;
        self.transport.approve_pairing(request).await?;
        info!(session_id, device_name, "pairing approved");
        Ok(())
    }

    /// Rejects a pending session; the new device sees a rejected outcome.
    pub async fn reject_pairing(&self, session_id: &str, reason: &str) -> Result<(), PairingError> {
        let request = SignedRequest::seal(
            &self.credentials,
            RequestOp::RejectPairing,
            &RejectPairingRequest {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            },
        )?;
        self.transport.reject_pairing(request).await?;
        info!(session_id, reason, "pairing rejected");
        Ok(())
    }
}
