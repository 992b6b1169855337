//! Server-side session registry.
//!
//! [`PairingService`] is the authority both clients talk to: the new device opens a
//! session and waits on its frame channel, the attestation device reads and decides
//! it. Every decision is a compare-and-set on the session state under a short lock
//! that is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use ed25519_dalek::VerifyingKey;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::crypto::identity::{fingerprint, DeviceCertificate, NodeAuthority};
use crate::crypto::{RequestOp, SignedRequest};
use crate::error::PairingError;
use crate::frame::{self, Frame};
use crate::messages::{
    exchange_payload_for, ApprovePairingRequest, GetPairingDataRequest, GetPairingDataResponse,
    PairDeviceRequest, PairDeviceResponse, PairingOpened, PairingOutcome, ProtocolVersion,
    RejectPairingRequest,
};
use crate::transport::{FrameReceiver, FrameSender};

pub mod state;
use state::{PairingState, Resolution};

struct SessionEntry {
    state: PairingState,
    request: PairDeviceRequest,
    exchange_payload: String,
    /// Taken when the session is resolved or expired.
    frames: Option<FrameSender>,
    opened_at: Instant,
}

struct Inner {
    config: ServiceConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    authorities: Mutex<HashMap<Vec<u8>, Arc<NodeAuthority>>>,
}

/// Pairing session registry and the node authorities that sign new devices.
#[derive(Clone)]
pub struct PairingService {
    inner: Arc<Inner>,
}

impl PairingService {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
                authorities: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Makes `authority` the signer for its node. Replaces any previous authority.
    pub fn register_authority(&self, authority: NodeAuthority) {
        info!(
            node_id = ?authority.node_id(),
            key = %fingerprint(&authority.public_key()),
            "node authority registered"
        );
        self.inner
            .authorities
            .lock()
            .insert(authority.node_id().to_vec(), Arc::new(authority));
    }

    /// Opens a session for an anonymous new device.
    ///
    /// Must be called from within a tokio runtime: a supervisor task is spawned that
    /// expires the session after the configured TTL or once the returned receiver
    /// is dropped.
    pub fn open_session(
        &self,
        request: PairDeviceRequest,
    ) -> Result<(PairingOpened, FrameReceiver), PairingError> {
        let version = request.protocol_version;
        if !self.inner.config.supported_versions.contains(&version) {
            let offered = self
                .inner
                .config
                .supported_versions
                .iter()
                .copied()
                .max_by_key(ProtocolVersion::as_u8)
                .unwrap_or_default();
            warn!(requested = ?version, ?offered, "unsupported protocol version");
            return Err(PairingError::ProtocolMismatch {
                requested: version,
                offered,
            });
        }
        VerifyingKey::from_bytes(&request.device_public_key)
            .map_err(|_| PairingError::Codec("invalid device public key".into()))?;

        let session_id = Uuid::new_v4().to_string();
        let exchange_payload = exchange_payload_for(&session_id);
        let (tx, rx) = mpsc::channel(self.inner.config.frame_buffer.max(2));

        if version == ProtocolVersion::V1 {
            let info = frame::encode(&Frame::Info(exchange_payload.clone()))?;
            tx.try_send(Ok(info)).map_err(PairingError::transport)?;
        }
        let state = PairingState::Created.transition(PairingState::AwaitingApproval)?;

        info!(
            session_id = %session_id,
            name = %request.name,
            device = %fingerprint(&request.device_public_key),
            ?version,
            "pairing session opened"
        );
        self.inner.sessions.lock().insert(
            session_id.clone(),
            SessionEntry {
                state,
                request,
                exchange_payload: exchange_payload.clone(),
                frames: Some(tx.clone()),
                opened_at: Instant::now(),
            },
        );
        tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            session_id.clone(),
            tx,
        ));

        let opened = PairingOpened {
            session_id,
            protocol_version: version,
            exchange_payload: match version {
                ProtocolVersion::V1 => None,
                ProtocolVersion::V2 => Some(exchange_payload),
            },
        };
        Ok((opened, rx))
    }

    /// Returns the pending session's pairing data to an authenticated device.
    pub fn pairing_data(
        &self,
        signed: &SignedRequest,
    ) -> Result<GetPairingDataResponse, PairingError> {
        let body: GetPairingDataRequest = signed.open(RequestOp::GetPairingData)?;
        self.authorize(&signed.certificate)?;

        let sessions = self.inner.sessions.lock();
        match sessions.get(&body.session_id) {
            Some(entry) if entry.state.is_open() => Ok(GetPairingDataResponse {
                session_id: body.session_id.clone(),
                exchange_payload: entry.exchange_payload.clone(),
                name: entry.request.name.clone(),
                description: entry.request.description.clone(),
                restrictions: entry.request.restrictions.clone(),
            }),
            _ => Err(PairingError::SessionNotFound(body.session_id)),
        }
    }

    /// Approves a pending session and delivers issued credentials to the new device.
    pub async fn approve(&self, signed: &SignedRequest) -> Result<(), PairingError> {
        let body: ApprovePairingRequest = signed.open(RequestOp::ApprovePairing)?;
        let authority = self.authorize(&signed.certificate)?;
        if body.node_id != signed.certificate.node_id {
            warn!(
                session_id = %body.session_id,
                requested = ?body.node_id,
                holder = ?signed.certificate.node_id,
                "approval for foreign node refused"
            );
            return Err(PairingError::Unauthorized(
                "credentials have no rights over the requested node".into(),
            ));
        }
        // Policies are opaque, but a restricted holder cannot hand out an unrestricted one.
        if !signed.certificate.restrictions.is_empty() && body.restrictions.is_empty() {
            warn!(
                session_id = %body.session_id,
                holder_restrictions = %signed.certificate.restrictions,
                "unrestricted grant from restricted device refused"
            );
            return Err(PairingError::Unauthorized(
                "restricted credentials cannot grant unrestricted access".into(),
            ));
        }

        let (device_key, frames) =
            self.resolve(&body.session_id, Resolution::Approved)?;
        let issued = authority.issue_credentials(device_key, &body.device_name, &body.restrictions);
        info!(
            session_id = %body.session_id,
            node_id = ?body.node_id,
            device_name = %body.device_name,
            "pairing approved"
        );
        self.deliver(
            frames,
            PairDeviceResponse {
                session_id: body.session_id,
                outcome: PairingOutcome::Approved(issued),
            },
        )
        .await
    }

    /// Rejects a pending session; the new device receives a rejected outcome.
    pub async fn reject(&self, signed: &SignedRequest) -> Result<(), PairingError> {
        let body: RejectPairingRequest = signed.open(RequestOp::RejectPairing)?;
        self.authorize(&signed.certificate)?;

        let (_, frames) = self.resolve(&body.session_id, Resolution::Rejected)?;
        info!(
            session_id = %body.session_id,
            node_id = ?signed.certificate.node_id,
            reason = %body.reason,
            "pairing rejected"
        );
        self.deliver(
            frames,
            PairDeviceResponse {
                session_id: body.session_id,
                outcome: PairingOutcome::Rejected {
                    reason: body.reason,
                },
            },
        )
        .await
    }

    /// Current state of a session, `None` once it has been removed.
    pub fn session_state(&self, session_id: &str) -> Option<PairingState> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.state)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    fn authorize(&self, certificate: &DeviceCertificate) -> Result<Arc<NodeAuthority>, PairingError> {
        let authority = self
            .inner
            .authorities
            .lock()
            .get(&certificate.node_id)
            .cloned()
            .ok_or_else(|| {
                warn!(node_id = ?certificate.node_id, "request from unknown node");
                PairingError::Unauthorized("credentials are not valid for any known node".into())
            })?;
        certificate.verify(&authority.public_key()).map_err(|err| {
            warn!(node_id = ?certificate.node_id, "certificate rejected");
            err
        })?;
        Ok(authority)
    }

    /// Compare-and-set into `Resolved`. Returns the device key and the frame sender.
    fn resolve(
        &self,
        session_id: &str,
        resolution: Resolution,
    ) -> Result<([u8; 32], Option<FrameSender>), PairingError> {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| PairingError::SessionNotFound(session_id.to_string()))?;
        match entry.state {
            PairingState::Resolved(_) => {
                warn!(session_id, "session already resolved");
                return Err(PairingError::SessionAlreadyResolved(session_id.to_string()));
            }
            PairingState::Expired => {
                return Err(PairingError::SessionNotFound(session_id.to_string()))
            }
            _ => {}
        }
        // A new device that already left counts as expiry, even before the supervisor runs.
        if entry.frames.as_ref().map_or(true, |tx| tx.is_closed()) {
            entry.state = entry.state.transition(PairingState::Expired)?;
            entry.frames = None;
            info!(session_id, "new device left before the decision");
            return Err(PairingError::SessionNotFound(session_id.to_string()));
        }
        entry.state = entry.state.transition(PairingState::Resolved(resolution))?;
        Ok((entry.request.device_public_key, entry.frames.take()))
    }

    async fn deliver(
        &self,
        frames: Option<FrameSender>,
        response: PairDeviceResponse,
    ) -> Result<(), PairingError> {
        let session_id = response.session_id.clone();
        let bytes = frame::encode(&Frame::PairDeviceResponse(response))?;
        let tx = frames.ok_or_else(|| {
            warn!(session_id = %session_id, "no frame channel for session");
            PairingError::SessionNotFound(session_id.clone())
        })?;
        debug!(session_id = %session_id, len = bytes.len(), "sending terminal frame");
        tx.send(Ok(bytes)).await.map_err(|_| {
            warn!(session_id = %session_id, "new device left before the terminal frame");
            PairingError::SessionNotFound(session_id.clone())
        })
    }
}

impl std::fmt::Debug for PairingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingService")
            .field("sessions", &self.session_count())
            .field("authorities", &self.inner.authorities.lock().len())
            .finish()
    }
}

impl Inner {
    /// Moves an open session to `Expired`. Returns the sender if the state changed.
    fn expire(&self, session_id: &str) -> Option<FrameSender> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(session_id)?;
        let next = entry.state.transition(PairingState::Expired).ok()?;
        entry.state = next;
        info!(
            session_id,
            age_ms = entry.opened_at.elapsed().as_millis() as u64,
            "pairing session expired"
        );
        entry.frames.take()
    }

    fn remove(&self, session_id: &str) {
        if self.sessions.lock().remove(session_id).is_some() {
            debug!(session_id, "pairing session removed");
        }
    }
}

/// Expires the session on TTL or when the new device drops its receiver, then
/// removes the entry once the TTL has elapsed.
async fn supervise(inner: Weak<Inner>, session_id: String, watch: FrameSender) {
    let ttl = match inner.upgrade() {
        Some(inner) => inner.config.session_ttl(),
        None => return,
    };
    let deadline = time::Instant::now() + ttl;

    let abandoned = tokio::select! {
        _ = time::sleep_until(deadline) => false,
        _ = watch.closed() => true,
    };
    drop(watch);

    if let Some(inner) = inner.upgrade() {
        if let Some(tx) = inner.expire(&session_id) {
            if !abandoned {
                let _ = tx.send(Err(PairingError::Timeout)).await;
            }
        }
    }

    time::sleep_until(deadline).await;
    if let Some(inner) = inner.upgrade() {
        inner.remove(&session_id);
    }
}
