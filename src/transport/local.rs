use async_trait::async_trait;

use super::{FrameReceiver, PairingTransport};
use crate::crypto::SignedRequest;
use crate::error::PairingError;
use crate::messages::{GetPairingDataResponse, PairDeviceRequest, PairingOpened};
use crate::session::PairingService;

/// In-process transport calling a [`PairingService`] directly.
///
/// Useful for tests and for embedding the service next to its clients.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    service: PairingService,
}

impl LocalTransport {
    pub fn new(service: PairingService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &PairingService {
        &self.service
    }
}

#[async_trait]
impl PairingTransport for LocalTransport {
    async fn pair_device(
        &self,
        request: PairDeviceRequest,
    ) -> Result<(PairingOpened, FrameReceiver), PairingError> {
        self.service.open_session(request)
    }

    async fn get_pairing_data(
        &self,
        request: SignedRequest,
    ) -> Result<GetPairingDataResponse, PairingError> {
        self.service.pairing_data(&request)
    }

    async fn approve_pairing(&self, request: SignedRequest) -> Result<(), PairingError> {
        self.service.approve(&request).await
    }

    async fn reject_pairing(&self, request: SignedRequest) -> Result<(), PairingError> {
        self.service.reject(&request).await
    }
}
