use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use super::{FrameReceiver, PairingTransport};
use crate::crypto::SignedRequest;
use crate::error::PairingError;
use crate::messages::{GetPairingDataResponse, PairDeviceRequest, PairingOpened};

/// Wrapper that bounds every call with a timeout.
///
/// For `pair_device` only the opening exchange is bounded; waiting on the returned
/// frames is the caller's concern.
#[derive(Debug, Clone)]
pub struct TimeoutTransport<T> {
    inner: T,
    request_timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, request_timeout: Duration) -> Self {
        Self {
            inner,
            request_timeout,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn bounded<F, R>(&self, call: F) -> Result<R, PairingError>
    where
        F: std::future::Future<Output = Result<R, PairingError>> + Send,
    {
        match time::timeout(self.request_timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(PairingError::Timeout),
        }
    }
}

#[async_trait]
impl<T> PairingTransport for TimeoutTransport<T>
where
    T: PairingTransport,
{
    async fn pair_device(
        &self,
        request: PairDeviceRequest,
    ) -> Result<(PairingOpened, FrameReceiver), PairingError> {
        self.bounded(self.inner.pair_device(request)).await
    }

    async fn get_pairing_data(
        &self,
        request: SignedRequest,
    ) -> Result<GetPairingDataResponse, PairingError> {
        self.bounded(self.inner.get_pairing_data(request)).await
    }

    async fn approve_pairing(&self, request: SignedRequest) -> Result<(), PairingError> {
        self.bounded(self.inner.approve_pairing(request)).await
    }

    async fn reject_pairing(&self, request: SignedRequest) -> Result<(), PairingError> {
        self.bounded(self.inner.reject_pairing(request)).await
    }
}
