//! RPC seam between the pairing clients and the service.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::crypto::SignedRequest;
use crate::error::PairingError;
use crate::messages::{GetPairingDataResponse, PairDeviceRequest, PairingOpened};

pub mod local;
pub mod tcp;
pub mod timeout;

pub use local::LocalTransport;
pub use tcp::{serve, TcpTransport};
pub use timeout::TimeoutTransport;

/// Raw frames of one pairing stream, in production order. An `Err` ends the stream.
pub type FrameReceiver = mpsc::Receiver<Result<Vec<u8>, PairingError>>;
pub type FrameSender = mpsc::Sender<Result<Vec<u8>, PairingError>>;

/// Calls offered by a pairing server.
#[async_trait]
pub trait PairingTransport: Send + Sync {
    /// Anonymous. Opens a session and returns its server-streamed frames.
    async fn pair_device(
        &self,
        request: PairDeviceRequest,
    ) -> Result<(PairingOpened, FrameReceiver), PairingError>;

    async fn get_pairing_data(
        &self,
        request: SignedRequest,
    ) -> Result<GetPairingDataResponse, PairingError>;

    async fn approve_pairing(&self, request: SignedRequest) -> Result<(), PairingError>;

    async fn reject_pairing(&self, request: SignedRequest) -> Result<(), PairingError>;
}

#[async_trait]
impl<T> PairingTransport for Arc<T>
where
    T: PairingTransport + ?Sized,
{
    async fn pair_device(
        &self,
        request: PairDeviceRequest,
    ) -> Result<(PairingOpened, FrameReceiver), PairingError> {
        (**self).pair_device(request).await
    }

    async fn get_pairing_data(
        &self,
        request: SignedRequest,
    ) -> Result<GetPairingDataResponse, PairingError> {
        (**self).get_pairing_data(request).await
    }

    async fn approve_pairing(&self, request: SignedRequest) -> Result<(), PairingError> {
        (**self).approve_pairing(request).await
    }

    async fn reject_pairing(&self, request: SignedRequest) -> Result<(), PairingError> {
        (**self).reject_pairing(request).await
    }
}
