use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use ed25519_dalek::SigningKey;
use futures::future::poll_fn;
use futures::Stream;
use tokio::time::{self, Sleep};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::crypto::identity::{fingerprint, generate_device_key, Credentials};
use crate::error::PairingError;
use crate::frame::{self, Frame};
use crate::messages::{PairDeviceRequest, PairDeviceResponse, PairingOutcome, ProtocolVersion};
use crate::transport::{FrameReceiver, PairingTransport, TcpTransport, TimeoutTransport};

/// Typed item of a [`PairingStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// Informational text. Only produced under [`ProtocolVersion::V1`], where the
    /// first one is the exchange payload.
    Info(String),
    /// Terminal response. Nothing follows it.
    Response(PairDeviceResponse),
}

/// Anonymous client used by a device that has no credentials yet.
///
/// # Guarantees
/// * Calls run over `TimeoutTransport` bounded by the request timeout.
/// * Every `pair_device` call opens a new session with a new device key.
#[derive(Debug)]
pub struct NewDeviceClient<T> {
    config: ClientConfig,
    transport: TimeoutTransport<T>,
}

impl NewDeviceClient<TcpTransport> {
    /// Resolves the server address from `config` and connects over TCP.
    ///
    /// # Errors
    /// `Config` if no valid address can be resolved.
    pub fn connect(config: ClientConfig) -> Result<Self, PairingError> {
        let transport = TcpTransport::from_config(&config)?;
        Ok(Self::open(config, transport))
    }
}

impl<T> NewDeviceClient<T>
where
    T: PairingTransport,
{
    /// Wraps an existing transport. The transport is held for the client's lifetime.
    pub fn open(config: ClientConfig, transport: T) -> Self {
        debug!(
            identity = %config.tls.fingerprint(),
            version = ?config.protocol_version,
            "new device client opened"
        );
        let transport = TimeoutTransport::new(transport, config.request_timeout());
        Self { config, transport }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a pairing session and returns the stream of its events.
    ///
    /// # Behavior
    /// * Generates a fresh device key; the issued certificate will bind it.
    /// * Under `V2` the exchange payload is available immediately; under `V1` it
    ///   becomes available after the first `Info` event.
    /// * The stream yields a `Timeout` error if no terminal frame arrives within
    ///   the pairing timeout.
    ///
    /// # Errors
    /// `ProtocolMismatch` if the server answers with another protocol version,
    /// `Transport` or `Timeout` if the session cannot be opened.
    pub async fn pair_device(
        &self,
        name: &str,
        description: &str,
        restrictions: &str,
    ) -> Result<PairingStream, PairingError> {
        let device_key = generate_device_key();
        let requested = self.config.protocol_version;
        let request = PairDeviceRequest {
            name: name.to_string(),
            description: description.to_string(),
            restrictions: restrictions.to_string(),
            device_public_key: device_key.verifying_key().to_bytes(),
            protocol_version: requested,
        };

        let (opened, frames) = self.transport.pair_device(request).await?;
        if opened.protocol_version != requested {
            warn!(
                session_id = %opened.session_id,
                ?requested,
                offered = ?opened.protocol_version,
                "server answered with another protocol version"
            );
            return Err(PairingError::ProtocolMismatch {
                requested,
                offered: opened.protocol_version,
            });
        }
        info!(
            session_id = %opened.session_id,
            device = %fingerprint(&device_key.verifying_key().to_bytes()),
            "pairing session opened"
        );

        Ok(PairingStream {
            session_id: opened.session_id,
            version: requested,
            exchange_payload: opened.exchange_payload,
            device_key,
            frames: Some(frames),
            deadline: Box::pin(time::sleep(self.config.pairing_timeout())),
        })
    }
}

/// Lazy, cancellable stream of one pairing session.
///
/// Yields zero or more [`PairingEvent::Info`] then exactly one
/// [`PairingEvent::Response`], then ends. Any error also ends the stream. Dropping
/// the stream or calling [`PairingStream::close`] releases the connection, and the
/// server expires the session.
pub struct PairingStream {
    session_id: String,
    version: ProtocolVersion,
    exchange_payload: Option<String>,
    device_key: SigningKey,
    frames: Option<FrameReceiver>,
    deadline: Pin<Box<Sleep>>,
}

impl std::fmt::Debug for PairingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingStream")
            .field("session_id", &self.session_id)
            .field("version", &self.version)
            .field("exchange_payload", &self.exchange_payload)
            .field("closed", &self.frames.is_none())
            .finish()
    }
}

impl PairingStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    /// The payload to hand to the attestation device, once known.
    pub fn exchange_payload(&self) -> Option<&str> {
        self.exchange_payload.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_none()
    }

    /// Cancels the attempt and releases the connection.
    pub fn close(&mut self) {
        if self.frames.take().is_some() {
            debug!(session_id = %self.session_id, "pairing stream closed");
        }
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<PairingEvent, PairingError>> {
        poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Drives the stream to its terminal response, skipping informational events.
    pub async fn response(&mut self) -> Result<PairDeviceResponse, PairingError> {
        while let Some(event) = self.next().await {
            if let PairingEvent::Response(response) = event? {
                return Ok(response);
            }
        }
        Err(PairingError::Transport("pairing stream already ended".into()))
    }

    /// Builds credentials from an approved response and this session's device key.
    ///
    /// # Errors
    /// `Rejected` for a rejected outcome, `Unauthorized` if the issued certificate
    /// does not verify or does not bind this device's key.
    pub fn credentials(&self, response: &PairDeviceResponse) -> Result<Credentials, PairingError> {
        if response.session_id != self.session_id {
            return Err(PairingError::InvalidState(format!(
                "response for session {} used with session {}",
                response.session_id, self.session_id
            )));
        }
        match &response.outcome {
            PairingOutcome::Approved(issued) => {
                Credentials::new(self.device_key.clone(), issued.clone())
            }
            PairingOutcome::Rejected { reason } => Err(PairingError::Rejected(reason.clone())),
        }
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<PairingEvent, PairingError>>> {
        let Some(frames) = self.frames.as_mut() else {
            return Poll::Ready(None);
        };
        let item = match frames.poll_recv(cx) {
            Poll::Ready(item) => item,
            Poll::Pending => {
                return match self.deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        warn!(session_id = %self.session_id, "no terminal frame before timeout");
                        self.frames = None;
                        Poll::Ready(Some(Err(PairingError::Timeout)))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }
        };

        let event = match item {
            Some(Ok(bytes)) => {
                debug!(session_id = %self.session_id, len = bytes.len(), "frame received");
                frame::decode(&bytes, self.version)
                    .map_err(PairingError::from)
                    .and_then(|frame| self.accept(frame))
            }
            Some(Err(err)) => Err(err),
            None => Err(PairingError::Transport(
                "stream ended before the terminal frame".into(),
            )),
        };
        match &event {
            Ok(PairingEvent::Info(_)) => {}
            Ok(PairingEvent::Response(_)) => self.frames = None,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "pairing stream failed");
                self.frames = None;
            }
        }
        Poll::Ready(Some(event))
    }

    fn accept(&mut self, frame: Frame) -> Result<PairingEvent, PairingError> {
        match frame {
            Frame::Info(text) => {
                if self.version == ProtocolVersion::V1 && self.exchange_payload.is_none() {
                    self.exchange_payload = Some(text.clone());
                }
                Ok(PairingEvent::Info(text))
            }
            Frame::PairDeviceResponse(response) => {
                if response.session_id != self.session_id {
                    return Err(PairingError::MalformedFrame(format!(
                        "response for foreign session {}",
                        response.session_id
                    )));
                }
                Ok(PairingEvent::Response(response))
            }
        }
    }
}

impl Stream for PairingStream {
    type Item = Result<PairingEvent, PairingError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}
