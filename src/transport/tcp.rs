//! Length-delimited CBOR records over TCP.
//!
//! Each connection carries exactly one call: the client writes one [`RpcRequest`]
//! and the server answers with one [`RpcReply`]. A `PairDevice` call keeps the
//! connection open after `Opened` and streams [`StreamRecord`]s until the terminal
//! frame or an error.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::{FrameReceiver, PairingTransport};
use crate::config::ClientConfig;
use crate::crypto::SignedRequest;
use crate::error::{PairingError, WireError};
use crate::frame::TAG_PAIR_DEVICE_RESPONSE;
use crate::messages::{GetPairingDataResponse, PairDeviceRequest, PairingOpened};
use crate::session::PairingService;

/// Upper bound for a single record.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Pause after a failed accept, so an exhausted descriptor table is not spun on.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Client-to-server call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    PairDevice(PairDeviceRequest),
    GetPairingData(SignedRequest),
    ApprovePairing(SignedRequest),
    RejectPairing(SignedRequest),
}

impl RpcRequest {
    fn name(&self) -> &'static str {
        match self {
            RpcRequest::PairDevice(_) => "pair_device",
            RpcRequest::GetPairingData(_) => "get_pairing_data",
            RpcRequest::ApprovePairing(_) => "approve_pairing",
            RpcRequest::RejectPairing(_) => "reject_pairing",
        }
    }
}

/// Server answer to an [`RpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    Opened(PairingOpened),
    PairingData(GetPairingDataResponse),
    Ack,
    Error(WireError),
}

/// Item of a pairing stream after `Opened`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamRecord {
    /// One raw frame: tag byte followed by the payload.
    Frame(Vec<u8>),
    Error(WireError),
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_RECORD_LEN)
        .new_codec()
}

async fn write_record<S, T>(sink: &mut S, value: &T) -> Result<(), PairingError>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
    T: Serialize,
{
    let bytes = serde_cbor::to_vec(value).map_err(PairingError::codec)?;
    sink.send(Bytes::from(bytes))
        .await
        .map_err(PairingError::transport)
}

/// Reads one record; `Ok(None)` when the peer closed the connection.
async fn read_record<S, T>(stream: &mut S) -> Result<Option<T>, PairingError>
where
    S: Stream<Item = Result<BytesMut, io::Error>> + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        Some(Ok(bytes)) => serde_cbor::from_slice(&bytes)
            .map(Some)
            .map_err(PairingError::codec),
        Some(Err(err)) => Err(PairingError::transport(err)),
        None => Ok(None),
    }
}

/// Client side of the TCP transport. Opens one connection per call.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Uses the address resolved from `config`.
    pub fn from_config(config: &ClientConfig) -> Result<Self, PairingError> {
        Ok(Self::new(config.resolve_uri()?))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(
        &self,
        request: RpcRequest,
    ) -> Result<(RpcReply, Framed<TcpStream, LengthDelimitedCodec>), PairingError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| PairingError::Transport(format!("connect {}: {}", self.addr, e)))?;
        let mut framed = Framed::new(stream, codec());
        debug!(addr = %self.addr, call = request.name(), "sending request");
        write_record(&mut framed, &request).await?;
        match read_record::<_, RpcReply>(&mut framed).await? {
            Some(RpcReply::Error(err)) => Err(err.into()),
            Some(reply) => Ok((reply, framed)),
            None => Err(PairingError::Transport(
                "connection closed before reply".into(),
            )),
        }
    }

    async fn unary(&self, request: RpcRequest) -> Result<RpcReply, PairingError> {
        self.call(request).await.map(|(reply, _)| reply)
    }
}

fn unexpected(reply: &RpcReply) -> PairingError {
    PairingError::Codec(format!("unexpected reply {:?}", reply))
}

#[async_trait]
impl PairingTransport for TcpTransport {
    async fn pair_device(
        &self,
        request: PairDeviceRequest,
    ) -> Result<(PairingOpened, FrameReceiver), PairingError> {
        let (reply, framed) = self.call(RpcRequest::PairDevice(request)).await?;
        let opened = match reply {
            RpcReply::Opened(opened) => opened,
            other => return Err(unexpected(&other)),
        };
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(forward_stream(framed, tx));
        Ok((opened, rx))
    }

    async fn get_pairing_data(
        &self,
        request: SignedRequest,
    ) -> Result<GetPairingDataResponse, PairingError> {
        match self.unary(RpcRequest::GetPairingData(request)).await? {
            RpcReply::PairingData(data) => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    async fn approve_pairing(&self, request: SignedRequest) -> Result<(), PairingError> {
        match self.unary(RpcRequest::ApprovePairing(request)).await? {
            RpcReply::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn reject_pairing(&self, request: SignedRequest) -> Result<(), PairingError> {
        match self.unary(RpcRequest::RejectPairing(request)).await? {
            RpcReply::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

/// Moves stream records from the socket into the local frame channel. Dropping the
/// receiver closes the connection, which the server treats as abandonment.
async fn forward_stream(
    mut framed: Framed<TcpStream, LengthDelimitedCodec>,
    tx: mpsc::Sender<Result<Vec<u8>, PairingError>>,
) {
    loop {
        let record = tokio::select! {
            record = read_record::<_, StreamRecord>(&mut framed) => record,
            _ = tx.closed() => {
                debug!("pairing stream receiver dropped, closing connection");
                return;
            }
        };
        let item = match record {
            Ok(Some(StreamRecord::Frame(bytes))) => Ok(bytes),
            Ok(Some(StreamRecord::Error(err))) => Err(err.into()),
            Ok(None) => return,
            Err(err) => Err(err),
        };
        let last = item.is_err();
        if tx.send(item).await.is_err() || last {
            return;
        }
    }
}

/// Accepts connections and serves each call against `service`.
pub async fn serve(listener: TcpListener, service: PairingService) -> Result<(), PairingError> {
    let local = listener.local_addr().map_err(PairingError::transport)?;
    info!(addr = %local, "pairing server listening");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(addr = %local, error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, service).await {
                warn!(%peer, error = %err, "connection failed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: PairingService,
) -> Result<(), PairingError> {
    let mut framed = Framed::new(stream, codec());
    let request = match read_record::<_, RpcRequest>(&mut framed).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => {
            write_record(&mut framed, &RpcReply::Error(WireError::from(&err))).await?;
            return Err(err);
        }
    };
    debug!(%peer, call = request.name(), "request received");

    let reply = match request {
        RpcRequest::PairDevice(request) => match service.open_session(request) {
            Ok((opened, frames)) => return stream_session(framed, peer, opened, frames).await,
            Err(err) => RpcReply::Error(WireError::from(&err)),
        },
        RpcRequest::GetPairingData(signed) => match service.pairing_data(&signed) {
            Ok(data) => RpcReply::PairingData(data),
            Err(err) => RpcReply::Error(WireError::from(&err)),
        },
        RpcRequest::ApprovePairing(signed) => match service.approve(&signed).await {
            Ok(()) => RpcReply::Ack,
            Err(err) => RpcReply::Error(WireError::from(&err)),
        },
        RpcRequest::RejectPairing(signed) => match service.reject(&signed).await {
            Ok(()) => RpcReply::Ack,
            Err(err) => RpcReply::Error(WireError::from(&err)),
        },
    };
    write_record(&mut framed, &reply).await
}

async fn stream_session(
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer: SocketAddr,
    opened: PairingOpened,
    mut frames: FrameReceiver,
) -> Result<(), PairingError> {
    let (mut sink, mut stream) = framed.split();
    write_record(&mut sink, &RpcReply::Opened(opened.clone())).await?;

    loop {
        let item = tokio::select! {
            item = frames.recv() => item,
            _ = stream.next() => {
                debug!(%peer, session_id = %opened.session_id, "new device disconnected");
                return Ok(());
            }
        };
        let (record, last) = match item {
            Some(Ok(bytes)) => {
                let last = bytes.first() == Some(&TAG_PAIR_DEVICE_RESPONSE);
                (StreamRecord::Frame(bytes), last)
            }
            Some(Err(err)) => (StreamRecord::Error(WireError::from(&err)), true),
            None => return Ok(()),
        };
        write_record(&mut sink, &record).await?;
        if last {
            sink.close().await.map_err(PairingError::transport)?;
            return Ok(());
        }
    }
}
