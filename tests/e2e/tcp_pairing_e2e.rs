use std::error::Error;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use pairing::config::ServiceConfig;
use pairing::e2e_common::{client_config, run_tcp_pairing, service_with_node, spawn_tcp_service};
use pairing::messages::{session_id_from_exchange, PairDeviceRequest, PairingOutcome, ProtocolVersion};
use pairing::session::state::PairingState;
use pairing::transport::tcp::{RpcReply, RpcRequest, StreamRecord};
use pairing::{AttestationDeviceClient, NewDeviceClient, PairingError, PairingEvent};

const NODE_ID: &[u8] = b"node-e2e";

#[tokio::test]
async fn tcp_pairing_e2e_approval() -> Result<(), Box<dyn Error>> {
    let (response, credentials) = run_tcp_pairing().await?;
    assert!(response.is_approved());
    assert_eq!(credentials.certificate().device_name, "laptop");
    assert_eq!(credentials.restrictions(), "readonly");

    // The stored blob is enough to restore the device identity.
    let restored = pairing::Credentials::from_bytes(&credentials.to_bytes()?)?;
    assert_eq!(restored.node_id(), credentials.node_id());
    Ok(())
}

#[tokio::test]
async fn tcp_pairing_e2e_v1_rejection() -> Result<(), Box<dyn Error>> {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let addr = spawn_tcp_service(service).await?.to_string();
    let config = client_config(&addr)?.with_protocol_version(ProtocolVersion::V1);
    let new_device = NewDeviceClient::connect(config.clone())?;
    let attestation = AttestationDeviceClient::connect(&config, attester)?;

    let mut stream = new_device.pair_device("kiosk", "lobby kiosk", "").await?;
    let payload = match stream.next().await {
        Some(Ok(PairingEvent::Info(text))) => text,
        other => panic!("expected the exchange payload, got {:?}", other),
    };
    let session_id = session_id_from_exchange(&payload)?;
    assert_eq!(session_id, stream.session_id());

    let data = attestation.get_pairing_data(&session_id).await?;
    assert_eq!(data.description, "lobby kiosk");
    attestation.reject_pairing(&session_id, "not ours").await?;

    let response = stream.response().await?;
    assert_eq!(
        response.outcome,
        PairingOutcome::Rejected {
            reason: "not ours".into()
        }
    );
    assert!(stream.next().await.is_none());

    assert_eq!(
        attestation
            .approve_pairing(&session_id, NODE_ID, "kiosk", "")
            .await,
        Err(PairingError::SessionAlreadyResolved(session_id.clone()))
    );
    Ok(())
}

#[tokio::test]
async fn tcp_errors_cross_the_wire() -> Result<(), Box<dyn Error>> {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let addr = spawn_tcp_service(service).await?.to_string();
    let attestation = AttestationDeviceClient::connect(&client_config(&addr)?, attester)?;

    assert_eq!(
        attestation.get_pairing_data("sess-123").await,
        Err(PairingError::SessionNotFound("sess-123".into()))
    );
    Ok(())
}

#[tokio::test]
async fn tcp_server_expiry_is_delivered() -> Result<(), Box<dyn Error>> {
    let config = ServiceConfig::default().with_session_ttl(Duration::from_millis(100));
    let (service, _) = service_with_node(config, NODE_ID);
    let addr = spawn_tcp_service(service).await?.to_string();
    let new_device = NewDeviceClient::connect(client_config(&addr)?)?;

    let mut stream = new_device.pair_device("laptop", "", "").await?;
    assert_eq!(stream.response().await, Err(PairingError::Timeout));
    Ok(())
}

#[tokio::test]
async fn tcp_disconnect_expires_session() -> Result<(), Box<dyn Error>> {
    let (service, _) = service_with_node(ServiceConfig::default(), NODE_ID);
    let addr = spawn_tcp_service(service.clone()).await?.to_string();
    let new_device = NewDeviceClient::connect(client_config(&addr)?)?;

    let mut stream = new_device.pair_device("laptop", "", "").await?;
    let session_id = stream.session_id().to_string();
    stream.close();

    for _ in 0..100 {
        if service.session_state(&session_id) == Some(PairingState::Expired) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session was not expired after the client disconnected");
}

#[tokio::test]
async fn unsupported_version_is_refused_over_tcp() -> Result<(), Box<dyn Error>> {
    let config = ServiceConfig {
        supported_versions: vec![ProtocolVersion::V2],
        ..ServiceConfig::default()
    };
    let (service, _) = service_with_node(config, NODE_ID);
    let addr = spawn_tcp_service(service).await?;

    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let request = RpcRequest::PairDevice(PairDeviceRequest {
        name: "old".into(),
        description: String::new(),
        restrictions: String::new(),
        device_public_key: pairing::crypto::identity::generate_device_key()
            .verifying_key()
            .to_bytes(),
        protocol_version: ProtocolVersion::V1,
    });
    framed.send(Bytes::from(serde_cbor::to_vec(&request)?)).await?;

    let reply: RpcReply = serde_cbor::from_slice(&framed.next().await.ok_or("closed")??)?;
    let err = match reply {
        RpcReply::Error(err) => err,
        other => panic!("expected an error reply, got {:?}", other),
    };
    assert_eq!(
        PairingError::from(err),
        PairingError::ProtocolMismatch {
            requested: ProtocolVersion::V1,
            offered: ProtocolVersion::V2,
        }
    );
    Ok(())
}

#[tokio::test]
async fn raw_stream_records_carry_frames() -> Result<(), Box<dyn Error>> {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let addr = spawn_tcp_service(service).await?;

    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let request = RpcRequest::PairDevice(PairDeviceRequest {
        name: "raw".into(),
        description: String::new(),
        restrictions: String::new(),
        device_public_key: pairing::crypto::identity::generate_device_key()
            .verifying_key()
            .to_bytes(),
        protocol_version: ProtocolVersion::V2,
    });
    framed.send(Bytes::from(serde_cbor::to_vec(&request)?)).await?;
    let reply: RpcReply = serde_cbor::from_slice(&framed.next().await.ok_or("closed")??)?;
    let opened = match reply {
        RpcReply::Opened(opened) => opened,
        other => panic!("expected opened, got {:?}", other),
    };

    let attestation = AttestationDeviceClient::connect(&client_config(&addr.to_string())?, attester)?;
    attestation
        .approve_pairing(&opened.session_id, NODE_ID, "raw", "")
        .await?;

    let record: StreamRecord = serde_cbor::from_slice(&framed.next().await.ok_or("closed")??)?;
    let bytes = match record {
        StreamRecord::Frame(bytes) => bytes,
        other => panic!("expected a frame record, got {:?}", other),
    };
    assert_eq!(bytes[0], pairing::frame::TAG_PAIR_DEVICE_RESPONSE);
    // The server closes the connection after the terminal frame.
    assert!(framed.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn server_keeps_accepting_after_aborted_connections() -> Result<(), Box<dyn Error>> {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let addr = spawn_tcp_service(service).await?;

    // Reset each connection as soon as it is made.
    for _ in 0..32 {
        let stream = TcpStream::connect(addr).await?;
        stream.set_linger(Some(Duration::ZERO))?;
        drop(stream);
    }

    let attestation = AttestationDeviceClient::connect(&client_config(&addr.to_string())?, attester)?;
    assert_eq!(
        attestation.get_pairing_data("sess-123").await,
        Err(PairingError::SessionNotFound("sess-123".into()))
    );
    Ok(())
}
