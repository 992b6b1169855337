use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use pairing::config::ServiceConfig;
use pairing::crypto::identity::NodeAuthority;
use pairing::e2e_common::{client_config, service_with_node};
use pairing::frame::{self, Frame};
use pairing::messages::{
    session_id_from_exchange, GetPairingDataResponse, PairDeviceRequest, PairDeviceResponse,
    PairingOpened, PairingOutcome, ProtocolVersion,
};
use pairing::session::state::{PairingState, Resolution};
use pairing::transport::{FrameReceiver, LocalTransport, PairingTransport};
use pairing::{
    AttestationDeviceClient, NewDeviceClient, PairingError, PairingEvent, PairingService,
    SignedRequest,
};

const NODE_ID: &[u8] = b"\x01\x02";

fn clients(
    service: &PairingService,
    attester: pairing::Credentials,
    version: ProtocolVersion,
) -> (
    NewDeviceClient<LocalTransport>,
    AttestationDeviceClient<LocalTransport>,
) {
    let config = client_config("127.0.0.1:1")
        .unwrap()
        .with_protocol_version(version);
    (
        NewDeviceClient::open(config, LocalTransport::new(service.clone())),
        AttestationDeviceClient::new(attester, LocalTransport::new(service.clone())),
    )
}

/// Transport that plays back a fixed list of frames for any pairing request.
struct ScriptedTransport {
    frames: Vec<Vec<u8>>,
    exchange_payload: Option<String>,
    echo_version: Option<ProtocolVersion>,
}

#[async_trait]
impl PairingTransport for ScriptedTransport {
    async fn pair_device(
        &self,
        request: PairDeviceRequest,
    ) -> Result<(PairingOpened, FrameReceiver), PairingError> {
        let (tx, rx) = mpsc::channel(self.frames.len().max(1));
        for frame in &self.frames {
            tx.try_send(Ok(frame.clone())).unwrap();
        }
        Ok((
            PairingOpened {
                session_id: "sess-123".into(),
                protocol_version: self.echo_version.unwrap_or(request.protocol_version),
                exchange_payload: self.exchange_payload.clone(),
            },
            rx,
        ))
    }

    async fn get_pairing_data(
        &self,
        _request: SignedRequest,
    ) -> Result<GetPairingDataResponse, PairingError> {
        Err(PairingError::SessionNotFound("sess-123".into()))
    }

    async fn approve_pairing(&self, _request: SignedRequest) -> Result<(), PairingError> {
        Ok(())
    }

    async fn reject_pairing(&self, _request: SignedRequest) -> Result<(), PairingError> {
        Ok(())
    }
}

fn rejected_frame() -> Vec<u8> {
    frame::encode(&Frame::PairDeviceResponse(PairDeviceResponse {
        session_id: "sess-123".into(),
        outcome: PairingOutcome::Rejected {
            reason: "not now".into(),
        },
    }))
    .unwrap()
}

fn scripted_client(transport: ScriptedTransport, version: ProtocolVersion) -> NewDeviceClient<ScriptedTransport> {
    let config = client_config("127.0.0.1:1")
        .unwrap()
        .with_protocol_version(version)
        .with_pairing_timeout(Duration::from_millis(100));
    NewDeviceClient::open(config, transport)
}

#[tokio::test]
async fn scenario_a_single_terminal_frame() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (new_device, attestation) = clients(&service, attester, ProtocolVersion::V2);

    let mut stream = new_device
        .pair_device("laptop", "my laptop", "readonly")
        .await
        .unwrap();
    let session_id = session_id_from_exchange(stream.exchange_payload().unwrap()).unwrap();
    assert_eq!(session_id, stream.session_id());

    attestation
        .approve_pairing(&session_id, NODE_ID, "laptop", "readonly")
        .await
        .unwrap();

    let events: Vec<_> = (&mut stream).collect().await;
    assert_eq!(events.len(), 1);
    let PairingEvent::Response(response) = events[0].clone().unwrap() else {
        panic!("expected the terminal response");
    };
    assert!(response.is_approved());

    let credentials = stream.credentials(&response).unwrap();
    assert_eq!(credentials.node_id(), NODE_ID);
    assert_eq!(credentials.restrictions(), "readonly");
    assert_eq!(credentials.certificate().device_name, "laptop");
}

#[tokio::test]
async fn scenario_a_with_scripted_server() {
    let transport = ScriptedTransport {
        frames: vec![rejected_frame()],
        exchange_payload: Some("pairing:sess-123".into()),
        echo_version: None,
    };
    let client = scripted_client(transport, ProtocolVersion::V2);
    let mut stream = client.pair_device("laptop", "my laptop", "readonly").await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert!(matches!(first, PairingEvent::Response(_)));
    assert!(stream.next().await.is_none());
    assert!(stream.is_closed());
}

#[tokio::test]
async fn scenario_b_unknown_session() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (_, attestation) = clients(&service, attester, ProtocolVersion::V2);
    assert_eq!(
        attestation.get_pairing_data("sess-123").await,
        Err(PairingError::SessionNotFound("sess-123".into()))
    );
}

#[tokio::test]
async fn scenario_c_second_approval_fails() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (new_device, attestation) = clients(&service, attester, ProtocolVersion::V2);

    let mut stream = new_device
        .pair_device("laptop", "my laptop", "readonly")
        .await
        .unwrap();
    let session_id = stream.session_id().to_string();

    attestation
        .approve_pairing(&session_id, NODE_ID, "laptop", "readonly")
        .await
        .unwrap();
    assert_eq!(
        attestation
            .approve_pairing(&session_id, NODE_ID, "laptop", "admin")
            .await,
        Err(PairingError::SessionAlreadyResolved(session_id.clone()))
    );
    assert_eq!(
        attestation.reject_pairing(&session_id, "too late").await,
        Err(PairingError::SessionAlreadyResolved(session_id.clone()))
    );

    // The first decision stands.
    let response = stream.response().await.unwrap();
    let credentials = stream.credentials(&response).unwrap();
    assert_eq!(credentials.restrictions(), "readonly");
    assert_eq!(
        service.session_state(&session_id),
        Some(PairingState::Resolved(Resolution::Approved))
    );
}

#[tokio::test]
async fn concurrent_approvals_resolve_once() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (new_device, _) = clients(&service, attester.clone(), ProtocolVersion::V2);
    let mut stream = new_device.pair_device("tablet", "", "").await.unwrap();
    let session_id = stream.session_id().to_string();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let attestation =
            AttestationDeviceClient::new(attester.clone(), LocalTransport::new(service.clone()));
        let session_id = session_id.clone();
        tasks.push(tokio::spawn(async move {
            attestation
                .approve_pairing(&session_id, NODE_ID, &format!("tablet-{i}"), "")
                .await
        }));
    }
    let mut approved = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => approved += 1,
            Err(err) => assert_eq!(err, PairingError::SessionAlreadyResolved(session_id.clone())),
        }
    }
    assert_eq!(approved, 1);
    assert!(stream.response().await.unwrap().is_approved());
}

#[tokio::test]
async fn pairing_data_describes_pending_session() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (new_device, attestation) = clients(&service, attester, ProtocolVersion::V2);
    let stream = new_device
        .pair_device("laptop", "my laptop", "readonly")
        .await
        .unwrap();

    let data = attestation.get_pairing_data(stream.session_id()).await.unwrap();
    assert_eq!(data.name, "laptop");
    assert_eq!(data.description, "my laptop");
    assert_eq!(data.restrictions, "readonly");
    assert_eq!(Some(data.exchange_payload.as_str()), stream.exchange_payload());
}

#[tokio::test]
async fn rejection_is_an_outcome_not_an_error() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (new_device, attestation) = clients(&service, attester, ProtocolVersion::V2);
    let mut stream = new_device.pair_device("laptop", "", "").await.unwrap();
    let session_id = stream.session_id().to_string();

    attestation
        .reject_pairing(&session_id, "unknown device")
        .await
        .unwrap();

    let response = stream.response().await.unwrap();
    assert_eq!(
        response.outcome,
        PairingOutcome::Rejected {
            reason: "unknown device".into()
        }
    );
    assert_eq!(
        stream.credentials(&response).unwrap_err(),
        PairingError::Rejected("unknown device".into())
    );
    assert_eq!(
        attestation.get_pairing_data(&session_id).await,
        Err(PairingError::SessionNotFound(session_id.clone()))
    );
}

#[tokio::test]
async fn foreign_node_credentials_cannot_approve() {
    let (service, attester_a) = service_with_node(ServiceConfig::default(), b"node-a");
    let authority_b = NodeAuthority::generate(b"node-b".to_vec());
    service.register_authority(authority_b);
    let (new_device, attestation) = clients(&service, attester_a, ProtocolVersion::V2);

    let mut stream = new_device.pair_device("laptop", "", "").await.unwrap();
    let session_id = stream.session_id().to_string();
    assert!(matches!(
        attestation
            .approve_pairing(&session_id, b"node-b", "laptop", "")
            .await,
        Err(PairingError::Unauthorized(_))
    ));
    assert_eq!(
        service.session_state(&session_id),
        Some(PairingState::AwaitingApproval)
    );
    stream.close();
}

#[tokio::test]
async fn unknown_authority_is_unauthorized() {
    let (service, _) = service_with_node(ServiceConfig::default(), NODE_ID);
    let stranger = NodeAuthority::generate(NODE_ID.to_vec()).enroll_device("stranger", "");
    let (new_device, attestation) = clients(&service, stranger, ProtocolVersion::V2);
    let stream = new_device.pair_device("laptop", "", "").await.unwrap();

    assert!(matches!(
        attestation.get_pairing_data(stream.session_id()).await,
        Err(PairingError::Unauthorized(_))
    ));
    let never_registered = NodeAuthority::generate(b"ghost".to_vec()).enroll_device("ghost", "");
    let ghost = AttestationDeviceClient::new(never_registered, LocalTransport::new(service.clone()));
    assert!(matches!(
        ghost.reject_pairing(stream.session_id(), "no").await,
        Err(PairingError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn v1_delivers_exchange_payload_as_first_info_frame() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (new_device, attestation) = clients(&service, attester, ProtocolVersion::V1);

    let mut stream = new_device.pair_device("laptop", "", "ro").await.unwrap();
    assert_eq!(stream.protocol_version(), ProtocolVersion::V1);
    assert_eq!(stream.exchange_payload(), None);

    let PairingEvent::Info(payload) = stream.next().await.unwrap().unwrap() else {
        panic!("expected the exchange payload first");
    };
    assert_eq!(stream.exchange_payload(), Some(payload.as_str()));

    let session_id = session_id_from_exchange(&payload).unwrap();
    attestation
        .approve_pairing(&session_id, NODE_ID, "laptop", "ro")
        .await
        .unwrap();
    assert!(matches!(
        stream.next().await,
        Some(Ok(PairingEvent::Response(_)))
    ));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn info_frames_precede_terminal_frame_in_order() {
    let mut frames: Vec<Vec<u8>> = (0..5)
        .map(|i| frame::encode(&Frame::Info(format!("step {i}"))).unwrap())
        .collect();
    frames.push(rejected_frame());
    frames.push(frame::encode(&Frame::Info("after the end".into())).unwrap());
    let client = scripted_client(
        ScriptedTransport {
            frames,
            exchange_payload: None,
            echo_version: None,
        },
        ProtocolVersion::V1,
    );

    let stream = client.pair_device("laptop", "", "").await.unwrap();
    let events: Vec<_> = stream.map(Result::unwrap).collect().await;
    assert_eq!(events.len(), 6);
    for (i, event) in events[..5].iter().enumerate() {
        assert_eq!(event, &PairingEvent::Info(format!("step {i}")));
    }
    assert!(matches!(events[5], PairingEvent::Response(_)));
}

#[tokio::test]
async fn info_frame_is_unknown_under_v2() {
    let client = scripted_client(
        ScriptedTransport {
            frames: vec![frame::encode(&Frame::Info("hello".into())).unwrap(), rejected_frame()],
            exchange_payload: Some("pairing:sess-123".into()),
            echo_version: None,
        },
        ProtocolVersion::V2,
    );
    let mut stream = client.pair_device("laptop", "", "").await.unwrap();
    assert_eq!(
        stream.next().await,
        Some(Err(PairingError::UnknownFrameType(2)))
    );
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn malformed_frames_abort_the_stream() {
    let client = scripted_client(
        ScriptedTransport {
            frames: vec![vec![], rejected_frame()],
            exchange_payload: None,
            echo_version: None,
        },
        ProtocolVersion::V1,
    );
    let mut stream = client.pair_device("laptop", "", "").await.unwrap();
    assert!(matches!(
        stream.next().await,
        Some(Err(PairingError::MalformedFrame(_)))
    ));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn echoed_version_must_match() {
    let client = scripted_client(
        ScriptedTransport {
            frames: vec![],
            exchange_payload: None,
            echo_version: Some(ProtocolVersion::V1),
        },
        ProtocolVersion::V2,
    );
    assert_eq!(
        client.pair_device("laptop", "", "").await.unwrap_err(),
        PairingError::ProtocolMismatch {
            requested: ProtocolVersion::V2,
            offered: ProtocolVersion::V1,
        }
    );
}

#[tokio::test]
async fn client_times_out_without_terminal_frame() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (new_device, _) = clients(&service, attester, ProtocolVersion::V2);
    let config = new_device
        .config()
        .clone()
        .with_pairing_timeout(Duration::from_millis(50));
    let new_device = NewDeviceClient::open(config, LocalTransport::new(service.clone()));

    let mut stream = new_device.pair_device("laptop", "", "").await.unwrap();
    let err = stream.response().await.unwrap_err();
    assert_eq!(err, PairingError::Timeout);
    assert!(err.is_retryable());
    assert!(stream.is_closed());
}

#[tokio::test]
async fn server_expiry_reaches_waiting_device() {
    let config = ServiceConfig::default().with_session_ttl(Duration::from_millis(50));
    let (service, attester) = service_with_node(config, NODE_ID);
    let (new_device, attestation) = clients(&service, attester, ProtocolVersion::V2);

    let mut stream = new_device.pair_device("laptop", "", "").await.unwrap();
    let session_id = stream.session_id().to_string();
    assert_eq!(stream.next().await, Some(Err(PairingError::Timeout)));

    assert_eq!(
        attestation
            .approve_pairing(&session_id, NODE_ID, "laptop", "")
            .await,
        Err(PairingError::SessionNotFound(session_id.clone()))
    );
}

#[tokio::test]
async fn closing_the_stream_expires_the_session() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (new_device, attestation) = clients(&service, attester, ProtocolVersion::V2);

    let mut stream = new_device.pair_device("laptop", "", "").await.unwrap();
    let session_id = stream.session_id().to_string();
    stream.close();
    assert!(stream.next().await.is_none());

    let mut state = service.session_state(&session_id);
    for _ in 0..50 {
        if state == Some(PairingState::Expired) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = service.session_state(&session_id);
    }
    assert_eq!(state, Some(PairingState::Expired));
    assert_eq!(
        attestation.get_pairing_data(&session_id).await,
        Err(PairingError::SessionNotFound(session_id.clone()))
    );
}

#[tokio::test]
async fn every_attempt_gets_a_fresh_session() {
    let (service, attester) = service_with_node(ServiceConfig::default(), NODE_ID);
    let (new_device, _) = clients(&service, attester, ProtocolVersion::V2);
    let first = new_device.pair_device("laptop", "", "").await.unwrap();
    let second = new_device.pair_device("laptop", "", "").await.unwrap();
    assert_ne!(first.session_id(), second.session_id());
    assert_eq!(service.session_count(), 2);
}
