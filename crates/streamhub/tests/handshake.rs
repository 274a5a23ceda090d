use std::time::Duration;

use streamhub::{ClientSession, HandshakeError, ReceiverTable, SessionState, Transport};
use streamhub_core::{Frame, MessagePackSerializer, PROTOCOL_VERSION, VERSION_HEADER, nil_payload};
use streamhub_testkit::{calculator_service, test_client_options};

async fn connect(transport: Transport) -> Result<ClientSession, HandshakeError> {
    ClientSession::connect(
        "Calculator",
        transport,
        ReceiverTable::<MessagePackSerializer>::new(),
        test_client_options().with_connect_timeout(Duration::from_millis(200)),
    )
    .await
}

async fn send(server: &Transport, frame: Frame) {
    let bytes = frame.encode(server.buffer_pool()).unwrap();
    server.send_frame(bytes).await.unwrap();
}

#[tokio::test]
async fn hub_service_sends_the_version_marker_first() {
    let (service, _) = calculator_service(Default::default());
    let (client, server) = Transport::mem_pair();
    tokio::spawn(async move { service.serve(server).await });

    let first = client.recv_frame().await.unwrap();
    let frame = Frame::decode(&first, streamhub_core::Origin::Server).unwrap();
    assert_eq!(
        frame,
        Frame::Handshake {
            headers: vec![(VERSION_HEADER.to_string(), PROTOCOL_VERSION.to_string())],
        }
    );
}

#[tokio::test]
async fn application_frame_before_marker_is_version_missing() {
    let (client, server) = Transport::mem_pair();
    send(
        &server,
        Frame::Broadcast {
            method_id: 1,
            args: nil_payload(),
        },
    )
    .await;

    let err = connect(client).await.unwrap_err();
    assert!(matches!(err, HandshakeError::VersionMissing), "got {err}");
}

#[tokio::test]
async fn marker_without_version_is_version_missing() {
    let (client, server) = Transport::mem_pair();
    send(&server, Frame::Handshake { headers: vec![] }).await;

    let err = connect(client).await.unwrap_err();
    assert!(matches!(err, HandshakeError::VersionMissing), "got {err}");
}

#[tokio::test]
async fn other_version_is_rejected() {
    let (client, server) = Transport::mem_pair();
    send(
        &server,
        Frame::Handshake {
            headers: vec![(VERSION_HEADER.to_string(), "1".to_string())],
        },
    )
    .await;

    match connect(client).await.unwrap_err() {
        HandshakeError::VersionMismatch { expected, actual } => {
            assert_eq!(expected, PROTOCOL_VERSION);
            assert_eq!(actual, "1");
        }
        other => panic!("expected a version mismatch, got {other}"),
    }
}

#[tokio::test]
async fn stream_closed_before_marker_is_connect_failure() {
    let (client, server) = Transport::mem_pair();
    server.close();
    drop(server);

    let err = connect(client).await.unwrap_err();
    assert!(matches!(err, HandshakeError::ConnectFailed(_)), "got {err}");
}

#[tokio::test]
async fn silent_server_times_out() {
    let (client, _server) = Transport::mem_pair();

    let err = connect(client).await.unwrap_err();
    assert!(matches!(err, HandshakeError::TimedOut), "got {err}");
}

#[tokio::test]
async fn valid_marker_activates_the_session() {
    let (client, server) = Transport::mem_pair();
    send(&server, Frame::handshake()).await;

    let session = connect(client).await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
    session.dispose().await;
    assert_eq!(session.state(), SessionState::Closed);
}
