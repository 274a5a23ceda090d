use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use streamhub::{
    ClientSession, DisconnectReason, HubOptions, ReceiverTable, RpcError, SessionState, Transport,
};
use streamhub_core::{Frame, MessagePackSerializer, Origin, method_id};
use streamhub_testkit::{LATENCY, calculator_service, connect, test_client_options, MemFactory};
use tokio::sync::mpsc;

/// A server that completes the handshake and then never answers anything.
async fn mute_server() -> (Transport, Transport) {
    let (client, server) = Transport::mem_pair();
    let marker = Frame::handshake().encode(server.buffer_pool()).unwrap();
    server.send_frame(marker).await.unwrap();
    (client, server)
}

#[tokio::test]
async fn unanswered_client_heartbeat_drains_session_and_cancels_calls() {
    let (transport, server) = mute_server().await;
    // Keep reading so outbound frames never back up.
    let reader = tokio::spawn(async move {
        let mut probes = 0;
        while let Ok(bytes) = server.recv_frame().await {
            if let Ok(Frame::ClientHeartbeat { .. }) = Frame::decode(&bytes, Origin::Client) {
                probes += 1;
            }
        }
        probes
    });

    let options = test_client_options()
        .with_call_timeout(None)
        .with_heartbeat_interval(Some(Duration::from_millis(20)))
        .with_heartbeat_timeout(Some(Duration::from_millis(80)));
    let session = Arc::new(
        ClientSession::connect(
            "Calculator",
            transport,
            ReceiverTable::<MessagePackSerializer>::new(),
            options,
        )
        .await
        .unwrap(),
    );

    let call = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call_with_response(method_id("Add"), Bytes::from_static(&[0x92, 0x02, 0x03]))
                .await
        })
    };

    let reason = tokio::time::timeout(Duration::from_secs(2), session.wait_for_disconnect())
        .await
        .expect("session should time out");
    assert_eq!(reason, DisconnectReason::TimedOut);
    assert_eq!(session.state(), SessionState::Closed);

    match call.await.unwrap() {
        Err(RpcError::Disconnected(DisconnectReason::TimedOut)) => {}
        other => panic!("pending call should be cancelled, got {other:?}"),
    }
    assert!(reader.await.unwrap() >= 1);
}

#[tokio::test]
async fn client_heartbeat_reports_round_trip() {
    let (service, _) = calculator_service(HubOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = test_client_options()
        .with_heartbeat_interval(Some(Duration::from_millis(20)))
        .with_heartbeat_timeout(Some(Duration::from_secs(1)))
        .on_client_heartbeat_response(move |event| {
            let _ = tx.send(event.round_trip_time);
        });
    let (client, _server) = connect::<MemFactory, _>(&service, ReceiverTable::new(), options)
        .await
        .unwrap();

    let rtt = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("heartbeat response should arrive")
        .unwrap();
    assert!(rtt < Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), SessionState::Active);
    client.dispose().await;
}

#[tokio::test]
async fn server_heartbeat_reaches_client_and_records_latency() {
    // msgpack "meta"
    const METADATA: &[u8] = &[0xa4, b'm', b'e', b't', b'a'];

    let options = HubOptions::default()
        .with_heartbeat(Duration::from_millis(20), Some(Duration::from_secs(1)))
        .with_heartbeat_metadata(|| Bytes::from_static(METADATA));
    let (service, _) = calculator_service(options);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_options = test_client_options().on_server_heartbeat(move |event| {
        let _ = tx.send(event);
    });
    let (client, _server) = connect::<MemFactory, _>(&service, ReceiverTable::new(), client_options)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("server heartbeat should arrive")
        .unwrap();
    assert_eq!(&event.metadata[..], METADATA);
    assert!(event.server_time > 0);

    let manager = service.heartbeat().unwrap();
    assert_eq!(manager.registered(), 1);

    // Give the echo time to come back before asking for it.
    let mut latency = None;
    for _ in 0..50 {
        latency = client.invoke::<_, Option<u64>>(LATENCY, &()).await.unwrap();
        if latency.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(latency.is_some(), "hub should record heartbeat latency");

    client.dispose().await;
    streamhub_testkit::wait_until(|| manager.registered() == 0).await.unwrap();
    assert!(!manager.is_running());
}

#[tokio::test]
async fn unanswered_server_heartbeat_ends_hub_session() {
    let options =
        HubOptions::default().with_heartbeat(Duration::from_millis(20), Some(Duration::from_millis(80)));
    let (service, _) = calculator_service(options);
    let (client, server) = Transport::mem_pair();

    let serving = {
        let service = service.clone();
        tokio::spawn(async move { service.serve(server).await })
    };
    // Read everything, answer nothing.
    tokio::spawn(async move { while client.recv_frame().await.is_ok() {} });

    let reason = tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .expect("hub session should time out")
        .unwrap();
    assert_eq!(reason, DisconnectReason::TimedOut);
    assert_eq!(service.heartbeat().unwrap().registered(), 0);
}
