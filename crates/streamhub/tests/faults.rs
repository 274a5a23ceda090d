use std::time::Duration;

use bytes::Bytes;
use streamhub::server::{HubContext, MethodTable};
use streamhub::{
    ClientSession, DisconnectReason, HandshakeError, HubOptions, HubService, ReceiverTable,
    RpcError, StreamingHub, Transport,
};
use streamhub_core::{Frame, MessagePackSerializer, Origin, method_id};
use streamhub_testkit::{ADD, MemFactory, calculator_service, connect, test_client_options, wait_until};
use tokio::io::AsyncWriteExt;

/// array(6): no frame kind has six elements in either direction.
const UNKNOWN_FRAME: &[u8] = &[0x96, 0, 0, 0, 0, 0, 0];

async fn send(transport: &Transport, frame: Frame) {
    let bytes = frame.encode(transport.buffer_pool()).unwrap();
    transport.send_frame(bytes).await.unwrap();
}

#[tokio::test]
async fn unknown_frame_faults_client_and_fails_pending_calls() {
    let (transport, server) = Transport::mem_pair();
    send(&server, Frame::handshake()).await;

    let session = std::sync::Arc::new(
        ClientSession::connect(
            "Calculator",
            transport,
            ReceiverTable::<MessagePackSerializer>::new(),
            test_client_options().with_call_timeout(None),
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
    wait_until(|| session.pending_calls() == 1).await.unwrap();

    server
        .send_frame(Bytes::from_static(UNKNOWN_FRAME))
        .await
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), session.wait_for_disconnect())
        .await
        .expect("session should fault");
    match &reason {
        DisconnectReason::Faulted(msg) => assert!(msg.contains("framing error"), "got {msg}"),
        other => panic!("expected a fault, got {other}"),
    }
    match call.await.unwrap() {
        Err(RpcError::Disconnected(DisconnectReason::Faulted(_))) => {}
        other => panic!("pending call should fail with the fault, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_frame_faults_hub_session() {
    let (service, _) = calculator_service(HubOptions::default());
    let (client, server) = Transport::mem_pair();
    let serving = tokio::spawn(async move { service.serve(server).await });

    let marker = client.recv_frame().await.unwrap();
    assert!(matches!(
        Frame::decode(&marker, Origin::Server),
        Ok(Frame::Handshake { .. })
    ));
    client
        .send_frame(Bytes::from_static(UNKNOWN_FRAME))
        .await
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .expect("hub session should end")
        .unwrap();
    assert!(matches!(reason, DisconnectReason::Faulted(_)), "got {reason}");
}

#[tokio::test]
async fn truncated_frame_on_a_stream_faults_hub_session() {
    let (service, _) = calculator_service(HubOptions::default());
    let (raw, server) = tokio::io::duplex(1024);
    let serving = tokio::spawn(async move { service.serve(Transport::stream(server)).await });

    let (_read, mut write) = tokio::io::split(raw);
    // Promise ten bytes, deliver three, hang up.
    write.write_all(&10u32.to_le_bytes()).await.unwrap();
    write.write_all(&[0x93, 0x01, 0x02]).await.unwrap();
    write.shutdown().await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .expect("hub session should end")
        .unwrap();
    assert!(matches!(reason, DisconnectReason::Faulted(_)), "got {reason}");
}

/// A hub whose named lifecycle hook panics.
struct Fragile {
    panics_in: &'static str,
}

impl Fragile {
    fn check(&self, hook: &str) {
        if self.panics_in == hook {
            panic!("{hook} exploded");
        }
    }
}

impl StreamingHub for Fragile {
    async fn on_connecting(&self, _ctx: &HubContext) {
        self.check("on_connecting");
    }

    async fn on_connected(&self, _ctx: &HubContext) {
        self.check("on_connected");
    }

    async fn on_disconnected(&self, _ctx: &HubContext) {
        self.check("on_disconnected");
    }
}

fn fragile_service(panics_in: &'static str) -> HubService<Fragile> {
    let table = MethodTable::<Fragile>::builder("Fragile")
        .method(ADD, |_hub, _ctx, (a, b): (i32, i32)| async move {
            Ok::<_, RpcError>(a + b)
        })
        .build()
        .unwrap();
    let options =
        HubOptions::default().with_heartbeat(Duration::from_millis(50), Some(Duration::from_secs(5)));
    HubService::new(table, move |_: &HubContext| Fragile { panics_in }, options)
}

#[tokio::test]
async fn panicking_connected_hook_keeps_the_session_serving() {
    let service = fragile_service("on_connected");
    let (client, server) = connect::<MemFactory, _>(&service, ReceiverTable::new(), test_client_options())
        .await
        .unwrap();

    let sum: i32 = client.invoke(ADD, &(2, 3)).await.unwrap();
    assert_eq!(sum, 5);

    client.dispose().await;
    let reason = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("hub session should end")
        .unwrap();
    assert_eq!(reason, DisconnectReason::CompletedNormally);
    assert_eq!(service.heartbeat().unwrap().registered(), 0);
}

#[tokio::test]
async fn panicking_disconnected_hook_still_finishes_teardown() {
    let service = fragile_service("on_disconnected");
    let (client, server) = connect::<MemFactory, _>(&service, ReceiverTable::new(), test_client_options())
        .await
        .unwrap();
    client.dispose().await;

    let reason = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("hub session should end")
        .expect("serve task should not panic");
    assert_eq!(reason, DisconnectReason::CompletedNormally);
    assert_eq!(service.heartbeat().unwrap().registered(), 0);
    assert!(!service.heartbeat().unwrap().is_running());
}

#[tokio::test]
async fn panicking_connecting_hook_rejects_the_connection() {
    let service = fragile_service("on_connecting");
    let (transport, server) = Transport::mem_pair();
    let serving = {
        let service = service.clone();
        tokio::spawn(async move { service.serve(server).await })
    };

    let err = ClientSession::connect(
        "Fragile",
        transport,
        ReceiverTable::<MessagePackSerializer>::new(),
        test_client_options().with_connect_timeout(Duration::from_secs(1)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, HandshakeError::ConnectFailed(_)), "got {err}");

    let reason = serving.await.unwrap();
    assert!(matches!(reason, DisconnectReason::Faulted(_)), "got {reason}");
    assert_eq!(service.heartbeat().unwrap().registered(), 0);
}
