//! Transport-generic scenarios. Each `run_*` panics with the failing step.

use std::sync::Arc;
use std::time::Duration;

use streamhub::{DisconnectReason, GroupStrategy, HubClient, HubOptions, ReceiverTable, SessionState};
use streamhub::group::GroupRepository;
use streamhub_core::{MethodDescriptor, RpcError, StatusCode};

use crate::*;

async fn recv_within<T>(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>,
    wait: Duration,
) -> Option<T> {
    tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
}

// ============================================================================
// Calls
// ============================================================================

pub async fn run_add_happy_path<F: TransportFactory>() {
    if let Err(e) = run_add_happy_path_inner::<F>().await {
        panic!("run_add_happy_path failed: {e}");
    }
}

async fn run_add_happy_path_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (service, _) = calculator_service(HubOptions::default());
    let (client, server) = connect::<F, _>(&service, ReceiverTable::new(), test_client_options()).await?;

    let sum: i32 = client.invoke(ADD, &(2, 3)).await?;
    if sum != 5 {
        return Err(TestError::Assertion(format!("expected 5, got {sum}")));
    }
    if client.state() != SessionState::Active {
        return Err(TestError::Assertion(format!("unexpected state {}", client.state())));
    }

    client.dispose().await;
    let reason = server
        .await
        .map_err(|e| TestError::Setup(format!("server task failed: {e}")))?;
    if reason != DisconnectReason::CompletedNormally {
        return Err(TestError::Assertion(format!(
            "server should see a normal close, got {reason}"
        )));
    }
    Ok(())
}

pub async fn run_concurrent_calls<F: TransportFactory>() {
    if let Err(e) = run_concurrent_calls_inner::<F>().await {
        panic!("run_concurrent_calls failed: {e}");
    }
}

async fn run_concurrent_calls_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (service, _) = calculator_service(HubOptions::default());
    let (client, _server) = connect::<F, _>(&service, ReceiverTable::new(), test_client_options()).await?;

    let calls = (0..64).map(|i| {
        let client = &client;
        async move {
            let sum: i32 = client.invoke(ADD, &(i, 1000)).await?;
            Ok::<_, RpcError>((i, sum))
        }
    });
    for result in futures::future::join_all(calls).await {
        let (i, sum) = result?;
        if sum != i + 1000 {
            return Err(TestError::Assertion(format!(
                "call {i} got {sum}; replies were crossed"
            )));
        }
    }
    if client.session().pending_calls() != 0 {
        return Err(TestError::Assertion("pending table should be empty".into()));
    }
    client.dispose().await;
    Ok(())
}

pub async fn run_fire_and_forget<F: TransportFactory>() {
    if let Err(e) = run_fire_and_forget_inner::<F>().await {
        panic!("run_fire_and_forget failed: {e}");
    }
}

async fn run_fire_and_forget_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (service, log) = calculator_service(HubOptions::default());
    let (client, _server) = connect::<F, _>(&service, ReceiverTable::new(), test_client_options()).await?;

    client.invoke_no_reply(RECORD, &7)?;
    client.invoke_no_reply(RECORD, &8)?;
    // Requests on one connection run in order, so this reply follows both records.
    let _: i32 = client.invoke(ADD, &(0, 0)).await?;

    let recorded = log.lock().clone();
    if recorded != vec![7, 8] {
        return Err(TestError::Assertion(format!("expected [7, 8], got {recorded:?}")));
    }
    client.dispose().await;
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

pub async fn run_unknown_method<F: TransportFactory>() {
    if let Err(e) = run_unknown_method_inner::<F>().await {
        panic!("run_unknown_method failed: {e}");
    }
}

async fn run_unknown_method_inner<F: TransportFactory>() -> Result<(), TestError> {
    const MISSING: MethodDescriptor = MethodDescriptor::new("Missing");

    let (service, _) = calculator_service(HubOptions::default());
    let (client, _server) = connect::<F, _>(&service, ReceiverTable::new(), test_client_options()).await?;

    match client.invoke::<_, i32>(MISSING, &()).await {
        Err(RpcError::Status { code, detail, .. }) => {
            if code != StatusCode::Unimplemented {
                return Err(TestError::Assertion(format!("expected Unimplemented, got {code}")));
            }
            let expected = format!(
                "StreamingHub method '{}' is not found in StreamingHub.",
                MISSING.id
            );
            if detail != expected {
                return Err(TestError::Assertion(format!("unexpected detail {detail:?}")));
            }
        }
        other => {
            return Err(TestError::Assertion(format!("expected Unimplemented, got {other:?}")));
        }
    }

    // The connection survives.
    let sum: i32 = client.invoke(ADD, &(1, 1)).await?;
    if sum != 2 {
        return Err(TestError::Assertion(format!("expected 2, got {sum}")));
    }
    client.dispose().await;
    Ok(())
}

pub async fn run_handler_errors<F: TransportFactory>() {
    if let Err(e) = run_handler_errors_inner::<F>().await {
        panic!("run_handler_errors failed: {e}");
    }
}

async fn run_handler_errors_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (service, _) = calculator_service(HubOptions::default());
    let (client, _server) = connect::<F, _>(&service, ReceiverTable::new(), test_client_options()).await?;

    match client.invoke::<_, ()>(REJECT, &13).await {
        Err(RpcError::Status { code: StatusCode::InvalidArgument, detail, .. }) => {
            if detail != "13 is not acceptable" {
                return Err(TestError::Assertion(format!("unexpected detail {detail:?}")));
            }
        }
        other => return Err(TestError::Assertion(format!("expected InvalidArgument, got {other:?}"))),
    }

    match client.invoke::<_, ()>(CRASH, &()).await {
        Err(RpcError::Status {
            code: StatusCode::Internal,
            detail,
            message,
        }) => {
            if detail != "An error occurred while processing handler 'Calculator/Crash'." {
                return Err(TestError::Assertion(format!("unexpected detail {detail:?}")));
            }
            if message.is_some() {
                return Err(TestError::Assertion("error text must stay on the server".into()));
            }
        }
        other => return Err(TestError::Assertion(format!("expected Internal, got {other:?}"))),
    }

    let sum: i32 = client.invoke(ADD, &(20, 22)).await?;
    if sum != 42 {
        return Err(TestError::Assertion(format!("expected 42, got {sum}")));
    }
    client.dispose().await;
    Ok(())
}

pub async fn run_error_detail<F: TransportFactory>() {
    if let Err(e) = run_error_detail_inner::<F>().await {
        panic!("run_error_detail failed: {e}");
    }
}

async fn run_error_detail_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (service, _) = calculator_service(HubOptions::default().with_return_error_detail(true));
    let (client, _server) = connect::<F, _>(&service, ReceiverTable::new(), test_client_options()).await?;

    match client.invoke::<_, ()>(BROKEN, &()).await {
        Err(RpcError::Status {
            code: StatusCode::Internal,
            message: Some(message),
            ..
        }) => {
            if message.is_empty() {
                return Err(TestError::Assertion("expected error text".into()));
            }
        }
        other => return Err(TestError::Assertion(format!("expected Internal with text, got {other:?}"))),
    }
    client.dispose().await;
    Ok(())
}

// ============================================================================
// Client results
// ============================================================================

pub async fn run_client_result<F: TransportFactory>() {
    if let Err(e) = run_client_result_inner::<F>().await {
        panic!("run_client_result failed: {e}");
    }
}

async fn run_client_result_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (service, _) = calculator_service(HubOptions::default());
    let receivers = ReceiverTable::new().on_client_result(CLIENT_NAME, |prefix: String| async move {
        Ok::<_, RpcError>(format!("{prefix}-client"))
    });
    let (client, _server) = connect::<F, _>(&service, receivers, test_client_options()).await?;

    let name: String = client.invoke(ASK_CLIENT, &"hello").await?;
    if name != "hello-client" {
        return Err(TestError::Assertion(format!("expected hello-client, got {name}")));
    }
    client.dispose().await;
    Ok(())
}

pub async fn run_client_result_unimplemented<F: TransportFactory>() {
    if let Err(e) = run_client_result_unimplemented_inner::<F>().await {
        panic!("run_client_result_unimplemented failed: {e}");
    }
}

async fn run_client_result_unimplemented_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (service, _) = calculator_service(HubOptions::default());
    let (client, _server) = connect::<F, _>(&service, ReceiverTable::new(), test_client_options()).await?;

    // The hub's client-result call fails, so the hub method fails with it.
    match client.invoke::<_, String>(ASK_CLIENT, &"hello").await {
        Err(RpcError::Status {
            code: StatusCode::Unimplemented,
            ..
        }) => {}
        other => return Err(TestError::Assertion(format!("expected Unimplemented, got {other:?}"))),
    }
    client.dispose().await;
    Ok(())
}

// ============================================================================
// Lifecycle
// ============================================================================

pub async fn run_dispose_cancels_pending<F: TransportFactory>() {
    if let Err(e) = run_dispose_cancels_pending_inner::<F>().await {
        panic!("run_dispose_cancels_pending failed: {e}");
    }
}

async fn run_dispose_cancels_pending_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (service, _) = calculator_service(HubOptions::default());
    let (client, _server) = connect::<F, _>(&service, ReceiverTable::new(), test_client_options()).await?;
    let client = Arc::new(client);

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.invoke::<_, i32>(SLOW_ADD, &(10_000u64, 1, 2)).await })
    };
    wait_until(|| client.session().pending_calls() == 1).await?;

    let reason = client.dispose().await;
    if reason != DisconnectReason::Disposed {
        return Err(TestError::Assertion(format!("expected Disposed, got {reason}")));
    }
    if client.state() != SessionState::Closed {
        return Err(TestError::Assertion(format!("expected Closed, got {}", client.state())));
    }

    let outcome = slow
        .await
        .map_err(|e| TestError::Setup(format!("call task failed: {e}")))?;
    match outcome {
        Err(RpcError::Disconnected(DisconnectReason::Disposed)) => {}
        other => return Err(TestError::Assertion(format!("expected cancellation, got {other:?}"))),
    }

    match client.invoke::<_, i32>(ADD, &(1, 2)).await {
        Err(e) if e.is_connection_lost() => {}
        other => return Err(TestError::Assertion(format!("call after dispose: {other:?}"))),
    }
    Ok(())
}

/// Poll `check` until it holds or a second passes.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> Result<(), TestError> {
    for _ in 0..100 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(TestError::Assertion("condition not reached in time".into()))
}

// ============================================================================
// Groups
// ============================================================================

pub async fn run_broadcast_except_sender<F: TransportFactory>(strategy: GroupStrategy) {
    if let Err(e) = run_broadcast_except_sender_inner::<F>(strategy).await {
        panic!("run_broadcast_except_sender({strategy:?}) failed: {e}");
    }
}

async fn run_broadcast_except_sender_inner<F: TransportFactory>(
    strategy: GroupStrategy,
) -> Result<(), TestError> {
    let service = chat_service(HubOptions::default()).with_groups(GroupRepository::new(strategy));

    let mut members: Vec<(HubClient, _)> = Vec::new();
    for user in ["A", "B", "C"] {
        let (receivers, inbox) = chat_receivers();
        let (client, _server) = connect::<F, _>(&service, receivers, test_client_options()).await?;
        let _: usize = client.invoke(JOIN, &("room-42", user)).await?;
        members.push((client, inbox));
    }
    let room = service
        .groups()
        .try_get("room-42")
        .ok_or_else(|| TestError::Assertion("room-42 should exist".into()))?;
    if room.member_count() != 3 {
        return Err(TestError::Assertion(format!("expected 3 members, got {}", room.member_count())));
    }

    let delivered: usize = members[0].0.invoke(SEND_MESSAGE, &"hi").await?;
    if delivered != 2 {
        return Err(TestError::Assertion(format!("expected 2 deliveries, got {delivered}")));
    }

    let expected = ChatMessage {
        user: "A".into(),
        text: "hi".into(),
    };
    for (_, inbox) in members.iter_mut().skip(1) {
        match recv_within(inbox, Duration::from_secs(2)).await {
            Some(message) if message == expected => {}
            other => return Err(TestError::Assertion(format!("expected {expected:?}, got {other:?}"))),
        }
    }
    if let Some(echo) = recv_within(&mut members[0].1, Duration::from_millis(100)).await {
        return Err(TestError::Assertion(format!("sender received its own message: {echo:?}")));
    }

    // Disconnecting members leave the room; the last one removes it.
    for (client, _) in &members {
        client.dispose().await;
    }
    wait_until(|| service.groups().try_get("room-42").is_none()).await?;
    Ok(())
}

pub async fn run_broadcast_survives_dead_member<F: TransportFactory>() {
    if let Err(e) = run_broadcast_survives_dead_member_inner::<F>().await {
        panic!("run_broadcast_survives_dead_member failed: {e}");
    }
}

async fn run_broadcast_survives_dead_member_inner<F: TransportFactory>() -> Result<(), TestError> {
    let groups: GroupRepository = GroupRepository::new(GroupStrategy::CopyOnWrite);
    let room = groups.get_or_add("room-7");

    let mut inboxes = Vec::new();
    for i in 0..4 {
        let (client_side, server_side) = F::connect_pair();
        let connection = Arc::new(streamhub::server::HubConnection::new(server_side));
        room.add(connection);
        if i == 0 {
            // A peer that vanished without a goodbye.
            client_side.close();
            drop(client_side);
        } else {
            inboxes.push(client_side);
        }
    }

    let delivered = room
        .write_all(ON_MESSAGE.id, &ChatMessage {
            user: "server".into(),
            text: "still here".into(),
        })
        .await
        .map_err(RpcError::from)?;
    if delivered < 3 {
        return Err(TestError::Assertion(format!("delivered to {delivered} of 3 live members")));
    }
    for inbox in &inboxes {
        let frame = tokio::time::timeout(Duration::from_secs(2), inbox.recv_frame())
            .await
            .map_err(|_| TestError::Assertion("live member received nothing".into()))?
            .map_err(RpcError::from)?;
        let decoded = streamhub_core::Frame::decode(&frame, streamhub_core::Origin::Server)
            .map_err(RpcError::from)?;
        if !matches!(decoded, streamhub_core::Frame::Broadcast { method_id, .. } if method_id == ON_MESSAGE.id) {
            return Err(TestError::Assertion(format!("unexpected frame {decoded:?}")));
        }
    }
    Ok(())
}
