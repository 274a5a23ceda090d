//! streamhub-testkit: shared hubs, receivers and scenarios for streamhub tests.
//!
//! Scenarios are generic over a [`TransportFactory`] so every transport runs
//! the same suite:
//!
//! ```ignore
//! #[tokio::test]
//! async fn mem_add_happy_path() {
//!     streamhub_testkit::run_add_happy_path::<MemFactory>().await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use streamhub::server::{HubContext, MethodTable};
use streamhub::{
    ClientOptions, DisconnectReason, Group, HubClient, HubOptions, HubService, ReceiverTable,
    StreamingHub,
};
use streamhub_core::{MethodDescriptor, RpcError, StatusCode, Transport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod scenarios;
pub use scenarios::*;

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    Setup(String),
    Rpc(RpcError),
    Handshake(streamhub_core::HandshakeError),
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {msg}"),
            TestError::Rpc(e) => write!(f, "RPC error: {e}"),
            TestError::Handshake(e) => write!(f, "handshake error: {e}"),
            TestError::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpcError> for TestError {
    fn from(e: RpcError) -> Self {
        TestError::Rpc(e)
    }
}

impl From<streamhub_core::HandshakeError> for TestError {
    fn from(e: streamhub_core::HandshakeError) -> Self {
        TestError::Handshake(e)
    }
}

/// Creates connected transport pairs.
pub trait TransportFactory: Send + Sync + 'static {
    /// Returns `(client_side, server_side)`.
    fn connect_pair() -> (Transport, Transport);
}

pub struct MemFactory;

impl TransportFactory for MemFactory {
    fn connect_pair() -> (Transport, Transport) {
        Transport::mem_pair()
    }
}

/// Length-prefixed frames over an in-process duplex byte stream.
pub struct StreamFactory;

impl TransportFactory for StreamFactory {
    fn connect_pair() -> (Transport, Transport) {
        Transport::stream_pair()
    }
}

/// Serve one connection of `service` on a background task and return the
/// client half plus the task yielding the server's disconnect reason.
pub fn serve<F, H>(service: &HubService<H>) -> (Transport, JoinHandle<DisconnectReason>)
where
    F: TransportFactory,
    H: StreamingHub,
{
    let (client, server) = F::connect_pair();
    let service = service.clone();
    let task = tokio::spawn(async move { service.serve(server).await });
    (client, task)
}

/// Serve one connection and connect a typed client to it.
pub async fn connect<F, H>(
    service: &HubService<H>,
    receivers: ReceiverTable,
    options: ClientOptions,
) -> Result<(HubClient, JoinHandle<DisconnectReason>), TestError>
where
    F: TransportFactory,
    H: StreamingHub,
{
    let (transport, server) = serve::<F, H>(service);
    let client = HubClient::connect(service.hub_name(), transport, receivers, options).await?;
    Ok((client, server))
}

/// Client options for tests: no heartbeats, short grace, bounded calls.
pub fn test_client_options() -> ClientOptions {
    ClientOptions::default()
        .with_heartbeat_interval(None)
        .with_call_timeout(Some(Duration::from_secs(10)))
        .with_shutdown_grace(Duration::from_millis(500))
}

// ============================================================================
// Test hub: Calculator
// ============================================================================

pub const ADD: MethodDescriptor = MethodDescriptor::new("Add");
/// `(delay_ms, a, b)`: sleeps, then adds.
pub const SLOW_ADD: MethodDescriptor = MethodDescriptor::new("SlowAdd");
/// Fire-and-forget: appends its argument to the hub's log.
pub const RECORD: MethodDescriptor = MethodDescriptor::new("Record");
/// Fails with `InvalidArgument`.
pub const REJECT: MethodDescriptor = MethodDescriptor::new("Reject");
/// Fails with a non-status error.
pub const BROKEN: MethodDescriptor = MethodDescriptor::new("Broken");
pub const CRASH: MethodDescriptor = MethodDescriptor::new("Crash");
/// Asks the calling client for its name through a client result.
pub const ASK_CLIENT: MethodDescriptor = MethodDescriptor::new("AskClient");
/// Latest server heartbeat round trip in milliseconds, if any.
pub const LATENCY: MethodDescriptor = MethodDescriptor::new("Latency");

/// Client-result method implemented by test receivers.
pub const CLIENT_NAME: MethodDescriptor = MethodDescriptor::new("GetClientName");

pub struct Calculator {
    log: Arc<Mutex<Vec<i32>>>,
}

impl StreamingHub for Calculator {}

impl Calculator {
    /// Hub factory sharing `log` across connections.
    pub fn factory(log: Arc<Mutex<Vec<i32>>>) -> impl Fn(&HubContext) -> Calculator + Send + Sync + 'static {
        move |_: &HubContext| Calculator { log: log.clone() }
    }
}

pub fn calculator_table() -> MethodTable<Calculator> {
    MethodTable::<Calculator>::builder("Calculator")
        .method(ADD, |_hub, _ctx, (a, b): (i32, i32)| async move {
            Ok::<_, RpcError>(a + b)
        })
        .method(SLOW_ADD, |_hub, _ctx, (delay_ms, a, b): (u64, i32, i32)| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok::<_, RpcError>(a + b)
        })
        .method(RECORD, |hub: Arc<Calculator>, _ctx, value: i32| async move {
            hub.log.lock().push(value);
            Ok::<_, RpcError>(())
        })
        .method(REJECT, |_hub, _ctx, value: i32| async move {
            Err::<(), _>(RpcError::status(
                StatusCode::InvalidArgument,
                format!("{value} is not acceptable"),
            ))
        })
        .method(BROKEN, |_hub, _ctx, (): ()| async move {
            Err::<(), _>(RpcError::Disposed)
        })
        .method(CRASH, |_hub, _ctx, (): ()| async move { explode() })
        .method(ASK_CLIENT, |_hub, ctx: HubContext, prefix: String| async move {
            ctx.client().invoke::<_, String>(CLIENT_NAME, &prefix).await
        })
        .method(LATENCY, |_hub, ctx: HubContext, (): ()| async move {
            Ok::<_, RpcError>(ctx.latency().map(|d| d.as_millis() as u64))
        })
        .build()
        .expect("calculator methods have distinct ids")
}

fn explode() -> Result<(), RpcError> {
    panic!("calculator exploded")
}

pub fn calculator_service(options: HubOptions) -> (HubService<Calculator>, Arc<Mutex<Vec<i32>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let service = HubService::new(calculator_table(), Calculator::factory(log.clone()), options);
    (service, log)
}

// ============================================================================
// Test hub: Chat
// ============================================================================

/// `(room, user)`
pub const JOIN: MethodDescriptor = MethodDescriptor::new("JoinAsync");
pub const LEAVE: MethodDescriptor = MethodDescriptor::new("LeaveAsync");
/// Broadcast `text` to everyone else in the room.
pub const SEND_MESSAGE: MethodDescriptor = MethodDescriptor::new("SendMessage");
/// Receiver method: `(user, text)`.
pub const ON_MESSAGE: MethodDescriptor = MethodDescriptor::new("OnMessage");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user: String,
    pub text: String,
}

#[derive(Default)]
pub struct ChatHub {
    room: Mutex<Option<(Arc<Group>, String)>>,
}

impl StreamingHub for ChatHub {
    async fn on_disconnected(&self, ctx: &HubContext) {
        if let Some((group, user)) = self.room.lock().take() {
            tracing::debug!(room = group.name(), user = %user, connection_id = %ctx.connection_id(), "chat: member left");
        }
    }
}

pub fn chat_table() -> MethodTable<ChatHub> {
    MethodTable::<ChatHub>::builder("ChatHub")
        .method(JOIN, |hub: Arc<ChatHub>, ctx: HubContext, (room, user): (String, String)| async move {
            let group = ctx.join(&room);
            *hub.room.lock() = Some((group.clone(), user));
            Ok::<_, RpcError>(group.member_count())
        })
        .method(LEAVE, |hub: Arc<ChatHub>, ctx: HubContext, (): ()| async move {
            let joined = hub.room.lock().take();
            if let Some((group, _)) = joined {
                ctx.leave(&group);
            }
            Ok::<_, RpcError>(())
        })
        .method(SEND_MESSAGE, |hub: Arc<ChatHub>, ctx: HubContext, text: String| async move {
            let joined = hub.room.lock().clone();
            let Some((group, user)) = joined else {
                return Err(RpcError::status(StatusCode::FailedPrecondition, "join a room first"));
            };
            let message = ChatMessage { user, text };
            let delivered = group
                .write_except(ON_MESSAGE.id, &message, &[ctx.connection_id()])
                .await?;
            Ok(delivered)
        })
        .build()
        .expect("chat methods have distinct ids")
}

pub fn chat_service(options: HubOptions) -> HubService<ChatHub> {
    HubService::new(chat_table(), |_: &HubContext| ChatHub::default(), options)
}

/// Receivers forwarding every `OnMessage` broadcast into a channel.
pub fn chat_receivers() -> (ReceiverTable, mpsc::UnboundedReceiver<ChatMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let receivers = ReceiverTable::new().on(ON_MESSAGE, move |message: ChatMessage| {
        let _ = tx.send(message);
    });
    (receivers, rx)
}
