//! Per-connection hub session.
//!
//! The read loop decodes client frames. Requests go through a bounded queue
//! to a single worker, so one connection's handlers run in arrival order.
//! Client-result replies and heartbeats are handled by the read loop itself,
//! which lets a handler await its client without stalling the connection.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use streamhub_core::{
    DecodeError, DisconnectReason, Frame, MethodId, Origin, RpcError, StatusCode, Transport,
    TransportError, method_path,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::dispatch::MethodTable;
use super::heartbeat::HeartbeatManager;
use super::{HubConnection, HubContext};
use crate::config::HubOptions;
use crate::group::GroupRepository;
use crate::panic_message;

/// Lifecycle hooks of a hub. A fresh hub value is created per connection.
///
/// A panicking hook is logged. In `on_connecting` it also rejects the
/// connection; the other hooks let the session carry on.
pub trait StreamingHub: Send + Sync + 'static {
    /// Runs before the handshake marker is sent.
    fn on_connecting(&self, _ctx: &HubContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Runs once the client can receive frames; broadcasting here is allowed.
    fn on_connected(&self, _ctx: &HubContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Runs after queued requests drained and the connection left its groups.
    fn on_disconnected(&self, _ctx: &HubContext) -> impl Future<Output = ()> + Send {
        async {}
    }
}

type HubFactory<H> = Arc<dyn Fn(&HubContext) -> H + Send + Sync>;

/// Serves connections for hubs of type `H`.
pub struct HubService<H> {
    hub_name: Arc<str>,
    table: Arc<MethodTable<H>>,
    factory: HubFactory<H>,
    groups: GroupRepository,
    heartbeat: Option<HeartbeatManager>,
    options: HubOptions,
}

impl<H> Clone for HubService<H> {
    fn clone(&self) -> Self {
        Self {
            hub_name: self.hub_name.clone(),
            table: self.table.clone(),
            factory: self.factory.clone(),
            groups: self.groups.clone(),
            heartbeat: self.heartbeat.clone(),
            options: self.options.clone(),
        }
    }
}

struct Inbound {
    /// `None` for fire-and-forget requests.
    call_id: Option<i32>,
    method_id: MethodId,
    args: Bytes,
}

impl<H: StreamingHub> HubService<H> {
    pub fn new(
        table: MethodTable<H>,
        factory: impl Fn(&HubContext) -> H + Send + Sync + 'static,
        options: HubOptions,
    ) -> Self {
        let heartbeat = options.heartbeat_interval.map(|interval| {
            HeartbeatManager::with_metadata(
                interval,
                options.heartbeat_timeout,
                options.heartbeat_metadata.clone(),
            )
        });
        Self {
            hub_name: Arc::from(table.hub_name()),
            table: Arc::new(table),
            factory: Arc::new(factory),
            groups: GroupRepository::default(),
            heartbeat,
            options,
        }
    }

    /// Share a group repository, e.g. to pick a strategy or reach groups from outside.
    pub fn with_groups(mut self, groups: GroupRepository) -> Self {
        self.groups = groups;
        self
    }

    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    pub fn groups(&self) -> &GroupRepository {
        &self.groups
    }

    pub fn heartbeat(&self) -> Option<&HeartbeatManager> {
        self.heartbeat.as_ref()
    }

    /// Serve one connection until it ends.
    pub async fn serve(&self, transport: Transport) -> DisconnectReason {
        let connection = Arc::new(HubConnection::new(transport.clone()));
        let ctx = HubContext::new(
            self.hub_name.clone(),
            connection.clone(),
            self.groups.clone(),
            streamhub_core::max_pending(),
            self.options.client_result_timeout,
        );
        let connection_id = connection.id();
        tracing::debug!(hub = %self.hub_name, %connection_id, "hub session: connecting");

        let hub = Arc::new((self.factory)(&ctx));
        if let Err(error) = guard_hook("on_connecting", hub.on_connecting(&ctx)).await {
            tracing::error!(hub = %self.hub_name, %connection_id, %error, "hub session: rejected while connecting");
            connection.close().await;
            return DisconnectReason::Faulted(error);
        }

        let marker = match Frame::handshake().encode(transport.buffer_pool()) {
            Ok(marker) => marker,
            Err(e) => return DisconnectReason::Faulted(e.to_string()),
        };
        if let Err(e) = connection.write(marker).await {
            tracing::warn!(hub = %self.hub_name, %connection_id, error = %e, "hub session: handshake write failed");
            connection.close().await;
            return DisconnectReason::Faulted(e.to_string());
        }

        let timeout_token = ctx.inner().shutdown.child_token();
        if let Some(manager) = &self.heartbeat {
            let handle = manager.register(connection.clone(), timeout_token.clone());
            let _ = ctx.inner().heartbeat.set(handle);
        }

        if let Err(error) = guard_hook("on_connected", hub.on_connected(&ctx)).await {
            tracing::error!(hub = %self.hub_name, %connection_id, %error, "hub session: connected hook failed");
        }
        tracing::debug!(hub = %self.hub_name, %connection_id, "hub session: connected");

        let (tx, rx) = mpsc::channel(self.options.request_queue_capacity);
        let mut worker = tokio::spawn(run_worker(
            self.table.clone(),
            hub.clone(),
            ctx.clone(),
            rx,
            self.options.return_error_detail,
        ));

        let reason = read_loop(&ctx, &transport, &timeout_token, tx).await;
        match &reason {
            DisconnectReason::TimedOut => {
                tracing::warn!(hub = %self.hub_name, %connection_id, "hub session: heartbeat timed out")
            }
            DisconnectReason::Faulted(error) => {
                tracing::error!(hub = %self.hub_name, %connection_id, %error, "hub session: faulted")
            }
            _ => tracing::debug!(hub = %self.hub_name, %connection_id, %reason, "hub session: ending"),
        }

        // Nothing can answer a client result any more.
        ctx.fail_client_results(&reason);

        if tokio::time::timeout(self.options.drain_timeout, &mut worker)
            .await
            .is_err()
        {
            tracing::warn!(hub = %self.hub_name, %connection_id, "hub session: request queue did not drain in time");
            worker.abort();
        }

        if let Some(handle) = ctx.inner().heartbeat.get() {
            handle.unregister();
        }
        ctx.leave_all();
        if let Err(error) = guard_hook("on_disconnected", hub.on_disconnected(&ctx)).await {
            tracing::error!(hub = %self.hub_name, %connection_id, %error, "hub session: disconnected hook failed");
        }

        ctx.inner().shutdown.cancel();
        connection.close().await;
        tracing::debug!(hub = %self.hub_name, %connection_id, %reason, "hub session: closed");
        reason
    }
}

/// Run a lifecycle hook, turning a panic into an error message.
async fn guard_hook(hook: &str, fut: impl Future<Output = ()>) -> Result<(), String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| format!("{hook}: {}", panic_message(panic.as_ref())))
}

/// Resolves when the session should stop for a local reason.
async fn stopped(shutdown: &CancellationToken, timed_out: &CancellationToken) -> DisconnectReason {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => DisconnectReason::Disposed,
        _ = timed_out.cancelled() => DisconnectReason::TimedOut,
    }
}

async fn read_loop(
    ctx: &HubContext,
    transport: &Transport,
    timed_out: &CancellationToken,
    requests: mpsc::Sender<Inbound>,
) -> DisconnectReason {
    let inner = ctx.inner();
    loop {
        let received = tokio::select! {
            biased;
            reason = stopped(&inner.shutdown, timed_out) => return reason,
            received = transport.recv_frame() => received,
        };
        let bytes = match received {
            Ok(bytes) => bytes,
            Err(TransportError::Closed) => return DisconnectReason::CompletedNormally,
            Err(e) => return DisconnectReason::Faulted(e.to_string()),
        };
        let frame = match Frame::decode(&bytes, Origin::Client) {
            Ok(frame) => frame,
            Err(e) => return framing_error(e),
        };

        let inbound = match frame {
            Frame::Request { method_id, args } => Inbound {
                call_id: None,
                method_id,
                args,
            },
            Frame::RequestWithResponse {
                call_id,
                method_id,
                args,
            } => Inbound {
                call_id: Some(call_id),
                method_id,
                args,
            },
            Frame::ClientResultResponse {
                client_call_id,
                result,
                ..
            } => {
                inner.client_results.complete(client_call_id, Ok(result));
                continue;
            }
            Frame::ClientResultResponseError {
                client_call_id,
                status,
                detail,
                message,
                ..
            } => {
                inner.client_results.complete(
                    client_call_id,
                    Err(RpcError::Status {
                        code: status,
                        detail,
                        message,
                    }),
                );
                continue;
            }
            Frame::ServerHeartbeatResponse { sequence, .. } => {
                if let Some(handle) = inner.heartbeat.get() {
                    handle.ack(sequence);
                }
                continue;
            }
            Frame::ClientHeartbeat {
                sequence,
                sent_at,
                extra,
            } => {
                let reply = Frame::ClientHeartbeatResponse {
                    sequence,
                    sent_at,
                    extra,
                };
                write_frame(ctx, &reply).await;
                continue;
            }
            other => {
                tracing::warn!(frame = ?other, "hub session: ignoring server-bound frame kind");
                continue;
            }
        };

        tracing::trace!(
            call_id = ?inbound.call_id,
            method_id = inbound.method_id,
            "hub session: request queued"
        );
        tokio::select! {
            biased;
            reason = stopped(&inner.shutdown, timed_out) => return reason,
            sent = requests.send(inbound) => {
                if sent.is_err() {
                    return DisconnectReason::Faulted("request worker stopped".into());
                }
            }
        }
    }
}

fn framing_error(error: DecodeError) -> DisconnectReason {
    DisconnectReason::Faulted(format!("framing error: {error}"))
}

async fn write_frame(ctx: &HubContext, frame: &Frame) {
    let encoded = match frame.encode(ctx.buffer_pool()) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::warn!(error = %e, "hub session: failed to encode reply");
            return;
        }
    };
    if let Err(e) = ctx.connection().write(encoded).await {
        tracing::debug!(connection_id = %ctx.connection_id(), error = %e, "hub session: write failed");
    }
}

async fn run_worker<H: StreamingHub>(
    table: Arc<MethodTable<H>>,
    hub: Arc<H>,
    ctx: HubContext,
    mut requests: mpsc::Receiver<Inbound>,
    return_error_detail: bool,
) {
    while let Some(request) = requests.recv().await {
        let Inbound {
            call_id,
            method_id,
            args,
        } = request;

        let Some(entry) = table.get(method_id) else {
            tracing::warn!(hub = %table.hub_name(), method_id, "hub session: unknown method");
            if let Some(call_id) = call_id {
                let reply = Frame::ResponseWithError {
                    call_id,
                    status: StatusCode::Unimplemented,
                    detail: format!(
                        "StreamingHub method '{method_id}' is not found in StreamingHub."
                    ),
                    message: None,
                };
                write_frame(&ctx, &reply).await;
            }
            continue;
        };

        let method = entry.descriptor();
        let outcome = AssertUnwindSafe(entry.invoke(hub.clone(), ctx.clone(), args))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result.map_err(HandlerError::Rpc),
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        };

        let Some(call_id) = call_id else {
            if let Err(e) = result {
                tracing::warn!(
                    method = %method_path(table.hub_name(), method.name),
                    error = %e,
                    "hub session: fire-and-forget request failed"
                );
            }
            continue;
        };

        let reply = match result {
            Ok(payload) => Frame::Response {
                call_id,
                method_id,
                result: payload,
            },
            Err(error) => {
                let path = method_path(table.hub_name(), method.name);
                tracing::debug!(call_id, method = %path, %error, "hub session: handler failed");
                error_reply(call_id, &path, error, return_error_detail)
            }
        };
        write_frame(&ctx, &reply).await;
    }
}

enum HandlerError {
    Rpc(RpcError),
    Panicked(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Panicked(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

/// Status errors raised by the handler pass through; anything else is `Internal`.
fn error_reply(call_id: i32, path: &str, error: HandlerError, return_error_detail: bool) -> Frame {
    match error {
        HandlerError::Rpc(RpcError::Status {
            code,
            detail,
            message,
        }) => Frame::ResponseWithError {
            call_id,
            status: code,
            detail,
            message,
        },
        other => Frame::ResponseWithError {
            call_id,
            status: StatusCode::Internal,
            detail: format!("An error occurred while processing handler '{path}'."),
            message: return_error_detail.then(|| other.to_string()),
        },
    }
}
