//! Client side of a StreamingHub connection.
//!
//! A [`ClientSession`] runs three loops over one transport:
//!
//! - the **read loop** correlates responses, dispatches broadcasts and
//!   client-result requests, and answers heartbeats
//! - the **write loop** is the only writer; everything outbound goes through
//!   a [`WriteQueue`]
//! - the **heartbeat loop** sends periodic probes when enabled
//!
//! All of them stop on the session's shutdown token. The heartbeat timeout
//! token is a child of it, so a dead peer and an explicit dispose tear the
//! session down the same way.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures_timeout::TimeoutExt;
use parking_lot::Mutex;
use streamhub_core::{
    BufferPool, DisconnectReason, EncodeError, Frame, HandshakeError, MethodId, Origin,
    PROTOCOL_VERSION, PendingGuard, PendingTable, RpcError, StatusCode, Transport,
    TransportError, VERSION_HEADER, WriteQueue, WriteQueueReceiver, write_queue,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::ClientOptions;
use crate::panic_message;

mod heartbeat;
mod receiver;
mod stub;

use heartbeat::ClientHeartbeat;
pub use receiver::ReceiverTable;
use receiver::Receivers;
pub use stub::HubClient;

/// Lifecycle of a client session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A connected client session.
///
/// Dropping the session without [`dispose`](Self::dispose) still shuts its
/// loops down; only the wait for a clean flush is skipped.
pub struct ClientSession {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    hub_name: Arc<str>,
    transport: Transport,
    queue: WriteQueue,
    pending: PendingTable<i32>,
    receivers: Receivers,
    heartbeat: ClientHeartbeat,
    options: ClientOptions,
    state: watch::Sender<SessionState>,
    /// Why the session started draining.
    cause: Mutex<Option<DisconnectReason>>,
    /// Published once the session is closed.
    reason: watch::Sender<Option<DisconnectReason>>,
    shutdown: CancellationToken,
    /// Cancelled with a message when the write loop fails.
    write_failed: CancellationToken,
    write_error: Mutex<Option<String>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    tasks: TaskTracker,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("hub", &self.inner.hub_name)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl ClientSession {
    /// Wait for the server's version marker, then start the session loops.
    ///
    /// Fails without ever reaching [`SessionState::Active`] if the marker is
    /// missing or names another protocol version, or if the transport ends or
    /// faults before it arrives.
    pub async fn connect<S>(
        hub_name: &str,
        transport: Transport,
        receivers: ReceiverTable<S>,
        options: ClientOptions,
    ) -> Result<Self, HandshakeError>
    where
        S: streamhub_core::PayloadSerializer,
    {
        tracing::debug!(hub = hub_name, "client session: connecting");
        if let Err(e) = handshake(&transport, &options).await {
            tracing::warn!(hub = hub_name, error = %e, "client session: handshake failed");
            transport.close();
            return Err(e);
        }

        let shutdown = CancellationToken::new();
        let heartbeat = ClientHeartbeat::new(
            options.heartbeat_interval,
            options.heartbeat_timeout,
            shutdown.child_token(),
            options.on_server_heartbeat.clone(),
            options.on_client_heartbeat_response.clone(),
        );
        let (queue, outbound) = write_queue();
        let (state, _) = watch::channel(SessionState::Connecting);
        let (reason, _) = watch::channel(None);
        let inner = Arc::new(ClientInner {
            hub_name: Arc::from(hub_name),
            transport,
            queue,
            pending: PendingTable::new(options.max_pending),
            receivers: receivers.into_receivers(),
            heartbeat,
            options,
            state,
            cause: Mutex::new(None),
            reason,
            shutdown,
            write_failed: CancellationToken::new(),
            write_error: Mutex::new(None),
            writer: Mutex::new(None),
            tasks: TaskTracker::new(),
        });

        inner.state.send_replace(SessionState::Active);
        inner.start(outbound);
        tracing::debug!(hub = hub_name, "client session: active");
        Ok(Self { inner })
    }

    pub fn hub_name(&self) -> &str {
        &self.inner.hub_name
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Calls still waiting for their reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send a fire-and-forget request. Only fails if the session is no longer active.
    pub fn call(&self, method_id: MethodId, args: Bytes) -> Result<(), RpcError> {
        let frame = Frame::Request { method_id, args }.encode(self.buffer_pool())?;
        self.send(frame)
    }

    /// Send a request and wait for its response payload.
    pub async fn call_with_response(&self, method_id: MethodId, args: Bytes) -> Result<Bytes, RpcError> {
        self.request_with_response(method_id, |call_id, pool| {
            Frame::RequestWithResponse {
                call_id,
                method_id,
                args,
            }
            .encode(pool)
        })
        .await
    }

    pub(crate) fn buffer_pool(&self) -> &BufferPool {
        self.inner.transport.buffer_pool()
    }

    pub(crate) fn send(&self, frame: Bytes) -> Result<(), RpcError> {
        self.inner.ensure_active()?;
        self.inner.queue.enqueue(frame)
    }

    /// Register a call id, enqueue the frame `encode` builds for it, and wait
    /// for the matching reply.
    pub(crate) async fn request_with_response<E>(
        &self,
        method_id: MethodId,
        encode: E,
    ) -> Result<Bytes, RpcError>
    where
        E: FnOnce(i32, &BufferPool) -> Result<Bytes, EncodeError>,
    {
        let inner = &*self.inner;
        inner.ensure_active()?;
        let (call_id, rx) = inner.pending.register_next()?;
        let mut guard = PendingGuard::new(&inner.pending, call_id);

        let frame = encode(call_id, self.buffer_pool())?;
        inner.queue.enqueue(frame)?;
        tracing::debug!(call_id, method_id, "call: request sent");

        let received = match inner.options.call_timeout {
            Some(timeout) => match rx.timeout(timeout).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    tracing::warn!(
                        call_id,
                        method_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "call: timed out"
                    );
                    return Err(RpcError::DeadlineExceeded);
                }
            },
            None => rx.await,
        };
        guard.disarm();

        match received {
            Ok(result) => result,
            Err(_) => Err(RpcError::Disconnected(inner.reason_or(DisconnectReason::Disposed))),
        }
    }

    /// Drain the session and wait until it is closed.
    ///
    /// Pending calls fail with [`RpcError::Disconnected`]. Returns the reason the
    /// session ended, which is `Disposed` unless something else ended it first.
    pub async fn dispose(&self) -> DisconnectReason {
        self.inner.clone().teardown(DisconnectReason::Disposed).await;
        self.inner.tasks.close();
        if tokio::time::timeout(self.inner.options.shutdown_grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(hub = %self.inner.hub_name, "client session: loops still running after dispose");
        }
        self.wait_for_disconnect().await
    }

    /// Resolves once the session is closed.
    pub async fn wait_for_disconnect(&self) -> DisconnectReason {
        let mut rx = self.inner.reason.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(DisconnectReason::Disposed),
            Err(_) => DisconnectReason::Disposed,
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn handshake(transport: &Transport, options: &ClientOptions) -> Result<(), HandshakeError> {
    let bytes = match transport.recv_frame().timeout(options.connect_timeout).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(HandshakeError::ConnectFailed(e)),
        Err(_elapsed) => return Err(HandshakeError::TimedOut),
    };
    let headers = match Frame::decode(&bytes, Origin::Server) {
        Ok(Frame::Handshake { headers }) => headers,
        Ok(other) => {
            tracing::debug!(frame = ?other, "client session: first frame is not a version marker");
            return Err(HandshakeError::VersionMissing);
        }
        Err(e) => {
            tracing::debug!(error = %e, "client session: undecodable first frame");
            return Err(HandshakeError::VersionMissing);
        }
    };
    let version = headers
        .into_iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(VERSION_HEADER))
        .map(|(_, value)| value)
        .ok_or(HandshakeError::VersionMissing)?;
    if version != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            expected: PROTOCOL_VERSION.to_string(),
            actual: version,
        });
    }
    Ok(())
}

impl ClientInner {
    fn start(self: &Arc<Self>, outbound: WriteQueueReceiver) {
        let writer = {
            let inner = self.clone();
            self.tasks.spawn(async move {
                if let Err(e) = outbound.drain_into(&inner.transport).await {
                    tracing::warn!(hub = %inner.hub_name, error = %e, "client session: write loop failed");
                    *inner.write_error.lock() = Some(e.to_string());
                    inner.write_failed.cancel();
                }
            })
        };
        *self.writer.lock() = Some(writer);

        let inner = self.clone();
        self.tasks.spawn(async move {
            let reason = inner.read_loop().await;
            inner.teardown(reason).await;
        });

        if let Some(interval) = self.heartbeat.interval() {
            let inner = self.clone();
            self.tasks.spawn(async move { inner.heartbeat_loop(interval).await });
        }
    }

    fn ensure_active(&self) -> Result<(), RpcError> {
        match *self.state.borrow() {
            SessionState::Active => Ok(()),
            SessionState::Connecting => Err(RpcError::status(
                StatusCode::Unavailable,
                "session is not connected",
            )),
            SessionState::Draining | SessionState::Closed => {
                Err(RpcError::Disconnected(self.reason_or(DisconnectReason::Disposed)))
            }
        }
    }

    fn reason_or(&self, fallback: DisconnectReason) -> DisconnectReason {
        self.cause.lock().clone().unwrap_or(fallback)
    }

    async fn read_loop(self: &Arc<Self>) -> DisconnectReason {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return DisconnectReason::Disposed,
                _ = self.heartbeat.timed_out().cancelled() => return DisconnectReason::TimedOut,
                _ = self.write_failed.cancelled() => {
                    let error = self.write_error.lock().clone().unwrap_or_default();
                    return DisconnectReason::Faulted(error);
                }
                received = self.transport.recv_frame() => received,
            };
            let bytes = match received {
                Ok(bytes) => bytes,
                Err(TransportError::Closed) => return DisconnectReason::CompletedNormally,
                Err(e) => return DisconnectReason::Faulted(e.to_string()),
            };
            match Frame::decode(&bytes, Origin::Server) {
                Ok(frame) => self.route(frame),
                Err(e) => {
                    tracing::error!(hub = %self.hub_name, error = %e, "client session: framing error");
                    return DisconnectReason::Faulted(format!("framing error: {e}"));
                }
            }
        }
    }

    fn route(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Response {
                call_id, result, ..
            } => {
                tracing::trace!(call_id, "read loop: response");
                self.pending.complete(call_id, Ok(result));
            }
            Frame::ResponseWithError {
                call_id,
                status,
                detail,
                message,
            } => {
                tracing::trace!(call_id, %status, "read loop: error response");
                self.pending.complete(
                    call_id,
                    Err(RpcError::Status {
                        code: status,
                        detail,
                        message,
                    }),
                );
            }
            Frame::Broadcast { method_id, args } => self.on_broadcast(method_id, args),
            Frame::ClientResultRequest {
                client_call_id,
                method_id,
                args,
            } => self.on_client_result(client_call_id, method_id, args),
            Frame::ServerHeartbeat {
                sequence,
                sent_at,
                metadata,
            } => {
                let reply = self.heartbeat.on_server_heartbeat(sequence, sent_at, metadata);
                self.enqueue_frame(&reply);
            }
            Frame::ClientHeartbeatResponse {
                sequence, sent_at, ..
            } => {
                self.heartbeat.on_response(sequence, sent_at);
            }
            other => {
                tracing::warn!(frame = ?other, "read loop: ignoring client-bound frame kind");
            }
        }
    }

    fn on_broadcast(&self, method_id: MethodId, args: Bytes) {
        let Some((method, handler)) = self.receivers.broadcast(method_id) else {
            tracing::debug!(method_id, "read loop: broadcast without a receiver");
            return;
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(Ok(())) => tracing::trace!(method, "read loop: broadcast handled"),
            Ok(Err(e)) => tracing::warn!(method, error = %e, "read loop: broadcast payload rejected"),
            Err(panic) => {
                tracing::error!(method, panic = %panic_message(panic.as_ref()), "read loop: broadcast handler panicked")
            }
        }
    }

    /// Run the receiver off the read loop and enqueue its answer.
    fn on_client_result(self: &Arc<Self>, client_call_id: Uuid, method_id: MethodId, args: Bytes) {
        let Some((method, handler)) = self.receivers.client_result(method_id) else {
            tracing::warn!(%client_call_id, method_id, "read loop: client result method not found");
            self.enqueue_frame(&Frame::ClientResultResponseError {
                client_call_id,
                method_id,
                status: StatusCode::Unimplemented,
                detail: format!("Client result method '{method_id}' is not found in the receiver."),
                message: None,
            });
            return;
        };

        let call = handler(args, self.transport.buffer_pool().clone());
        let inner = self.clone();
        self.tasks.spawn(async move {
            let outcome = AssertUnwindSafe(call).catch_unwind().await;
            let reply = match outcome {
                Ok(Ok(result)) => Frame::ClientResultResponse {
                    client_call_id,
                    method_id,
                    result,
                },
                Ok(Err(RpcError::Status {
                    code,
                    detail,
                    message,
                })) => Frame::ClientResultResponseError {
                    client_call_id,
                    method_id,
                    status: code,
                    detail,
                    message,
                },
                Ok(Err(e)) => client_result_failure(client_call_id, method_id, method, e.to_string()),
                Err(panic) => client_result_failure(
                    client_call_id,
                    method_id,
                    method,
                    panic_message(panic.as_ref()),
                ),
            };
            tracing::debug!(%client_call_id, method, "client result: answered");
            inner.enqueue_frame(&reply);
        });
    }

    fn enqueue_frame(&self, frame: &Frame) {
        let encoded = match frame.encode(self.transport.buffer_pool()) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, "client session: failed to encode frame");
                return;
            }
        };
        if let Err(e) = self.queue.enqueue(encoded) {
            tracing::debug!(error = %e, "client session: dropping frame after shutdown");
        }
    }

    async fn heartbeat_loop(&self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let probe = self.heartbeat.next_probe();
            let encoded = match probe.encode(self.transport.buffer_pool()) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::warn!(error = %e, "client heartbeat: failed to encode probe");
                    continue;
                }
            };
            if self.queue.enqueue(encoded).is_err() {
                break;
            }
        }
        tracing::debug!(hub = %self.hub_name, "client heartbeat: loop stopped");
    }

    /// Move to `Draining`, fail pending calls, flush the write queue, then close.
    ///
    /// Only the first caller does the work; later calls return immediately.
    async fn teardown(self: Arc<Self>, reason: DisconnectReason) {
        let started = self.state.send_if_modified(|state| match state {
            SessionState::Connecting | SessionState::Active => {
                *state = SessionState::Draining;
                true
            }
            SessionState::Draining | SessionState::Closed => false,
        });
        if !started {
            return;
        }
        *self.cause.lock() = Some(reason.clone());
        match &reason {
            DisconnectReason::Faulted(error) => {
                tracing::error!(hub = %self.hub_name, %error, "client session: draining after fault")
            }
            DisconnectReason::TimedOut => {
                tracing::warn!(hub = %self.hub_name, "client session: heartbeat timed out; draining")
            }
            _ => tracing::debug!(hub = %self.hub_name, %reason, "client session: draining"),
        }

        self.shutdown.cancel();
        self.heartbeat.stop();
        let cancelled = self.pending.fail_all(reason.clone());
        if cancelled > 0 {
            tracing::debug!(hub = %self.hub_name, cancelled, "client session: pending calls cancelled");
        }

        self.queue.complete();
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(self.options.shutdown_grace, &mut writer)
                .await
                .is_err()
            {
                tracing::warn!(hub = %self.hub_name, "client session: write loop did not flush in time");
                writer.abort();
            }
        }
        self.transport.close();

        self.reason.send_replace(Some(reason.clone()));
        self.state.send_replace(SessionState::Closed);
        tracing::debug!(hub = %self.hub_name, %reason, "client session: closed");
    }
}

fn client_result_failure(
    client_call_id: Uuid,
    method_id: MethodId,
    method: &str,
    error: String,
) -> Frame {
    tracing::warn!(%client_call_id, method, %error, "client result: handler failed");
    Frame::ClientResultResponseError {
        client_call_id,
        method_id,
        status: StatusCode::Internal,
        detail: format!("An error occurred while processing client result method '{method}'."),
        message: Some(error),
    }
}
