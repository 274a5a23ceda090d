use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use futures_timeout::TimeoutExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use streamhub_core::{
    BufferPool, DisconnectReason, FrameHead, MessagePackSerializer, MethodDescriptor,
    PayloadSerializer, PendingGuard, PendingTable, RpcError,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::heartbeat::HeartbeatHandle;
use super::{ConnectionId, HubConnection};
use crate::group::{Group, GroupRepository};

/// Everything a hub method can reach about its own connection.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct HubContext {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    hub_name: Arc<str>,
    connection: Arc<HubConnection>,
    groups: GroupRepository,
    joined: Mutex<Vec<Arc<Group>>>,
    pub(crate) client_results: PendingTable<Uuid>,
    client_result_timeout: Duration,
    pub(crate) shutdown: CancellationToken,
    pub(crate) heartbeat: OnceLock<HeartbeatHandle>,
}

impl std::fmt::Debug for HubContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubContext")
            .field("hub", &self.inner.hub_name)
            .field("connection_id", &self.inner.connection.id())
            .finish_non_exhaustive()
    }
}

impl HubContext {
    pub(crate) fn new(
        hub_name: Arc<str>,
        connection: Arc<HubConnection>,
        groups: GroupRepository,
        max_pending: usize,
        client_result_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                hub_name,
                connection,
                groups,
                joined: Mutex::new(Vec::new()),
                client_results: PendingTable::new(max_pending),
                client_result_timeout,
                shutdown: CancellationToken::new(),
                heartbeat: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &ContextInner {
        &self.inner
    }

    pub fn hub_name(&self) -> &str {
        &self.inner.hub_name
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection.id()
    }

    pub fn connection(&self) -> &Arc<HubConnection> {
        &self.inner.connection
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        self.inner.connection.buffer_pool()
    }

    pub fn groups(&self) -> &GroupRepository {
        &self.inner.groups
    }

    /// Join `name`, creating the group if needed. The connection leaves it
    /// automatically when it disconnects.
    pub fn join(&self, name: &str) -> Arc<Group> {
        let group = self.inner.groups.get_or_add(name);
        if group.add(self.inner.connection.clone()) {
            self.inner.joined.lock().push(group.clone());
        }
        group
    }

    pub fn leave(&self, group: &Group) -> bool {
        let id = self.connection_id();
        self.inner
            .joined
            .lock()
            .retain(|g| !std::ptr::eq(Arc::as_ptr(g), group));
        group.remove(id)
    }

    pub(crate) fn leave_all(&self) {
        let joined = std::mem::take(&mut *self.inner.joined.lock());
        let id = self.connection_id();
        for group in joined {
            group.remove(id);
        }
    }

    /// Calls into this connection's client.
    pub fn client(&self) -> ClientProxy {
        ClientProxy {
            ctx: self.clone(),
            _serializer: PhantomData,
        }
    }

    /// Latest heartbeat round trip, when server heartbeats are enabled.
    pub fn latency(&self) -> Option<Duration> {
        self.inner.heartbeat.get().and_then(|h| h.latency())
    }

    pub fn last_heartbeat_received_at(&self) -> Option<SystemTime> {
        self.inner.heartbeat.get().and_then(|h| h.last_received_at())
    }

    /// Cancelled once the connection is shutting down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Ask the session to close this connection.
    pub fn disconnect(&self) {
        self.inner.shutdown.cancel();
    }

    pub(crate) fn fail_client_results(&self, reason: &DisconnectReason) -> usize {
        self.inner.client_results.fail_all(reason.clone())
    }
}

/// Typed calls from a hub into its connected client, answered with a value.
pub struct ClientProxy<S = MessagePackSerializer> {
    ctx: HubContext,
    _serializer: PhantomData<fn() -> S>,
}

impl<S: PayloadSerializer> ClientProxy<S> {
    /// Invoke a client-result method on the receiver and wait for its answer.
    pub async fn invoke<A, R>(&self, method: MethodDescriptor, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let inner = self.ctx.inner();
        let client_call_id = Uuid::new_v4();
        let rx = inner.client_results.register(client_call_id)?;
        let mut guard = PendingGuard::new(&inner.client_results, client_call_id);

        let frame = FrameHead::ClientResultRequest {
            client_call_id,
            method_id: method.id,
        }
        .encode::<S, A>(self.ctx.buffer_pool(), args)?;
        inner.connection.write(frame).await?;
        tracing::debug!(
            %client_call_id,
            method = method.name,
            method_id = method.id,
            "client result: request sent"
        );

        let received = match rx.timeout(inner.client_result_timeout).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                return Err(RpcError::Disconnected(DisconnectReason::Faulted(
                    "client result waiter dropped".into(),
                )));
            }
            Err(_elapsed) => {
                tracing::warn!(
                    %client_call_id,
                    method = method.name,
                    timeout_ms = inner.client_result_timeout.as_millis() as u64,
                    "client result: timed out"
                );
                return Err(RpcError::DeadlineExceeded);
            }
        };
        guard.disarm();

        let payload = received?;
        S::deserialize(&payload).map_err(RpcError::from)
    }
}
