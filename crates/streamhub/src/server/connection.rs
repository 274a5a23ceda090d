//! Server-side handle to one connected peer.

use bytes::Bytes;
use streamhub_core::{BufferPool, Transport, TransportError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Stable identity of a connection, unique per process.
pub type ConnectionId = Uuid;

/// The write side of one hub connection.
///
/// Every write acquires the connection's own lock, so a broadcast from a
/// group, a heartbeat and a response on the same connection never interleave
/// on the wire.
#[derive(Debug)]
pub struct HubConnection {
    id: ConnectionId,
    transport: Transport,
    write_lock: tokio::sync::Mutex<()>,
    closed: CancellationToken,
}

impl HubConnection {
    pub fn new(transport: Transport) -> Self {
        Self::with_id(Uuid::new_v4(), transport)
    }

    pub fn with_id(id: ConnectionId, transport: Transport) -> Self {
        Self {
            id,
            transport,
            write_lock: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Write one encoded message. Fails with `Closed` once the connection ended.
    pub async fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let _guard = self.write_lock.lock().await;
        self.transport.send_frame(frame).await
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        self.transport.buffer_pool()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Finish the outbound stream and refuse further writes.
    pub(crate) async fn close(&self) {
        self.closed.cancel();
        {
            let _guard = self.write_lock.lock().await;
            if let Err(e) = self.transport.complete().await {
                tracing::debug!(connection_id = %self.id, error = %e, "complete on close failed");
            }
        }
        self.transport.close();
    }
}
