//! Server-initiated heartbeats.
//!
//! One timer per manager ticks for every registered connection. Each tick
//! encodes a single `ServerHeartbeat` and writes it to all connections, then
//! arms each connection's timeout. A `ServerHeartbeatResponse` carrying the
//! awaited sequence disarms it and records the latency. A connection whose
//! timeout fires is cancelled.
//!
//! The timer starts with the first registration and stops with the last.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use streamhub_core::{BufferPool, Frame, nil_payload};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{ConnectionId, HubConnection};
use crate::config::HeartbeatMetadataProvider;
use crate::timer::TimeoutTimer;

/// Milliseconds since the Unix epoch, as carried in heartbeat frames.
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct HeartbeatManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    interval: Duration,
    timeout: Option<Duration>,
    metadata: Option<HeartbeatMetadataProvider>,
    handles: DashMap<ConnectionId, Arc<HandleState>>,
    ticker: Mutex<Option<AbortHandle>>,
    buffer_pool: BufferPool,
}

struct HandleState {
    connection: Arc<HubConnection>,
    timer: TimeoutTimer,
    probe: Mutex<Probe>,
}

#[derive(Default)]
struct Probe {
    waiting_sequence: Option<i16>,
    sent_at: Option<Instant>,
    latency: Option<Duration>,
    last_received_at: Option<SystemTime>,
}

impl HandleState {
    fn restart_timeout(&self, sequence: i16, sent_at: Instant) {
        let mut probe = self.probe.lock();
        probe.waiting_sequence = Some(sequence);
        probe.sent_at = Some(sent_at);
        self.timer.arm();
    }

    fn ack(&self, sequence: i16) -> Option<Duration> {
        let mut probe = self.probe.lock();
        if probe.waiting_sequence != Some(sequence) {
            return None;
        }
        let latency = probe.sent_at?.elapsed();
        probe.latency = Some(latency);
        probe.last_received_at = Some(SystemTime::now());
        probe.waiting_sequence = None;
        self.timer.disarm();
        Some(latency)
    }
}

impl HeartbeatManager {
    /// `timeout: None` sends heartbeats without ever timing out a connection.
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Self::with_metadata(interval, timeout, None)
    }

    pub fn with_metadata(
        interval: Duration,
        timeout: Option<Duration>,
        metadata: Option<HeartbeatMetadataProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                interval,
                timeout,
                metadata,
                handles: DashMap::new(),
                ticker: Mutex::new(None),
                buffer_pool: BufferPool::new(),
            }),
        }
    }

    /// Start probing `connection`. `timeout_token` is cancelled if it stops answering.
    pub fn register(
        &self,
        connection: Arc<HubConnection>,
        timeout_token: CancellationToken,
    ) -> HeartbeatHandle {
        let id = connection.id();
        let state = Arc::new(HandleState {
            connection,
            timer: TimeoutTimer::new(self.inner.timeout, timeout_token),
            probe: Mutex::new(Probe::default()),
        });
        self.inner.handles.insert(id, state.clone());
        self.ensure_ticker();
        tracing::debug!(connection_id = %id, "heartbeat: registered");
        HeartbeatHandle {
            id,
            state,
            manager: Arc::downgrade(&self.inner),
        }
    }

    pub fn registered(&self) -> usize {
        self.inner.handles.len()
    }

    /// True while the shared timer is ticking.
    pub fn is_running(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    fn ensure_ticker(&self) {
        let mut ticker = self.inner.ticker.lock();
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        tracing::debug!(
            interval = ?self.inner.interval,
            timeout = ?self.inner.timeout,
            "heartbeat: timer started"
        );
        let task = tokio::spawn(run_ticker(Arc::downgrade(&self.inner), self.inner.interval));
        *ticker = Some(task.abort_handle());
    }
}

impl ManagerInner {
    fn unregister(&self, id: ConnectionId) {
        if self.handles.remove(&id).is_none() {
            return;
        }
        tracing::debug!(connection_id = %id, "heartbeat: unregistered");
        let mut ticker = self.ticker.lock();
        // Re-checked under the ticker lock so a concurrent register keeps the timer.
        if self.handles.is_empty() {
            if let Some(task) = ticker.take() {
                task.abort();
                tracing::debug!("heartbeat: timer stopped");
            }
        }
    }
}

async fn run_ticker(manager: Weak<ManagerInner>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence: i16 = 0;

    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };

        let metadata: Bytes = manager
            .metadata
            .as_ref()
            .map(|provide| provide())
            .unwrap_or_else(nil_payload);
        let frame = Frame::ServerHeartbeat {
            sequence,
            sent_at: unix_millis(),
            metadata,
        };
        let encoded = match frame.encode(&manager.buffer_pool) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat: encode failed");
                continue;
            }
        };

        let now = Instant::now();
        let targets: Vec<Arc<HandleState>> =
            manager.handles.iter().map(|e| e.value().clone()).collect();
        tracing::trace!(sequence, connections = targets.len(), "heartbeat: sending");
        for target in &targets {
            target.restart_timeout(sequence, now);
        }
        drop(manager);

        // Writes run off the ticker so a stuck connection cannot delay the next tick.
        tokio::spawn(async move {
            let writes = targets.iter().map(|target| {
                let encoded = encoded.clone();
                async move {
                    if let Err(e) = target.connection.write(encoded).await {
                        tracing::debug!(
                            connection_id = %target.connection.id(),
                            error = %e,
                            "heartbeat: write failed"
                        );
                    }
                }
            });
            futures::future::join_all(writes).await;
        });

        sequence = sequence.wrapping_add(1);
    }
}

/// Per-connection registration with a [`HeartbeatManager`]. Unregisters on drop.
pub struct HeartbeatHandle {
    id: ConnectionId,
    state: Arc<HandleState>,
    manager: Weak<ManagerInner>,
}

impl HeartbeatHandle {
    /// Handle a `ServerHeartbeatResponse`. Returns the measured latency when
    /// `sequence` is the one awaited.
    pub fn ack(&self, sequence: i16) -> Option<Duration> {
        let latency = self.state.ack(sequence);
        match latency {
            Some(latency) => {
                tracing::trace!(connection_id = %self.id, sequence, ?latency, "heartbeat: ack")
            }
            None => {
                tracing::trace!(connection_id = %self.id, sequence, "heartbeat: stale ack ignored")
            }
        }
        latency
    }

    /// Round-trip time of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.state.probe.lock().latency
    }

    pub fn last_received_at(&self) -> Option<SystemTime> {
        self.state.probe.lock().last_received_at
    }

    pub fn timeout_token(&self) -> &CancellationToken {
        self.state.timer.token()
    }

    pub fn has_timed_out(&self) -> bool {
        self.state.timer.has_fired()
    }

    pub fn unregister(&self) {
        self.state.timer.disarm();
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(self.id);
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use streamhub_core::{Origin, Transport};

    use super::*;

    fn connection() -> (Arc<HubConnection>, Transport) {
        let (local, remote) = Transport::mem_pair();
        (Arc::new(HubConnection::new(local)), remote)
    }

    async fn next_heartbeat(remote: &Transport) -> (i16, i64) {
        let bytes = remote.recv_frame().await.unwrap();
        match Frame::decode(&bytes, Origin::Server).unwrap() {
            Frame::ServerHeartbeat {
                sequence, sent_at, ..
            } => (sequence, sent_at),
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timer_runs_only_while_connections_are_registered() {
        let manager = HeartbeatManager::new(Duration::from_millis(20), None);
        assert!(!manager.is_running());

        let (a, _ra) = connection();
        let (b, _rb) = connection();
        let ha = manager.register(a, CancellationToken::new());
        let hb = manager.register(b, CancellationToken::new());
        assert!(manager.is_running());
        assert_eq!(manager.registered(), 2);

        drop(ha);
        assert!(manager.is_running());
        hb.unregister();
        assert_eq!(manager.registered(), 0);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn matching_ack_records_latency_and_prevents_timeout() {
        let manager = HeartbeatManager::new(Duration::from_millis(20), Some(Duration::from_millis(200)));
        let (conn, remote) = connection();
        let handle = manager.register(conn, CancellationToken::new());

        let (first, sent_at) = next_heartbeat(&remote).await;
        assert_eq!(first, 0);
        assert!(sent_at > 0);
        assert!(handle.ack(first.wrapping_add(5)).is_none());
        assert!(handle.ack(first).is_some());
        assert!(handle.latency().is_some());
        assert!(handle.last_received_at().is_some());

        let (second, _) = next_heartbeat(&remote).await;
        assert_eq!(second, 1);
        handle.ack(second);
        assert!(!handle.has_timed_out());
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let manager = HeartbeatManager::new(Duration::from_millis(10), Some(Duration::from_millis(40)));
        let (conn, _remote) = connection();
        let token = CancellationToken::new();
        let _handle = manager.register(conn, token.clone());

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("heartbeat timeout should cancel the connection");
    }

    #[tokio::test]
    async fn metadata_provider_fills_the_payload() {
        let manager = HeartbeatManager::with_metadata(
            Duration::from_millis(10),
            None,
            Some(Arc::new(|| Bytes::from_static(&[0xa2, b'h', b'i']))),
        );
        let (conn, remote) = connection();
        let _handle = manager.register(conn, CancellationToken::new());

        let bytes = remote.recv_frame().await.unwrap();
        match Frame::decode(&bytes, Origin::Server).unwrap() {
            Frame::ServerHeartbeat { metadata, .. } => {
                assert_eq!(&metadata[..], &[0xa2, b'h', b'i'])
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }
}
