//! Client and hub options.
//!
//! Defaults can be overridden per process through `STREAMHUB_*` environment
//! variables; explicit builder calls win over both.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_CLIENT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_CLIENT_RESULT_TIMEOUT: Duration = Duration::from_secs(5);

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// A zero interval means "disabled".
fn nonzero(duration: Option<Duration>) -> Option<Duration> {
    duration.filter(|d| !d.is_zero())
}

/// Server heartbeat as observed by the client.
#[derive(Debug, Clone)]
pub struct ServerHeartbeatEvent {
    /// Server clock at send time, milliseconds since the Unix epoch.
    pub server_time: i64,
    /// Raw metadata payload attached by the server (nil when absent).
    pub metadata: Bytes,
}

/// Acknowledgement of a client heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct ClientHeartbeatEvent {
    pub round_trip_time: Duration,
}

pub type ServerHeartbeatObserver = Arc<dyn Fn(ServerHeartbeatEvent) + Send + Sync>;
pub type ClientHeartbeatObserver = Arc<dyn Fn(ClientHeartbeatEvent) + Send + Sync>;

#[derive(Clone)]
pub struct ClientOptions {
    /// Bound on each `call_with_response`. `None` waits until the session ends.
    pub call_timeout: Option<Duration>,
    /// Bound on reading the handshake marker.
    pub connect_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub max_pending: usize,
    /// How long teardown waits for the write loop to flush.
    pub shutdown_grace: Duration,
    pub(crate) on_server_heartbeat: Option<ServerHeartbeatObserver>,
    pub(crate) on_client_heartbeat_response: Option<ClientHeartbeatObserver>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            call_timeout: Some(
                env_millis("STREAMHUB_CALL_TIMEOUT_MS").unwrap_or(DEFAULT_CALL_TIMEOUT),
            ),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: nonzero(env_millis("STREAMHUB_CLIENT_HEARTBEAT_INTERVAL_MS")),
            heartbeat_timeout: Some(
                env_millis("STREAMHUB_CLIENT_HEARTBEAT_TIMEOUT_MS")
                    .unwrap_or(DEFAULT_CLIENT_HEARTBEAT_TIMEOUT),
            ),
            max_pending: streamhub_core::max_pending(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            on_server_heartbeat: None,
            on_client_heartbeat_response: None,
        }
    }
}

impl ClientOptions {
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable the client heartbeat. `None` or a zero interval disables it.
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = nonzero(interval);
        self
    }

    /// `None` never times out; heartbeats are still sent.
    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn on_server_heartbeat(
        mut self,
        observer: impl Fn(ServerHeartbeatEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_server_heartbeat = Some(Arc::new(observer));
        self
    }

    pub fn on_client_heartbeat_response(
        mut self,
        observer: impl Fn(ClientHeartbeatEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_client_heartbeat_response = Some(Arc::new(observer));
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("call_timeout", &self.call_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("max_pending", &self.max_pending)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

/// Supplies the metadata payload attached to each server heartbeat.
pub type HeartbeatMetadataProvider = Arc<dyn Fn() -> Bytes + Send + Sync>;

#[derive(Clone)]
pub struct HubOptions {
    /// Server heartbeat period. `None` disables server heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// How long a connection may leave a heartbeat unanswered.
    pub heartbeat_timeout: Option<Duration>,
    /// Requests buffered between the read loop and the handler worker.
    pub request_queue_capacity: usize,
    /// Include the handler's error text in `Internal` error replies.
    pub return_error_detail: bool,
    /// Bound on waiting for queued requests when a connection ends.
    pub drain_timeout: Duration,
    /// How long a hub waits for its client to answer a client-result call.
    pub client_result_timeout: Duration,
    pub(crate) heartbeat_metadata: Option<HeartbeatMetadataProvider>,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: nonzero(env_millis("STREAMHUB_SERVER_HEARTBEAT_INTERVAL_MS")),
            heartbeat_timeout: env_millis("STREAMHUB_SERVER_HEARTBEAT_TIMEOUT_MS"),
            request_queue_capacity: DEFAULT_REQUEST_QUEUE_CAPACITY,
            return_error_detail: false,
            drain_timeout: DEFAULT_SHUTDOWN_GRACE,
            client_result_timeout: DEFAULT_CLIENT_RESULT_TIMEOUT,
            heartbeat_metadata: None,
        }
    }
}

impl HubOptions {
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Option<Duration>) -> Self {
        self.heartbeat_interval = nonzero(Some(interval));
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_request_queue_capacity(mut self, capacity: usize) -> Self {
        self.request_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_return_error_detail(mut self, enabled: bool) -> Self {
        self.return_error_detail = enabled;
        self
    }

    pub fn with_client_result_timeout(mut self, timeout: Duration) -> Self {
        self.client_result_timeout = timeout;
        self
    }

    pub fn with_heartbeat_metadata(
        mut self,
        provider: impl Fn() -> Bytes + Send + Sync + 'static,
    ) -> Self {
        self.heartbeat_metadata = Some(Arc::new(provider));
        self
    }
}

impl fmt::Debug for HubOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubOptions")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("request_queue_capacity", &self.request_queue_capacity)
            .field("return_error_detail", &self.return_error_detail)
            .field("drain_timeout", &self.drain_timeout)
            .field("client_result_timeout", &self.client_result_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_disables_heartbeat() {
        let options = ClientOptions::default().with_heartbeat_interval(Some(Duration::ZERO));
        assert_eq!(options.heartbeat_interval, None);

        let hub = HubOptions::default().with_heartbeat(Duration::ZERO, None);
        assert_eq!(hub.heartbeat_interval, None);
    }

    #[test]
    fn builder_overrides_defaults() {
        let options = ClientOptions::default()
            .with_call_timeout(None)
            .with_max_pending(0);
        assert_eq!(options.call_timeout, None);
        assert_eq!(options.max_pending, 1);
        assert_eq!(
            HubOptions::default().request_queue_capacity,
            DEFAULT_REQUEST_QUEUE_CAPACITY
        );
    }
}
