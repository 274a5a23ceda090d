use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use streamhub_core::{Frame, nil_payload};
use tokio_util::sync::CancellationToken;

use crate::config::{
    ClientHeartbeatEvent, ClientHeartbeatObserver, ServerHeartbeatEvent, ServerHeartbeatObserver,
};
use crate::timer::TimeoutTimer;

/// Client side of both heartbeat directions.
///
/// Probes carry a sequence number and the time since the session started;
/// only the answer to the most recent probe disarms the timeout.
pub(crate) struct ClientHeartbeat {
    origin: Instant,
    interval: Option<Duration>,
    sequence: Mutex<Sequence>,
    timer: TimeoutTimer,
    on_server_heartbeat: Option<ServerHeartbeatObserver>,
    on_response: Option<ClientHeartbeatObserver>,
}

#[derive(Default)]
struct Sequence {
    next: i16,
    last_sent: Option<i16>,
}

impl ClientHeartbeat {
    pub(crate) fn new(
        interval: Option<Duration>,
        timeout: Option<Duration>,
        timed_out: CancellationToken,
        on_server_heartbeat: Option<ServerHeartbeatObserver>,
        on_response: Option<ClientHeartbeatObserver>,
    ) -> Self {
        Self {
            origin: Instant::now(),
            interval,
            sequence: Mutex::new(Sequence::default()),
            timer: TimeoutTimer::new(timeout, timed_out),
            on_server_heartbeat,
            on_response,
        }
    }

    pub(crate) fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Cancelled when a probe goes unanswered for the configured timeout.
    pub(crate) fn timed_out(&self) -> &CancellationToken {
        self.timer.token()
    }

    fn elapsed_millis(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Build the next probe and start the ack timeout if it is not already running.
    pub(crate) fn next_probe(&self) -> Frame {
        let sequence = {
            let mut seq = self.sequence.lock();
            let sequence = seq.next;
            seq.next = seq.next.wrapping_add(1);
            seq.last_sent = Some(sequence);
            sequence
        };
        self.timer.arm();
        Frame::ClientHeartbeat {
            sequence,
            sent_at: self.elapsed_millis(),
            extra: nil_payload(),
        }
    }

    /// Handle the server's echo of a probe and return its round trip.
    ///
    /// Every echo reaches the observer; only the latest probe's echo disarms
    /// the timeout.
    pub(crate) fn on_response(&self, sequence: i16, sent_at: i64) -> Duration {
        if self.sequence.lock().last_sent == Some(sequence) {
            self.timer.disarm();
        } else {
            tracing::debug!(sequence, "client heartbeat: stale response");
        }
        let elapsed = self.elapsed_millis().saturating_sub(sent_at).max(0);
        let round_trip_time = Duration::from_millis(elapsed as u64);
        tracing::trace!(sequence, rtt_ms = elapsed, "client heartbeat: response");
        if let Some(observer) = &self.on_response {
            observer(ClientHeartbeatEvent { round_trip_time });
        }
        round_trip_time
    }

    /// Notify the observer of a server heartbeat and build the reply.
    pub(crate) fn on_server_heartbeat(&self, sequence: i16, sent_at: i64, metadata: Bytes) -> Frame {
        tracing::trace!(sequence, sent_at, "client heartbeat: server heartbeat");
        if let Some(observer) = &self.on_server_heartbeat {
            observer(ServerHeartbeatEvent {
                server_time: sent_at,
                metadata,
            });
        }
        Frame::ServerHeartbeatResponse { sequence, sent_at }
    }

    pub(crate) fn stop(&self) {
        self.timer.disarm();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn heartbeat(timeout: Duration) -> ClientHeartbeat {
        ClientHeartbeat::new(
            Some(Duration::from_millis(10)),
            Some(timeout),
            CancellationToken::new(),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn probes_count_up_and_arm_the_timeout() {
        let hb = heartbeat(Duration::from_secs(5));
        let Frame::ClientHeartbeat { sequence: first, .. } = hb.next_probe() else {
            panic!("expected a client heartbeat");
        };
        let Frame::ClientHeartbeat { sequence: second, .. } = hb.next_probe() else {
            panic!("expected a client heartbeat");
        };
        assert_eq!((first, second), (0, 1));
        assert!(hb.timer.is_running());
    }

    #[tokio::test]
    async fn only_the_latest_probe_disarms() {
        let hb = heartbeat(Duration::from_secs(5));
        hb.next_probe();
        hb.next_probe();

        hb.on_response(0, 0);
        assert!(hb.timer.is_running());

        hb.on_response(1, 0);
        assert!(!hb.timer.is_running());
    }

    #[tokio::test]
    async fn stale_responses_still_reach_the_observer() {
        let seen = Arc::new(AtomicUsize::new(0));
        let observed = seen.clone();
        let hb = ClientHeartbeat::new(
            Some(Duration::from_millis(10)),
            Some(Duration::from_secs(5)),
            CancellationToken::new(),
            None,
            Some(Arc::new(move |_: ClientHeartbeatEvent| {
                observed.fetch_add(1, Ordering::SeqCst);
            })),
        );
        hb.next_probe();
        hb.next_probe();

        hb.on_response(0, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(hb.timer.is_running());

        hb.on_response(1, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(!hb.timer.is_running());
    }

    #[tokio::test]
    async fn unanswered_probe_fires_the_token() {
        let hb = heartbeat(Duration::from_millis(30));
        hb.next_probe();
        tokio::time::timeout(Duration::from_secs(1), hb.timed_out().cancelled())
            .await
            .expect("heartbeat timeout should fire");
    }

    #[tokio::test]
    async fn server_heartbeat_reaches_observer_and_is_echoed() {
        let seen = Arc::new(AtomicUsize::new(0));
        let observed = seen.clone();
        let hb = ClientHeartbeat::new(
            None,
            None,
            CancellationToken::new(),
            Some(Arc::new(move |event: ServerHeartbeatEvent| {
                assert_eq!(event.server_time, 1234);
                observed.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        );
        let reply = hb.on_server_heartbeat(7, 1234, nil_payload());
        assert_eq!(
            reply,
            Frame::ServerHeartbeatResponse {
                sequence: 7,
                sent_at: 1234
            }
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
