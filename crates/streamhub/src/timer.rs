//! Restartable liveness timeout shared by both heartbeat directions.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Fires its token once `period` elapses without being disarmed.
///
/// Arming an already running timer is a no-op: the deadline counts from the
/// oldest unacknowledged probe, not the latest.
pub(crate) struct TimeoutTimer {
    period: Option<Duration>,
    fired: CancellationToken,
    running: Mutex<Option<AbortHandle>>,
}

impl TimeoutTimer {
    /// `None` builds a timer that never fires. `fired` is usually a child of
    /// the session's shutdown token.
    pub(crate) fn new(period: Option<Duration>, fired: CancellationToken) -> Self {
        Self {
            period,
            fired,
            running: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self) {
        let Some(period) = self.period else { return };
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            fired.cancel();
        });
        *running = Some(task.abort_handle());
    }

    pub(crate) fn disarm(&self) {
        if let Some(task) = self.running.lock().take() {
            task.abort();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.fired
    }

    pub(crate) fn has_fired(&self) -> bool {
        self.fired.is_cancelled()
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_when_not_disarmed() {
        let timer = TimeoutTimer::new(Some(Duration::from_millis(20)), CancellationToken::new());
        timer.arm();
        assert!(timer.is_running());
        tokio::time::timeout(Duration::from_secs(1), timer.token().cancelled())
            .await
            .unwrap();
        assert!(timer.has_fired());
    }

    #[tokio::test]
    async fn disarm_prevents_firing() {
        let timer = TimeoutTimer::new(Some(Duration::from_millis(20)), CancellationToken::new());
        timer.arm();
        timer.disarm();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!timer.has_fired());
    }

    #[tokio::test]
    async fn without_period_never_arms() {
        let timer = TimeoutTimer::new(None, CancellationToken::new());
        timer.arm();
        assert!(!timer.is_running());
    }
}
