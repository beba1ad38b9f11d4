//! Platform lifecycle: run state, stop signal and in-flight event tracking.
//!
//! The run state lives in an `ArcSwap` so the send path can check it without
//! locking. Each accepted event holds an [`InFlightGuard`]; draining waits
//! until every guard has dropped or the drain timeout passes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Run state of the platform.
///
/// Transitions: Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    /// Accepting events.
    Running,
    /// Rejecting new sends while in-flight events finish.
    Draining,
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Coordinates shutdown across dispatchers, queue managers and inboxes.
#[derive(Debug)]
pub struct Lifecycle {
    state: ArcSwap<RunState>,
    stop: CancellationToken,
    in_flight: Arc<InFlight>,
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(RunState::Starting),
            stop: CancellationToken::new(),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn set_running(&self) {
        self.state.store(Arc::new(RunState::Running));
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        **self.state.load()
    }

    /// `true` until shutdown begins.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        matches!(self.state(), RunState::Starting | RunState::Running)
    }

    /// Token cancelled when shutdown is triggered. Per-route tokens are
    /// children of it so that releasing a route does not stop the others.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.stop.child_token()
    }

    /// Moves to `Draining`. New sends are refused from here on.
    pub fn begin_drain(&self) {
        self.state.store(Arc::new(RunState::Draining));
    }

    /// Cancels every token handed out by [`Lifecycle::child_token`] and
    /// marks the platform stopped.
    pub fn stop(&self) {
        self.stop.cancel();
        self.state.store(Arc::new(RunState::Stopped));
    }

    /// Counts an event as in flight until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no event is in flight, up to `timeout`.
    ///
    /// Returns `false` if events were still running when the timeout passed.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let idle = self.in_flight.idle.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), RunState::Starting);
        assert!(lifecycle.is_accepting());

        lifecycle.set_running();
        assert_eq!(lifecycle.state(), RunState::Running);

        lifecycle.begin_drain();
        assert_eq!(lifecycle.state(), RunState::Draining);
        assert!(!lifecycle.is_accepting());

        lifecycle.stop();
        assert_eq!(lifecycle.state(), RunState::Stopped);
    }

    #[test]
    fn guards_track_in_flight_events() {
        let lifecycle = Lifecycle::new();
        let one = lifecycle.in_flight_guard();
        let two = lifecycle.in_flight_guard();
        assert_eq!(lifecycle.in_flight_count(), 2);

        drop(one);
        assert_eq!(lifecycle.in_flight_count(), 1);
        drop(two);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn stop_cancels_child_tokens() {
        let lifecycle = Lifecycle::new();
        let token = lifecycle.child_token();
        assert!(!token.is_cancelled());

        lifecycle.stop();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn cancelling_a_child_leaves_the_rest_running() {
        let lifecycle = Lifecycle::new();
        let first = lifecycle.child_token();
        let second = lifecycle.child_token();

        first.cancel();
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn drain_is_immediate_when_idle() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.wait_for_drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let lifecycle = Lifecycle::new();
        let guard = lifecycle.in_flight_guard();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(lifecycle.wait_for_drain(Duration::from_secs(2)).await);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_with_events_running() {
        let lifecycle = Lifecycle::new();
        let _guard = lifecycle.in_flight_guard();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(50)).await);
    }
}
