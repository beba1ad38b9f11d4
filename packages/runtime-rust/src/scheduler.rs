//! Delayed delivery of events.
//!
//! Each scheduled event is encoded up front and held by a timer task until
//! it is due. Cancelling an event, or stopping the platform, disposes the
//! timer before it fires.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use mesh_core::Envelope;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::bus::LocalBus;
use crate::error::SendError;

const MIN_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct FutureEvent {
    to: String,
    due: SystemTime,
    cancel: CancellationToken,
}

/// Timer-backed holding area for events sent later.
#[derive(Debug)]
pub struct Scheduler {
    bus: Arc<LocalBus>,
    handle: Handle,
    stop: CancellationToken,
    pending: Arc<DashMap<String, FutureEvent>>,
}

impl Scheduler {
    /// Creates a scheduler whose timers end when `stop` is cancelled.
    #[must_use]
    pub fn new(bus: Arc<LocalBus>, handle: Handle, stop: CancellationToken) -> Self {
        Self {
            bus,
            handle,
            stop,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Delivers `event` to its `to` route after `delay`. Returns the id
    /// used to cancel or inspect the scheduled delivery.
    ///
    /// # Errors
    ///
    /// Returns `SendError::MissingRoute` when `to` is unset or an encode
    /// error. Routing failures surface when the event is due and are logged.
    pub fn schedule(&self, event: &Envelope, delay: Duration) -> Result<String, SendError> {
        let to = event.to.clone().ok_or(SendError::MissingRoute)?;
        let payload = Bytes::from(event.to_bytes()?);
        let delay = delay.max(MIN_DELAY);
        let id = uuid::Uuid::new_v4().simple().to_string();
        let cancel = self.stop.child_token();

        self.pending.insert(
            id.clone(),
            FutureEvent {
                to: to.clone(),
                due: SystemTime::now() + delay,
                cancel: cancel.clone(),
            },
        );
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(route = %to, delay_ms, "future event scheduled");

        let bus = Arc::clone(&self.bus);
        let pending = Arc::clone(&self.pending);
        let key = id.clone();
        self.handle.spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    pending.remove(&key);
                    if let Err(e) = bus.send(&to, payload) {
                        tracing::error!(route = %to, "Deferred delivery to {to} failed - {e}");
                    }
                }
            }
        });
        Ok(id)
    }

    /// Cancels a scheduled delivery. Returns `false` if it already fired or
    /// is unknown.
    pub fn cancel(&self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some((_, event)) => {
                event.cancel.cancel();
                tracing::debug!(route = %event.to, id, "future event cancelled");
                true
            }
            None => false,
        }
    }

    /// Ids of the events scheduled for `to`.
    #[must_use]
    pub fn events_for(&self, to: &str) -> Vec<String> {
        self.pending
            .iter()
            .filter(|entry| entry.value().to == to)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Routes with at least one scheduled event, sorted.
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self
            .pending
            .iter()
            .map(|entry| entry.value().to.clone())
            .collect();
        routes.sort_unstable();
        routes.dedup();
        routes
    }

    /// Wall-clock time a scheduled event is due.
    #[must_use]
    pub fn due_time(&self, id: &str) -> Option<SystemTime> {
        self.pending.get(id).map(|entry| entry.value().due)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Cancels every scheduled delivery.
    pub fn cancel_all(&self) {
        for entry in self.pending.iter() {
            entry.value().cancel.cancel();
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(bus: &Arc<LocalBus>) -> Scheduler {
        Scheduler::new(Arc::clone(bus), Handle::current(), CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn event_is_delivered_after_delay() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.bind("hello.world");
        let scheduler = scheduler(&bus);

        let started = tokio::time::Instant::now();
        let id = scheduler
            .schedule(&Envelope::new().with_to("hello.world").with_body("later"), Duration::from_secs(2))
            .unwrap();
        assert_eq!(scheduler.events_for("hello.world"), vec![id.clone()]);
        assert!(scheduler.due_time(&id).is_some());

        let event = Envelope::from_bytes(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event.body, Some(mesh_core::Value::from("later")));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(scheduler.is_empty());
        assert!(!scheduler.cancel(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_event_is_never_delivered() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.bind("hello.world");
        let scheduler = scheduler(&bus);

        let early = scheduler
            .schedule(&Envelope::new().with_to("hello.world").with_body(1), Duration::from_millis(500))
            .unwrap();
        let late = scheduler
            .schedule(&Envelope::new().with_to("hello.world").with_body(2), Duration::from_secs(5))
            .unwrap();
        let mut ids = scheduler.events_for("hello.world");
        ids.sort_unstable();
        let mut expected = vec![early.clone(), late.clone()];
        expected.sort_unstable();
        assert_eq!(ids, expected);

        assert!(scheduler.cancel(&late));
        assert_eq!(scheduler.events_for("hello.world"), vec![early]);

        let first = Envelope::from_bytes(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.body, Some(mesh_core::Value::Int(1)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_destination_is_rejected() {
        let bus = Arc::new(LocalBus::new());
        let err = scheduler(&bus)
            .schedule(&Envelope::new(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SendError::MissingRoute));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_routes() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.bind("a.one");
        let _b = bus.bind("b.two");
        let scheduler = scheduler(&bus);
        for to in ["b.two", "a.one", "b.two"] {
            scheduler
                .schedule(&Envelope::new().with_to(to), Duration::from_secs(1))
                .unwrap();
        }
        assert_eq!(scheduler.routes(), vec!["a.one".to_string(), "b.two".to_string()]);

        scheduler.cancel_all();
        assert!(scheduler.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }
}
