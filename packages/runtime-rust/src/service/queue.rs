//! Per-route service queue.
//!
//! The queue owns the route's intake and a FIFO of idle instances. An event
//! goes to the first idle instance or waits in an elastic buffer. An instance
//! becomes idle again only when its [`ReadySignal`] fires, so no instance ever
//! holds more than one event.
//!
//! An accepted event counts as in flight from the moment the queue takes it,
//! so a draining platform waits for buffered events as well as running ones.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::{InFlightGuard, Lifecycle};

// ---------------------------------------------------------------------------
// ReadySignal
// ---------------------------------------------------------------------------

/// Marks one instance as ready for its next event when dropped.
///
/// Processing code moves the signal along with the work it guards; a
/// deferred reply keeps it until the reply resolves. Dropping during
/// unwinding still releases the instance.
#[derive(Debug)]
pub struct ReadySignal {
    instance: usize,
    tx: mpsc::UnboundedSender<usize>,
}

impl ReadySignal {
    pub(crate) fn new(instance: usize, tx: mpsc::UnboundedSender<usize>) -> Self {
        Self { instance, tx }
    }

    #[must_use]
    pub fn instance(&self) -> usize {
        self.instance
    }
}

impl Drop for ReadySignal {
    fn drop(&mut self) {
        // Queue already stopped when this fails.
        let _ = self.tx.send(self.instance);
    }
}

// ---------------------------------------------------------------------------
// ServiceQueue
// ---------------------------------------------------------------------------

/// An accepted event on its way to an instance.
pub(crate) struct Queued {
    pub payload: Bytes,
    /// Held until the event's invocation completes.
    pub in_flight: InFlightGuard,
}

/// Dispatch state of one route.
pub(crate) struct ServiceQueue {
    route: String,
    lifecycle: Arc<Lifecycle>,
    instances: Vec<mpsc::Sender<Queued>>,
    idle: VecDeque<usize>,
    buffer: VecDeque<Queued>,
}

impl ServiceQueue {
    /// `instances[i]` feeds instance `i + 1`. All instances start idle.
    pub(crate) fn new(
        route: impl Into<String>,
        lifecycle: Arc<Lifecycle>,
        instances: Vec<mpsc::Sender<Queued>>,
    ) -> Self {
        let idle = (1..=instances.len()).collect();
        Self {
            route: route.into(),
            lifecycle,
            instances,
            idle,
            buffer: VecDeque::new(),
        }
    }

    /// Hands the event to an idle instance or buffers it.
    fn on_event(&mut self, payload: Bytes) {
        let event = Queued {
            payload,
            in_flight: self.lifecycle.in_flight_guard(),
        };
        match self.idle.pop_front() {
            Some(instance) => self.forward(instance, event),
            None => self.buffer.push_back(event),
        }
    }

    /// Feeds the oldest buffered event to `instance` or marks it idle.
    fn on_ready(&mut self, instance: usize) {
        match self.buffer.pop_front() {
            Some(event) => self.forward(instance, event),
            None => self.idle.push_back(instance),
        }
    }

    fn forward(&self, instance: usize, event: Queued) {
        let Some(tx) = instance.checked_sub(1).and_then(|i| self.instances.get(i)) else {
            tracing::error!(route = %self.route, instance, "ready signal from unknown instance");
            return;
        };
        if tx.try_send(event).is_err() {
            tracing::error!(route = %self.route, instance, "instance intake closed, event dropped");
        }
    }

    #[cfg(test)]
    fn idle(&self) -> Vec<usize> {
        self.idle.iter().copied().collect()
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Runs until the intake closes or `stop` is cancelled.
    pub(crate) async fn run(
        mut self,
        mut intake: mpsc::UnboundedReceiver<Bytes>,
        mut ready: mpsc::UnboundedReceiver<usize>,
        stop: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                Some(instance) = ready.recv() => self.on_ready(instance),
                event = intake.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
            }
        }
        if !self.buffer.is_empty() {
            tracing::warn!(
                route = %self.route,
                dropped = self.buffer.len(),
                "service queue stopped with buffered events"
            );
        }
        tracing::debug!(route = %self.route, "service queue stopped");
    }
}
