//! In-process delivery of encoded envelopes.
//!
//! Each route owns one unbounded intake channel. A service route's intake is
//! drained by its queue manager; the reply inbox drains its intake directly.

use bytes::Bytes;
use dashmap::DashMap;
use mesh_core::Envelope;
use tokio::sync::mpsc;

use crate::error::SendError;

/// Thread-safe route table for same-process delivery.
///
/// Delivery is FIFO per route; the bus adds no retry or
/// acknowledgement on top of the channels.
#[derive(Debug, Default)]
pub struct LocalBus {
    routes: DashMap<String, mpsc::UnboundedSender<Bytes>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `route` and returns the receiver for its intake.
    ///
    /// Re-binding a route replaces the previous intake; the old receiver
    /// sees its channel close.
    pub fn bind(&self, route: &str) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(route.to_string(), tx);
        rx
    }

    /// Removes `route`. Its receiver sees the channel close.
    pub fn unbind(&self, route: &str) {
        self.routes.remove(route);
    }

    #[must_use]
    pub fn exists(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Fire-and-forget delivery of raw bytes to a route.
    ///
    /// # Errors
    ///
    /// Returns `SendError::NoRoute` if the route is not bound and
    /// `SendError::Closed` if its receiver has gone away.
    pub fn send(&self, route: &str, payload: Bytes) -> Result<(), SendError> {
        let tx = self
            .routes
            .get(route)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SendError::NoRoute(route.to_string()))?;
        tx.send(payload)
            .map_err(|_| SendError::Closed(route.to_string()))
    }

    /// Encodes `event` and delivers it to its `to` route.
    ///
    /// # Errors
    ///
    /// Returns `SendError::MissingRoute` when `to` is unset, an encode error,
    /// or any error from [`LocalBus::send`].
    pub fn send_event(&self, event: &Envelope) -> Result<(), SendError> {
        let route = event.to.as_deref().ok_or(SendError::MissingRoute)?;
        let bytes = event.to_bytes()?;
        self.send(route, Bytes::from(bytes))
    }
}
