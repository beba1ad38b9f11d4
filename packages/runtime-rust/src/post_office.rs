//! Messaging handle for code running inside a handler.
//!
//! A [`PostOffice`] is built from the headers the dispatcher injected, so
//! everything it sends is stamped with the caller's route as `from` and
//! continues the caller's trace.

use std::time::Duration;

use mesh_core::{headers, Envelope, Value};

use crate::error::{RpcError, SendError};
use crate::platform::Platform;
use crate::service::handler::Headers;

#[derive(Debug, Clone)]
pub struct PostOffice {
    platform: Platform,
    route: Option<String>,
    trace_id: Option<String>,
    trace_path: Option<String>,
    instance: usize,
}

impl PostOffice {
    #[must_use]
    pub fn new(platform: &Platform, headers: &Headers, instance: usize) -> Self {
        Self {
            platform: platform.clone(),
            route: headers.get(headers::MY_ROUTE).cloned(),
            trace_id: headers.get(headers::MY_TRACE_ID).cloned(),
            trace_path: headers.get(headers::MY_TRACE_PATH).cloned(),
            instance,
        }
    }

    /// Route of the handler this post office belongs to.
    #[must_use]
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    #[must_use]
    pub fn trace_path(&self) -> Option<&str> {
        self.trace_path.as_deref()
    }

    #[must_use]
    pub fn instance(&self) -> usize {
        self.instance
    }

    /// Sets `from` and the trace fields unless the event already has them.
    fn stamp(&self, mut event: Envelope) -> Envelope {
        if event.from.is_none() {
            event.from.clone_from(&self.route);
        }
        if event.trace_id.is_none() {
            if let Some(id) = &self.trace_id {
                event.trace_id = Some(id.clone());
                event.trace_path = Some(self.trace_path.clone().unwrap_or_else(|| "?".to_string()));
            }
        }
        event
    }

    /// Fire-and-forget delivery.
    ///
    /// # Errors
    ///
    /// See [`Platform::send`].
    pub fn send(&self, event: Envelope) -> Result<(), SendError> {
        self.platform.send(&self.stamp(event))
    }

    /// Delivery after `delay` within the current trace.
    ///
    /// # Errors
    ///
    /// See [`Platform::send_later`].
    pub fn send_later(&self, event: Envelope, delay: Duration) -> Result<String, SendError> {
        self.platform.send_later(self.stamp(event), delay)
    }

    /// See [`Platform::cancel_future_event`].
    pub fn cancel_future_event(&self, id: &str) -> bool {
        self.platform.cancel_future_event(id)
    }

    /// Request/reply within the current trace.
    ///
    /// # Errors
    ///
    /// See [`Platform::request`].
    pub async fn request(&self, event: Envelope, timeout: Duration) -> Result<Envelope, RpcError> {
        self.platform.request(self.stamp(event), timeout).await
    }

    /// Fork-join within the current trace.
    ///
    /// # Errors
    ///
    /// See [`Platform::request_all`].
    pub async fn request_all(
        &self,
        events: Vec<Envelope>,
        timeout: Duration,
    ) -> Result<Vec<Envelope>, RpcError> {
        let events = events.into_iter().map(|e| self.stamp(e)).collect();
        self.platform.request_all(events, timeout).await
    }

    /// Adds a key/value to the current trace span. Returns `false` when the
    /// handler is not being traced.
    pub fn annotate_trace(&self, key: &str, value: impl Into<Value>) -> bool {
        match &self.route {
            Some(route) => self
                .platform
                .tracer()
                .annotate(route, self.instance, key, value.into()),
            None => false,
        }
    }
}
