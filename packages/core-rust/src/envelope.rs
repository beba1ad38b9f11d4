//! The message record exchanged between services.
//!
//! An `Envelope` is built by a sender, consumed once by a dispatcher or a
//! reply inbox, and never mutated after that except to derive a reply. All
//! fields use `#[serde(rename_all = "camelCase")]` and encode to `MsgPack`
//! via `rmp_serde::to_vec_named()`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

// ---------------------------------------------------------------------------
// Reserved headers
// ---------------------------------------------------------------------------

/// Header keys injected or produced by the dispatch engine.
///
/// Handler code reads these but must not set them.
pub mod headers {
    /// Route of the service currently handling the event.
    pub const MY_ROUTE: &str = "my_route";
    /// Trace id of the current hop.
    pub const MY_TRACE_ID: &str = "my_trace_id";
    /// Dotted trace path of the current hop.
    pub const MY_TRACE_PATH: &str = "my_trace_path";
    /// Stream id on the immediate reply of a streaming handler.
    pub const X_STREAM_ID: &str = "x-stream-id";
    /// Stream time-to-live in milliseconds.
    pub const X_TTL: &str = "x-ttl";

    /// Headers stripped before the handler sees an inbound event.
    pub const ROUTING: [&str; 3] = [MY_ROUTE, MY_TRACE_ID, MY_TRACE_PATH];
}

/// Success status.
pub const STATUS_OK: u16 = 200;

// ---------------------------------------------------------------------------
// EnvelopeError
// ---------------------------------------------------------------------------

/// Failure while converting an envelope to or from its wire form.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unable to encode envelope: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("unable to decode envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A message travelling through the bus.
///
/// `body` is tri-state: `None` means no body, `Some(Value::Null)` is an
/// explicit null. A reply carries the same `correlation_id`, `trace_id` and
/// `trace_path` as the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique event id.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from: Option<String>,
    /// Route receiving the response. Absent for fire-and-forget events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exception: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace_path: Option<String>,
    /// Pass-through metadata, never interpreted by the engine.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub tags: BTreeMap<String, String>,
    /// Trace side-notes accumulated by handlers.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub annotations: BTreeMap<String, Value>,
    /// RPC timeout requested by the caller, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rpc_timeout_ms: Option<u64>,
    /// Handler execution time reported on a reply.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub execution_time_ms: Option<f64>,
    /// Caller-measured round trip time, set when a reply is correlated.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub round_trip_ms: Option<f64>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Envelope {
    /// Creates an empty envelope with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            to: None,
            from: None,
            reply_to: None,
            correlation_id: None,
            headers: BTreeMap::new(),
            body: None,
            status: None,
            exception: None,
            trace_id: None,
            trace_path: None,
            tags: BTreeMap::new(),
            annotations: BTreeMap::new(),
            rpc_timeout_ms: None,
            execution_time_ms: None,
            round_trip_ms: None,
        }
    }

    /// Starts a reply to `request`, carrying its correlation id and trace
    /// context verbatim and addressed to its `reply_to` route.
    #[must_use]
    pub fn reply_to_request(request: &Envelope) -> Self {
        let mut reply = Self::new();
        reply.to.clone_from(&request.reply_to);
        reply.correlation_id.clone_from(&request.correlation_id);
        reply.trace_id.clone_from(&request.trace_id);
        reply.trace_path.clone_from(&request.trace_path);
        reply
    }

    #[must_use]
    pub fn with_to(mut self, route: impl Into<String>) -> Self {
        self.to = Some(route.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, route: impl Into<String>) -> Self {
        self.from = Some(route.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, route: impl Into<String>) -> Self {
        self.reply_to = Some(route.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, cid: impl Into<String>) -> Self {
        self.correlation_id = Some(cid.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Marks the envelope as a failure with `status` and `message`.
    #[must_use]
    pub fn with_exception(mut self, status: u16, message: impl Into<String>) -> Self {
        self.status = Some(status);
        self.exception = Some(message.into());
        self
    }

    /// Sets trace id and path together. A trace needs both.
    #[must_use]
    pub fn with_trace(mut self, id: impl Into<String>, path: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self.trace_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Status, treating an unset status as success.
    #[must_use]
    pub fn status_or_ok(&self) -> u16 {
        self.status.unwrap_or(STATUS_OK)
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status_or_ok() >= 400
    }

    /// Failure text: the exception if set, else a string body.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.exception.clone().or_else(|| {
            self.body
                .as_ref()
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Removes the routing metadata injected for the previous hop.
    pub fn strip_reserved_headers(&mut self) {
        for key in headers::ROUTING {
            self.headers.remove(key);
        }
    }

    /// Encodes to `MsgPack` with named fields.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Encode` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes an envelope produced by [`Envelope::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Decode` if the bytes are not a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelopes_get_distinct_ids() {
        let a = Envelope::new();
        let b = Envelope::new();
        assert_ne!(a.id, b.id);
        assert!(!a.id.contains('-'));
    }

    #[test]
    fn reply_carries_correlation_and_trace_context() {
        let request = Envelope::new()
            .with_to("hello.world")
            .with_reply_to("temporary.inbox")
            .with_correlation_id("cid-1")
            .with_trace("t-100", "GET /api/hello");

        let reply = Envelope::reply_to_request(&request);
        assert_eq!(reply.to.as_deref(), Some("temporary.inbox"));
        assert_eq!(reply.correlation_id.as_deref(), Some("cid-1"));
        assert_eq!(reply.trace_id.as_deref(), Some("t-100"));
        assert_eq!(reply.trace_path.as_deref(), Some("GET /api/hello"));
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn explicit_null_body_differs_from_absent_body() {
        let with_null = Envelope::new().with_body(Value::Null);
        let without = Envelope::new();

        let decoded_null = Envelope::from_bytes(&with_null.to_bytes().unwrap()).unwrap();
        let decoded_none = Envelope::from_bytes(&without.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded_null.body, Some(Value::Null));
        assert_eq!(decoded_none.body, None);
    }

    #[test]
    fn wire_form_preserves_all_fields() {
        let mut env = Envelope::new()
            .with_to("a.b")
            .with_from("c.d")
            .with_header("k", "v")
            .with_body(Value::map([("id", Value::from(1))]))
            .with_exception(400, "Missing id")
            .with_tag("tenant", "t1")
            .with_rpc_timeout(5000);
        env.set_annotation("step", "one");

        let decoded = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let result = Envelope::from_bytes(&[0xc1, 0x00, 0x13]);
        assert!(matches!(result, Err(EnvelopeError::Decode(_))));
    }

    #[test]
    fn strip_removes_only_routing_headers() {
        let mut env = Envelope::new()
            .with_header(headers::MY_ROUTE, "x.y")
            .with_header(headers::MY_TRACE_ID, "t")
            .with_header(headers::MY_TRACE_PATH, "p")
            .with_header("user", "kept");
        env.strip_reserved_headers();
        assert_eq!(env.headers.len(), 1);
        assert_eq!(env.header("user"), Some("kept"));
    }

    #[test]
    fn error_message_prefers_exception() {
        let env = Envelope::new().with_body("body text");
        assert!(!env.is_error());
        assert_eq!(env.error_message().as_deref(), Some("body text"));

        let failed = env.with_exception(500, "boom");
        assert!(failed.is_error());
        assert_eq!(failed.error_message().as_deref(), Some("boom"));
    }
}
