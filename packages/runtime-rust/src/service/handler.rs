//! The contract every service implements.
//!
//! A handler receives `(headers, input, instance)` and returns a
//! [`HandlerResult`]: a plain reply, a deferred single value or a stream.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Stream, StreamExt};
use mesh_core::{Envelope, Record, Value};

use crate::error::AppError;

/// Headers visible to a handler, including the injected `my_*` metadata.
pub type Headers = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// What the dispatcher passes to a handler.
#[derive(Debug, Clone)]
pub enum HandlerInput {
    /// The event carried no body.
    Empty,
    /// Raw body, for routes without an input schema.
    Body(Value),
    /// Body decoded through the route's input schema.
    Record(Record),
    /// A list-of-maps body decoded element-wise.
    Records(Vec<Record>),
    /// The raw event, for interceptors and envelope-accepting routes.
    Envelope(Box<Envelope>),
}

impl HandlerInput {
    /// Body as a plain value. Records are converted back to maps and an
    /// envelope yields its body.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            HandlerInput::Empty => Value::Null,
            HandlerInput::Body(v) => v,
            HandlerInput::Record(r) => r.into_value(),
            HandlerInput::Records(rs) => {
                Value::Array(rs.into_iter().map(Record::into_value).collect())
            }
            HandlerInput::Envelope(e) => e.body.unwrap_or(Value::Null),
        }
    }

    #[must_use]
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            HandlerInput::Record(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_envelope(&self) -> Option<&Envelope> {
        match self {
            HandlerInput::Envelope(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// A single reply produced by a handler.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Becomes the reply body with status 200. `Value::Null` is kept as an
    /// explicit null.
    Value(Value),
    /// Headers, body, status and exception are merged into the reply.
    Envelope(Envelope),
}

impl From<Value> for Reply {
    fn from(v: Value) -> Self {
        Reply::Value(v)
    }
}

impl From<Envelope> for Reply {
    fn from(e: Envelope) -> Self {
        Reply::Envelope(e)
    }
}

/// Deferred single reply.
pub type DeferredReply = BoxFuture<'static, Result<Reply, AppError>>;

/// Stream of values published out of band.
pub type ReplyStream = BoxStream<'static, Result<Value, AppError>>;

/// Closed set of handler result shapes.
pub enum HandlerResult {
    Plain(Reply),
    /// Readiness of the instance is withheld until this resolves or times out.
    Deferred(DeferredReply),
    /// The caller gets an immediate reply naming the stream.
    Stream(ReplyStream),
}

impl HandlerResult {
    pub fn value(v: impl Into<Value>) -> Self {
        HandlerResult::Plain(Reply::Value(v.into()))
    }

    #[must_use]
    pub fn null() -> Self {
        HandlerResult::Plain(Reply::Value(Value::Null))
    }

    #[must_use]
    pub fn envelope(e: Envelope) -> Self {
        HandlerResult::Plain(Reply::Envelope(e))
    }

    pub fn deferred<F, R>(fut: F) -> Self
    where
        F: Future<Output = Result<R, AppError>> + Send + 'static,
        R: Into<Reply>,
    {
        HandlerResult::Deferred(fut.map(|r| r.map(Into::into)).boxed())
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, AppError>> + Send + 'static,
    {
        HandlerResult::Stream(stream.boxed())
    }

    /// Variant name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerResult::Plain(_) => "plain",
            HandlerResult::Deferred(_) => "deferred",
            HandlerResult::Stream(_) => "stream",
        }
    }
}

impl std::fmt::Debug for HandlerResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerResult::Plain(reply) => f.debug_tuple("Plain").field(reply).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Business logic of a route.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handles one event. Failures are classified into a status and message.
    async fn handle(
        &self,
        headers: Headers,
        input: HandlerInput,
        instance: usize,
    ) -> Result<HandlerResult, AppError>;
}

/// Route-specific replacement for the automatic error reply.
#[async_trait]
pub trait ErrorHandler: Send + Sync + 'static {
    /// Called with the classified failure and the event that caused it.
    async fn handle_error(
        &self,
        route: &str,
        status: u16,
        message: &str,
        event: &Envelope,
        instance: usize,
    ) -> anyhow::Result<()>;
}

/// Converts between a route's wire body and the value its handler works with.
pub trait CustomSerializer: Send + Sync + 'static {
    /// Body to handler input.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be converted.
    fn to_input(&self, body: Value) -> Result<Value, AppError>;

    /// Handler output to reply body.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted.
    fn to_output(&self, value: Value) -> Result<Value, AppError>;
}

// ---------------------------------------------------------------------------
// Closure adapter
// ---------------------------------------------------------------------------

/// Handler built from an async closure.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Headers, HandlerInput, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerResult, AppError>> + Send + 'static,
{
    async fn handle(
        &self,
        headers: Headers,
        input: HandlerInput,
        instance: usize,
    ) -> Result<HandlerResult, AppError> {
        (self.f)(headers, input, instance).await
    }
}

/// Wraps an async closure as a shared [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Headers, HandlerInput, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerResult, AppError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
