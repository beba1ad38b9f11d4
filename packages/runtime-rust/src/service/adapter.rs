//! Result adapter: turns a handler outcome into reply envelopes, trace
//! records and the readiness signal.
//!
//! Every invocation ends in [`Invocation::complete`]. Plain results and
//! failures finish inline. A deferred result moves the invocation, and with
//! it the instance's [`ReadySignal`], into a task that waits for the value
//! under a deadline. A stream result replies at once and publishes out of
//! band.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use mesh_core::clock::duration_millis;
use mesh_core::{headers, Envelope, TraceJournal, Value, STATUS_OK};

use super::classify::{classify, log_failure, panic_error};
use super::handler::{CustomSerializer, DeferredReply, HandlerResult, Reply, ReplyStream};
use super::queue::ReadySignal;
use super::registry::ServiceDef;
use super::stream::publish;
use super::worker::DispatchContext;
use crate::error::AppError;
use crate::lifecycle::InFlightGuard;
use crate::tracer::{SpanHandle, SpanOutcome};

// ---------------------------------------------------------------------------
// ProcessStatus
// ---------------------------------------------------------------------------

/// Outcome of one invocation, recorded on its trace.
#[derive(Debug, Clone)]
pub(crate) struct ProcessStatus {
    pub success: bool,
    /// `false` when a reply was due but could not be sent.
    pub delivered: bool,
    pub status: u16,
    pub exception: Option<String>,
    /// Milliseconds from invocation to the terminal event.
    pub exec_time: f64,
    /// Output snapshot for journaled routes.
    pub output: Option<Value>,
}

impl ProcessStatus {
    fn ok(status: u16, exec_time: f64) -> Self {
        Self {
            success: status < 400,
            delivered: true,
            status,
            exception: None,
            exec_time,
            output: None,
        }
    }

    fn failed(status: u16, message: impl Into<String>, exec_time: f64) -> Self {
        Self {
            success: false,
            delivered: true,
            status,
            exception: Some(message.into()),
            exec_time,
            output: None,
        }
    }

    fn undelivered(&mut self, reason: &str) {
        self.delivered = false;
        self.success = false;
        self.status = 500;
        self.exception = Some(format!("Response not delivered - {reason}"));
    }
}

// ---------------------------------------------------------------------------
// Reply building
// ---------------------------------------------------------------------------

/// Merges a handler reply into `response`.
///
/// A value becomes the body with status 200. An envelope contributes its
/// headers (except the routing headers), body, status and exception.
///
/// # Errors
///
/// Returns the serializer's error if the output cannot be converted.
pub(crate) fn merge_reply(
    mut response: Envelope,
    reply: Reply,
    serializer: Option<&Arc<dyn CustomSerializer>>,
) -> Result<Envelope, AppError> {
    match reply {
        Reply::Value(value) => {
            let body = match serializer {
                Some(s) => s.to_output(value)?,
                None => value,
            };
            response.body = Some(body);
            response.status = Some(STATUS_OK);
        }
        Reply::Envelope(reply) => {
            for (key, value) in reply.headers {
                if !headers::ROUTING.contains(&key.as_str()) {
                    response.headers.insert(key, value);
                }
            }
            response.body = reply.body;
            response.status = Some(reply.status.unwrap_or(STATUS_OK));
            response.exception = reply.exception;
        }
    }
    Ok(response)
}

fn output_snapshot(response: &Envelope) -> Value {
    Value::map([
        ("body", response.body.clone().unwrap_or(Value::Null)),
        ("status", Value::from(u32::from(response.status_or_ok()))),
    ])
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// State of one event from handler invocation until readiness.
pub(crate) struct Invocation {
    pub ctx: Arc<DispatchContext>,
    pub def: Arc<ServiceDef>,
    pub instance: usize,
    /// The inbound event with routing headers stripped.
    pub event: Envelope,
    pub span: Option<SpanHandle>,
    pub started: Instant,
    /// Input snapshot, present only for journaled routes.
    pub journal_input: Option<Value>,
    /// Releases the instance when the invocation is dropped.
    pub _ready: ReadySignal,
    pub _in_flight: InFlightGuard,
}

impl Invocation {
    /// Routes the handler outcome to the matching completion path.
    pub(crate) async fn complete(self, outcome: Result<HandlerResult, AppError>) {
        match outcome {
            Ok(HandlerResult::Plain(reply)) => {
                let status = self.reply(reply).await;
                self.finish(status).await;
            }
            Ok(HandlerResult::Deferred(pending)) => {
                tokio::spawn(self.resolve_deferred(pending));
            }
            Ok(HandlerResult::Stream(stream)) => {
                let status = self.start_stream(stream);
                self.finish(status).await;
            }
            Err(e) => {
                let status = self.fail(&e).await;
                self.finish(status).await;
            }
        }
    }

    fn route(&self) -> &str {
        self.def.route()
    }

    fn elapsed(&self) -> f64 {
        duration_millis(self.started.elapsed())
    }

    /// Caller deadline, or the configured default for fire-and-forget events.
    fn reply_timeout(&self) -> Duration {
        self.event
            .rpc_timeout_ms
            .map_or(self.ctx.config.dispatch.default_deferred_timeout, Duration::from_millis)
    }

    /// Interceptors answer successful events themselves; errors are always
    /// returned to a waiting caller.
    fn expects_reply(&self) -> bool {
        self.event.reply_to.is_some() && !self.def.is_interceptor()
    }

    fn base_reply(&self) -> Envelope {
        Envelope::reply_to_request(&self.event).with_from(self.route())
    }

    /// Sends `response` to the caller when `due`, recording a delivery
    /// failure on `status`.
    fn deliver(&self, mut response: Envelope, status: &mut ProcessStatus, due: bool) {
        if self.journal_input.is_some() {
            status.output = Some(output_snapshot(&response));
        }
        if !due {
            return;
        }
        if let Some(span) = &self.span {
            response.annotations = self.ctx.tracer.annotations(span);
        }
        response.execution_time_ms = Some(status.exec_time);
        if let Err(e) = self.ctx.bus.send_event(&response) {
            tracing::error!(
                route = self.route(),
                instance = self.instance,
                cid = response.correlation_id.as_deref().unwrap_or(""),
                "Unable to deliver response - {e}"
            );
            status.undelivered(&e.to_string());
        }
    }

    async fn reply(&self, reply: Reply) -> ProcessStatus {
        let response = match merge_reply(self.base_reply(), reply, self.def.serializer()) {
            Ok(response) => response,
            Err(e) => return self.fail(&e).await,
        };
        let mut status = ProcessStatus::ok(response.status_or_ok(), self.elapsed());
        status.exception.clone_from(&response.exception);
        self.deliver(response, &mut status, self.expects_reply());
        status
    }

    /// Classifies a failure and replies with it, or hands it to the route's
    /// error handler.
    async fn fail(&self, err: &AppError) -> ProcessStatus {
        let classified = classify(err);
        log_failure(self.route(), self.instance, &classified);
        let mut status =
            ProcessStatus::failed(classified.status, classified.message.clone(), self.elapsed());

        if let Some(handler) = self.def.error_handler() {
            let handled = handler
                .handle_error(
                    self.route(),
                    classified.status,
                    &classified.message,
                    &self.event,
                    self.instance,
                )
                .await;
            if let Err(e) = handled {
                tracing::error!(route = self.route(), "Error handler failed - {e}");
                status.delivered = false;
                status.exception = Some(format!("Response not delivered - {e}"));
            }
            return status;
        }

        let response = self
            .base_reply()
            .with_exception(classified.status, classified.message);
        self.deliver(response, &mut status, self.event.reply_to.is_some());
        status
    }

    /// Waits for a deferred reply under the caller's deadline.
    ///
    /// Dropping the future on expiry disposes it, so a late resolution
    /// cannot produce a second reply. A panic while resolving is a failure
    /// like any other.
    async fn resolve_deferred(self, pending: DeferredReply) {
        let timeout = self.reply_timeout();
        let guarded = AssertUnwindSafe(pending).catch_unwind();
        let status = match tokio::time::timeout(timeout, guarded).await {
            Ok(Ok(Ok(reply))) => self.reply(reply).await,
            Ok(Ok(Err(e))) => self.fail(&e).await,
            Ok(Err(panic)) => self.fail(&panic_error(panic.as_ref())).await,
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    route = self.route(),
                    instance = self.instance,
                    timeout_ms,
                    "Async response timeout"
                );
                let mut status = ProcessStatus::failed(
                    408,
                    format!("Timeout for {timeout_ms} ms"),
                    self.elapsed(),
                );
                status.delivered = !self.expects_reply();
                status
            }
        };
        self.finish(status).await;
    }

    /// Replies with the stream id and time-to-live, then publishes in the
    /// background. Readiness does not wait for the stream.
    fn start_stream(&self, stream: ReplyStream) -> ProcessStatus {
        let ttl = self.reply_timeout();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let (stream_id, tx) = self.ctx.streams.open(ttl);

        let route = self.route().to_string();
        let id = stream_id.clone();
        let deadline = tokio::time::Instant::now() + ttl;
        tokio::spawn(async move {
            publish(&route, &id, stream, tx, deadline).await;
        });

        let response = self
            .base_reply()
            .with_header(headers::X_STREAM_ID, stream_id)
            .with_header(headers::X_TTL, ttl_ms.to_string())
            .with_body(Value::empty_map())
            .with_status(STATUS_OK);
        let mut status = ProcessStatus::ok(STATUS_OK, self.elapsed());
        self.deliver(response, &mut status, self.expects_reply());
        status
    }

    /// Records metrics, closes the trace span and releases the instance.
    async fn finish(mut self, status: ProcessStatus) {
        let route = self.route().to_string();
        metrics::counter!(
            "mesh_events_total",
            "route" => route.clone(),
            "status" => status.status.to_string()
        )
        .increment(1);
        metrics::histogram!("mesh_event_duration_seconds", "route" => route.clone())
            .record(status.exec_time / 1000.0);

        tracing::debug!(
            route = %route,
            instance = self.instance,
            status = status.status,
            exec_time = status.exec_time,
            "event processed"
        );

        if let Some(span) = self.span.take() {
            let tracer = Arc::clone(&self.ctx.tracer);
            let journal = self.journal_input.take().map(|input| TraceJournal {
                input,
                output: status.output.clone().unwrap_or(Value::Null),
            });
            let outcome = SpanOutcome {
                from: self.event.from.clone(),
                success: status.success,
                status: status.status,
                exec_time: status.exec_time,
                exception: status.exception.clone(),
                journal,
            };
            let rpc = self.event.reply_to.is_some();
            if let Some(record) = tracer.stop_tracing(span, outcome) {
                if tracer.should_emit(&route, rpc, status.delivered) {
                    tracer.emit(record).await;
                }
            }
        }
        // Dropping `self` fires the ready signal and the in-flight guard.
    }
}
