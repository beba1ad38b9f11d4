//! Per-instance dispatcher.
//!
//! A dispatcher drains the bounded intake of one `(route, instance)` pair.
//! For each event it decodes the envelope, strips reserved headers and hands
//! the invocation to the route's executor. The instance stays busy until the
//! invocation's [`ReadySignal`] drops, which is what keeps delivery to one
//! instance strictly sequential.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use mesh_core::{headers, Envelope, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::adapter::Invocation;
use super::classify::panic_error;
use super::executor::Executors;
use super::handler::{Headers, HandlerInput, HandlerResult};
use super::queue::{Queued, ReadySignal};
use super::registry::ServiceDef;
use super::stream::StreamRegistry;
use crate::bus::LocalBus;
use crate::config::RuntimeConfig;
use crate::error::AppError;
use crate::lifecycle::{InFlightGuard, Lifecycle};
use crate::tracer::Tracer;

// ---------------------------------------------------------------------------
// DispatchContext
// ---------------------------------------------------------------------------

/// Shared services every dispatcher needs.
///
/// Holds no reference back to the platform, so dispatchers never keep it
/// alive.
pub(crate) struct DispatchContext {
    pub config: Arc<RuntimeConfig>,
    pub bus: Arc<LocalBus>,
    pub tracer: Arc<Tracer>,
    pub streams: Arc<StreamRegistry>,
    pub executors: Arc<Executors>,
    pub lifecycle: Arc<Lifecycle>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub(crate) struct Dispatcher {
    ctx: Arc<DispatchContext>,
    /// Current definition of the route. Reloading swaps it in place.
    def: Arc<ArcSwap<ServiceDef>>,
    instance: usize,
    ready: mpsc::UnboundedSender<usize>,
}

impl Dispatcher {
    pub(crate) fn new(
        ctx: Arc<DispatchContext>,
        def: Arc<ArcSwap<ServiceDef>>,
        instance: usize,
        ready: mpsc::UnboundedSender<usize>,
    ) -> Self {
        Self {
            ctx,
            def,
            instance,
            ready,
        }
    }

    /// Runs until the intake closes or `stop` is cancelled.
    pub(crate) async fn run(self, mut intake: mpsc::Receiver<Queued>, stop: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                next = intake.recv() => match next {
                    Some(queued) => self.submit(queued),
                    None => break,
                },
            }
        }
        tracing::debug!(route = self.def.load().route(), instance = self.instance, "dispatcher stopped");
    }

    fn submit(&self, queued: Queued) {
        let Queued { payload, in_flight } = queued;
        let def = self.def.load_full();
        let ready = ReadySignal::new(self.instance, self.ready.clone());
        let mut event = match Envelope::from_bytes(&payload) {
            Ok(event) => event,
            Err(e) => {
                // Dropping `ready` returns the instance to the queue.
                tracing::error!(
                    route = def.route(),
                    instance = self.instance,
                    "Unable to decode event - {e}"
                );
                return;
            }
        };
        event.strip_reserved_headers();

        let model = def.model();
        let ctx = Arc::clone(&self.ctx);
        let job = process_event(ctx, def, self.instance, event, ready, in_flight);
        self.ctx.executors.execute(model, job.boxed());
    }
}

// ---------------------------------------------------------------------------
// Event processing
// ---------------------------------------------------------------------------

async fn process_event(
    ctx: Arc<DispatchContext>,
    def: Arc<ServiceDef>,
    instance: usize,
    event: Envelope,
    ready: ReadySignal,
    in_flight: InFlightGuard,
) {
    let route = def.route();

    let span = if def.is_trackable() {
        ctx.tracer.start_tracing(
            route,
            event.trace_id.as_deref(),
            event.trace_path.as_deref(),
            instance,
        )
    } else {
        None
    };
    let journal_input = (span.is_some() && ctx.tracer.is_journaled(route))
        .then(|| event.body.clone().unwrap_or(Value::Null));

    let started = Instant::now();
    let outcome = match build_input(&def, &event) {
        Ok(input) => invoke(&def, handler_headers(route, &event), input, instance).await,
        Err(e) => Err(e),
    };

    let invocation = Invocation {
        ctx,
        def,
        instance,
        event,
        span,
        started,
        journal_input,
        _ready: ready,
        _in_flight: in_flight,
    };
    invocation.complete(outcome).await;
}

/// Calls the handler, turning a panic into an internal error.
async fn invoke(
    def: &ServiceDef,
    headers: Headers,
    input: HandlerInput,
    instance: usize,
) -> Result<HandlerResult, AppError> {
    AssertUnwindSafe(def.handler().handle(headers, input, instance))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_error(panic.as_ref())))
}

/// Headers visible to the handler: the event's own headers plus the
/// route and trace identity.
fn handler_headers(route: &str, event: &Envelope) -> Headers {
    let mut visible = event.headers.clone();
    visible.insert(headers::MY_ROUTE.to_string(), route.to_string());
    if let Some(id) = &event.trace_id {
        visible.insert(headers::MY_TRACE_ID.to_string(), id.clone());
    }
    if let Some(path) = &event.trace_path {
        visible.insert(headers::MY_TRACE_PATH.to_string(), path.clone());
    }
    visible
}

/// Converts the event body into the shape the handler declared.
///
/// # Errors
///
/// Returns a validation error when the body does not match the route's
/// schema, or the serializer's error.
fn build_input(def: &ServiceDef, event: &Envelope) -> Result<HandlerInput, AppError> {
    if def.wants_envelope() {
        return Ok(HandlerInput::Envelope(Box::new(event.clone())));
    }

    let body = match (&event.body, def.schema()) {
        (None, None) => return Ok(HandlerInput::Empty),
        (Some(body), _) => body.clone(),
        (None, Some(_)) => Value::Null,
    };
    let body = match def.serializer() {
        Some(serializer) => serializer.to_input(body)?,
        None => body,
    };

    let Some(schema) = def.schema() else {
        return Ok(HandlerInput::Body(body));
    };
    match &body {
        Value::Array(items) if body.is_list_of_maps() => {
            Ok(HandlerInput::Records(schema.decode_all(items)?))
        }
        _ => Ok(HandlerInput::Record(schema.decode(&body)?)),
    }
}
