//! Distributed trace spans.
//!
//! A span is opened per `(route, instance)` when an event carrying a trace id
//! reaches a traced route. Since an instance handles one event at a time,
//! the pair identifies the open span without any handle passing through
//! handler code; handlers annotate it through the post office.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use mesh_core::trace::UNKNOWN_CALLER;
use mesh_core::{ClockSource, Envelope, SystemClock, TraceJournal, TraceRecord, Value};

use crate::bus::LocalBus;
use crate::config::TraceConfig;

// ---------------------------------------------------------------------------
// Collectors
// ---------------------------------------------------------------------------

/// Destination of emitted trace records.
#[async_trait]
pub trait TraceCollector: Send + Sync + 'static {
    /// Delivers one record. Failures are logged by the tracer, never
    /// surfaced to the traced call.
    async fn collect(&self, record: &TraceRecord) -> anyhow::Result<()>;
}

/// Writes trace payloads to the log.
#[derive(Debug, Clone, Default)]
pub struct LogCollector;

#[async_trait]
impl TraceCollector for LogCollector {
    async fn collect(&self, record: &TraceRecord) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&record.to_payload().to_json())?;
        tracing::info!(target: "mesh::trace", trace_id = %record.trace_id, "{payload}");
        Ok(())
    }
}

/// Sends trace payloads to a collector route, logging them while that route
/// is not registered.
pub struct RouteCollector {
    bus: Arc<LocalBus>,
    route: String,
}

impl RouteCollector {
    #[must_use]
    pub fn new(bus: Arc<LocalBus>, route: impl Into<String>) -> Self {
        Self {
            bus,
            route: route.into(),
        }
    }
}

#[async_trait]
impl TraceCollector for RouteCollector {
    async fn collect(&self, record: &TraceRecord) -> anyhow::Result<()> {
        if !self.bus.exists(&self.route) {
            return LogCollector.collect(record).await;
        }
        let event = Envelope::new()
            .with_to(self.route.as_str())
            .with_body(record.to_payload());
        self.bus.send(&self.route, Bytes::from(event.to_bytes()?))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

/// Identifies an open span.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpanHandle {
    route: String,
    instance: usize,
}

impl SpanHandle {
    #[must_use]
    pub fn route(&self) -> &str {
        &self.route
    }

    #[must_use]
    pub fn instance(&self) -> usize {
        self.instance
    }
}

#[derive(Debug)]
struct OpenSpan {
    trace_id: String,
    trace_path: String,
    start: u64,
    annotations: BTreeMap<String, Value>,
}

/// How the traced invocation ended.
#[derive(Debug, Clone)]
pub struct SpanOutcome {
    pub from: Option<String>,
    pub success: bool,
    pub status: u16,
    pub exec_time: f64,
    pub exception: Option<String>,
    pub journal: Option<TraceJournal>,
}

/// Opens, annotates, closes and emits trace spans.
pub struct Tracer {
    origin: String,
    spans: DashMap<(String, usize), OpenSpan>,
    journaled: HashSet<String>,
    collector: Arc<dyn TraceCollector>,
    clock: Arc<dyn ClockSource>,
}

impl Tracer {
    #[must_use]
    pub fn new(
        origin: impl Into<String>,
        config: &TraceConfig,
        collector: Arc<dyn TraceCollector>,
    ) -> Self {
        Self {
            origin: origin.into(),
            spans: DashMap::new(),
            journaled: config.journaled_routes.clone(),
            collector,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for span start times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens a span for `(route, instance)`.
    ///
    /// Returns `None` when the event carries no trace id. A missing path is
    /// recorded as `"?"`.
    pub fn start_tracing(
        &self,
        route: &str,
        trace_id: Option<&str>,
        trace_path: Option<&str>,
        instance: usize,
    ) -> Option<SpanHandle> {
        let trace_id = trace_id?;
        let span = OpenSpan {
            trace_id: trace_id.to_string(),
            trace_path: trace_path.unwrap_or("?").to_string(),
            start: self.clock.now(),
            annotations: BTreeMap::new(),
        };
        self.spans.insert((route.to_string(), instance), span);
        Some(SpanHandle {
            route: route.to_string(),
            instance,
        })
    }

    /// Adds an annotation to the open span of `(route, instance)`.
    ///
    /// Returns `false` when no span is open.
    pub fn annotate(&self, route: &str, instance: usize, key: &str, value: Value) -> bool {
        match self.spans.get_mut(&(route.to_string(), instance)) {
            Some(mut span) => {
                span.annotations.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Annotations accumulated so far on an open span.
    #[must_use]
    pub fn annotations(&self, handle: &SpanHandle) -> BTreeMap<String, Value> {
        self.spans
            .get(&(handle.route.clone(), handle.instance))
            .map(|span| span.annotations.clone())
            .unwrap_or_default()
    }

    /// Closes the span and builds its record.
    ///
    /// Returns `None` if the span was already closed.
    pub fn stop_tracing(&self, handle: SpanHandle, outcome: SpanOutcome) -> Option<TraceRecord> {
        let (_, span) = self.spans.remove(&(handle.route.clone(), handle.instance))?;
        Some(TraceRecord {
            origin: self.origin.clone(),
            trace_id: span.trace_id,
            trace_path: span.trace_path,
            service: handle.route,
            from: outcome.from.unwrap_or_else(|| UNKNOWN_CALLER.to_string()),
            start: span.start,
            success: outcome.success,
            exec_time: outcome.exec_time,
            status: outcome.status,
            exception: outcome.exception,
            annotations: span.annotations,
            journal: outcome.journal,
        })
    }

    #[must_use]
    pub fn is_journaled(&self, route: &str) -> bool {
        self.journaled.contains(route)
    }

    /// Emission rule: journaled routes, fire-and-forget calls and undelivered
    /// replies are emitted; routine delivered RPC traffic is not.
    #[must_use]
    pub fn should_emit(&self, route: &str, rpc: bool, delivered: bool) -> bool {
        self.is_journaled(route) || !rpc || !delivered
    }

    /// Sends a record to the collector, logging delivery failures.
    pub async fn emit(&self, record: TraceRecord) {
        if let Err(e) = self.collector.collect(&record).await {
            tracing::warn!(
                route = %record.service,
                trace_id = %record.trace_id,
                "Unable to deliver trace - {e}"
            );
        }
    }

    /// Number of currently open spans.
    #[must_use]
    pub fn open_spans(&self) -> usize {
        self.spans.len()
    }
}

#[cfg(test)]
mod tests {
    use mesh_core::clock::FixedClock;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Captured(Mutex<Vec<TraceRecord>>);

    #[async_trait]
    impl TraceCollector for Captured {
        async fn collect(&self, record: &TraceRecord) -> anyhow::Result<()> {
            self.0.lock().push(record.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl TraceCollector for Failing {
        async fn collect(&self, _record: &TraceRecord) -> anyhow::Result<()> {
            anyhow::bail!("collector down")
        }
    }

    fn outcome() -> SpanOutcome {
        SpanOutcome {
            from: None,
            success: true,
            status: 200,
            exec_time: 1.5,
            exception: None,
            journal: None,
        }
    }

    fn tracer(collector: Arc<dyn TraceCollector>) -> Tracer {
        let config = TraceConfig {
            journaled_routes: HashSet::from(["journal.me".to_string()]),
            ..TraceConfig::default()
        };
        Tracer::new("node-1", &config, collector).with_clock(Arc::new(FixedClock(1000)))
    }

    #[test]
    fn no_trace_id_means_no_span() {
        let tracer = tracer(Arc::new(LogCollector));
        assert!(tracer.start_tracing("a.b", None, Some("p"), 1).is_none());
        assert_eq!(tracer.open_spans(), 0);
    }

    #[test]
    fn annotations_attach_to_record() {
        let tracer = tracer(Arc::new(LogCollector));
        let handle = tracer.start_tracing("a.b", Some("t1"), None, 2).unwrap();

        assert!(tracer.annotate("a.b", 2, "step", Value::from("one")));
        assert!(!tracer.annotate("a.b", 1, "step", Value::from("other instance")));
        assert_eq!(tracer.annotations(&handle).len(), 1);

        let record = tracer.stop_tracing(handle, outcome()).unwrap();
        assert_eq!(record.origin, "node-1");
        assert_eq!(record.trace_id, "t1");
        assert_eq!(record.trace_path, "?");
        assert_eq!(record.service, "a.b");
        assert_eq!(record.from, "unknown");
        assert_eq!(record.start, 1000);
        assert_eq!(record.annotations.get("step"), Some(&Value::from("one")));
        assert_eq!(tracer.open_spans(), 0);
    }

    #[test]
    fn stopping_twice_yields_nothing() {
        let tracer = tracer(Arc::new(LogCollector));
        let handle = tracer.start_tracing("a.b", Some("t"), Some("p"), 1).unwrap();
        assert!(tracer.stop_tracing(handle.clone(), outcome()).is_some());
        assert!(tracer.stop_tracing(handle, outcome()).is_none());
    }

    #[test]
    fn emission_rule() {
        let tracer = tracer(Arc::new(LogCollector));
        // delivered RPC on a plain route
        assert!(!tracer.should_emit("a.b", true, true));
        // fire-and-forget
        assert!(tracer.should_emit("a.b", false, true));
        // undelivered reply
        assert!(tracer.should_emit("a.b", true, false));
        // journaled route
        assert!(tracer.should_emit("journal.me", true, true));
    }

    #[tokio::test]
    async fn emit_reaches_collector() {
        let captured = Arc::new(Captured::default());
        let tracer = tracer(captured.clone());
        let handle = tracer.start_tracing("a.b", Some("t"), Some("p"), 1).unwrap();
        let record = tracer.stop_tracing(handle, outcome()).unwrap();
        tracer.emit(record).await;
        assert_eq!(captured.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn collector_failure_is_swallowed() {
        let tracer = tracer(Arc::new(Failing));
        let handle = tracer.start_tracing("a.b", Some("t"), Some("p"), 1).unwrap();
        let record = tracer.stop_tracing(handle, outcome()).unwrap();
        tracer.emit(record).await;
    }

    #[tokio::test]
    async fn route_collector_sends_payload_to_route() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.bind("distributed.tracing");
        let collector = RouteCollector::new(Arc::clone(&bus), "distributed.tracing");

        let tracer = tracer(Arc::new(LogCollector));
        let handle = tracer.start_tracing("a.b", Some("t9"), Some("p"), 1).unwrap();
        let record = tracer.stop_tracing(handle, outcome()).unwrap();
        collector.collect(&record).await.unwrap();

        let event = Envelope::from_bytes(&rx.recv().await.unwrap()).unwrap();
        let body = event.body.unwrap();
        assert_eq!(
            body.get("trace").and_then(|t| t.get("id")).and_then(Value::as_str),
            Some("t9")
        );
    }

    #[tokio::test]
    async fn route_collector_logs_without_route() {
        let collector = RouteCollector::new(Arc::new(LocalBus::new()), "distributed.tracing");
        let tracer = tracer(Arc::new(LogCollector));
        let handle = tracer.start_tracing("a.b", Some("t"), Some("p"), 1).unwrap();
        let record = tracer.stop_tracing(handle, outcome()).unwrap();
        assert!(collector.collect(&record).await.is_ok());
    }
}
