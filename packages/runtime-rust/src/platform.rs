//! The platform: registered routes, the reply inbox and the shared services
//! every dispatcher runs against.
//!
//! A [`Platform`] is a cheap, cloneable handle. It is passed explicitly to
//! whatever needs to send events; there is no process-wide instance.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use mesh_core::Envelope;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::LocalBus;
use crate::config::RuntimeConfig;
use crate::error::{PlatformError, RegistryError, RpcError, SendError};
use crate::lifecycle::{Lifecycle, RunState};
use crate::post_office::PostOffice;
use crate::routing::{run_multicast, RouteTable};
use crate::rpc::{run_inbox, Correlator};
use crate::scheduler::Scheduler;
use crate::service::executor::Executors;
use crate::service::handler::Headers;
use crate::service::queue::ServiceQueue;
use crate::service::registry::{Registration, ServiceDef, ServiceRegistry};
use crate::service::stream::{StreamConsumer, StreamRegistry};
use crate::service::worker::{DispatchContext, Dispatcher};
use crate::tracer::{RouteCollector, TraceCollector, Tracer};

/// Running state of one registered route.
struct RouteHandle {
    def: Arc<ArcSwap<ServiceDef>>,
    stop: CancellationToken,
}

struct PlatformInner {
    handle: Handle,
    ctx: Arc<DispatchContext>,
    registry: ServiceRegistry,
    running: DashMap<String, RouteHandle>,
    correlator: Arc<Correlator>,
    routes: RouteTable,
    scheduler: Scheduler,
}

/// Entry point of the event mesh.
#[derive(Clone)]
pub struct Platform {
    inner: Arc<PlatformInner>,
}

impl Platform {
    /// Starts a platform on the current tokio runtime. Trace records go to
    /// the configured collector route, or to the log while that route is not
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::NoRuntime` when called outside a runtime,
    /// `PlatformError::Thread` if the OS pool cannot start and
    /// `PlatformError::Routing` for an invalid substitution or multicast table.
    pub fn new(config: RuntimeConfig) -> Result<Self, PlatformError> {
        let bus = Arc::new(LocalBus::new());
        let collector = Arc::new(RouteCollector::new(
            Arc::clone(&bus),
            config.trace.collector_route.clone(),
        ));
        Self::build(config, bus, collector)
    }

    /// Starts a platform that hands trace records to `collector`.
    ///
    /// # Errors
    ///
    /// Same as [`Platform::new`].
    pub fn with_collector(
        config: RuntimeConfig,
        collector: Arc<dyn TraceCollector>,
    ) -> Result<Self, PlatformError> {
        Self::build(config, Arc::new(LocalBus::new()), collector)
    }

    fn build(
        config: RuntimeConfig,
        bus: Arc<LocalBus>,
        collector: Arc<dyn TraceCollector>,
    ) -> Result<Self, PlatformError> {
        let handle = Handle::try_current()?;
        let routes = RouteTable::new(&config.routing)?;
        let executors = Arc::new(Executors::new(&config.dispatch)?);
        let tracer = Arc::new(Tracer::new(config.origin.clone(), &config.trace, collector));
        let streams = Arc::new(StreamRegistry::new(config.stream.buffer));
        let lifecycle = Arc::new(Lifecycle::new());
        let correlator = Arc::new(Correlator::new(Arc::clone(&bus), &config.rpc));

        let inbox = bus.bind(correlator.inbox());
        handle.spawn(run_inbox(
            Arc::clone(&correlator),
            inbox,
            lifecycle.child_token(),
        ));
        for (source, members) in routes.multicast() {
            info!("Multicast {source} -> {members:?}");
            handle.spawn(run_multicast(
                source.to_string(),
                members.to_vec(),
                Arc::clone(&bus),
                bus.bind(source),
                lifecycle.child_token(),
            ));
        }
        let scheduler = Scheduler::new(Arc::clone(&bus), handle.clone(), lifecycle.child_token());

        info!(
            origin = %config.origin,
            light_pool = config.dispatch.light_pool_size,
            os_pool = executors.os_threads(),
            "platform started"
        );
        lifecycle.set_running();

        let ctx = Arc::new(DispatchContext {
            config: Arc::new(config),
            bus,
            tracer,
            streams,
            executors,
            lifecycle,
        });
        Ok(Self {
            inner: Arc::new(PlatformInner {
                handle,
                ctx,
                registry: ServiceRegistry::new(),
                running: DashMap::new(),
                correlator,
                routes,
                scheduler,
            }),
        })
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.inner.ctx.config.origin
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.ctx.config
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.inner.ctx.lifecycle.state()
    }

    pub(crate) fn tracer(&self) -> &Tracer {
        &self.inner.ctx.tracer
    }

    // -- Registration -------------------------------------------------------

    /// Registers a route and starts its instances.
    ///
    /// The instance count is clamped to the configured maximum. Registering
    /// an existing route with the same instance count swaps in the new
    /// definition without disturbing queued events.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Reserved` for the reply inbox route and multicast
    ///   sources.
    /// - `RegistryError::InvalidRoute` for a malformed route name.
    /// - `RegistryError::Conflict` when the instance count differs from the
    ///   running registration.
    pub fn register(&self, def: ServiceDef) -> Result<Registration, RegistryError> {
        if def.route() == self.inner.correlator.inbox()
            || self.inner.routes.members(def.route()).is_some()
        {
            return Err(RegistryError::Reserved(def.route().to_string()));
        }
        let max = self.config().dispatch.max_instances.max(1);
        let def = if def.instances() > max {
            warn!(
                route = def.route(),
                requested = def.instances(),
                max,
                "instance count clamped"
            );
            def.with_instances(max)
        } else {
            def
        };

        let (def, registration) = self.inner.registry.register(def)?;
        match registration {
            Registration::Added => self.start_route(def),
            Registration::Reloaded => {
                if let Some(running) = self.inner.running.get(def.route()) {
                    running.def.store(Arc::clone(&def));
                }
                info!(route = def.route(), "service reloaded");
            }
        }
        Ok(registration)
    }

    fn start_route(&self, def: Arc<ServiceDef>) {
        let ctx = &self.inner.ctx;
        let route = def.route().to_string();
        let stop = ctx.lifecycle.child_token();
        let slot = Arc::new(ArcSwap::new(Arc::clone(&def)));
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        let capacity = ctx.config.dispatch.intake_capacity.max(1);
        let mut senders = Vec::with_capacity(def.instances());
        for instance in 1..=def.instances() {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            let dispatcher =
                Dispatcher::new(Arc::clone(ctx), Arc::clone(&slot), instance, ready_tx.clone());
            self.inner.handle.spawn(dispatcher.run(rx, stop.clone()));
        }

        let intake = ctx.bus.bind(&route);
        let queue = ServiceQueue::new(route.as_str(), Arc::clone(&ctx.lifecycle), senders);
        self.inner.handle.spawn(queue.run(intake, ready_rx, stop.clone()));

        info!(
            route = %route,
            instances = def.instances(),
            model = %def.model(),
            "service registered"
        );
        self.inner.running.insert(route, RouteHandle { def: slot, stop });
    }

    /// Stops a route. Events already queued for it are dropped.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if the route is not registered.
    pub fn release(&self, route: &str) -> Result<(), RegistryError> {
        self.inner
            .registry
            .remove(route)
            .ok_or_else(|| RegistryError::NotFound(route.to_string()))?;
        self.inner.ctx.bus.unbind(route);
        if let Some((_, running)) = self.inner.running.remove(route) {
            running.stop.cancel();
        }
        info!(route, "service released");
        Ok(())
    }

    #[must_use]
    pub fn has_route(&self, route: &str) -> bool {
        self.inner.ctx.bus.exists(route)
    }

    /// Registered service routes in registration order.
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        self.inner.registry.routes()
    }

    // -- Messaging ----------------------------------------------------------

    fn check_accepting(&self) -> Result<(), SendError> {
        if self.inner.ctx.lifecycle.is_accepting() {
            Ok(())
        } else {
            Err(SendError::ShuttingDown)
        }
    }

    /// The route events for `to` are delivered to after substitution.
    #[must_use]
    pub fn substitute_route<'a>(&'a self, to: &'a str) -> &'a str {
        self.inner.routes.substitute(to)
    }

    /// Whether any multicast route is configured.
    #[must_use]
    pub fn is_multicast_enabled(&self) -> bool {
        self.inner.routes.is_multicast_enabled()
    }

    /// Fire-and-forget delivery to `event.to`, after route substitution.
    ///
    /// # Errors
    ///
    /// Returns `SendError::ShuttingDown` once shutdown has begun, otherwise
    /// any error from the bus.
    pub fn send(&self, event: &Envelope) -> Result<(), SendError> {
        self.check_accepting()?;
        match self.inner.routes.rerouted(event) {
            Some(rerouted) => self.inner.ctx.bus.send_event(&rerouted),
            None => self.inner.ctx.bus.send_event(event),
        }
    }

    /// Delivers `event` after `delay`. Returns the id of the scheduled
    /// delivery.
    ///
    /// # Errors
    ///
    /// Returns `SendError::ShuttingDown` once shutdown has begun,
    /// `SendError::MissingRoute` when `to` is unset, or an encode error.
    pub fn send_later(&self, mut event: Envelope, delay: Duration) -> Result<String, SendError> {
        self.check_accepting()?;
        self.inner.routes.reroute(&mut event);
        self.inner.scheduler.schedule(&event, delay)
    }

    /// Cancels a delivery scheduled by [`Platform::send_later`]. Returns
    /// `false` if it already fired or is unknown.
    pub fn cancel_future_event(&self, id: &str) -> bool {
        self.inner.scheduler.cancel(id)
    }

    /// Ids of the deliveries scheduled for `to`.
    #[must_use]
    pub fn future_events(&self, to: &str) -> Vec<String> {
        self.inner.scheduler.events_for(to)
    }

    /// Routes with at least one scheduled delivery.
    #[must_use]
    pub fn all_future_events(&self) -> Vec<String> {
        self.inner.scheduler.routes()
    }

    /// Wall-clock time a scheduled delivery is due.
    #[must_use]
    pub fn future_event_time(&self, id: &str) -> Option<SystemTime> {
        self.inner.scheduler.due_time(id)
    }

    /// Sends `event` and waits up to `timeout` for the reply.
    ///
    /// # Errors
    ///
    /// See [`Correlator::request`]; also `SendError::ShuttingDown`.
    pub async fn request(
        &self,
        mut event: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RpcError> {
        self.check_accepting()?;
        self.inner.routes.reroute(&mut event);
        self.inner.correlator.request(event, timeout).await
    }

    /// Sends all events in parallel and collects replies under one deadline.
    ///
    /// # Errors
    ///
    /// See [`Correlator::request_all`]; also `SendError::ShuttingDown`.
    pub async fn request_all(
        &self,
        events: Vec<Envelope>,
        timeout: Duration,
    ) -> Result<Vec<Envelope>, RpcError> {
        self.check_accepting()?;
        let events = events
            .into_iter()
            .map(|mut event| {
                self.inner.routes.reroute(&mut event);
                event
            })
            .collect();
        self.inner.correlator.request_all(events, timeout).await
    }

    /// Requests still waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Messaging handle bound to the calling handler's route and trace.
    #[must_use]
    pub fn post_office(&self, headers: &Headers, instance: usize) -> PostOffice {
        PostOffice::new(self, headers, instance)
    }

    /// Takes the consumer side of a stream announced in a reply's
    /// `x-stream-id` header. Each stream can be attached once.
    #[must_use]
    pub fn attach_stream(&self, stream_id: &str) -> Option<StreamConsumer> {
        self.inner.ctx.streams.attach(stream_id)
    }

    // -- Shutdown -----------------------------------------------------------

    /// Stops accepting sends, waits for accepted events up to the drain
    /// timeout, then stops every route and the worker pools.
    ///
    /// Accepted events include those buffered behind busy instances. Events
    /// still queued when the drain timeout passes are dropped, as are
    /// deliveries scheduled with [`Platform::send_later`].
    ///
    /// Returns `false` if events were still pending when the drain timeout
    /// passed.
    pub async fn shutdown(&self) -> bool {
        let ctx = &self.inner.ctx;
        if !ctx.lifecycle.is_accepting() {
            return ctx.lifecycle.in_flight_count() == 0;
        }
        ctx.lifecycle.begin_drain();
        info!(in_flight = ctx.lifecycle.in_flight_count(), "platform draining");

        let drained = ctx.lifecycle.wait_for_drain(ctx.config.drain_timeout).await;
        if !drained {
            warn!(
                in_flight = ctx.lifecycle.in_flight_count(),
                "drain timeout expired with events in flight"
            );
        }

        ctx.lifecycle.stop();
        self.inner.scheduler.cancel_all();
        for route in self.inner.registry.routes() {
            ctx.bus.unbind(&route);
        }
        for (source, _) in self.inner.routes.multicast() {
            ctx.bus.unbind(source);
        }
        self.inner.running.clear();
        self.inner.correlator.cancel_all();
        ctx.executors.close();
        info!("platform stopped");
        drained
    }

    /// Runs until Ctrl-C, then shuts down.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handler cannot be installed.
    pub async fn shutdown_on_ctrl_c(&self) -> anyhow::Result<bool> {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        Ok(self.shutdown().await)
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("origin", &self.origin())
            .field("routes", &self.routes())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::handler::{handler_fn, HandlerResult};

    fn echo(route: &str) -> ServiceDef {
        ServiceDef::new(
            route,
            handler_fn(|_h, input, _i| async move { Ok(HandlerResult::value(input.into_value())) }),
        )
    }

    #[test]
    fn platform_needs_a_runtime() {
        let err = Platform::new(RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, PlatformError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn inbox_route_is_reserved() {
        let platform = Platform::new(RuntimeConfig::default()).unwrap();
        let err = platform.register(echo("temporary.inbox")).unwrap_err();
        assert!(matches!(err, RegistryError::Reserved(_)));
        assert!(platform.has_route("temporary.inbox"));
    }

    #[tokio::test]
    async fn instances_are_clamped() {
        let mut config = RuntimeConfig::default();
        config.dispatch.max_instances = 3;
        let platform = Platform::new(config).unwrap();

        platform.register(echo("wide.service").with_instances(50)).unwrap();
        let def = platform.inner.registry.lookup("wide.service").unwrap();
        assert_eq!(def.instances(), 3);
    }

    #[tokio::test]
    async fn release_removes_route() {
        let platform = Platform::new(RuntimeConfig::default()).unwrap();
        platform.register(echo("echo.service")).unwrap();
        assert!(platform.has_route("echo.service"));

        platform.release("echo.service").unwrap();
        assert!(!platform.has_route("echo.service"));
        assert!(matches!(
            platform.release("echo.service"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn send_after_shutdown_is_refused() {
        let platform = Platform::new(RuntimeConfig::default()).unwrap();
        platform.register(echo("echo.service")).unwrap();

        assert!(platform.shutdown().await);
        assert_eq!(platform.state(), RunState::Stopped);

        let err = platform
            .send(&Envelope::new().with_to("echo.service"))
            .unwrap_err();
        assert!(matches!(err, SendError::ShuttingDown));
    }
}
