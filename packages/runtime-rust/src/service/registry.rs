use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use mesh_core::InputSchema;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::handler::{CustomSerializer, ErrorHandler, Handler};
use crate::error::RegistryError;

// ---------------------------------------------------------------------------
// ExecutionModel
// ---------------------------------------------------------------------------

/// How a route's handler is scheduled.
///
/// All three are functionally equivalent; they differ in scheduling cost and
/// in how much blocking the handler may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionModel {
    /// Task on the shared cooperative runtime. Handler must not block.
    #[default]
    Cooperative,
    /// Bounded pool of blocking-capable tasks. Brief blocking is fine.
    PooledLight,
    /// Dedicated OS threads. Long blocking is fine.
    PooledOs,
}

impl fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionModel::Cooperative => "cooperative",
            ExecutionModel::PooledLight => "pooled-light",
            ExecutionModel::PooledOs => "pooled-os",
        })
    }
}

// ---------------------------------------------------------------------------
// ServiceDef
// ---------------------------------------------------------------------------

/// Definition of a route: handler, instance count, execution model and flags.
///
/// Built once with the `with_*` setters and immutable after registration.
#[derive(Clone)]
pub struct ServiceDef {
    route: String,
    handler: Arc<dyn Handler>,
    instances: usize,
    model: ExecutionModel,
    interceptor: bool,
    trackable: bool,
    accepts_envelope: bool,
    schema: Option<Arc<InputSchema>>,
    serializer: Option<Arc<dyn CustomSerializer>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl ServiceDef {
    /// A single-instance, cooperative, traced route.
    pub fn new(route: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            route: route.into(),
            handler,
            instances: 1,
            model: ExecutionModel::Cooperative,
            interceptor: false,
            trackable: true,
            accepts_envelope: false,
            schema: None,
            serializer: None,
            error_handler: None,
        }
    }

    /// Sets the instance count. Values below 1 become 1.
    #[must_use]
    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances.max(1);
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: ExecutionModel) -> Self {
        self.model = model;
        self
    }

    /// Interceptors get the raw envelope and never reply automatically.
    #[must_use]
    pub fn interceptor(mut self) -> Self {
        self.interceptor = true;
        self
    }

    /// Disables trace spans for this route.
    #[must_use]
    pub fn untracked(mut self) -> Self {
        self.trackable = false;
        self
    }

    /// Passes the raw envelope instead of the decoded body.
    #[must_use]
    pub fn accepts_envelope(mut self) -> Self {
        self.accepts_envelope = true;
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: InputSchema) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn CustomSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn route(&self) -> &str {
        &self.route
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    #[must_use]
    pub fn instances(&self) -> usize {
        self.instances
    }

    #[must_use]
    pub fn model(&self) -> ExecutionModel {
        self.model
    }

    #[must_use]
    pub fn is_interceptor(&self) -> bool {
        self.interceptor
    }

    #[must_use]
    pub fn is_trackable(&self) -> bool {
        self.trackable
    }

    #[must_use]
    pub fn is_envelope_input(&self) -> bool {
        self.accepts_envelope
    }

    #[must_use]
    pub fn schema(&self) -> Option<&InputSchema> {
        self.schema.as_deref()
    }

    #[must_use]
    pub fn serializer(&self) -> Option<&Arc<dyn CustomSerializer>> {
        self.serializer.as_ref()
    }

    #[must_use]
    pub fn error_handler(&self) -> Option<&Arc<dyn ErrorHandler>> {
        self.error_handler.as_ref()
    }

    /// Whether the handler gets the raw envelope rather than a decoded body.
    #[must_use]
    pub fn wants_envelope(&self) -> bool {
        self.accepts_envelope || (self.interceptor && self.schema.is_none())
    }
}

impl fmt::Debug for ServiceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDef")
            .field("route", &self.route)
            .field("instances", &self.instances)
            .field("model", &self.model)
            .field("interceptor", &self.interceptor)
            .field("trackable", &self.trackable)
            .field("accepts_envelope", &self.accepts_envelope)
            .field("schema", &self.schema.as_ref().map(|s| s.name.as_str()))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Route names
// ---------------------------------------------------------------------------

/// Checks a route name: lowercase letters, digits, `.`, `-` and `_`, with at
/// least one `.` and no empty segment.
///
/// # Errors
///
/// Returns `RegistryError::InvalidRoute` if the name does not qualify.
pub fn validate_route(route: &str) -> Result<(), RegistryError> {
    let charset_ok = route
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'));
    let segments_ok = route.contains('.') && route.split('.').all(|s| !s.is_empty());
    if charset_ok && segments_ok {
        Ok(())
    } else {
        Err(RegistryError::InvalidRoute(route.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Outcome of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The route was not registered before.
    Added,
    /// The route existed with the same instance count and was replaced.
    Reloaded,
}

/// Route name to service definition map.
///
/// Lookups are lock-free through `DashMap`; registration order is kept for
/// deterministic listing and shutdown.
pub struct ServiceRegistry {
    routes: DashMap<String, Arc<ServiceDef>>,
    order: RwLock<Vec<String>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers or reloads a route.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidRoute` for a malformed name and
    /// `RegistryError::Conflict` if the route is registered with a different
    /// instance count.
    pub fn register(&self, def: ServiceDef) -> Result<(Arc<ServiceDef>, Registration), RegistryError> {
        validate_route(def.route())?;
        let def = Arc::new(def);

        match self.routes.entry(def.route().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let current = existing.get().instances();
                if current != def.instances() {
                    return Err(RegistryError::Conflict {
                        route: def.route().to_string(),
                        existing: current,
                        requested: def.instances(),
                    });
                }
                existing.insert(Arc::clone(&def));
                Ok((def, Registration::Reloaded))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&def));
                self.order.write().push(def.route().to_string());
                Ok((def, Registration::Added))
            }
        }
    }

    #[must_use]
    pub fn lookup(&self, route: &str) -> Option<Arc<ServiceDef>> {
        self.routes.get(route).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    /// Removes a route, returning its definition if it was registered.
    pub fn remove(&self, route: &str) -> Option<Arc<ServiceDef>> {
        let removed = self.routes.remove(route).map(|(_, def)| def);
        if removed.is_some() {
            self.order.write().retain(|r| r != route);
        }
        removed
    }

    /// Registered routes in registration order.
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        self.order.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;

    use super::*;
    use crate::service::handler::{handler_fn, HandlerResult};

    fn counting_handler(counter: Arc<AtomicU32>) -> Arc<dyn Handler> {
        handler_fn(move |_, _, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerResult::null())
            }
        })
    }

    fn noop() -> Arc<dyn Handler> {
        handler_fn(|_, _, _| async { Ok(HandlerResult::null()) })
    }

    #[test]
    fn register_and_lookup() {
        let registry = ServiceRegistry::new();
        let (def, outcome) = registry
            .register(ServiceDef::new("hello.world", noop()).with_instances(5))
            .unwrap();
        assert_eq!(outcome, Registration::Added);
        assert_eq!(def.instances(), 5);

        let found = registry.lookup("hello.world").unwrap();
        assert_eq!(found.route(), "hello.world");
        assert_eq!(found.model(), ExecutionModel::Cooperative);
        assert!(found.is_trackable());
    }

    #[test]
    fn lookup_unregistered_returns_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.lookup("no.such.route").is_none());
    }

    #[test]
    fn same_instance_count_reloads() {
        let registry = ServiceRegistry::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        registry
            .register(ServiceDef::new("a.b", counting_handler(first)).with_instances(2))
            .unwrap();
        let (_, outcome) = registry
            .register(ServiceDef::new("a.b", counting_handler(Arc::clone(&second))).with_instances(2))
            .unwrap();

        assert_eq!(outcome, Registration::Reloaded);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.routes(), vec!["a.b".to_string()]);
    }

    #[test]
    fn different_instance_count_conflicts() {
        let registry = ServiceRegistry::new();
        registry
            .register(ServiceDef::new("a.b", noop()).with_instances(2))
            .unwrap();
        let err = registry
            .register(ServiceDef::new("a.b", noop()).with_instances(3))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Conflict { existing: 2, requested: 3, .. }
        ));
        assert_eq!(registry.lookup("a.b").unwrap().instances(), 2);
    }

    #[test]
    fn routes_keep_registration_order() {
        let registry = ServiceRegistry::new();
        for route in ["c.one", "a.two", "b.three"] {
            registry.register(ServiceDef::new(route, noop())).unwrap();
        }
        assert_eq!(registry.routes(), vec!["c.one", "a.two", "b.three"]);

        registry.remove("a.two");
        assert_eq!(registry.routes(), vec!["c.one", "b.three"]);
        assert!(registry.remove("a.two").is_none());
    }

    #[test]
    fn zero_instances_become_one() {
        let def = ServiceDef::new("a.b", noop()).with_instances(0);
        assert_eq!(def.instances(), 1);
    }

    #[test]
    fn route_validation() {
        assert!(validate_route("hello.world").is_ok());
        assert!(validate_route("v1.profile-service_2").is_ok());
        assert!(validate_route("nodot").is_err());
        assert!(validate_route("Upper.case").is_err());
        assert!(validate_route("a..b").is_err());
        assert!(validate_route(".a").is_err());
        assert!(validate_route("a b.c").is_err());
    }

    #[test]
    fn interceptor_without_schema_wants_envelope() {
        let plain = ServiceDef::new("a.b", noop());
        assert!(!plain.wants_envelope());
        assert!(plain.clone().interceptor().wants_envelope());
        assert!(plain.clone().accepts_envelope().wants_envelope());

        let typed = plain
            .interceptor()
            .with_schema(mesh_core::InputSchema::new("T"));
        assert!(!typed.wants_envelope());
    }

    #[test]
    fn execution_model_names() {
        assert_eq!(ExecutionModel::PooledLight.to_string(), "pooled-light");
        let parsed: ExecutionModel = serde_json::from_str("\"pooled-os\"").unwrap();
        assert_eq!(parsed, ExecutionModel::PooledOs);
    }

    proptest! {
        #[test]
        fn dotted_lowercase_routes_are_valid(
            segments in prop::collection::vec("[a-z0-9_-]{1,8}", 2..5)
        ) {
            let route = segments.join(".");
            prop_assert!(validate_route(&route).is_ok());
        }

        #[test]
        fn routes_with_uppercase_are_rejected(route in "[a-z]{1,4}\\.[A-Z]{1,4}") {
            prop_assert!(validate_route(&route).is_err());
        }
    }
}
