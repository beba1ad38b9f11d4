//! Runtime configuration for the dispatch engine.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration for a [`Platform`](crate::platform::Platform).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Identifier of this process, recorded as `origin` on trace records.
    pub origin: String,
    /// Per-route dispatch and execution pool settings.
    pub dispatch: DispatchConfig,
    /// Request/response correlation settings.
    pub rpc: RpcConfig,
    /// Distributed trace emission settings.
    pub trace: TraceConfig,
    /// Streamed result settings.
    pub stream: StreamConfig,
    /// Route substitution and local multicast.
    pub routing: RoutingConfig,
    /// Maximum time `shutdown()` waits for in-flight events.
    pub drain_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            origin: format!("mesh-{}", uuid::Uuid::new_v4().simple()),
            dispatch: DispatchConfig::default(),
            rpc: RpcConfig::default(),
            trace: TraceConfig::default(),
            stream: StreamConfig::default(),
            routing: RoutingConfig::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Dispatcher and execution strategy settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bounded channel capacity between a route's queue and each instance.
    pub intake_capacity: usize,
    /// Maximum number of `pooled-light` handlers running at once.
    pub light_pool_size: usize,
    /// Number of OS threads backing `pooled-os` handlers.
    pub os_pool_size: usize,
    /// Upper bound for a route's instance count.
    pub max_instances: usize,
    /// Deadline for a deferred result when the caller gave none.
    pub default_deferred_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 256,
            light_pool_size: 200,
            os_pool_size: 32,
            max_instances: 1000,
            default_deferred_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Response correlator settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Floor applied to every request timeout.
    pub min_timeout: Duration,
    /// Route receiving replies for requests made through the correlator.
    pub inbox_route: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            min_timeout: Duration::from_millis(100),
            inbox_route: "temporary.inbox".to_string(),
        }
    }
}

/// Trace emission settings.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Route receiving trace payloads. Falls back to logging when the route
    /// is not registered.
    pub collector_route: String,
    /// Routes whose input and output are journaled with every trace.
    pub journaled_routes: HashSet<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            collector_route: "distributed.tracing".to_string(),
            journaled_routes: HashSet::new(),
        }
    }
}

impl TraceConfig {
    #[must_use]
    pub fn is_journaled(&self, route: &str) -> bool {
        self.journaled_routes.contains(route)
    }
}

/// Streamed result settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Frames buffered per stream before the publisher waits for the consumer.
    pub buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { buffer: 1024 }
    }
}

/// Route rewriting applied to outgoing events.
#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    /// Destination routes replaced by another route, e.g. `v1.api -> v2.api`.
    pub substitutions: BTreeMap<String, String>,
    /// Source routes whose events are copied to every member route.
    pub multicast: BTreeMap<String, Vec<String>>,
}

impl RuntimeConfig {
    /// Defaults overlaid with `MESH_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Recognized keys: `MESH_ORIGIN`, `MESH_LIGHT_POOL_SIZE`,
    /// `MESH_OS_POOL_SIZE`, `MESH_MAX_INSTANCES`, `MESH_RPC_MIN_TIMEOUT_MS`,
    /// `MESH_TRACE_COLLECTOR`, `MESH_JOURNAL_ROUTES` (comma separated),
    /// `MESH_DRAIN_TIMEOUT_MS`, `MESH_ROUTE_SUBSTITUTION` (comma separated
    /// `route:replacement` pairs).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a numeric value cannot be parsed or a
    /// substitution entry has no `:`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(origin) = lookup("MESH_ORIGIN") {
            config.origin = origin;
        }
        if let Some(n) = parse(&lookup, "MESH_LIGHT_POOL_SIZE")? {
            config.dispatch.light_pool_size = n;
        }
        if let Some(n) = parse(&lookup, "MESH_OS_POOL_SIZE")? {
            config.dispatch.os_pool_size = n;
        }
        if let Some(n) = parse(&lookup, "MESH_MAX_INSTANCES")? {
            config.dispatch.max_instances = n;
        }
        if let Some(ms) = parse(&lookup, "MESH_RPC_MIN_TIMEOUT_MS")? {
            config.rpc.min_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "MESH_DRAIN_TIMEOUT_MS")? {
            config.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(route) = lookup("MESH_TRACE_COLLECTOR") {
            config.trace.collector_route = route;
        }
        if let Some(routes) = lookup("MESH_JOURNAL_ROUTES") {
            config.trace.journaled_routes = routes
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(entries) = lookup("MESH_ROUTE_SUBSTITUTION") {
            for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (route, replacement) = entry.split_once(':').ok_or_else(|| ConfigError {
                    key: "MESH_ROUTE_SUBSTITUTION".to_string(),
                    value: entry.to_string(),
                })?;
                config
                    .routing
                    .substitutions
                    .insert(route.trim().to_string(), replacement.trim().to_string());
            }
        }
        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError {
            key: key.to_string(),
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.origin.starts_with("mesh-"));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.rpc.min_timeout, Duration::from_millis(100));
        assert_eq!(config.rpc.inbox_route, "temporary.inbox");
        assert_eq!(config.trace.collector_route, "distributed.tracing");
        assert!(config.trace.journaled_routes.is_empty());
        assert_eq!(config.stream.buffer, 1024);
        assert!(config.routing.substitutions.is_empty());
        assert!(config.routing.multicast.is_empty());
    }

    #[test]
    fn dispatch_config_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.intake_capacity, 256);
        assert_eq!(config.light_pool_size, 200);
        assert_eq!(config.os_pool_size, 32);
        assert_eq!(config.max_instances, 1000);
        assert_eq!(config.default_deferred_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MESH_ORIGIN", "node-a"),
            ("MESH_OS_POOL_SIZE", "4"),
            ("MESH_RPC_MIN_TIMEOUT_MS", "500"),
            ("MESH_JOURNAL_ROUTES", "a.b, c.d,,"),
        ]);
        let config =
            RuntimeConfig::from_lookup(|k| vars.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(config.origin, "node-a");
        assert_eq!(config.dispatch.os_pool_size, 4);
        assert_eq!(config.rpc.min_timeout, Duration::from_millis(500));
        assert!(config.trace.is_journaled("a.b"));
        assert!(config.trace.is_journaled("c.d"));
        assert_eq!(config.trace.journaled_routes.len(), 2);
    }

    #[test]
    fn route_substitution_from_lookup() {
        let config = RuntimeConfig::from_lookup(|k| {
            (k == "MESH_ROUTE_SUBSTITUTION").then(|| "v1.api:v2.api, old.svc : new.svc".to_string())
        })
        .unwrap();
        assert_eq!(config.routing.substitutions.len(), 2);
        assert_eq!(config.routing.substitutions["v1.api"], "v2.api");
        assert_eq!(config.routing.substitutions["old.svc"], "new.svc");

        let err = RuntimeConfig::from_lookup(|k| {
            (k == "MESH_ROUTE_SUBSTITUTION").then(|| "v1.api".to_string())
        })
        .unwrap_err();
        assert_eq!(err.key, "MESH_ROUTE_SUBSTITUTION");
    }

    #[test]
    fn unparsable_number_is_rejected() {
        let err = RuntimeConfig::from_lookup(|k| {
            (k == "MESH_LIGHT_POOL_SIZE").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert_eq!(err.key, "MESH_LIGHT_POOL_SIZE");
        assert_eq!(err.value, "lots");
    }
}
