//! Route substitution and local multicast.
//!
//! A substitution redirects every outgoing event for one route to another,
//! so callers can keep using an old name while a replacement serves it. A
//! multicast source is a relay route: each event sent to it is copied to
//! every member route.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use mesh_core::Envelope;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::LocalBus;
use crate::config::RoutingConfig;
use crate::error::RoutingError;
use crate::service::registry::validate_route;

/// Validated substitution and multicast tables.
#[derive(Debug, Default)]
pub struct RouteTable {
    substitutions: HashMap<String, String>,
    multicast: HashMap<String, Vec<String>>,
}

fn checked(route: &str) -> Result<(), RoutingError> {
    validate_route(route).map_err(|_| RoutingError::InvalidRoute(route.to_string()))
}

impl RouteTable {
    /// Builds the tables from configuration.
    ///
    /// Multicast members equal to their source and duplicate members are
    /// dropped with a warning.
    ///
    /// # Errors
    ///
    /// - `RoutingError::InvalidRoute` for a malformed route name.
    /// - `RoutingError::SelfSubstitution` when a route replaces itself.
    /// - `RoutingError::Nested` when a replacement is itself substituted.
    /// - `RoutingError::NoMembers` for a multicast source without members.
    pub fn new(config: &RoutingConfig) -> Result<Self, RoutingError> {
        let mut substitutions = HashMap::with_capacity(config.substitutions.len());
        for (route, replacement) in &config.substitutions {
            checked(route)?;
            checked(replacement)?;
            if route == replacement {
                return Err(RoutingError::SelfSubstitution(route.clone()));
            }
            if config.substitutions.contains_key(replacement) {
                return Err(RoutingError::Nested {
                    from: route.clone(),
                    to: replacement.clone(),
                });
            }
            tracing::info!("Route substitution: {route} -> {replacement}");
            substitutions.insert(route.clone(), replacement.clone());
        }

        let mut multicast = HashMap::with_capacity(config.multicast.len());
        for (source, targets) in &config.multicast {
            checked(source)?;
            let mut seen = BTreeSet::new();
            let mut members = Vec::with_capacity(targets.len());
            for target in targets {
                checked(target)?;
                if target != source && seen.insert(target.as_str()) {
                    members.push(target.clone());
                }
            }
            if members.is_empty() {
                return Err(RoutingError::NoMembers(source.clone()));
            }
            if members.len() < targets.len() {
                tracing::warn!(
                    "Multicast config error - {source} -> {targets:?} becomes {source} -> {members:?}"
                );
            }
            multicast.insert(source.clone(), members);
        }

        Ok(Self {
            substitutions,
            multicast,
        })
    }

    /// The route `to` is delivered to after substitution.
    #[must_use]
    pub fn substitute<'a>(&'a self, to: &'a str) -> &'a str {
        self.substitutions.get(to).map_or(to, String::as_str)
    }

    /// Applies substitution to the event's destination in place.
    pub fn reroute(&self, event: &mut Envelope) {
        if let Some(replacement) = event.to.as_deref().and_then(|to| self.substitutions.get(to)) {
            event.to = Some(replacement.clone());
        }
    }

    /// Copy of `event` with its destination substituted, or `None` when no
    /// substitution applies.
    #[must_use]
    pub fn rerouted(&self, event: &Envelope) -> Option<Envelope> {
        let replacement = self.substitutions.get(event.to.as_deref()?)?;
        let mut event = event.clone();
        event.to = Some(replacement.clone());
        Some(event)
    }

    /// Members of a multicast source.
    #[must_use]
    pub fn members(&self, source: &str) -> Option<&[String]> {
        self.multicast.get(source).map(Vec::as_slice)
    }

    #[must_use]
    pub fn is_multicast_enabled(&self) -> bool {
        !self.multicast.is_empty()
    }

    /// Multicast sources with their members.
    pub fn multicast(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.multicast
            .iter()
            .map(|(source, members)| (source.as_str(), members.as_slice()))
    }
}

/// Relays every event arriving on a multicast source to its members.
///
/// Copies keep the reply address, so a request to a multicast route is
/// answered by the first member to reply.
pub(crate) async fn run_multicast(
    source: String,
    members: Vec<String>,
    bus: Arc<LocalBus>,
    mut intake: mpsc::UnboundedReceiver<Bytes>,
    stop: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            next = intake.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let event = match Envelope::from_bytes(&bytes) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(route = %source, "Unable to decode event - {e}");
                continue;
            }
        };
        for member in &members {
            let mut copy = event.clone();
            copy.to = Some(member.clone());
            if let Err(e) = bus.send_event(&copy) {
                tracing::warn!(route = %source, member = %member, "Unable to relay multicast event - {e}");
            }
        }
    }
    tracing::debug!(route = %source, "multicast relay stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn substitutions(pairs: &[(&str, &str)]) -> RoutingConfig {
        RoutingConfig {
            substitutions: pairs
                .iter()
                .map(|(a, b)| ((*a).to_string(), (*b).to_string()))
                .collect(),
            multicast: BTreeMap::new(),
        }
    }

    fn multicast(source: &str, members: &[&str]) -> RoutingConfig {
        RoutingConfig {
            substitutions: BTreeMap::new(),
            multicast: BTreeMap::from([(
                source.to_string(),
                members.iter().map(ToString::to_string).collect(),
            )]),
        }
    }

    #[test]
    fn substitution_rewrites_destination() {
        let table = RouteTable::new(&substitutions(&[("v1.api", "v2.api")])).unwrap();
        assert_eq!(table.substitute("v1.api"), "v2.api");
        assert_eq!(table.substitute("other.api"), "other.api");

        let mut event = Envelope::new().with_to("v1.api");
        table.reroute(&mut event);
        assert_eq!(event.to.as_deref(), Some("v2.api"));

        let outgoing = Envelope::new().with_to("v1.api");
        assert_eq!(table.rerouted(&outgoing).unwrap().to.as_deref(), Some("v2.api"));
        assert!(table.rerouted(&Envelope::new().with_to("v2.api")).is_none());
    }

    #[test]
    fn nested_substitution_is_rejected() {
        let err = RouteTable::new(&substitutions(&[("a.one", "b.two"), ("b.two", "c.three")]))
            .unwrap_err();
        assert!(matches!(err, RoutingError::Nested { ref from, .. } if from == "a.one"));
    }

    #[test]
    fn self_and_invalid_substitution_is_rejected() {
        assert!(matches!(
            RouteTable::new(&substitutions(&[("a.one", "a.one")])),
            Err(RoutingError::SelfSubstitution(_))
        ));
        assert!(matches!(
            RouteTable::new(&substitutions(&[("NoDots", "a.one")])),
            Err(RoutingError::InvalidRoute(ref r)) if r == "NoDots"
        ));
    }

    #[test]
    fn multicast_members_exclude_source_and_duplicates() {
        let table =
            RouteTable::new(&multicast("fan.out", &["fan.out", "a.one", "b.two", "a.one"])).unwrap();
        assert!(table.is_multicast_enabled());
        assert_eq!(
            table.members("fan.out").unwrap(),
            ["a.one".to_string(), "b.two".to_string()]
        );
        assert!(table.members("a.one").is_none());
    }

    #[test]
    fn multicast_without_members_is_rejected() {
        assert!(matches!(
            RouteTable::new(&multicast("fan.out", &["fan.out"])),
            Err(RoutingError::NoMembers(_))
        ));
        assert!(!RouteTable::default().is_multicast_enabled());
    }

    #[tokio::test]
    async fn relay_copies_events_to_members() {
        let bus = Arc::new(LocalBus::new());
        let mut a = bus.bind("a.one");
        let mut b = bus.bind("b.two");
        let intake = bus.bind("fan.out");
        let stop = CancellationToken::new();
        let relay = tokio::spawn(run_multicast(
            "fan.out".to_string(),
            vec!["a.one".to_string(), "b.two".to_string(), "gone.route".to_string()],
            Arc::clone(&bus),
            intake,
            stop.clone(),
        ));

        bus.send_event(&Envelope::new().with_to("fan.out").with_body("hi"))
            .unwrap();

        for rx in [&mut a, &mut b] {
            let copy = Envelope::from_bytes(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(copy.body, Some(mesh_core::Value::from("hi")));
        }
        stop.cancel();
        relay.await.unwrap();
    }
}
