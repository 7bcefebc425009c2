use log::debug;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use super::{Rule, RuleKind};
use crate::registry::ServerRegistry;
use crate::server::Server;
use crate::zone::{available_zones, zone_snapshots};

/// Steers away from zones whose share of unreachable or tripped servers is
/// above the threshold, then lets the delegate pick within the rest.
pub struct ZoneAvoidanceRule {
    registry: Arc<ServerRegistry>,
    delegate: Arc<dyn Rule>,
    threshold: f64,
}

impl ZoneAvoidanceRule {
    pub fn new(registry: Arc<ServerRegistry>, delegate: Arc<dyn Rule>, threshold: f64) -> Self {
        Self {
            registry,
            delegate,
            threshold,
        }
    }

    fn select(
        &self,
        all: &[Server],
        reachable: &[Server],
        is_reachable: impl Fn(&Server) -> bool,
        key: Option<&str>,
    ) -> Option<Server> {
        if reachable.is_empty() {
            return None;
        }
        let stats = self.registry.stats();
        let now = Instant::now();
        let zones = zone_snapshots(all, is_reachable, stats, now);
        let retained = available_zones(&zones, self.threshold);
        if retained.len() < zones.len() {
            debug!(
                "Avoiding zones {:?}",
                zones.keys().filter(|z| !retained.contains(*z)).collect::<Vec<_>>()
            );
        }

        let in_zone: Vec<Server> = reachable
            .iter()
            .filter(|s| retained.contains(s.zone_key()))
            .cloned()
            .collect();
        let closed: Vec<Server> = in_zone
            .iter()
            .filter(|s| !stats.is_circuit_open(s, now))
            .cloned()
            .collect();

        let candidates = if !closed.is_empty() {
            closed
        } else if !in_zone.is_empty() {
            in_zone
        } else {
            reachable.to_vec()
        };
        self.delegate.choose_from(&candidates, key)
    }
}

impl Rule for ZoneAvoidanceRule {
    fn kind(&self) -> RuleKind {
        RuleKind::ZoneAvoidance
    }

    fn choose(&self, key: Option<&str>) -> Option<Server> {
        let all = self.registry.all_servers();
        let reachable = self.registry.reachable_servers();
        self.select(&all, &reachable, |s| reachable.contains(s.id()), key)
    }

    fn choose_from(&self, candidates: &[Server], key: Option<&str>) -> Option<Server> {
        let ids: HashSet<&str> = candidates.iter().map(|s| s.id()).collect();
        let all = self.registry.all_servers();
        self.select(&all, candidates, |s| ids.contains(s.id()), key)
    }

    fn start(&self) {
        self.delegate.start();
    }

    fn stop(&self) {
        self.delegate.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{registry_with, trip_circuit};
    use crate::rules::RoundRobinRule;

    fn two_zones() -> Vec<Server> {
        let mut servers = Vec::new();
        for zone in ["z1", "z2"] {
            for i in 0..3 {
                servers.push(Server::new(format!("{}-{}", zone, i), 80).with_zone(zone));
            }
        }
        servers
    }

    fn rule(registry: Arc<ServerRegistry>, threshold: f64) -> ZoneAvoidanceRule {
        ZoneAvoidanceRule::new(
            registry.clone(),
            Arc::new(RoundRobinRule::new(registry)),
            threshold,
        )
    }

    #[test]
    fn test_never_picks_fully_tripped_zone() {
        let servers = two_zones();
        let registry = registry_with(servers.clone());
        for server in servers.iter().filter(|s| s.zone() == Some("z1")) {
            trip_circuit(&registry, server);
        }
        let rule = rule(registry, 0.99999);
        for _ in 0..100 {
            assert_eq!(rule.choose(None).unwrap().zone(), Some("z2"));
        }
    }

    #[test]
    fn test_avoids_zone_with_unreachable_servers() {
        let servers = two_zones();
        let registry = registry_with(servers.clone());
        let reachable: Vec<Server> = servers
            .iter()
            .filter(|s| s.host() != "z2-0" && s.host() != "z2-1")
            .cloned()
            .collect();
        registry.replace_reachable(reachable);
        let rule = rule(registry, 0.5);
        for _ in 0..30 {
            assert_eq!(rule.choose(None).unwrap().zone(), Some("z1"));
        }
    }

    #[test]
    fn test_single_zone_is_never_excluded() {
        let servers: Vec<Server> = two_zones().into_iter().filter(|s| s.zone() == Some("z1")).collect();
        let registry = registry_with(servers.clone());
        trip_circuit(&registry, &servers[0]);
        trip_circuit(&registry, &servers[1]);
        let rule = rule(registry, 0.1);
        for _ in 0..10 {
            assert_eq!(rule.choose(None).unwrap().host(), "z1-2");
        }
    }

    #[test]
    fn test_empty_reachable_returns_none() {
        let registry = registry_with(two_zones());
        registry.replace_reachable(vec![]);
        assert!(rule(registry, 0.5).choose(None).is_none());
    }
}
