use std::sync::Arc;
use std::time::Instant;

use super::{Rule, RoundRobinRule, RuleKind};
use crate::registry::ServerRegistry;
use crate::server::Server;

/// Round robin over servers whose circuit is closed and whose active request
/// count is within the limit.
pub struct AvailabilityFilteringRule {
    registry: Arc<ServerRegistry>,
    round_robin: RoundRobinRule,
    active_connections_limit: i64,
}

impl AvailabilityFilteringRule {
    pub fn new(registry: Arc<ServerRegistry>, active_connections_limit: i64) -> Self {
        Self {
            round_robin: RoundRobinRule::new(registry.clone()),
            registry,
            active_connections_limit,
        }
    }
}

impl Rule for AvailabilityFilteringRule {
    fn kind(&self) -> RuleKind {
        RuleKind::AvailabilityFiltering
    }

    fn choose(&self, key: Option<&str>) -> Option<Server> {
        let reachable = self.registry.reachable_servers();
        self.choose_from(&reachable, key)
    }

    fn choose_from(&self, candidates: &[Server], key: Option<&str>) -> Option<Server> {
        let stats = self.registry.stats();
        let now = Instant::now();
        let closed: Vec<Server> = candidates
            .iter()
            .filter(|s| !stats.is_circuit_open(s, now))
            .cloned()
            .collect();
        let eligible: Vec<Server> = closed
            .iter()
            .filter(|s| stats.active_requests(s, now) <= self.active_connections_limit)
            .cloned()
            .collect();

        if !eligible.is_empty() {
            return self.round_robin.choose_from(&eligible, key);
        }
        if !closed.is_empty() {
            return self.round_robin.choose_from(&closed, key);
        }
        self.round_robin.choose_from(candidates, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{hosts, registry_with, trip_circuit};

    #[test]
    fn test_never_returns_open_circuit_while_closed_exists() {
        let servers = hosts(&["a", "b", "c"]);
        let registry = registry_with(servers.clone());
        trip_circuit(&registry, &servers[0]);
        trip_circuit(&registry, &servers[2]);
        let rule = AvailabilityFilteringRule::new(registry, i32::MAX as i64);
        for _ in 0..50 {
            assert_eq!(rule.choose(None).unwrap().host(), "b");
        }
    }

    #[test]
    fn test_skips_overloaded_servers() {
        let servers = hosts(&["a", "b"]);
        let registry = registry_with(servers.clone());
        for _ in 0..3 {
            registry.stats().note_request_start(&servers[0]);
        }
        let rule = AvailabilityFilteringRule::new(registry, 2);
        for _ in 0..10 {
            assert_eq!(rule.choose(None).unwrap().host(), "b");
        }
    }

    #[test]
    fn test_prefers_closed_overloaded_over_open_circuit() {
        let servers = hosts(&["a", "b"]);
        let registry = registry_with(servers.clone());
        trip_circuit(&registry, &servers[0]);
        for _ in 0..5 {
            registry.stats().note_request_start(&servers[1]);
        }
        let rule = AvailabilityFilteringRule::new(registry, 1);
        for _ in 0..10 {
            assert_eq!(rule.choose(None).unwrap().host(), "b");
        }
    }

    #[test]
    fn test_falls_back_to_reachable_when_all_open() {
        let servers = hosts(&["a", "b"]);
        let registry = registry_with(servers.clone());
        trip_circuit(&registry, &servers[0]);
        trip_circuit(&registry, &servers[1]);
        let rule = AvailabilityFilteringRule::new(registry, 10);
        assert!(rule.choose(None).is_some());
    }
}
