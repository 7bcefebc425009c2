use std::sync::Arc;
use std::time::Instant;

use super::{Rule, RoundRobinRule, RuleKind};
use crate::registry::ServerRegistry;
use crate::server::Server;

/// Least active requests among servers with a closed circuit.
pub struct BestAvailableRule {
    registry: Arc<ServerRegistry>,
    fallback: RoundRobinRule,
}

impl BestAvailableRule {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            fallback: RoundRobinRule::new(registry.clone()),
            registry,
        }
    }
}

impl Rule for BestAvailableRule {
    fn kind(&self) -> RuleKind {
        RuleKind::BestAvailable
    }

    fn choose(&self, key: Option<&str>) -> Option<Server> {
        let reachable = self.registry.reachable_servers();
        self.choose_from(&reachable, key)
    }

    fn choose_from(&self, candidates: &[Server], key: Option<&str>) -> Option<Server> {
        let stats = self.registry.stats();
        let now = Instant::now();
        let mut best: Option<(&Server, i64)> = None;
        for server in candidates {
            if stats.is_circuit_open(server, now) {
                continue;
            }
            let active = stats.active_requests(server, now);
            // strict comparison keeps the earliest server on ties
            if best.map_or(true, |(_, min)| active < min) {
                best = Some((server, active));
            }
        }
        match best {
            Some((server, _)) => Some(server.clone()),
            None => self.fallback.choose_from(candidates, key),
        }
    }
}
