use log::warn;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Rule, RuleKind};
use crate::registry::ServerRegistry;
use crate::server::Server;

pub struct RoundRobinRule {
    registry: Arc<ServerRegistry>,
    counter: AtomicUsize,
}

impl RoundRobinRule {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            counter: AtomicUsize::new(0),
        }
    }

    fn next_index(&self, len: usize) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % len
    }
}

impl Rule for RoundRobinRule {
    fn kind(&self) -> RuleKind {
        RuleKind::RoundRobin
    }

    fn choose(&self, key: Option<&str>) -> Option<Server> {
        let reachable = self.registry.reachable_servers();
        let picked = self.choose_from(&reachable, key);
        if picked.is_none() && !reachable.is_empty() {
            warn!(
                "No live server after {} round robin attempts",
                reachable.len()
            );
        }
        picked
    }

    /// Skips servers that left the registry since `candidates` was taken.
    fn choose_from(&self, candidates: &[Server], _key: Option<&str>) -> Option<Server> {
        if candidates.is_empty() {
            return None;
        }
        for _ in 0..candidates.len() {
            let server = &candidates[self.next_index(candidates.len())];
            if self.registry.is_alive(server.id()) {
                return Some(server.clone());
            }
        }
        None
    }
}
