use rand::Rng;
use std::sync::Arc;

use super::{Rule, RuleKind};
use crate::registry::ServerRegistry;
use crate::server::Server;

pub struct RandomRule {
    registry: Arc<ServerRegistry>,
}

impl RandomRule {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }
}

impl Rule for RandomRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Random
    }

    fn choose(&self, key: Option<&str>) -> Option<Server> {
        let reachable = self.registry.reachable_servers();
        self.choose_from(&reachable, key)
    }

    fn choose_from(&self, candidates: &[Server], _key: Option<&str>) -> Option<Server> {
        if candidates.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        let index = rng.gen_range(0..candidates.len());
        candidates.get(index).cloned()
    }
}
