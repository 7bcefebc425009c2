use log::debug;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ZoneAffinityConfig;
use crate::server::{InstanceStatus, Server};
use crate::stats::LoadBalancerStats;

/// Narrows a freshly fetched candidate list by policy.
pub trait ServerListFilter: Send + Sync {
    fn filtered_list_of_servers(&self, servers: Vec<Server>) -> Vec<Server>;
}

/// Keeps same-zone servers unless doing so would strand the client on an
/// unhealthy or overloaded zone.
pub struct ZoneAffinityFilter {
    zone: String,
    config: ZoneAffinityConfig,
    stats: Arc<LoadBalancerStats>,
}

impl ZoneAffinityFilter {
    pub fn new(zone: impl Into<String>, config: ZoneAffinityConfig, stats: Arc<LoadBalancerStats>) -> Self {
        Self {
            zone: zone.into(),
            config,
            stats,
        }
    }

    fn should_keep_affinity(&self, same_zone: &[Server]) -> bool {
        if same_zone.is_empty() {
            return false;
        }
        let now = Instant::now();
        let mut unhealthy = 0usize;
        let mut active = 0i64;
        for server in same_zone {
            if server.status() != InstanceStatus::Up || self.stats.is_circuit_open(server, now) {
                unhealthy += 1;
            }
            active += self.stats.active_requests(server, now);
        }
        let count = same_zone.len();
        let unhealthy_fraction = unhealthy as f64 / count as f64;
        let load_per_server = active as f64 / count as f64;
        let available = count - unhealthy;

        if unhealthy_fraction >= self.config.max_unhealthy_fraction
            || load_per_server >= self.config.max_load_per_server
            || available < self.config.min_available_servers
        {
            debug!(
                "Zone affinity for {} disabled: unhealthy={:.2} load={:.2} available={}",
                self.zone, unhealthy_fraction, load_per_server, available
            );
            return false;
        }
        true
    }
}

impl ServerListFilter for ZoneAffinityFilter {
    fn filtered_list_of_servers(&self, servers: Vec<Server>) -> Vec<Server> {
        let same_zone: Vec<Server> = servers
            .iter()
            .filter(|s| s.zone() == Some(self.zone.as_str()))
            .cloned()
            .collect();
        if self.should_keep_affinity(&same_zone) {
            same_zone
        } else {
            servers
        }
    }
}
