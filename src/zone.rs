//! Per-zone health accounting shared by zone avoidance and the zone-aware balancer.

use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::server::Server;
use crate::stats::LoadBalancerStats;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneSnapshot {
    pub instance_count: usize,
    pub unreachable_count: usize,
    /// Circuit-open servers among the reachable ones.
    pub circuit_open_count: usize,
    pub active_requests: i64,
}

impl ZoneSnapshot {
    pub fn unhealthy_count(&self) -> usize {
        (self.unreachable_count + self.circuit_open_count).min(self.instance_count)
    }

    pub fn healthy_count(&self) -> usize {
        self.instance_count - self.unhealthy_count()
    }

    pub fn unhealthy_fraction(&self) -> f64 {
        if self.instance_count == 0 {
            return 1.0;
        }
        self.unhealthy_count() as f64 / self.instance_count as f64
    }

    pub fn load_per_server(&self) -> f64 {
        let healthy = self.healthy_count();
        if healthy == 0 {
            return -1.0;
        }
        self.active_requests as f64 / healthy as f64
    }
}

/// Builds one snapshot per zone observed in `all`.
pub fn zone_snapshots(
    all: &[Server],
    is_reachable: impl Fn(&Server) -> bool,
    stats: &LoadBalancerStats,
    now: Instant,
) -> BTreeMap<String, ZoneSnapshot> {
    let mut zones: BTreeMap<String, ZoneSnapshot> = BTreeMap::new();
    for server in all {
        let zone = zones.entry(server.zone_key().to_string()).or_default();
        zone.instance_count += 1;
        if !is_reachable(server) {
            zone.unreachable_count += 1;
            continue;
        }
        if stats.is_circuit_open(server, now) {
            zone.circuit_open_count += 1;
        } else {
            zone.active_requests += stats.active_requests(server, now);
        }
    }
    zones
}

/// Zones left after dropping the unhealthy ones, worst first, while more than one zone remains.
pub fn available_zones(zones: &BTreeMap<String, ZoneSnapshot>, threshold: f64) -> BTreeSet<String> {
    let mut available: BTreeSet<String> = zones
        .iter()
        .filter(|(_, z)| z.instance_count > 0)
        .map(|(name, _)| name.clone())
        .collect();

    let mut unhealthy: Vec<(&String, f64)> = zones
        .iter()
        .map(|(name, z)| (name, z.unhealthy_fraction()))
        .filter(|(_, fraction)| *fraction > threshold)
        .collect();
    unhealthy.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    for (name, _) in unhealthy {
        if available.len() <= 1 {
            break;
        }
        available.remove(name);
    }
    available
}

/// Picks a zone at random, weighted by its healthy server count.
pub fn choose_zone<R: Rng + ?Sized>(
    zones: &BTreeMap<String, ZoneSnapshot>,
    available: &BTreeSet<String>,
    rng: &mut R,
) -> Option<String> {
    let weighted: Vec<(&String, usize)> = available
        .iter()
        .filter_map(|name| zones.get(name).map(|z| (name, z.healthy_count())))
        .collect();
    let total: usize = weighted.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return available.iter().next().cloned();
    }
    let mut pick = rng.gen_range(0..total);
    for (name, weight) in weighted {
        if pick < weight {
            return Some(name.clone());
        }
        pick -= weight;
    }
    None
}
