//! Shared server state: the two snapshots plus the stats map.
//!
//! Snapshots are immutable and swapped wholesale through [`ArcSwap`], so a
//! reader holding an `Arc<Snapshot>` always sees one complete generation no
//! matter how many swaps happen while it works.

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::server::Server;
use crate::stats::LoadBalancerStats;

/// Point-in-time ordered server list.
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    servers: Vec<Server>,
    ids: HashSet<String>,
}

impl Snapshot {
    pub fn new(generation: u64, servers: Vec<Server>) -> Self {
        let ids = servers.iter().map(|s| s.id().to_string()).collect();
        Self {
            generation,
            servers,
            ids,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn to_vec(&self) -> Vec<Server> {
        self.servers.clone()
    }

    fn same_members(&self, other: &[Server]) -> bool {
        self.servers.len() == other.len() && other.iter().all(|s| self.ids.contains(s.id()))
    }
}

impl Deref for Snapshot {
    type Target = [Server];

    fn deref(&self) -> &[Server] {
        &self.servers
    }
}

pub struct ServerRegistry {
    all: ArcSwap<Snapshot>,
    reachable: ArcSwap<Snapshot>,
    stats: Arc<LoadBalancerStats>,
    generation: AtomicU64,
    membership_changed: Notify,
}

impl ServerRegistry {
    pub fn new(stats: Arc<LoadBalancerStats>) -> Self {
        Self {
            all: ArcSwap::from_pointee(Snapshot::default()),
            reachable: ArcSwap::from_pointee(Snapshot::default()),
            stats,
            generation: AtomicU64::new(0),
            membership_changed: Notify::new(),
        }
    }

    pub fn stats(&self) -> &Arc<LoadBalancerStats> {
        &self.stats
    }

    pub fn all_servers(&self) -> Arc<Snapshot> {
        self.all.load_full()
    }

    pub fn reachable_servers(&self) -> Arc<Snapshot> {
        self.reachable.load_full()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Replaces the all-servers snapshot. Wakes the pinger when membership changed.
    pub fn replace_all(&self, servers: Vec<Server>) -> Arc<Snapshot> {
        let changed = !self.all.load().same_members(&servers);
        let snapshot = Arc::new(Snapshot::new(self.next_generation(), servers));
        self.all.store(snapshot.clone());
        if changed {
            self.membership_changed.notify_one();
        }
        snapshot
    }

    pub fn replace_reachable(&self, servers: Vec<Server>) -> Arc<Snapshot> {
        let snapshot = Arc::new(Snapshot::new(self.next_generation(), servers));
        self.reachable.store(snapshot.clone());
        snapshot
    }

    /// Removes one server from the reachable snapshot until the next ping cycle.
    pub fn mark_down(&self, id: &str) -> bool {
        let mut removed = false;
        self.reachable.rcu(|current| {
            removed = current.contains(id);
            if !removed {
                return Arc::clone(current);
            }
            let remaining = current.iter().filter(|s| s.id() != id).cloned().collect();
            Arc::new(Snapshot::new(self.next_generation(), remaining))
        });
        removed
    }

    /// Still listed and still reachable in the latest snapshots.
    pub fn is_alive(&self, id: &str) -> bool {
        self.all.load().contains(id) && self.reachable.load().contains(id)
    }

    pub fn membership_changed(&self) -> &Notify {
        &self.membership_changed
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(LoadBalancerStats::default()))
    }
}
