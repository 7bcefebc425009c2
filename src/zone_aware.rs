//! Zone-aware composition over a flat [`LoadBalancer`].
//!
//! Reachable servers are split into one bucket per zone. Each bucket owns a
//! small registry (sharing the parent's stats) and its own rule, so per-zone
//! round robin cursors and weight tables survive snapshot swaps. Buckets are
//! refreshed lazily whenever a caller notices that the parent's snapshot
//! generations moved on.

use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

use crate::config::LbConfig;
use crate::error::Result;
use crate::health_check::PingOutcome;
use crate::load_balancer::{LbParts, LbState, LbStatus, LoadBalancer};
use crate::registry::{ServerRegistry, Snapshot};
use crate::rules::{build_rule, Rule};
use crate::server::Server;
use crate::stats::FailureKind;
use crate::zone::{available_zones, choose_zone, zone_snapshots};

struct ZoneBucket {
    registry: Arc<ServerRegistry>,
    rule: Arc<dyn Rule>,
}

pub struct ZoneAwareLoadBalancer {
    inner: LoadBalancer,
    buckets: DashMap<String, Arc<ZoneBucket>>,
    seen_all: AtomicU64,
    seen_reachable: AtomicU64,
    rebuild: Mutex<()>,
    runtime: Mutex<Option<Handle>>,
}

impl ZoneAwareLoadBalancer {
    pub fn new(config: LbConfig, parts: LbParts) -> Result<Self> {
        Ok(Self {
            inner: LoadBalancer::new(config, parts)?,
            buckets: DashMap::new(),
            seen_all: AtomicU64::new(u64::MAX),
            seen_reachable: AtomicU64::new(u64::MAX),
            rebuild: Mutex::new(()),
            runtime: Mutex::new(None),
        })
    }

    pub async fn start(&self) -> Result<()> {
        *self.runtime.lock() = Some(Handle::current());
        // buckets built by a selection before start never had their rule started
        for bucket in self.buckets.iter() {
            bucket.rule.start();
        }
        self.inner.start().await?;
        self.refresh_buckets();
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stop();
        for bucket in self.buckets.iter() {
            bucket.rule.stop();
        }
        self.runtime.lock().take();
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.inner
    }

    pub fn state(&self) -> LbState {
        self.inner.state()
    }

    pub fn all_servers(&self) -> Arc<Snapshot> {
        self.inner.all_servers()
    }

    pub fn reachable_servers(&self) -> Arc<Snapshot> {
        self.inner.reachable_servers()
    }

    pub fn zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self.buckets.iter().map(|b| b.key().clone()).collect();
        zones.sort();
        zones
    }

    fn is_zone_aware(&self) -> bool {
        let config = self.inner.config();
        config.zone_aware_enabled && config.client_zone.is_some()
    }

    /// Picks a zone first, then a server inside it; flat selection when zones don't apply.
    pub fn choose_server(&self, key: Option<&str>) -> Option<Server> {
        let (zone, bucket) = match self.route() {
            Some(route) => route,
            None => return self.inner.choose_server(key),
        };
        match bucket.and_then(|bucket| bucket.rule.choose(key)) {
            Some(server) => Some(server),
            None => {
                debug!("Zone {:?} yielded no server, using flat selection", zone);
                self.inner.choose_server(key)
            }
        }
    }

    pub async fn choose_server_async(&self, key: Option<&str>) -> Option<Server> {
        let (zone, bucket) = match self.route() {
            Some(route) => route,
            None => return self.inner.choose_server_async(key).await,
        };
        let picked = match bucket {
            Some(bucket) => bucket.rule.choose_async(key).await,
            None => None,
        };
        match picked {
            Some(server) => Some(server),
            None => {
                debug!("Zone {:?} yielded no server, using flat selection", zone);
                self.inner.choose_server_async(key).await
            }
        }
    }

    /// The chosen zone and its bucket, or `None` when selection should stay flat.
    fn route(&self) -> Option<(Option<String>, Option<Arc<ZoneBucket>>)> {
        if !self.is_zone_aware() {
            return None;
        }
        self.refresh_buckets();

        let registry = self.inner.registry();
        let all = registry.all_servers();
        let reachable = registry.reachable_servers();
        let zones = zone_snapshots(
            &all,
            |s| reachable.contains(s.id()),
            registry.stats(),
            Instant::now(),
        );
        if zones.len() <= 1 {
            return None;
        }

        let available = available_zones(&zones, self.inner.config().zone_unhealthy_threshold);
        let zone = choose_zone(&zones, &available, &mut rand::thread_rng());
        let bucket = zone
            .as_ref()
            .and_then(|zone| self.buckets.get(zone).map(|b| b.value().clone()));
        Some((zone, bucket))
    }

    /// Re-partitions the parent snapshots when either generation changed.
    fn refresh_buckets(&self) {
        let registry = self.inner.registry();
        let all = registry.all_servers();
        let reachable = registry.reachable_servers();
        if self.seen_all.load(Ordering::Acquire) == all.generation()
            && self.seen_reachable.load(Ordering::Acquire) == reachable.generation()
        {
            return;
        }
        let _guard = self.rebuild.lock();
        if self.seen_all.load(Ordering::Acquire) == all.generation()
            && self.seen_reachable.load(Ordering::Acquire) == reachable.generation()
        {
            return;
        }

        let mut all_by_zone: BTreeMap<String, Vec<Server>> = BTreeMap::new();
        for server in all.iter() {
            all_by_zone.entry(server.zone_key().to_string()).or_default().push(server.clone());
        }
        let mut reachable_by_zone: BTreeMap<String, Vec<Server>> = BTreeMap::new();
        for server in reachable.iter() {
            reachable_by_zone
                .entry(server.zone_key().to_string())
                .or_default()
                .push(server.clone());
        }

        for (zone, servers) in all_by_zone {
            let bucket = self.bucket(&zone);
            bucket.registry.replace_all(servers);
            bucket
                .registry
                .replace_reachable(reachable_by_zone.remove(&zone).unwrap_or_default());
        }
        for bucket in self.buckets.iter() {
            if !all.iter().any(|s| s.zone_key() == bucket.key()) {
                bucket.registry.replace_all(Vec::new());
                bucket.registry.replace_reachable(Vec::new());
            }
        }

        self.seen_all.store(all.generation(), Ordering::Release);
        self.seen_reachable.store(reachable.generation(), Ordering::Release);
    }

    fn bucket(&self, zone: &str) -> Arc<ZoneBucket> {
        if let Some(bucket) = self.buckets.get(zone) {
            return bucket.clone();
        }
        let config = self.inner.config();
        let registry = Arc::new(ServerRegistry::new(self.inner.stats().clone()));
        let rule = build_rule(config.zone_rule, config, registry.clone());
        if let Some(handle) = self.runtime.lock().as_ref() {
            let _enter = handle.enter();
            rule.start();
        }
        info!("[{}] Tracking zone {}", config.name, zone);
        let bucket = Arc::new(ZoneBucket { registry, rule });
        self.buckets.insert(zone.to_string(), bucket.clone());
        bucket
    }

    pub fn mark_server_down(&self, server: &Server) {
        self.inner.mark_server_down(server);
    }

    pub async fn update_now(&self) -> bool {
        self.inner.update_now().await
    }

    pub async fn ping_now(&self) -> PingOutcome {
        self.inner.ping_now().await
    }

    pub fn note_request_start(&self, server: &Server) {
        self.inner.note_request_start(server);
    }

    pub fn report_success(&self, server: &Server, elapsed: Duration) {
        self.inner.report_success(server, elapsed);
    }

    pub fn report_failure(&self, server: &Server, kind: FailureKind, elapsed: Duration) {
        self.inner.report_failure(server, kind, elapsed);
    }

    pub fn status(&self) -> LbStatus {
        self.inner.status()
    }
}

impl Drop for ZoneAwareLoadBalancer {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            bucket.rule.stop();
        }
    }
}
