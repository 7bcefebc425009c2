use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LbConfig;
use crate::error::{LbError, Result};
use crate::filter::{ServerListFilter, ZoneAffinityFilter};
use crate::health_check::{NoOpPing, Ping, PingOutcome, PingSettings, Pinger};
use crate::pipeline::UpdatePipeline;
use crate::registry::{ServerRegistry, Snapshot};
use crate::rules::{build_rule, Rule, RuleKind};
use crate::server::Server;
use crate::server_list::ServerList;
use crate::stats::{FailureKind, LoadBalancerStats, StatsSettings};
use crate::updater::{PollingUpdater, ServerListUpdater};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LbState {
    Uninitialized,
    /// Initial load and first ping pass in flight.
    Starting,
    Active,
    ShuttingDown,
    Stopped,
}

impl LbState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LbState::Uninitialized,
            1 => LbState::Starting,
            2 => LbState::Active,
            3 => LbState::ShuttingDown,
            _ => LbState::Stopped,
        }
    }
}

/// Collaborators plugged into a [`LoadBalancer`].
pub struct LbParts {
    pub server_list: Arc<dyn ServerList>,
    /// Defaults to a zone affinity filter when `zone_affinity.enabled` is set.
    pub filter: Option<Arc<dyn ServerListFilter>>,
    /// Defaults to polling at `update_interval_ms`.
    pub updater: Option<Arc<dyn ServerListUpdater>>,
    /// Defaults to [`NoOpPing`].
    pub ping: Option<Arc<dyn Ping>>,
}

impl LbParts {
    pub fn new(server_list: Arc<dyn ServerList>) -> Self {
        Self {
            server_list,
            filter: None,
            updater: None,
            ping: None,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn ServerListFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_updater(mut self, updater: Arc<dyn ServerListUpdater>) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn with_ping(mut self, ping: Arc<dyn Ping>) -> Self {
        self.ping = Some(ping);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LbStatus {
    pub name: String,
    pub state: LbState,
    pub rule: RuleKind,
    pub all_servers: usize,
    pub reachable_servers: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub missed_update_cycles: u64,
    pub update_failures: u64,
    pub ping_cycles: u64,
}

/// Keeps the server snapshots fresh and hands out servers through its rule.
pub struct LoadBalancer {
    config: LbConfig,
    registry: Arc<ServerRegistry>,
    pipeline: Arc<UpdatePipeline>,
    updater: Arc<dyn ServerListUpdater>,
    pinger: Pinger,
    rule: Arc<dyn Rule>,
    state: AtomicU8,
}

impl LoadBalancer {
    /// Validates `config` and wires the collaborators. Nothing runs until [`start`](Self::start).
    pub fn new(config: LbConfig, parts: LbParts) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(LoadBalancerStats::new(StatsSettings::from(&config)));
        let registry = Arc::new(ServerRegistry::new(stats.clone()));

        let filter = match parts.filter {
            Some(filter) => Some(filter),
            None if config.zone_affinity.enabled => {
                let zone = config
                    .client_zone
                    .clone()
                    .ok_or_else(|| LbError::config("zone_affinity requires client_zone"))?;
                Some(Arc::new(ZoneAffinityFilter::new(zone, config.zone_affinity.clone(), stats))
                    as Arc<dyn ServerListFilter>)
            }
            None => None,
        };
        let pipeline = Arc::new(UpdatePipeline::new(
            config.name.clone(),
            parts.server_list,
            filter,
            registry.clone(),
        ));
        let updater = parts.updater.unwrap_or_else(|| {
            Arc::new(PollingUpdater::new(
                config.initial_update_delay(),
                config.update_interval(),
            ))
        });
        let ping = parts.ping.unwrap_or_else(|| Arc::new(NoOpPing));
        let pinger = Pinger::new(
            config.name.clone(),
            ping,
            registry.clone(),
            PingSettings::from(&config),
        );
        let rule = build_rule(config.rule, &config, registry.clone());

        Ok(Self {
            config,
            registry,
            pipeline,
            updater,
            pinger,
            rule,
            state: AtomicU8::new(LbState::Uninitialized as u8),
        })
    }

    /// Loads the initial servers, runs the first ping pass and starts the background tasks.
    pub async fn start(&self) -> Result<()> {
        match self.state.compare_exchange(
            LbState::Uninitialized as u8,
            LbState::Starting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(current) => {
                return match LbState::from_u8(current) {
                    LbState::Starting | LbState::Active => Ok(()),
                    state => Err(LbError::Lifecycle(format!(
                        "cannot start load balancer {} in state {:?}",
                        self.config.name, state
                    ))),
                };
            }
        }

        self.pipeline.run_initial().await;
        self.pinger.run_cycle().await;
        self.updater.start(self.pipeline.action());
        self.pinger.start();
        self.rule.start();

        // a concurrent stop() may have run while the initial load was in flight
        if self
            .state
            .compare_exchange(
                LbState::Starting as u8,
                LbState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.updater.stop();
            self.pinger.stop();
            self.rule.stop();
            return Err(LbError::Lifecycle(format!(
                "load balancer {} was stopped while starting",
                self.config.name
            )));
        }
        info!(
            "🚀 [{}] Load balancer active with {} servers ({} reachable)",
            self.config.name,
            self.registry.all_servers().len(),
            self.registry.reachable_servers().len()
        );
        Ok(())
    }

    /// Stops every background task. Safe to call repeatedly and from any thread.
    pub fn stop(&self) {
        let previous = self.state.swap(LbState::ShuttingDown as u8, Ordering::AcqRel);
        match LbState::from_u8(previous) {
            LbState::ShuttingDown | LbState::Stopped => {
                self.state.store(LbState::Stopped as u8, Ordering::Release);
                return;
            }
            LbState::Uninitialized | LbState::Starting | LbState::Active => {}
        }
        self.updater.stop();
        self.pinger.stop();
        self.rule.stop();
        self.state.store(LbState::Stopped as u8, Ordering::Release);
        info!("[{}] Load balancer stopped", self.config.name);
    }

    pub fn state(&self) -> LbState {
        LbState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LbConfig {
        &self.config
    }

    /// Picks a server, or `None` when nothing is eligible. Retrying is up to the caller.
    pub fn choose_server(&self, key: Option<&str>) -> Option<Server> {
        let server = self.rule.choose(key);
        if server.is_none() {
            warn!("[{}] No eligible server available", self.config.name);
        }
        server
    }

    /// Same as [`choose_server`](Self::choose_server), but a retrying rule
    /// waits on the runtime's timer instead of blocking the thread.
    pub async fn choose_server_async(&self, key: Option<&str>) -> Option<Server> {
        let server = self.rule.choose_async(key).await;
        if server.is_none() {
            warn!("[{}] No eligible server available", self.config.name);
        }
        server
    }

    pub fn rule(&self) -> &Arc<dyn Rule> {
        &self.rule
    }

    pub fn all_servers(&self) -> Arc<Snapshot> {
        self.registry.all_servers()
    }

    pub fn reachable_servers(&self) -> Arc<Snapshot> {
        self.registry.reachable_servers()
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<LoadBalancerStats> {
        self.registry.stats()
    }

    /// Drops `server` from the reachable set until the next ping cycle.
    pub fn mark_server_down(&self, server: &Server) {
        if self.registry.mark_down(server.id()) {
            info!("[{}] Marked {} down", self.config.name, server);
        }
    }

    pub async fn update_now(&self) -> bool {
        self.pipeline.run_cycle().await
    }

    pub async fn ping_now(&self) -> PingOutcome {
        self.pinger.run_cycle().await
    }

    pub fn note_request_start(&self, server: &Server) {
        self.stats().note_request_start(server);
    }

    pub fn report_success(&self, server: &Server, elapsed: Duration) {
        self.stats().report_success(server, elapsed);
    }

    pub fn report_failure(&self, server: &Server, kind: FailureKind, elapsed: Duration) {
        self.stats().report_failure(server, kind, elapsed);
    }

    pub fn status(&self) -> LbStatus {
        LbStatus {
            name: self.config.name.clone(),
            state: self.state(),
            rule: self.rule.kind(),
            all_servers: self.registry.all_servers().len(),
            reachable_servers: self.registry.reachable_servers().len(),
            last_update: self.updater.last_update(),
            missed_update_cycles: self.updater.missed_cycles(),
            update_failures: self.pipeline.failures(),
            ping_cycles: self.pinger.cycles(),
        }
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        if matches!(self.state(), LbState::Starting | LbState::Active) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_list::StaticServerList;

    fn config(rule: RuleKind) -> LbConfig {
        LbConfig {
            name: "unit".to_string(),
            rule,
            ..LbConfig::default()
        }
    }

    fn parts(hosts: &[&str]) -> LbParts {
        let servers = hosts.iter().map(|h| Server::new(*h, 80)).collect();
        LbParts::new(Arc::new(StaticServerList::new(servers)))
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let bad = LbConfig {
            max_concurrent_probes: 0,
            ..LbConfig::default()
        };
        assert!(matches!(LoadBalancer::new(bad, parts(&["a"])), Err(LbError::Config(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let lb = LoadBalancer::new(config(RuleKind::RoundRobin), parts(&["a", "b"])).unwrap();
        assert_eq!(lb.state(), LbState::Uninitialized);
        assert!(lb.choose_server(None).is_none());

        lb.start().await.unwrap();
        lb.start().await.unwrap();
        assert_eq!(lb.state(), LbState::Active);
        assert_eq!(lb.all_servers().len(), 2);
        assert_eq!(lb.reachable_servers().len(), 2);
        assert!(lb.choose_server(None).is_some());

        lb.stop();
        lb.stop();
        assert_eq!(lb.state(), LbState::Stopped);
        assert!(matches!(lb.start().await, Err(LbError::Lifecycle(_))));
    }

    struct SlowList(Vec<Server>);

    #[async_trait::async_trait]
    impl ServerList for SlowList {
        async fn initial_list_of_servers(&self) -> Result<Vec<Server>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(self.0.clone())
        }

        async fn updated_list_of_servers(&self) -> Result<Vec<Server>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_start_leaves_nothing_running() {
        let updater = Arc::new(PollingUpdater::new(Duration::from_millis(10), Duration::from_millis(10)));
        let parts = LbParts::new(Arc::new(SlowList(vec![Server::new("a", 80)])))
            .with_updater(updater.clone());
        let lb = Arc::new(LoadBalancer::new(config(RuleKind::WeightedResponseTime), parts).unwrap());

        let starting = {
            let lb = lb.clone();
            tokio::spawn(async move { lb.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lb.state(), LbState::Starting);
        assert!(lb.all_servers().is_empty());

        lb.stop();
        let result = starting.await.unwrap();
        assert!(matches!(result, Err(LbError::Lifecycle(_))));
        assert_eq!(lb.state(), LbState::Stopped);
        assert!(!updater.is_running());
        assert!(!lb.pinger.is_running());
    }

    #[tokio::test]
    async fn test_async_retry_waits_for_servers_to_appear() {
        let lb = LoadBalancer::new(config(RuleKind::Retry), parts(&[])).unwrap();
        lb.start().await.unwrap();
        assert!(lb.all_servers().is_empty());

        let registry = lb.registry().clone();
        let filler = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.replace_all(vec![Server::new("late", 80)]);
            registry.replace_reachable(vec![Server::new("late", 80)]);
        });
        let server = lb.choose_server_async(None).await;
        assert_eq!(server.unwrap().host(), "late");
        filler.await.unwrap();
        lb.stop();
    }

    #[test]
    fn test_stop_before_start() {
        let lb = LoadBalancer::new(config(RuleKind::RoundRobin), parts(&["a"])).unwrap();
        lb.stop();
        assert_eq!(lb.state(), LbState::Stopped);
    }

    #[tokio::test]
    async fn test_mark_server_down_and_status() {
        let lb = LoadBalancer::new(config(RuleKind::RoundRobin), parts(&["a", "b"])).unwrap();
        lb.start().await.unwrap();
        let a = Server::new("a", 80);
        lb.mark_server_down(&a);
        for _ in 0..5 {
            assert_eq!(lb.choose_server(None).unwrap().host(), "b");
        }
        let status = lb.status();
        assert_eq!(status.all_servers, 2);
        assert_eq!(status.reachable_servers, 1);
        assert_eq!(status.state, LbState::Active);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"active\""));
        lb.stop();
    }

    #[tokio::test]
    async fn test_transport_feedback_reaches_rules() {
        let lb = LoadBalancer::new(config(RuleKind::BestAvailable), parts(&["a", "b"])).unwrap();
        lb.start().await.unwrap();
        let a = Server::new("a", 80);
        lb.note_request_start(&a);
        assert_eq!(lb.choose_server(None).unwrap().host(), "b");
        lb.report_success(&a, Duration::from_millis(3));
        for _ in 0..3 {
            lb.report_failure(&Server::new("b", 80), FailureKind::Connection, Duration::from_millis(1));
        }
        assert_eq!(lb.choose_server(None).unwrap().host(), "a");
        lb.stop();
    }
}
