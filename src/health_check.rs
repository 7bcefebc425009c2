use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::LbConfig;
use crate::error::{LbError, Result};
use crate::registry::ServerRegistry;
use crate::server::{InstanceStatus, Server};

/// Liveness probe for a single server.
#[async_trait]
pub trait Ping: Send + Sync {
    async fn is_alive(&self, server: &Server) -> Result<bool>;
}

/// Treats every server as alive.
#[derive(Debug, Default, Clone)]
pub struct NoOpPing;

#[async_trait]
impl Ping for NoOpPing {
    async fn is_alive(&self, _server: &Server) -> Result<bool> {
        Ok(true)
    }
}

/// Trusts the health status the registry reported for the server.
#[derive(Debug, Default, Clone)]
pub struct RegistryStatusPing;

#[async_trait]
impl Ping for RegistryStatusPing {
    async fn is_alive(&self, server: &Server) -> Result<bool> {
        Ok(server.status() == InstanceStatus::Up)
    }
}

#[derive(Debug, Clone)]
pub struct HttpPingConfig {
    pub path: String,
    pub timeout: Duration,
    pub success_codes: Vec<u16>,
}

impl Default for HttpPingConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            timeout: Duration::from_secs(2),
            success_codes: vec![200],
        }
    }
}

/// Issues a GET against the server's health endpoint.
pub struct HttpPing {
    client: Client,
    config: HttpPingConfig,
}

impl HttpPing {
    pub fn new(config: HttpPingConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Ping for HttpPing {
    async fn is_alive(&self, server: &Server) -> Result<bool> {
        let url = server.url(&self.config.path);
        let response = self.client.get(&url).send().await?;
        Ok(self.config.success_codes.contains(&response.status().as_u16()))
    }
}

#[derive(Debug, Clone)]
pub struct PingSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub deadline: Duration,
    pub max_concurrent_probes: usize,
}

impl From<&LbConfig> for PingSettings {
    fn from(config: &LbConfig) -> Self {
        Self {
            interval: config.ping_interval(),
            probe_timeout: config.probe_timeout(),
            deadline: config.ping_deadline(),
            max_concurrent_probes: config.max_concurrent_probes,
        }
    }
}

/// Result of one ping cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Completed { probed: usize, alive: usize },
    /// Another cycle was already in flight.
    Skipped,
}

struct PingState {
    name: String,
    ping: Arc<dyn Ping>,
    registry: Arc<ServerRegistry>,
    settings: PingSettings,
    in_progress: AtomicBool,
    cycles: AtomicU64,
}

impl PingState {
    async fn run_cycle(&self) -> PingOutcome {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            debug!("[{}] Ping cycle already in progress", self.name);
            return PingOutcome::Skipped;
        }
        let _guard = CycleGuard(&self.in_progress);
        let outcome = self.probe_all().await;
        self.cycles.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn probe_all(&self) -> PingOutcome {
        let all = self.registry.all_servers();
        let deadline = tokio::time::Instant::now() + self.settings.deadline;
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_probes));
        let mut probes = JoinSet::new();

        for server in all.iter().cloned() {
            let ping = self.ping.clone();
            let permits = permits.clone();
            let timeout = self.settings.probe_timeout;
            probes.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let alive = match tokio::time::timeout(timeout, ping.is_alive(&server)).await {
                    Ok(Ok(alive)) => alive,
                    Ok(Err(e)) => {
                        debug!("Probe failed for {}: {}", server, e);
                        false
                    }
                    Err(_) => {
                        debug!("{}", LbError::probe(server.id(), format!("timed out after {:?}", timeout)));
                        false
                    }
                };
                (server.id().to_string(), alive)
            });
        }

        let mut alive_ids = HashSet::new();
        loop {
            match tokio::time::timeout_at(deadline, probes.join_next()).await {
                Ok(Some(Ok((id, alive)))) => {
                    if alive {
                        alive_ids.insert(id);
                    }
                }
                Ok(Some(Err(e))) => warn!("[{}] Probe task failed: {}", self.name, e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "[{}] Ping cycle deadline reached with {} probes outstanding",
                        self.name,
                        probes.len()
                    );
                    probes.abort_all();
                    break;
                }
            }
        }

        let reachable: Vec<Server> = all
            .iter()
            .filter(|s| alive_ids.contains(s.id()))
            .cloned()
            .collect();
        let alive = reachable.len();
        let previous = self.registry.reachable_servers().len();
        self.registry.replace_reachable(reachable);
        if previous != alive {
            info!("[{}] Reachable servers: {} -> {} of {}", self.name, previous, alive, all.len());
        }
        PingOutcome::Completed {
            probed: all.len(),
            alive,
        }
    }
}

/// Clears the in-progress flag even when the cycle's task is aborted.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Schedules ping cycles and recomputes the reachable-servers snapshot.
pub struct Pinger {
    state: Arc<PingState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pinger {
    pub fn new(
        name: impl Into<String>,
        ping: Arc<dyn Ping>,
        registry: Arc<ServerRegistry>,
        settings: PingSettings,
    ) -> Self {
        Self {
            state: Arc::new(PingState {
                name: name.into(),
                ping,
                registry,
                settings,
                in_progress: AtomicBool::new(false),
                cycles: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    pub async fn run_cycle(&self) -> PingOutcome {
        self.state.run_cycle().await
    }

    /// Starts the recurring cycle; also runs early when server membership changes.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let state = self.state.clone();
        info!(
            "🩺 [{}] Starting ping cycle (interval: {:?}, probe timeout: {:?})",
            state.name, state.settings.interval, state.settings.probe_timeout
        );
        *task = Some(tokio::spawn(async move {
            let interval = state.settings.interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = state.registry.membership_changed().notified() => {
                        debug!("[{}] Membership changed, pinging early", state.name);
                    }
                }
                state.run_cycle().await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("[{}] Stopped ping cycle", self.state.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn cycles(&self) -> u64 {
        self.state.cycles.load(Ordering::Relaxed)
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::LoadBalancerStats;

    struct SlowPing {
        hang: HashSet<String>,
        fail: HashSet<String>,
    }

    #[async_trait]
    impl Ping for SlowPing {
        async fn is_alive(&self, server: &Server) -> Result<bool> {
            if self.hang.contains(server.id()) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail.contains(server.id()) {
                return Err(LbError::probe(server.id(), "connection refused"));
            }
            Ok(true)
        }
    }

    fn settings(probe_timeout: Duration, deadline: Duration) -> PingSettings {
        PingSettings {
            interval: Duration::from_secs(10),
            probe_timeout,
            deadline,
            max_concurrent_probes: 2,
        }
    }

    fn registry_with(hosts: &[&str]) -> Arc<ServerRegistry> {
        let registry = Arc::new(ServerRegistry::new(Arc::new(LoadBalancerStats::default())));
        registry.replace_all(hosts.iter().map(|h| Server::new(*h, 80)).collect());
        registry
    }

    fn ids(registry: &ServerRegistry) -> Vec<String> {
        registry
            .reachable_servers()
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_noop_ping_marks_everything_reachable() {
        let registry = registry_with(&["a", "b", "c"]);
        let pinger = Pinger::new("t", Arc::new(NoOpPing), registry.clone(), settings(Duration::from_secs(1), Duration::from_secs(2)));
        let outcome = pinger.run_cycle().await;
        assert_eq!(outcome, PingOutcome::Completed { probed: 3, alive: 3 });
        assert_eq!(ids(&registry), vec!["a:80", "b:80", "c:80"]);
    }

    #[tokio::test]
    async fn test_registry_status_ping() {
        let registry = Arc::new(ServerRegistry::default());
        registry.replace_all(vec![
            Server::new("a", 80),
            Server::new("b", 80).with_status(InstanceStatus::OutOfService),
        ]);
        let pinger = Pinger::new("t", Arc::new(RegistryStatusPing), registry.clone(), settings(Duration::from_secs(1), Duration::from_secs(2)));
        pinger.run_cycle().await;
        assert_eq!(ids(&registry), vec!["a:80"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_and_hung_probes_are_not_alive() {
        let registry = registry_with(&["a", "b", "c", "d"]);
        let ping = SlowPing {
            hang: ["b:80".to_string()].into_iter().collect(),
            fail: ["c:80".to_string()].into_iter().collect(),
        };
        let pinger = Pinger::new("t", Arc::new(ping), registry.clone(), settings(Duration::from_millis(100), Duration::from_secs(5)));
        let outcome = pinger.run_cycle().await;
        assert_eq!(outcome, PingOutcome::Completed { probed: 4, alive: 2 });
        assert_eq!(ids(&registry), vec!["a:80", "d:80"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_deadline_cuts_off_outstanding_probes() {
        let registry = registry_with(&["a", "b"]);
        let ping = SlowPing {
            hang: ["b:80".to_string()].into_iter().collect(),
            fail: HashSet::new(),
        };
        // probe timeout longer than the cycle deadline
        let pinger = Pinger::new("t", Arc::new(ping), registry.clone(), settings(Duration::from_secs(60), Duration::from_millis(200)));
        let started = tokio::time::Instant::now();
        pinger.run_cycle().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(ids(&registry), vec!["a:80"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_cycles_and_stop() {
        let registry = registry_with(&["a"]);
        let pinger = Pinger::new("t", Arc::new(NoOpPing), registry.clone(), settings(Duration::from_millis(100), Duration::from_millis(500)));
        pinger.stop();
        pinger.start();
        pinger.start();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(pinger.cycles() >= 2);
        assert_eq!(ids(&registry), vec!["a:80"]);

        pinger.stop();
        assert!(!pinger.is_running());
        let cycles = pinger.cycles();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(pinger.cycles(), cycles);
    }
}
