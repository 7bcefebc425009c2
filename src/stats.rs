//! Per-server request statistics fed by transport-reported outcomes.
//!
//! Every server gets its own [`ServerStats`] entry, created lazily the first
//! time anything references it. Entries are independent: recording an outcome
//! for one server never contends with another server's entry.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{CircuitConfig, LbConfig};
use crate::server::Server;

/// Number of response-time samples kept per server.
const RESPONSE_WINDOW: usize = 1000;

/// How a call against a server ended, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Could not connect or the connection was reset.
    Connection,
    /// The server shed load (e.g. 503 / 429).
    Throttled,
    /// Application-level failure; the server itself answered.
    Other,
}

impl FailureKind {
    pub fn trips_circuit(&self) -> bool {
        matches!(self, FailureKind::Connection | FailureKind::Throttled)
    }
}

#[derive(Debug, Clone)]
pub struct StatsSettings {
    pub circuit: CircuitConfig,
    pub active_requests_timeout: Duration,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            circuit: CircuitConfig::default(),
            active_requests_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&LbConfig> for StatsSettings {
    fn from(config: &LbConfig) -> Self {
        Self {
            circuit: config.circuit.clone(),
            active_requests_timeout: config.active_requests_timeout(),
        }
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    last_active_change: Option<Instant>,
    samples: VecDeque<f64>,
    sample_sum: f64,
    total_samples: u64,
    successive_failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct ServerStats {
    server: Server,
    settings: Arc<StatsSettings>,
    active_requests: AtomicI64,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    inner: Mutex<StatsInner>,
}

impl ServerStats {
    fn new(server: Server, settings: Arc<StatsSettings>) -> Self {
        Self {
            server,
            settings,
            active_requests: AtomicI64::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            inner: Mutex::new(StatsInner::default()),
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn increment_active_requests(&self) {
        self.active_requests.fetch_add(1, Ordering::AcqRel);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().last_active_change = Some(Instant::now());
    }

    pub fn decrement_active_requests(&self) {
        let prev = self.active_requests.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            // unmatched decrement
            self.active_requests.store(0, Ordering::Release);
        }
        self.inner.lock().last_active_change = Some(Instant::now());
    }

    /// Active request count, or 0 once the counter has gone stale.
    pub fn active_requests(&self, now: Instant) -> i64 {
        let count = self.active_requests.load(Ordering::Acquire);
        if count == 0 {
            return 0;
        }
        match self.inner.lock().last_active_change {
            Some(at) if now.saturating_duration_since(at) > self.settings.active_requests_timeout => 0,
            _ => count.max(0),
        }
    }

    pub fn note_response_time(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut inner = self.inner.lock();
        inner.samples.push_back(ms);
        inner.sample_sum += ms;
        if inner.samples.len() > RESPONSE_WINDOW {
            if let Some(oldest) = inner.samples.pop_front() {
                inner.sample_sum -= oldest;
            }
        }
        inner.total_samples += 1;
    }

    /// Mean response time in milliseconds over the sample window.
    pub fn mean_response_time_ms(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.samples.is_empty() {
            0.0
        } else {
            (inner.sample_sum / inner.samples.len() as f64).max(0.0)
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.inner.lock().total_samples
    }

    pub fn record_success(&self) {
        self.inner.lock().successive_failures = 0;
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if kind.trips_circuit() {
            inner.successive_failures = inner.successive_failures.saturating_add(1);
            inner.last_failure = Some(Instant::now());
        } else {
            inner.successive_failures = 0;
        }
    }

    pub fn successive_failures(&self) -> u32 {
        self.inner.lock().successive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.inner.lock().last_failure
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Blackout grows exponentially with each failure past the threshold.
    fn blackout(&self, failures: u32) -> Duration {
        let circuit = &self.settings.circuit;
        let exponent = failures.saturating_sub(circuit.failure_threshold).min(16);
        let millis = circuit
            .blackout_base_ms
            .saturating_mul(1u64 << exponent)
            .min(circuit.max_blackout_ms);
        Duration::from_millis(millis)
    }

    pub fn is_circuit_open(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        if inner.successive_failures < self.settings.circuit.failure_threshold {
            return false;
        }
        match inner.last_failure {
            Some(at) => now.saturating_duration_since(at) < self.blackout(inner.successive_failures),
            None => false,
        }
    }
}

/// Stats for every server a balancer has seen, keyed by server identity.
#[derive(Debug)]
pub struct LoadBalancerStats {
    settings: Arc<StatsSettings>,
    servers: DashMap<String, Arc<ServerStats>>,
}

impl Default for LoadBalancerStats {
    fn default() -> Self {
        Self::new(StatsSettings::default())
    }
}

impl LoadBalancerStats {
    pub fn new(settings: StatsSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            servers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, server: &Server) -> Arc<ServerStats> {
        if let Some(existing) = self.servers.get(server.id()) {
            return existing.clone();
        }
        self.servers
            .entry(server.id().to_string())
            .or_insert_with(|| Arc::new(ServerStats::new(server.clone(), self.settings.clone())))
            .clone()
    }

    /// Looks up stats without creating an entry.
    pub fn get(&self, id: &str) -> Option<Arc<ServerStats>> {
        self.servers.get(id).map(|entry| entry.clone())
    }

    pub fn is_circuit_open(&self, server: &Server, now: Instant) -> bool {
        self.get(server.id())
            .map(|stats| stats.is_circuit_open(now))
            .unwrap_or(false)
    }

    pub fn active_requests(&self, server: &Server, now: Instant) -> i64 {
        self.get(server.id())
            .map(|stats| stats.active_requests(now))
            .unwrap_or(0)
    }

    pub fn note_request_start(&self, server: &Server) {
        self.get_or_create(server).increment_active_requests();
    }

    pub fn report_success(&self, server: &Server, elapsed: Duration) {
        let stats = self.get_or_create(server);
        stats.decrement_active_requests();
        stats.note_response_time(elapsed);
        stats.record_success();
    }

    pub fn report_failure(&self, server: &Server, kind: FailureKind, elapsed: Duration) {
        let stats = self.get_or_create(server);
        stats.decrement_active_requests();
        stats.note_response_time(elapsed);
        stats.record_failure(kind);
    }

    /// Drops entries for servers outside `retained`. Returns how many were removed.
    pub fn prune<'a>(&self, retained: impl IntoIterator<Item = &'a str>) -> usize {
        let keep: HashSet<&str> = retained.into_iter().collect();
        let before = self.servers.len();
        self.servers.retain(|id, _| keep.contains(id.as_str()));
        before.saturating_sub(self.servers.len())
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
