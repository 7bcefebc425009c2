use arc_swap::ArcSwap;
use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{Rule, RoundRobinRule, RuleKind};
use crate::registry::ServerRegistry;
use crate::server::Server;

/// Below this total weight the distribution is considered degenerate.
const MIN_TOTAL_WEIGHT: f64 = 0.001;

#[derive(Debug, Default)]
struct WeightTable {
    /// identity -> weight; absent until the server has enough samples
    weights: HashMap<String, f64>,
}

struct WeightCalculator {
    registry: Arc<ServerRegistry>,
    min_samples: u64,
    table: ArcSwap<WeightTable>,
    in_progress: AtomicBool,
}

impl WeightCalculator {
    fn recompute(&self) {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return;
        }
        let all = self.registry.all_servers();
        let stats = self.registry.stats();

        let mut means = Vec::with_capacity(all.len());
        for server in all.iter() {
            let entry = stats.get_or_create(server);
            if entry.sample_count() >= self.min_samples {
                means.push((server.id().to_string(), entry.mean_response_time_ms()));
            }
        }
        let total: f64 = means.iter().map(|(_, mean)| mean).sum();
        let weights: HashMap<String, f64> = means
            .into_iter()
            .map(|(id, mean)| (id, (total - mean).max(0.0)))
            .collect();
        debug!(
            "Recomputed response-time weights for {} of {} servers (total mean {:.2}ms)",
            weights.len(),
            all.len(),
            total
        );
        self.table.store(Arc::new(WeightTable { weights }));
        self.in_progress.store(false, Ordering::Release);
    }
}

/// Favours servers with lower mean response time.
///
/// Each server's weight is the sum of all mean response times minus its own,
/// so the slowest server carries the least weight. Until every candidate has
/// enough samples the rule behaves like round robin.
pub struct WeightedResponseTimeRule {
    calculator: Arc<WeightCalculator>,
    fallback: RoundRobinRule,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WeightedResponseTimeRule {
    pub fn new(registry: Arc<ServerRegistry>, interval: Duration, min_samples: u64) -> Self {
        Self {
            calculator: Arc::new(WeightCalculator {
                registry: registry.clone(),
                min_samples,
                table: ArcSwap::from_pointee(WeightTable::default()),
                in_progress: AtomicBool::new(false),
            }),
            fallback: RoundRobinRule::new(registry),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Recomputes the weight table now instead of waiting for the next period.
    pub fn recompute_weights(&self) {
        self.calculator.recompute();
    }

    pub fn weight_of(&self, id: &str) -> Option<f64> {
        self.calculator.table.load().weights.get(id).copied()
    }
}

impl Rule for WeightedResponseTimeRule {
    fn kind(&self) -> RuleKind {
        RuleKind::WeightedResponseTime
    }

    fn choose(&self, key: Option<&str>) -> Option<Server> {
        let reachable = self.calculator.registry.reachable_servers();
        self.choose_from(&reachable, key)
    }

    fn choose_from(&self, candidates: &[Server], key: Option<&str>) -> Option<Server> {
        if candidates.is_empty() {
            return None;
        }
        let table = self.calculator.table.load();
        let mut cumulative = Vec::with_capacity(candidates.len());
        let mut total = 0.0;
        for server in candidates {
            match table.weights.get(server.id()) {
                Some(weight) => {
                    total += weight;
                    cumulative.push(total);
                }
                None => return self.fallback.choose_from(candidates, key),
            }
        }
        if total < MIN_TOTAL_WEIGHT {
            return self.fallback.choose_from(candidates, key);
        }
        let draw = rand::thread_rng().gen_range(0.0..total);
        let index = cumulative.partition_point(|&upper| upper <= draw);
        candidates
            .get(index.min(candidates.len() - 1))
            .cloned()
    }

    fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let calculator = self.calculator.clone();
        let interval = self.interval;
        info!("Starting response-time weight task (interval: {:?})", interval);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                calculator.recompute();
            }
        }));
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for WeightedResponseTimeRule {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{hosts, registry_with};

    fn feed(registry: &ServerRegistry, server: &Server, ms: u64, samples: usize) {
        for _ in 0..samples {
            registry.stats().note_request_start(server);
            registry
                .stats()
                .report_success(server, Duration::from_millis(ms));
        }
    }

    #[test]
    fn test_selection_ratio_follows_response_times() {
        let servers = hosts(&["fast", "slow"]);
        let registry = registry_with(servers.clone());
        feed(&registry, &servers[0], 10, 20);
        feed(&registry, &servers[1], 90, 20);

        let rule = WeightedResponseTimeRule::new(registry, Duration::from_secs(30), 10);
        rule.recompute_weights();
        assert!((rule.weight_of("fast:80").unwrap() - 90.0).abs() < 1e-6);
        assert!((rule.weight_of("slow:80").unwrap() - 10.0).abs() < 1e-6);

        let mut fast = 0usize;
        let rounds = 20_000;
        for _ in 0..rounds {
            if rule.choose(None).unwrap().host() == "fast" {
                fast += 1;
            }
        }
        let ratio = fast as f64 / rounds as f64;
        assert!((ratio - 0.9).abs() < 0.02, "fast ratio was {}", ratio);
    }

    #[test]
    fn test_falls_back_to_round_robin_without_samples() {
        let servers = hosts(&["a", "b"]);
        let registry = registry_with(servers.clone());
        feed(&registry, &servers[0], 10, 20);
        feed(&registry, &servers[1], 90, 2);

        let rule = WeightedResponseTimeRule::new(registry, Duration::from_secs(30), 10);
        rule.recompute_weights();
        assert!(rule.weight_of("b:80").is_none());
        let first = rule.choose(None).unwrap();
        let second = rule.choose(None).unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_single_server_weight_is_degenerate_not_negative() {
        let servers = hosts(&["only"]);
        let registry = registry_with(servers.clone());
        feed(&registry, &servers[0], 50, 20);
        let rule = WeightedResponseTimeRule::new(registry, Duration::from_secs(30), 10);
        rule.recompute_weights();
        assert_eq!(rule.weight_of("only:80"), Some(0.0));
        assert_eq!(rule.choose(None).unwrap().host(), "only");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_recomputes() {
        let servers = hosts(&["a", "b"]);
        let registry = registry_with(servers.clone());
        let rule = WeightedResponseTimeRule::new(registry.clone(), Duration::from_millis(100), 1);
        rule.start();
        rule.start();
        feed(&registry, &servers[0], 10, 1);
        feed(&registry, &servers[1], 30, 1);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rule.weight_of("a:80").is_some());
        rule.stop();
        rule.stop();
    }
}
