//! Server selection strategies.
//!
//! Every rule is bound to one [`ServerRegistry`] when it is built and reads
//! that registry's snapshots at call time. `choose` picks from the registry's
//! reachable servers; `choose_from` picks from a subset handed over by a
//! composing rule.

mod availability;
mod best_available;
mod random;
mod retry;
mod round_robin;
mod weighted;
mod zone_avoidance;

pub use availability::AvailabilityFilteringRule;
pub use best_available::BestAvailableRule;
pub use random::RandomRule;
pub use retry::RetryRule;
pub use round_robin::RoundRobinRule;
pub use weighted::WeightedResponseTimeRule;
pub use zone_avoidance::ZoneAvoidanceRule;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::LbConfig;
use crate::error::LbError;
use crate::registry::ServerRegistry;
use crate::server::Server;

#[async_trait]
pub trait Rule: Send + Sync {
    fn kind(&self) -> RuleKind;

    /// Picks a server, or `None` when nothing is eligible.
    fn choose(&self, key: Option<&str>) -> Option<Server>;

    /// Like [`choose`](Self::choose), but rules that wait between attempts
    /// yield to the runtime instead of blocking the thread.
    async fn choose_async(&self, key: Option<&str>) -> Option<Server> {
        self.choose(key)
    }

    fn choose_from(&self, candidates: &[Server], key: Option<&str>) -> Option<Server>;

    /// Starts background work, if the rule has any. Requires a tokio runtime.
    fn start(&self) {}

    fn stop(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    RoundRobin,
    Random,
    Retry,
    WeightedResponseTime,
    AvailabilityFiltering,
    BestAvailable,
    ZoneAvoidance,
}

impl FromStr for RuleKind {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "round_robin" | "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "retry" => Ok(Self::Retry),
            "weighted_response_time" | "weighted-response-time" | "weightedresponsetime" | "weighted" => {
                Ok(Self::WeightedResponseTime)
            }
            "availability_filtering" | "availability-filtering" | "availabilityfiltering" => {
                Ok(Self::AvailabilityFiltering)
            }
            "best_available" | "best-available" | "bestavailable" => Ok(Self::BestAvailable),
            "zone_avoidance" | "zone-avoidance" | "zoneavoidance" => Ok(Self::ZoneAvoidance),
            other => Err(LbError::config(format!("unknown rule: {}", other))),
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleKind::RoundRobin => "round_robin",
            RuleKind::Random => "random",
            RuleKind::Retry => "retry",
            RuleKind::WeightedResponseTime => "weighted_response_time",
            RuleKind::AvailabilityFiltering => "availability_filtering",
            RuleKind::BestAvailable => "best_available",
            RuleKind::ZoneAvoidance => "zone_avoidance",
        };
        write!(f, "{}", name)
    }
}

/// Builds the rule named by `kind`, bound to `registry`.
pub fn build_rule(kind: RuleKind, config: &LbConfig, registry: Arc<ServerRegistry>) -> Arc<dyn Rule> {
    info!("⚖️ [{}] Load balancing rule: {}", config.name, kind);
    build(kind, config, registry)
}

fn build(kind: RuleKind, config: &LbConfig, registry: Arc<ServerRegistry>) -> Arc<dyn Rule> {
    match kind {
        RuleKind::RoundRobin => Arc::new(RoundRobinRule::new(registry)),
        RuleKind::Random => Arc::new(RandomRule::new(registry)),
        RuleKind::Retry => {
            let inner = match config.retry_inner {
                RuleKind::Retry => RuleKind::RoundRobin,
                other => other,
            };
            Arc::new(RetryRule::new(build(inner, config, registry), config.retry_budget()))
        }
        RuleKind::WeightedResponseTime => Arc::new(WeightedResponseTimeRule::new(
            registry,
            config.weight_interval(),
            config.weighted_min_samples,
        )),
        RuleKind::AvailabilityFiltering => Arc::new(AvailabilityFilteringRule::new(
            registry,
            config.active_connections_limit,
        )),
        RuleKind::BestAvailable => Arc::new(BestAvailableRule::new(registry)),
        RuleKind::ZoneAvoidance => {
            let delegate = match config.zone_avoidance_delegate {
                RuleKind::ZoneAvoidance | RuleKind::Retry => RuleKind::RoundRobin,
                other => other,
            };
            Arc::new(ZoneAvoidanceRule::new(
                registry.clone(),
                build(delegate, config, registry),
                config.zone_unhealthy_threshold,
            ))
        }
    }
}
