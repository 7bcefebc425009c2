//! Client-side load balancing runtime.
//!
//! A [`LoadBalancer`] keeps two immutable snapshots per service: every known
//! server (refreshed by the update pipeline) and the reachable subset
//! (refreshed by the ping cycle). Callers pick servers through a [`Rule`]
//! and report call outcomes back so the rules can steer around slow,
//! overloaded or failing servers. [`ZoneAwareLoadBalancer`] layers zone
//! selection on top.

pub mod config;
pub mod error;
pub mod filter;
pub mod health_check;
pub mod load_balancer;
pub mod pipeline;
pub mod registry;
pub mod rules;
pub mod server;
pub mod server_list;
pub mod stats;
pub mod updater;
pub mod zone;
pub mod zone_aware;

pub use config::LbConfig;
pub use error::{LbError, Result};
pub use filter::{ServerListFilter, ZoneAffinityFilter};
pub use health_check::{HttpPing, NoOpPing, Ping, RegistryStatusPing};
pub use load_balancer::{LbParts, LbState, LbStatus, LoadBalancer};
pub use registry::{ServerRegistry, Snapshot};
pub use rules::{build_rule, Rule, RuleKind};
pub use server::{InstanceStatus, Server};
pub use server_list::{DiscoveryClient, InstanceRecord, RegistryEvent, RegistryServerList, ServerList, StaticServerList};
pub use stats::{FailureKind, LoadBalancerStats, ServerStats};
pub use updater::{EventDrivenUpdater, PollingUpdater, ServerListUpdater};
pub use zone_aware::ZoneAwareLoadBalancer;
