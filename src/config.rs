use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LbError, Result};
use crate::health_check::HttpPingConfig;
use crate::rules::RuleKind;
use crate::server::Server;

/// Thresholds under which the zone affinity filter keeps same-zone servers only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneAffinityConfig {
    pub enabled: bool,
    /// Fraction of unhealthy same-zone servers at which affinity is dropped.
    pub max_unhealthy_fraction: f64,
    /// Mean active requests per same-zone server at which affinity is dropped.
    pub max_load_per_server: f64,
    /// Fewer healthy same-zone servers than this disables affinity.
    pub min_available_servers: usize,
}

impl Default for ZoneAffinityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_unhealthy_fraction: 0.8,
            max_load_per_server: 0.6,
            min_available_servers: 2,
        }
    }
}

/// Per-server circuit tripping driven by transport-reported failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub blackout_base_ms: u64,
    pub max_blackout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            blackout_base_ms: 10_000,
            max_blackout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbConfig {
    pub name: String,
    pub rule: RuleKind,
    pub update_interval_ms: u64,
    pub initial_update_delay_ms: u64,
    pub ping_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub ping_deadline_ms: u64,
    pub max_concurrent_probes: usize,
    pub active_connections_limit: i64,
    pub zone_unhealthy_threshold: f64,
    pub weighted_min_samples: u64,
    pub weight_interval_ms: u64,
    pub retry_budget_ms: u64,
    pub retry_inner: RuleKind,
    pub zone_avoidance_delegate: RuleKind,
    pub zone_rule: RuleKind,
    pub zone_aware_enabled: bool,
    pub client_zone: Option<String>,
    pub active_requests_timeout_ms: u64,
    pub zone_affinity: ZoneAffinityConfig,
    pub circuit: CircuitConfig,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            rule: RuleKind::AvailabilityFiltering,
            update_interval_ms: 30_000,
            initial_update_delay_ms: 1_000,
            ping_interval_ms: 10_000,
            probe_timeout_ms: 2_000,
            ping_deadline_ms: 5_000,
            max_concurrent_probes: 8,
            active_connections_limit: i32::MAX as i64,
            zone_unhealthy_threshold: 0.99999,
            weighted_min_samples: 10,
            weight_interval_ms: 30_000,
            retry_budget_ms: 500,
            retry_inner: RuleKind::RoundRobin,
            zone_avoidance_delegate: RuleKind::RoundRobin,
            zone_rule: RuleKind::AvailabilityFiltering,
            zone_aware_enabled: true,
            client_zone: None,
            active_requests_timeout_ms: 600_000,
            zone_affinity: ZoneAffinityConfig::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

impl LbConfig {
    /// Loads the optional YAML file, applies `LB_*` environment overrides and validates.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = env::var("LB_NAME") {
            self.name = val;
        }
        if let Ok(val) = env::var("LB_RULE") {
            self.rule = RuleKind::from_str(&val)?;
        }
        if let Ok(val) = env::var("LB_CLIENT_ZONE") {
            self.client_zone = Some(val);
        }
        override_number("LB_UPDATE_INTERVAL_MS", &mut self.update_interval_ms)?;
        override_number("LB_PING_INTERVAL_MS", &mut self.ping_interval_ms)?;
        override_number("LB_PROBE_TIMEOUT_MS", &mut self.probe_timeout_ms)?;
        override_number("LB_PING_DEADLINE_MS", &mut self.ping_deadline_ms)?;
        override_number("LB_ACTIVE_CONNECTIONS_LIMIT", &mut self.active_connections_limit)?;
        override_number("LB_ZONE_UNHEALTHY_THRESHOLD", &mut self.zone_unhealthy_threshold)?;
        override_number("LB_WEIGHTED_MIN_SAMPLES", &mut self.weighted_min_samples)?;
        override_number("LB_RETRY_BUDGET_MS", &mut self.retry_budget_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LbError::config("name must not be empty"));
        }
        for (key, value) in [
            ("update_interval_ms", self.update_interval_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("ping_deadline_ms", self.ping_deadline_ms),
            ("weight_interval_ms", self.weight_interval_ms),
        ] {
            if value == 0 {
                return Err(LbError::config(format!("{} must be greater than 0", key)));
            }
        }
        if self.max_concurrent_probes == 0 {
            return Err(LbError::config("max_concurrent_probes must be greater than 0"));
        }
        if self.active_connections_limit <= 0 {
            return Err(LbError::config("active_connections_limit must be greater than 0"));
        }
        for (key, value) in [
            ("zone_unhealthy_threshold", self.zone_unhealthy_threshold),
            ("zone_affinity.max_unhealthy_fraction", self.zone_affinity.max_unhealthy_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(LbError::config(format!("{} must be within [0, 1], got {}", key, value)));
            }
        }
        if self.zone_affinity.max_load_per_server < 0.0 {
            return Err(LbError::config("zone_affinity.max_load_per_server must not be negative"));
        }
        if self.zone_affinity.enabled && self.client_zone.is_none() {
            return Err(LbError::config("zone_affinity requires client_zone"));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(LbError::config("circuit.failure_threshold must be greater than 0"));
        }
        if self.circuit.max_blackout_ms < self.circuit.blackout_base_ms {
            return Err(LbError::config("circuit.max_blackout_ms must be >= circuit.blackout_base_ms"));
        }
        if matches!(self.retry_inner, RuleKind::Retry) {
            return Err(LbError::config("retry_inner cannot itself be retry"));
        }
        if matches!(self.zone_avoidance_delegate, RuleKind::ZoneAvoidance | RuleKind::Retry) {
            return Err(LbError::config("zone_avoidance_delegate must be a leaf rule"));
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn initial_update_delay(&self) -> Duration {
        Duration::from_millis(self.initial_update_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn ping_deadline(&self) -> Duration {
        Duration::from_millis(self.ping_deadline_ms)
    }

    pub fn weight_interval(&self) -> Duration {
        Duration::from_millis(self.weight_interval_ms)
    }

    pub fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }

    pub fn active_requests_timeout(&self) -> Duration {
        Duration::from_millis(self.active_requests_timeout_ms)
    }
}

fn override_number<T: FromStr>(key: &str, target: &mut T) -> Result<()> {
    if let Ok(val) = env::var(key) {
        *target = val
            .trim()
            .parse()
            .map_err(|_| LbError::config(format!("{} is not a valid number: {}", key, val)))?;
    }
    Ok(())
}

/// Parses `host:port[:zone]` entries separated by commas.
pub fn parse_backends(val: &str) -> Result<Vec<Server>> {
    let mut backends = Vec::new();
    for entry in val.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(LbError::config(format!("invalid backend entry: {}", entry)));
        }
        let port = parts[1]
            .parse::<u16>()
            .map_err(|_| LbError::config(format!("invalid port in backend entry: {}", entry)))?;
        let mut server = Server::new(parts[0], port);
        if let Some(zone) = parts.get(2) {
            server = server.with_zone(*zone);
        }
        backends.push(server);
    }
    Ok(backends)
}

pub fn load_backends() -> Result<Vec<Server>> {
    let val = env::var("BACKENDS").map_err(|_| LbError::config("BACKENDS must be set"))?;
    let backends = parse_backends(&val)?;
    if backends.is_empty() {
        return Err(LbError::config("BACKENDS must not be empty"));
    }
    Ok(backends)
}

pub fn load_health_check_config() -> HttpPingConfig {
    let path = env::var("HEALTH_CHECK_PATH")
        .unwrap_or_else(|_| "/health".to_string());

    let timeout_ms = env::var("HEALTH_CHECK_TIMEOUT_MS")
        .unwrap_or_else(|_| "2000".to_string())
        .parse()
        .unwrap_or(2000);

    let success_codes_str = env::var("HEALTH_CHECK_SUCCESS_CODES")
        .unwrap_or_else(|_| "200".to_string());

    let success_codes: Vec<u16> = success_codes_str
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    HttpPingConfig {
        path,
        timeout: Duration::from_millis(timeout_ms),
        success_codes: if success_codes.is_empty() { vec![200] } else { success_codes },
    }
}
