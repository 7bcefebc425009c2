use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::load_backends;
use crate::error::Result;
use crate::server::{InstanceStatus, Server};

/// Source of the raw candidate servers for one service.
#[async_trait]
pub trait ServerList: Send + Sync {
    /// Called once when the balancer starts.
    async fn initial_list_of_servers(&self) -> Result<Vec<Server>>;

    /// Called on every update cycle. Transient failures are errors, never an empty list.
    async fn updated_list_of_servers(&self) -> Result<Vec<Server>>;
}

/// Fixed list of servers, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticServerList {
    servers: Vec<Server>,
}

impl StaticServerList {
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    /// Reads `BACKENDS` (`host:port[:zone]`, comma separated).
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(load_backends()?))
    }
}

#[async_trait]
impl ServerList for StaticServerList {
    async fn initial_list_of_servers(&self) -> Result<Vec<Server>> {
        Ok(self.servers.clone())
    }

    async fn updated_list_of_servers(&self) -> Result<Vec<Server>> {
        Ok(self.servers.clone())
    }
}

/// Raw instance tuple as reported by a discovery registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl InstanceRecord {
    pub fn to_server(&self) -> Server {
        let mut server = Server::new(self.host.clone(), self.port)
            .with_status(self.status)
            .with_scheme(if self.secure { "https" } else { "http" });
        if let Some(zone) = &self.zone {
            server = server.with_zone(zone.clone());
        }
        if let Some(id) = &self.instance_id {
            server = server.with_id(id.clone());
        }
        server
    }
}

/// Push notification from a discovery registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The client's local registry cache was refreshed.
    CacheRefreshed,
    InstancesChanged { service: String },
}

/// Pull side of a discovery registry client.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn instances(&self, service: &str) -> Result<Vec<InstanceRecord>>;
}

/// Server list backed by a discovery registry; only `Up` instances are kept.
pub struct RegistryServerList {
    client: Arc<dyn DiscoveryClient>,
    service: String,
}

impl RegistryServerList {
    pub fn new(client: Arc<dyn DiscoveryClient>, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    async fn fetch(&self) -> Result<Vec<Server>> {
        let records = self.client.instances(&self.service).await?;
        let total = records.len();
        let servers: Vec<Server> = records
            .iter()
            .filter(|r| r.status == InstanceStatus::Up)
            .map(InstanceRecord::to_server)
            .collect();
        debug!(
            "Registry returned {} instances for {} ({} up)",
            total,
            self.service,
            servers.len()
        );
        Ok(servers)
    }
}

#[async_trait]
impl ServerList for RegistryServerList {
    async fn initial_list_of_servers(&self) -> Result<Vec<Server>> {
        self.fetch().await
    }

    async fn updated_list_of_servers(&self) -> Result<Vec<Server>> {
        self.fetch().await
    }
}
