use serde::{Deserialize, Serialize};
use std::fmt;

/// Zone bucket used for servers that do not report one.
pub const UNKNOWN_ZONE: &str = "UNKNOWN";

/// Health reported for an instance by the discovery registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    OutOfService,
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Up => write!(f, "UP"),
            InstanceStatus::Down => write!(f, "DOWN"),
            InstanceStatus::Starting => write!(f, "STARTING"),
            InstanceStatus::OutOfService => write!(f, "OUT_OF_SERVICE"),
            InstanceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One endpoint of the remote service. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    host: String,
    port: u16,
    zone: Option<String>,
    scheme: String,
    status: InstanceStatus,
    id: String,
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let id = format!("{}:{}", host, port);
        Self {
            host,
            port,
            zone: None,
            scheme: "http".to_string(),
            status: InstanceStatus::Up,
            id,
        }
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Overrides the default `host:port` identity.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    /// Zone used for partitioning; servers without one share [`UNKNOWN_ZONE`].
    pub fn zone_key(&self) -> &str {
        self.zone.as_deref().unwrap_or(UNKNOWN_ZONE)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, path)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
