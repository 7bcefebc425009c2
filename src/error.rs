use thiserror::Error;

/// Errors raised by the load balancer runtime.
///
/// Only `Config` and `Lifecycle` ever reach a caller of the public API. Probe
/// and registry failures are absorbed by the background cycles that produce
/// them and surface as log lines and counters.
#[derive(Error, Debug, Clone)]
pub enum LbError {
    /// Invalid or missing option, detected before the balancer becomes active.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single health probe failed or timed out.
    #[error("Probe failed for {server}: {message}")]
    Probe { server: String, message: String },

    /// The discovery registry could not be queried for a service.
    #[error("Registry query failed for {service}: {message}")]
    RegistryQuery { service: String, message: String },

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("YAML error: {0}")]
    Yaml(String),
}

pub type Result<T> = std::result::Result<T, LbError>;

impl LbError {
    pub fn config(message: impl Into<String>) -> Self {
        LbError::Config(message.into())
    }

    pub fn registry(service: impl Into<String>, message: impl Into<String>) -> Self {
        LbError::RegistryQuery {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn probe(server: impl Into<String>, message: impl Into<String>) -> Self {
        LbError::Probe {
            server: server.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for LbError {
    fn from(err: std::io::Error) -> Self {
        LbError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for LbError {
    fn from(err: serde_yaml::Error) -> Self {
        LbError::Yaml(err.to_string())
    }
}

impl From<reqwest::Error> for LbError {
    fn from(err: reqwest::Error) -> Self {
        let server = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        LbError::Probe {
            server,
            message: err.to_string(),
        }
    }
}
