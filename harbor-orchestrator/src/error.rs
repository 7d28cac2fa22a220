//! Error taxonomy of the orchestrator.
//!
//! Configuration errors (cycles, unknown dependencies, exhausted address space) fail before
//! any side effect. Provisioning and health errors are scoped to one service. Persistence
//! errors are reported but never undo what was already applied.

use harbor_protocol::HookPhase;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::deployment::manifest::Category;
use crate::network::Ipv4Network;

/// Errors raised while layering the dependency graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// `from` requires `to`, and `to` is already on the path that led to `from`.
    #[error("Dependency cycle detected: '{from}' requires '{to}'")]
    Cycle { from: String, to: String },

    #[error("Service '{service}' requires unknown service '{dependency}'")]
    DependencyNotFound { service: String, dependency: String },
}

#[derive(Error, Debug)]
pub enum SubnetError {
    /// Every supernet has been searched without finding a free block.
    #[error("No available subnet left in any supernet")]
    NoAvailableSubnet,

    /// Lost a race: the subnet was recorded by someone else after it was found free.
    #[error("Subnet {0} is already allocated")]
    AlreadyAllocated(Ipv4Network),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(#[from] ipnetwork::IpNetworkError),

    #[error("Subnet record IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subnet worker failed: {0}")]
    Worker(String),
}

/// Failures of a single container engine call. Never retried.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("Failed to pull image '{image}': {message}")]
    ImagePull { image: String, message: String },

    #[error("Command '{command}' in container {container} exited with code {exit_code}")]
    ExecFailed {
        container: String,
        command: String,
        exit_code: i64,
    },

    #[error("Container engine returned no {0}")]
    MissingField(&'static str),

    #[error("Registry login to '{server}' failed: {message}")]
    Registry { server: String, message: String },

    #[error("Unknown container or network '{0}'")]
    NotFound(String),

    #[error("Container engine refused the request: {0}")]
    Refused(String),
}

/// Outcome of the health-check wait protocol.
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Container {0} is not running")]
    NotRunning(String),

    #[error("Container {container} did not become ready within {budget:?}")]
    Timeout { container: String, budget: Duration },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Lookups in a deployment's resource table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("No {category} resource recorded for '{label}'")]
    NotFound { category: Category, label: String },

    #[error("{count} {category} resources recorded for '{label}', expected one")]
    Ambiguous {
        category: Category,
        label: String,
        count: usize,
    },

    #[error("Resource recorded for '{label}' in {category} has the wrong kind")]
    WrongKind { category: Category, label: String },
}

/// Errors of the directory-backed manifest store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Deployment '{0}' not found")]
    NotFound(String),

    #[error("Deployment '{0}' is active and cannot be deleted")]
    InUse(String),

    /// Something other than a regular file sits where a manifest is expected.
    #[error("Corrupted manifest store: {} is not a regular file", .0.display())]
    Corrupted(PathBuf),

    #[error("Manifest store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why one service's provisioning state machine stopped.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Subnet allocation failed: {0}")]
    Subnet(#[from] SubnetError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Dependency lookup failed: {0}")]
    Dependency(#[from] ManifestError),

    #[error("{phase} hook '{command}' failed: {source}")]
    Hook {
        phase: HookPhase,
        command: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Health check failed: {0}")]
    Health(#[from] HealthError),

    /// The health check failed and the compensating stop failed too.
    #[error("Health check failed ({health}) and the container could not be stopped ({stop})")]
    HealthAndStop {
        health: HealthError,
        stop: RuntimeError,
    },

    #[error("Service task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug)]
pub struct ServiceFailure {
    pub service: String,
    pub error: ServiceError,
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.service, self.error)
    }
}

fn summarize(failures: &[ServiceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum DeploymentError {
    #[error("Invalid dependency graph: {0}")]
    Graph(#[from] GraphError),

    #[error("{} service(s) failed: {}", .0.len(), summarize(.0))]
    ServicesFailed(Vec<ServiceFailure>),

    #[error("Failed to persist deployment: {0}")]
    Store(#[from] StoreError),
}

/// Failures resolving an inbound host to a container address.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("No service serves host '{0}'")]
    UnknownHost(String),

    #[error("No active deployment")]
    NoActiveDeployment,

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Container {0} has no network address")]
    NoAddress(String),

    #[error("Invalid host pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Upstream request failed: {0}")]
    Upstream(String),
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse services file: {0}")]
    Parse(String),

    #[error("Invalid services file: {0}")]
    Services(#[from] harbor_protocol::ConfigError),

    #[error("Invalid supernet: {0}")]
    Supernet(#[from] SubnetError),
}
