use async_trait::async_trait;
use harbor_protocol::RegistryAuth;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::network::Ipv4Network;

/// Health reported by the engine for containers that define a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

/// Health-check parameters configured on a container image or at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

/// A snapshot of `ContainerInspect`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerState {
    /// Engine status string, e.g. `created`, `running`, `exited`.
    pub status: String,
    pub restart_count: i64,
    pub exit_code: i64,
    pub health: Option<HealthStatus>,
    pub health_check: Option<HealthCheckConfig>,
    /// Addresses per attached network.
    pub addresses: BTreeMap<String, Ipv4Addr>,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// The address to route to: the one on `preferred` if attached there, else the first.
    pub fn address(&self, preferred: Option<&str>) -> Option<Ipv4Addr> {
        preferred
            .and_then(|network| self.addresses.get(network).copied())
            .or_else(|| self.addresses.values().next().copied())
    }
}

/// Attach a new container to a network under an alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network: String,
    pub alias: String,
}

/// Everything `ContainerCreate` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub registry_auth: Option<RegistryAuth>,
    pub network: Option<NetworkAttachment>,
    /// Replaces the image's default command.
    pub command: Option<Vec<String>>,
}

/// Handle to a created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
}

/// One line of image pull progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullProgress {
    pub status: String,
    pub progress: Option<String>,
}

pub type ProgressCallback<'a> = &'a (dyn Fn(PullProgress) + Send + Sync);

/// Prefixes `image` with the registry host when pulling from a private registry.
pub fn qualified_image(image: &str, auth: Option<&RegistryAuth>) -> String {
    match auth {
        Some(auth) if !image.starts_with(&format!("{}/", auth.server)) => {
            format!("{}/{}", auth.server.trim_end_matches('/'), image)
        }
        _ => image.to_string(),
    }
}

/// The narrow interface to the container engine.
///
/// Every call is one blocking request from the caller's point of view. Implementations
/// never retry; retry policy, if any, belongs to the caller.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Pulls an image, feeding every status line to `progress`.
    ///
    /// The progress stream is drained completely before returning.
    async fn image_pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        progress: ProgressCallback<'_>,
    ) -> Result<(), RuntimeError>;

    async fn container_create(&self, spec: &ContainerSpec) -> Result<ContainerRef, RuntimeError>;

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn container_stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn container_inspect(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    /// Blocks until the container exits and returns its exit code.
    async fn container_wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Removes the container, killing it first if it still runs.
    async fn container_remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Runs `command` inside a running container and waits for it. A non-zero exit is an
    /// error, and so is a container that is not running.
    async fn container_exec(&self, id: &str, command: &[String]) -> Result<(), RuntimeError>;

    /// Creates a bridge network whose IPAM pool is `subnet`. Returns the network id.
    async fn network_create(
        &self,
        name: &str,
        subnet: &Ipv4Network,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError>;

    async fn network_connect(&self, network_id: &str, container_id: &str) -> Result<(), RuntimeError>;

    /// Verifies registry credentials.
    async fn registry_login(&self, auth: &RegistryAuth) -> Result<(), RuntimeError>;
}
