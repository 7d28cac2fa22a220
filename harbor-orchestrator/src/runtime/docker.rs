//! Container engine client backed by the Docker API (via bollard).

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, EndpointSettings, HealthConfig,
    HealthStatusEnum, Ipam, IpamConfig, NetworkCreateResponse,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use harbor_protocol::RegistryAuth;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::traits::{
    qualified_image, ContainerRef, ContainerSpec, ContainerState, HealthCheckConfig, HealthStatus,
    ProgressCallback, PullProgress, RuntimeClient,
};
use crate::error::RuntimeError;
use crate::network::Ipv4Network;

/// Seconds the engine waits for a graceful stop before killing the container.
const STOP_GRACE_SECS: i64 = 10;

// Docker substitutes these when a health check leaves the field at zero.
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_RETRIES: u32 = 3;

pub struct DockerRuntime {
    docker: Docker,
    http: reqwest::Client,
}

impl DockerRuntime {
    /// Connects using the local defaults (`DOCKER_HOST` or the platform socket).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        info!("Runtime: connected to container engine");
        Ok(Self::new(docker))
    }

    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            http: reqwest::Client::new(),
        }
    }
}

/// The engine may answer without an id; a network we cannot address is a failure.
fn network_id(response: NetworkCreateResponse) -> Result<String, RuntimeError> {
    response
        .id
        .filter(|id| !id.is_empty())
        .ok_or(RuntimeError::MissingField("network id"))
}

fn credentials(auth: Option<&RegistryAuth>) -> Option<DockerCredentials> {
    auth.map(|auth| DockerCredentials {
        username: Some(auth.username.clone()),
        password: Some(auth.password.clone()),
        serveraddress: Some(auth.server.clone()),
        ..Default::default()
    })
}

fn status_name(status: &ContainerStateStatusEnum) -> &'static str {
    match status {
        ContainerStateStatusEnum::EMPTY => "",
        ContainerStateStatusEnum::CREATED => "created",
        ContainerStateStatusEnum::RUNNING => "running",
        ContainerStateStatusEnum::PAUSED => "paused",
        ContainerStateStatusEnum::RESTARTING => "restarting",
        ContainerStateStatusEnum::REMOVING => "removing",
        ContainerStateStatusEnum::EXITED => "exited",
        ContainerStateStatusEnum::DEAD => "dead",
    }
}

fn nanos_or(value: Option<i64>, default: Duration) -> Duration {
    match value {
        Some(nanos) if nanos > 0 => Duration::from_nanos(nanos as u64),
        _ => default,
    }
}

fn health_check(config: Option<HealthConfig>) -> Option<HealthCheckConfig> {
    let config = config?;
    match config.test.as_deref() {
        None | Some([]) => return None,
        Some([first, ..]) if first == "NONE" => return None,
        _ => {}
    }

    Some(HealthCheckConfig {
        interval: nanos_or(config.interval, DEFAULT_HEALTH_INTERVAL),
        timeout: nanos_or(config.timeout, DEFAULT_HEALTH_TIMEOUT),
        retries: match config.retries {
            Some(retries) if retries > 0 => retries as u32,
            _ => DEFAULT_HEALTH_RETRIES,
        },
    })
}

fn container_state(response: ContainerInspectResponse) -> ContainerState {
    let state = response.state.unwrap_or_default();

    let health = state
        .health
        .and_then(|h| h.status)
        .and_then(|status| match status {
            HealthStatusEnum::STARTING => Some(HealthStatus::Starting),
            HealthStatusEnum::HEALTHY => Some(HealthStatus::Healthy),
            HealthStatusEnum::UNHEALTHY => Some(HealthStatus::Unhealthy),
            HealthStatusEnum::EMPTY | HealthStatusEnum::NONE => None,
        });

    let addresses = response
        .network_settings
        .and_then(|settings| settings.networks)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(network, endpoint)| {
            let ip = endpoint.ip_address?.parse().ok()?;
            Some((network, ip))
        })
        .collect();

    ContainerState {
        status: state.status.as_ref().map(status_name).unwrap_or("").to_string(),
        restart_count: response.restart_count.unwrap_or(0),
        exit_code: state.exit_code.unwrap_or(0),
        health,
        health_check: health_check(response.config.and_then(|c| c.healthcheck)),
        addresses,
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn image_pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        progress: ProgressCallback<'_>,
    ) -> Result<(), RuntimeError> {
        let reference = qualified_image(image, auth);
        let options = CreateImageOptions {
            from_image: reference.clone(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, credentials(auth));
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| RuntimeError::ImagePull {
                image: reference.clone(),
                message: e.to_string(),
            })?;
            if let Some(message) = info.error {
                return Err(RuntimeError::ImagePull {
                    image: reference,
                    message,
                });
            }
            if let Some(status) = info.status {
                progress(PullProgress {
                    status,
                    progress: info.progress,
                });
            }
        }

        debug!("Runtime: pulled image {}", reference);
        Ok(())
    }

    async fn container_create(&self, spec: &ContainerSpec) -> Result<ContainerRef, RuntimeError> {
        let networking_config = spec.network.as_ref().map(|attachment| {
            let mut endpoints_config = HashMap::new();
            endpoints_config.insert(
                attachment.network.clone(),
                EndpointSettings {
                    aliases: Some(vec![attachment.alias.clone()]),
                    ..Default::default()
                },
            );
            NetworkingConfig { endpoints_config }
        });

        let config = Config {
            image: Some(qualified_image(&spec.image, spec.registry_auth.as_ref())),
            env: Some(
                spec.env
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect(),
            ),
            labels: Some(spec.labels.clone().into_iter().collect()),
            cmd: spec.command.clone(),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        debug!("Runtime: created container {} ({})", spec.name, response.id);

        Ok(ContainerRef {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        debug!("Runtime: started container {}", id);
        Ok(())
    }

    async fn container_stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await?;
        debug!("Runtime: stopped container {}", id);
        Ok(())
    }

    async fn container_inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        debug!("Runtime: inspected container {}", id);
        Ok(container_state(response))
    }

    async fn container_wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        let exit_code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard turns a non-zero exit into an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(RuntimeError::MissingField("wait status")),
        };
        debug!("Runtime: container {} exited with {}", id, exit_code);
        Ok(exit_code)
    }

    async fn container_remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        debug!("Runtime: removed container {}", id);
        Ok(())
    }

    async fn container_exec(&self, id: &str, command: &[String]) -> Result<(), RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                debug!("Runtime: [{}] {}", id, chunk?);
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        match inspect.exit_code {
            Some(0) => {
                debug!("Runtime: exec {:?} in {} succeeded", command, id);
                Ok(())
            }
            Some(exit_code) => Err(RuntimeError::ExecFailed {
                container: id.to_string(),
                command: command.join(" "),
                exit_code,
            }),
            None => Err(RuntimeError::MissingField("exec exit code")),
        }
    }

    async fn network_create(
        &self,
        name: &str,
        subnet: &Ipv4Network,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            labels: labels.clone().into_iter().collect(),
            ..Default::default()
        };

        let id = network_id(self.docker.create_network(options).await?)?;

        debug!("Runtime: created network {} ({}) on {}", name, id, subnet);
        Ok(id)
    }

    async fn network_connect(&self, network_id: &str, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .connect_network(
                network_id,
                ConnectNetworkOptions {
                    container: container_id.to_string(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await?;
        debug!("Runtime: connected {} to network {}", container_id, network_id);
        Ok(())
    }

    async fn registry_login(&self, auth: &RegistryAuth) -> Result<(), RuntimeError> {
        let url = format!("https://{}/v2/", auth.server.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .basic_auth(&auth.username, Some(&auth.password))
            .send()
            .await
            .map_err(|e| RuntimeError::Registry {
                server: auth.server.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::Registry {
                server: auth.server.clone(),
                message: format!("registry answered {}", status),
            });
        }

        debug!("Runtime: registry login to {} succeeded", auth.server);
        Ok(())
    }
}
