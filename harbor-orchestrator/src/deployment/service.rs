//! The provisioning state machine of a single service.
//!
//! `Pending → NetworkProvisioned? → ImagePulled → ContainerCreated → PrestartHooksRun →
//! Started → PoststartHooksRun → HealthCheckPassed`. Steps run strictly in sequence and the
//! first failing step ends the machine; every transition is published as an event.
//!
//! The service container cannot run commands before it is started, so pre-start hooks each run
//! in a throwaway container built from the same image, environment and network. Post-start
//! hooks are executed inside the service container.

use harbor_protocol::{Event, EventPayload, HookPhase, Service, Stage};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::health;
use super::manifest::{Category, Resource};
use super::Deployment;
use crate::error::{RuntimeError, ServiceError};
use crate::runtime::{ContainerRef, ContainerSpec, NetworkAttachment, PullProgress};

/// Label carrying the owning service's name on every created container and network.
pub const SERVICE_LABEL: &str = "harbor.service";
/// Label carrying the deployment id.
pub const DEPLOYMENT_LABEL: &str = "harbor.deployment";

pub(super) struct ServiceDeployer<'a> {
    deployment: &'a Deployment,
    service: &'a Arc<Service>,
}

impl<'a> ServiceDeployer<'a> {
    pub(super) fn new(deployment: &'a Deployment, service: &'a Arc<Service>) -> Self {
        Self {
            deployment,
            service,
        }
    }

    /// Runs the machine to completion, reporting a failure as a service-scoped error event.
    pub(super) async fn run(&self) -> Result<(), ServiceError> {
        let result = self.provision().await;
        match &result {
            Ok(()) => info!("Deployment: service {} is up", self.service.name()),
            Err(e) => {
                error!("Deployment: service {} failed: {}", self.service.name(), e);
                self.emit(
                    Stage::Error,
                    EventPayload::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
        result
    }

    async fn provision(&self) -> Result<(), ServiceError> {
        let network = if self.service.owns_network() {
            Some(self.provision_network().await?)
        } else {
            None
        };

        self.pull_image().await?;
        let spec = self.container_spec(network);
        let container = self.create_container(&spec).await?;
        self.run_pre_start_hooks(&spec).await?;
        self.start(&container).await?;
        self.run_post_start_hooks(&container).await?;
        self.wait_healthy(&container).await?;

        self.emit(
            Stage::FinishService,
            EventPayload::Container {
                id: container.id,
                name: container.name,
            },
        );
        Ok(())
    }

    fn emit(&self, stage: Stage, payload: EventPayload) {
        self.deployment
            .events
            .publish(Event::for_service(self.service, stage, payload));
    }

    /// Deployment-scoped name shared by the service's container and private network.
    fn resource_name(&self) -> String {
        format!("{}-{}", self.service.name(), self.deployment.id)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(SERVICE_LABEL.to_string(), self.service.name().to_string());
        labels.insert(DEPLOYMENT_LABEL.to_string(), self.deployment.id.to_string());
        labels
    }

    /// Creates the service's private network and connects every dependency to it.
    /// Returns the network id.
    async fn provision_network(&self) -> Result<String, ServiceError> {
        let runtime = &self.deployment.runtime;

        let subnet = self.deployment.subnets.next().await?;
        self.emit(
            Stage::AcquireSubnet,
            EventPayload::Subnet {
                cidr: subnet.to_string(),
            },
        );

        let name = self.resource_name();
        let network_id = runtime.network_create(&name, &subnet, &self.labels()).await?;
        self.deployment.record(
            Category::CreatedNetworks,
            self.service.name(),
            Resource::Network {
                id: network_id.clone(),
                name: name.clone(),
                subnet,
            },
        );
        self.emit(
            Stage::CreateNetwork,
            EventPayload::Network {
                id: network_id.clone(),
                name,
            },
        );

        for dependency in self.service.requires() {
            // The dependency ran in an earlier layer, so its container must be recorded.
            let container_id = self.deployment.container_id(dependency)?;
            runtime.network_connect(&network_id, &container_id).await?;
            self.emit(
                Stage::ConnectDependency,
                EventPayload::Dependency {
                    service: dependency.clone(),
                    container: container_id,
                },
            );
        }

        Ok(network_id)
    }

    async fn pull_image(&self) -> Result<(), ServiceError> {
        let progress = |line: PullProgress| {
            self.emit(
                Stage::PullImage,
                EventPayload::PullProgress {
                    status: line.status,
                    progress: line.progress,
                },
            )
        };

        self.deployment
            .runtime
            .image_pull(self.service.image(), self.service.registry(), &progress)
            .await?;
        debug!("Deployment: image {} ready for {}", self.service.image(), self.service.name());
        self.emit(
            Stage::PullImage,
            EventPayload::PullProgress {
                status: format!("Pulled {}", self.service.image()),
                progress: None,
            },
        );
        Ok(())
    }

    fn container_spec(&self, network: Option<String>) -> ContainerSpec {
        ContainerSpec {
            image: self.service.image().to_string(),
            name: self.resource_name(),
            env: self.service.env().clone(),
            labels: self.labels(),
            registry_auth: self.service.registry().cloned(),
            network: network.map(|network| NetworkAttachment {
                network,
                alias: self.service.name().to_string(),
            }),
            command: None,
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerRef, ServiceError> {
        let container = self.deployment.runtime.container_create(spec).await?;
        self.deployment.record(
            Category::CreatedContainers,
            self.service.name(),
            Resource::Container {
                id: container.id.clone(),
                name: container.name.clone(),
            },
        );
        self.emit(
            Stage::CreateContainer,
            EventPayload::Container {
                id: container.id.clone(),
                name: container.name.clone(),
            },
        );
        Ok(container)
    }

    fn emit_hook(&self, phase: HookPhase, command: &str) {
        self.emit(
            Stage::RunHook,
            EventPayload::Hook {
                phase,
                command: command.to_string(),
            },
        );
    }

    /// Runs each pre-start hook in its own container; the first failure aborts the service.
    async fn run_pre_start_hooks(&self, service: &ContainerSpec) -> Result<(), ServiceError> {
        let phase = HookPhase::PreStart;
        for (index, command) in self.service.hooks().for_phase(phase).iter().enumerate() {
            self.emit_hook(phase, command);

            let mut spec = service.clone();
            spec.name = format!("{}-pre-start-{}", service.name, index);
            spec.command = Some(shell(command));
            if let Some(attachment) = spec.network.as_mut() {
                attachment.alias = spec.name.clone();
            }

            self.run_to_completion(&spec)
                .await
                .map_err(|source| ServiceError::Hook {
                    phase,
                    command: command.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Creates, starts and waits for a one-off container, then removes it.
    async fn run_to_completion(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let runtime = &self.deployment.runtime;
        let container = runtime.container_create(spec).await?;
        let exit_code = match runtime.container_start(&container.id).await {
            Ok(()) => runtime.container_wait(&container.id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = runtime.container_remove(&container.id).await {
            warn!("Deployment: could not remove hook container {}: {}", container.name, e);
        }

        match exit_code? {
            0 => Ok(()),
            exit_code => Err(RuntimeError::ExecFailed {
                container: container.name,
                command: spec.command.as_deref().unwrap_or_default().join(" "),
                exit_code,
            }),
        }
    }

    /// Runs the post-start hooks in order inside the running container.
    async fn run_post_start_hooks(&self, container: &ContainerRef) -> Result<(), ServiceError> {
        let phase = HookPhase::PostStart;
        for command in self.service.hooks().for_phase(phase) {
            self.emit_hook(phase, command);
            self.deployment
                .runtime
                .container_exec(&container.id, &shell(command))
                .await
                .map_err(|source| ServiceError::Hook {
                    phase,
                    command: command.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), ServiceError> {
        self.deployment.runtime.container_start(&container.id).await?;
        self.emit(
            Stage::StartContainer,
            EventPayload::Container {
                id: container.id.clone(),
                name: container.name.clone(),
            },
        );
        Ok(())
    }

    /// On a failed wait the container is stopped; a failed stop is reported alongside.
    async fn wait_healthy(&self, container: &ContainerRef) -> Result<(), ServiceError> {
        let runtime = self.deployment.runtime.as_ref();
        let health = match health::wait_until_ready(runtime, container).await {
            Ok(()) => return Ok(()),
            Err(health) => health,
        };

        warn!(
            "Deployment: {} failed its health check ({}), stopping it",
            container.name, health
        );
        match runtime.container_stop(&container.id).await {
            Ok(()) => Err(ServiceError::Health(health)),
            Err(stop) => Err(ServiceError::HealthAndStop { health, stop }),
        }
    }
}

fn shell(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}
