//! In-memory container engine for tests.
//!
//! Records every call, hands out deterministic ids and addresses, and lets a test make
//! individual operations fail or script what `container_inspect` reports.

use async_trait::async_trait;
use harbor_protocol::RegistryAuth;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use super::traits::{
    qualified_image, ContainerRef, ContainerSpec, ContainerState, ProgressCallback, PullProgress,
    RuntimeClient,
};
use crate::error::RuntimeError;
use crate::network::Ipv4Network;

/// Network every container lands on when created without an attachment.
pub const DEFAULT_NETWORK: &str = "bridge";

/// A recorded engine call. Containers and networks are referred to by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ImagePull { image: String },
    ContainerCreate { name: String },
    ContainerStart { name: String },
    ContainerStop { name: String },
    ContainerInspect { name: String },
    ContainerWait { name: String },
    ContainerRemove { name: String },
    ContainerExec { name: String, command: Vec<String> },
    NetworkCreate { name: String, subnet: Ipv4Network },
    NetworkConnect { network: String, container: String },
    RegistryLogin { server: String },
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    Exec,
    NetworkCreate,
    NetworkConnect,
    Login,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    started: bool,
    removed: bool,
    addresses: BTreeMap<String, Ipv4Addr>,
}

#[derive(Debug, Clone)]
struct FakeNetwork {
    name: String,
    subnet: Ipv4Network,
    next_host: u32,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, FakeNetwork>,
    failures: HashSet<(Op, String)>,
    inspect_scripts: HashMap<String, VecDeque<ContainerState>>,
    next_id: u64,
    next_bridge_host: u8,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }

    fn check(&self, op: Op, target: &str) -> Result<(), RuntimeError> {
        if self.failures.contains(&(op, target.to_string())) {
            return Err(RuntimeError::Refused(format!("{:?} {}", op, target)));
        }
        Ok(())
    }

    fn container(&self, id: &str) -> Result<&FakeContainer, RuntimeError> {
        self.containers
            .get(id)
            .filter(|c| !c.removed)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut FakeContainer, RuntimeError> {
        self.containers
            .get_mut(id)
            .filter(|c| !c.removed)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    /// Exit status of `command`: 1 when an exec failure was registered for its last word.
    fn exit_code(&self, command: &[String]) -> i64 {
        let line = command.last().cloned().unwrap_or_default();
        if self.check(Op::Exec, &line).is_err() {
            1
        } else {
            0
        }
    }

    fn attach(&mut self, network_id: &str, container_id: &str) -> Result<(), RuntimeError> {
        let network = self
            .networks
            .get_mut(network_id)
            .ok_or_else(|| RuntimeError::NotFound(network_id.to_string()))?;
        network.next_host += 1;
        let address = network
            .subnet
            .nth(network.next_host)
            .ok_or_else(|| RuntimeError::Refused(format!("network {} is full", network.name)))?;
        let name = network.name.clone();

        self.container_mut(container_id)?
            .addresses
            .insert(name, address);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `op` fail for `target`: an image for pulls, a container or network name,
    /// a registry server, or the full hook command line for execs. A container whose command
    /// ends in a failing hook line exits with status 1.
    pub fn fail(&self, op: Op, target: impl Into<String>) {
        self.state().failures.insert((op, target.into()));
    }

    /// Queues states returned by successive inspections of container `name`.
    ///
    /// The last state repeats once the queue is down to one. Addresses are filled in from
    /// the container's real attachments.
    pub fn script_inspect(&self, name: impl Into<String>, states: Vec<ContainerState>) {
        self.state()
            .inspect_scripts
            .insert(name.into(), states.into_iter().collect());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Position of the first recorded call equal to `call`.
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.state().calls.iter().position(|c| c == call)
    }

    /// The spec a container was created with, looked up by name. Removed containers are kept.
    pub fn created(&self, name: &str) -> Option<ContainerSpec> {
        self.state()
            .containers
            .values()
            .find(|c| c.spec.name == name)
            .map(|c| c.spec.clone())
    }

    pub fn container_id(&self, name: &str) -> Option<String> {
        self.state()
            .containers
            .iter()
            .find(|(_, c)| c.spec.name == name)
            .map(|(id, _)| id.clone())
    }

    fn name_of(&self, id: &str) -> String {
        self.state()
            .containers
            .get(id)
            .map(|c| c.spec.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn image_pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        progress: ProgressCallback<'_>,
    ) -> Result<(), RuntimeError> {
        let reference = qualified_image(image, auth);
        {
            let mut state = self.state();
            state.calls.push(Call::ImagePull {
                image: reference.clone(),
            });
            state.check(Op::Pull, &reference)?;
        }

        progress(PullProgress {
            status: format!("Pulling from {}", reference),
            progress: None,
        });
        progress(PullProgress {
            status: "Download complete".into(),
            progress: Some("[==================================================>]".into()),
        });
        Ok(())
    }

    async fn container_create(&self, spec: &ContainerSpec) -> Result<ContainerRef, RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::ContainerCreate {
            name: spec.name.clone(),
        });
        state.check(Op::Create, &spec.name)?;

        let id = state.id("container");
        state.next_bridge_host = state.next_bridge_host.wrapping_add(1);
        let mut addresses = BTreeMap::new();
        addresses.insert(
            DEFAULT_NETWORK.to_string(),
            Ipv4Addr::new(172, 17, 0, state.next_bridge_host.max(2)),
        );
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                started: false,
                removed: false,
                addresses,
            },
        );

        if let Some(attachment) = &spec.network {
            state.attach(&attachment.network, &id)?;
        }

        Ok(ContainerRef {
            id,
            name: spec.name.clone(),
        })
    }

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError> {
        let name = self.name_of(id);
        let mut state = self.state();
        state.calls.push(Call::ContainerStart { name: name.clone() });
        state.check(Op::Start, &name)?;
        state.container_mut(id)?.started = true;
        Ok(())
    }

    async fn container_stop(&self, id: &str) -> Result<(), RuntimeError> {
        let name = self.name_of(id);
        let mut state = self.state();
        state.calls.push(Call::ContainerStop { name: name.clone() });
        state.check(Op::Stop, &name)?;
        state.container_mut(id)?.started = false;
        Ok(())
    }

    async fn container_inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let name = self.name_of(id);
        let mut state = self.state();
        state.calls.push(Call::ContainerInspect { name: name.clone() });

        let container = state.container(id)?.clone();
        let scripted = match state.inspect_scripts.get_mut(&name) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };

        let mut inspected = scripted.unwrap_or_else(|| ContainerState {
            status: if container.started { "running" } else { "created" }.into(),
            ..Default::default()
        });
        if inspected.addresses.is_empty() {
            inspected.addresses = container.addresses;
        }
        Ok(inspected)
    }

    async fn container_wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let name = self.name_of(id);
        let mut state = self.state();
        state.calls.push(Call::ContainerWait { name: name.clone() });

        let container = state.container(id)?;
        if !container.started {
            return Err(RuntimeError::Refused(format!("container {} was never started", name)));
        }
        let command = container.spec.command.clone().unwrap_or_default();
        let exit_code = state.exit_code(&command);
        state.container_mut(id)?.started = false;
        Ok(exit_code)
    }

    async fn container_remove(&self, id: &str) -> Result<(), RuntimeError> {
        let name = self.name_of(id);
        let mut state = self.state();
        state.calls.push(Call::ContainerRemove { name: name.clone() });
        state.check(Op::Remove, &name)?;

        let container = state.container_mut(id)?;
        container.started = false;
        container.removed = true;
        Ok(())
    }

    async fn container_exec(&self, id: &str, command: &[String]) -> Result<(), RuntimeError> {
        let name = self.name_of(id);
        let mut state = self.state();
        state.calls.push(Call::ContainerExec {
            name: name.clone(),
            command: command.to_vec(),
        });
        if !state.container(id)?.started {
            return Err(RuntimeError::Refused(format!("container {} is not running", name)));
        }

        match state.exit_code(command) {
            0 => Ok(()),
            exit_code => Err(RuntimeError::ExecFailed {
                container: name,
                command: command.join(" "),
                exit_code,
            }),
        }
    }

    async fn network_create(
        &self,
        name: &str,
        subnet: &Ipv4Network,
        _labels: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::NetworkCreate {
            name: name.to_string(),
            subnet: *subnet,
        });
        state.check(Op::NetworkCreate, name)?;

        let id = state.id("network");
        state.networks.insert(
            id.clone(),
            FakeNetwork {
                name: name.to_string(),
                subnet: *subnet,
                next_host: 1,
            },
        );
        Ok(id)
    }

    async fn network_connect(&self, network_id: &str, container_id: &str) -> Result<(), RuntimeError> {
        let container = self.name_of(container_id);
        let mut state = self.state();
        let network = state
            .networks
            .get(network_id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| network_id.to_string());
        state.calls.push(Call::NetworkConnect {
            network: network.clone(),
            container,
        });
        state.check(Op::NetworkConnect, &network)?;
        state.attach(network_id, container_id)
    }

    async fn registry_login(&self, auth: &RegistryAuth) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::RegistryLogin {
            server: auth.server.clone(),
        });
        state
            .check(Op::Login, &auth.server)
            .map_err(|e| RuntimeError::Registry {
                server: auth.server.clone(),
                message: e.to_string(),
            })
    }
}
