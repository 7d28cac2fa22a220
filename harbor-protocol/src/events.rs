//! # Deployment Events
//!
//! The typed progress record of a deployment.
//!
//! Every transition of the per-service state machine, and every deployment-level milestone,
//! is published as an [`Event`]. The order in which events are published is the authoritative
//! observable record of progress; the persisted manifest only records results.
//!
//! Events are transient. Consumers (a terminal renderer, an SSE endpoint) format them and
//! drop them.

use crate::model::{HookPhase, Service};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// The kind tag of an [`Event`].
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Start,
    StartLayer,
    AcquireSubnet,
    CreateNetwork,
    ConnectDependency,
    PullImage,
    CreateContainer,
    RunHook,
    StartContainer,
    FinishService,
    Error,
    FinishDeployment,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::StartLayer => "start-layer",
            Stage::AcquireSubnet => "acquire-subnet",
            Stage::CreateNetwork => "create-network",
            Stage::ConnectDependency => "connect-dependency",
            Stage::PullImage => "pull-image",
            Stage::CreateContainer => "create-container",
            Stage::RunHook => "run-hook",
            Stage::StartContainer => "start-container",
            Stage::FinishService => "finish-service",
            Stage::Error => "error",
            Stage::FinishDeployment => "finish-deployment",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened, with the data a renderer needs to describe it.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    None,
    Deployment {
        id: String,
    },
    Layer {
        index: usize,
        services: Vec<String>,
    },
    Subnet {
        cidr: String,
    },
    Network {
        id: String,
        name: String,
    },
    Dependency {
        service: String,
        container: String,
    },
    PullProgress {
        status: String,
        progress: Option<String>,
    },
    Container {
        id: String,
        name: String,
    },
    Hook {
        phase: HookPhase,
        command: String,
    },
    Error {
        message: String,
    },
    Finished {
        id: String,
        success: bool,
    },
}

/// One entry of the event stream.
///
/// `service` is `None` for deployment-level events.
#[derive(Serialize, Clone, Debug)]
pub struct Event {
    #[serde(serialize_with = "serialize_service_name")]
    service: Option<Arc<Service>>,
    stage: Stage,
    payload: EventPayload,
}

impl Event {
    pub fn global(stage: Stage, payload: EventPayload) -> Self {
        Self {
            service: None,
            stage,
            payload,
        }
    }

    pub fn for_service(service: &Arc<Service>, stage: Stage, payload: EventPayload) -> Self {
        Self {
            service: Some(Arc::clone(service)),
            stage,
            payload,
        }
    }

    pub fn service(&self) -> Option<&Arc<Service>> {
        self.service.as_ref()
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service.as_deref().map(Service::name)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn is_error(&self) -> bool {
        self.stage == Stage::Error
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = self.service_name().unwrap_or("deployment");
        write!(f, "[{}] {}", scope, self.stage)?;
        match &self.payload {
            EventPayload::None => Ok(()),
            EventPayload::Deployment { id } => write!(f, " {}", id),
            EventPayload::Layer { index, services } => {
                write!(f, " #{}: {}", index, services.join(", "))
            }
            EventPayload::Subnet { cidr } => write!(f, " {}", cidr),
            EventPayload::Network { id, name } => write!(f, " {} ({})", name, id),
            EventPayload::Dependency { service, container } => {
                write!(f, " {} ({})", service, container)
            }
            EventPayload::PullProgress { status, progress } => match progress {
                Some(progress) => write!(f, " {} {}", status, progress),
                None => write!(f, " {}", status),
            },
            EventPayload::Container { id, name } => write!(f, " {} ({})", name, id),
            EventPayload::Hook { phase, command } => write!(f, " {}: {}", phase, command),
            EventPayload::Error { message } => write!(f, " {}", message),
            EventPayload::Finished { id, success } => {
                let outcome = if *success { "succeeded" } else { "failed" };
                write!(f, " {} {}", id, outcome)
            }
        }
    }
}

fn serialize_service_name<S>(service: &Option<Arc<Service>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match service {
        Some(service) => serializer.serialize_some(service.name()),
        None => serializer.serialize_none(),
    }
}
