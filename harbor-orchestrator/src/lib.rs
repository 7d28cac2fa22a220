//! Single-host service orchestrator.
//!
//! Deploys a declarative set of services as containers, in dependency order, and routes
//! inbound HTTP(S) traffic to them by host name.

pub mod deployment;
pub mod error;
pub mod event_bus;
pub mod graph;
pub mod network;
pub mod orchestrator;
pub mod router;
pub mod runtime;
pub mod settings;
pub mod store;

pub use deployment::{Deployment, DeploymentId, DeploymentManifest};
pub use event_bus::{EventBus, EventStream};
pub use orchestrator::{DeploymentHandle, Orchestrator};
pub use router::Router;
pub use settings::Settings;
