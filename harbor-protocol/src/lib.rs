//! # Harbor Protocol
//!
//! The shared data model of the orchestrator.
//!
//! ## Modules
//! - `model`: the declarative service configuration (`Config`, `Service`, hooks, registry auth).
//! - `events`: the typed deployment event stream.

pub mod events;
pub mod model;

pub use events::{Event, EventPayload, Stage};
pub use model::{Config, ConfigError, ControlPlane, HookPhase, Hooks, RegistryAuth, Service, ServiceSpec};
