//! Declarative service model.
//!
//! A [`Config`] is built once per load of the services file and is immutable afterwards.
//! The engine only ever holds `Arc<Service>` references into it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A service lists a requirement that is not declared in the same file.
    #[error("Service '{service}' requires unknown service '{dependency}'")]
    DependencyNotFound { service: String, dependency: String },

    #[error("Service '{0}' has no image")]
    MissingImage(String),

    #[error("Control plane host must not be empty")]
    MissingControlPlaneHost,
}

/// Credentials for a private registry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RegistryAuth {
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    PreStart,
    PostStart,
    PreStop,
    PostStop,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookPhase::PreStart => "pre-start",
            HookPhase::PostStart => "post-start",
            HookPhase::PreStop => "pre-stop",
            HookPhase::PostStop => "post-stop",
        };
        f.write_str(name)
    }
}

/// Lifecycle hooks. Each entry is one shell command line run inside the service container.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Hooks {
    #[serde(default)]
    pub pre_start: Vec<String>,
    #[serde(default)]
    pub post_start: Vec<String>,
    #[serde(default)]
    pub pre_stop: Vec<String>,
    #[serde(default)]
    pub post_stop: Vec<String>,
}

impl Hooks {
    pub fn for_phase(&self, phase: HookPhase) -> &[String] {
        match phase {
            HookPhase::PreStart => &self.pre_start,
            HookPhase::PostStart => &self.post_start,
            HookPhase::PreStop => &self.pre_stop,
            HookPhase::PostStop => &self.post_stop,
        }
    }
}

/// One entry of the `services` map as written in the services file.
///
/// The name is the map key, so it is not part of the spec itself.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ServiceSpec {
    pub image: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(default)]
    pub registry: Option<RegistryAuth>,
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Service {
    name: String,
    image: String,
    hosts: Vec<String>,
    env: BTreeMap<String, String>,
    hooks: Hooks,
    registry: Option<RegistryAuth>,
    requires: Vec<String>,
    is_top_level: bool,
}

impl Service {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            hosts: Vec::new(),
            env: BTreeMap::new(),
            hooks: Hooks::default(),
            registry: None,
            requires: Vec::new(),
            is_top_level: true,
        }
    }

    pub fn from_spec(name: impl Into<String>, spec: ServiceSpec) -> Self {
        Self {
            name: name.into(),
            image: spec.image,
            hosts: spec.hosts,
            env: spec.env,
            hooks: spec.hooks,
            registry: spec.registry,
            requires: spec.requires,
            is_top_level: true,
        }
    }

    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_registry(mut self, registry: RegistryAuth) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn registry(&self) -> Option<&RegistryAuth> {
        self.registry.as_ref()
    }

    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    /// True when no other service requires this one.
    pub fn is_top_level(&self) -> bool {
        self.is_top_level
    }

    /// Top-level services with requirements own a private network shared with their dependencies.
    pub fn owns_network(&self) -> bool {
        self.is_top_level && !self.requires.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ControlPlane {
    pub host: String,
}

/// The resolved configuration used by one deployment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    services: BTreeMap<String, Arc<Service>>,
    control_plane: ControlPlane,
}

impl Config {
    /// Builds a config, computing `is_top_level` for every service and rejecting
    /// requirements that point at undeclared services.
    pub fn new(
        services: impl IntoIterator<Item = Service>,
        control_plane: ControlPlane,
    ) -> Result<Self, ConfigError> {
        if control_plane.host.trim().is_empty() {
            return Err(ConfigError::MissingControlPlaneHost);
        }

        let mut by_name: BTreeMap<String, Service> = services
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        let mut required = std::collections::BTreeSet::new();
        for service in by_name.values() {
            if service.image.trim().is_empty() {
                return Err(ConfigError::MissingImage(service.name.clone()));
            }
            for dependency in &service.requires {
                if !by_name.contains_key(dependency) {
                    return Err(ConfigError::DependencyNotFound {
                        service: service.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
                if dependency != &service.name {
                    required.insert(dependency.clone());
                }
            }
        }

        for (name, service) in by_name.iter_mut() {
            service.is_top_level = !required.contains(name);
        }

        Ok(Self {
            services: by_name
                .into_iter()
                .map(|(name, service)| (name, Arc::new(service)))
                .collect(),
            control_plane,
        })
    }

    pub fn from_specs(
        specs: BTreeMap<String, ServiceSpec>,
        control_plane: ControlPlane,
    ) -> Result<Self, ConfigError> {
        Self::new(
            specs
                .into_iter()
                .map(|(name, spec)| Service::from_spec(name, spec)),
            control_plane,
        )
    }

    pub fn services(&self) -> &BTreeMap<String, Arc<Service>> {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.get(name)
    }

    pub fn control_plane(&self) -> &ControlPlane {
        &self.control_plane
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_plane() -> ControlPlane {
        ControlPlane {
            host: "harbor.example.com".into(),
        }
    }

    #[test]
    fn test_top_level_is_computed_from_requirements() {
        let config = Config::new(
            vec![
                Service::new("app", "app:1").with_requires(["db"]),
                Service::new("db", "postgres:16"),
                Service::new("worker", "worker:1"),
            ],
            control_plane(),
        )
        .expect("valid config");

        assert!(config.service("app").unwrap().is_top_level());
        assert!(config.service("app").unwrap().owns_network());
        assert!(!config.service("db").unwrap().is_top_level());
        // Standalone services are top level but have nothing to share a network with.
        assert!(config.service("worker").unwrap().is_top_level());
        assert!(!config.service("worker").unwrap().owns_network());
    }

    #[test]
    fn test_unknown_requirement_is_rejected() {
        let err = Config::new(
            vec![Service::new("app", "app:1").with_requires(["ghost"])],
            control_plane(),
        )
        .unwrap_err();

        assert_eq!(
            err,
            ConfigError::DependencyNotFound {
                service: "app".into(),
                dependency: "ghost".into(),
            }
        );
    }

    #[test]
    fn test_specs_are_named_after_their_key() {
        let spec: ServiceSpec = serde_json::from_value(serde_json::json!({
            "image": "nginx:1.27",
            "hosts": ["www.example.com"],
            "hooks": { "post-start": ["nginx -t"] }
        }))
        .unwrap();

        let mut specs = BTreeMap::new();
        specs.insert("web".to_string(), spec);
        let config = Config::from_specs(specs, control_plane()).unwrap();

        let web = config.service("web").unwrap();
        assert_eq!(web.name(), "web");
        assert_eq!(web.hosts(), ["www.example.com".to_string()]);
        assert_eq!(web.hooks().for_phase(HookPhase::PostStart), ["nginx -t"]);
    }
}
