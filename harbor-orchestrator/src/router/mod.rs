//! # Router
//!
//! Turns the `Host` of an inbound request into the address of a live container.
//!
//! The router serves one deployment at a time, the *active* one. Host patterns come from the
//! config snapshot stored in that deployment's manifest and container ids from its resource
//! table. Resolved addresses are cached per host for as long as the deployment stays active:
//! [`Router::activate`] installs a fresh, empty cache together with the new manifest.
//!
//! Every activation also republishes the hosts a certificate may be requested for, so the
//! HTTPS listener can follow the routing table.

pub mod api;
pub mod matcher;
pub mod proxy;
pub mod tls;

pub use matcher::{host_regex, normalize_host, HostMatcher};

use harbor_protocol::Service;
use log::{debug, info};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

use crate::deployment::DeploymentManifest;
use crate::error::RouteError;
use crate::runtime::RuntimeClient;

/// The active deployment and everything derived from it.
struct Active {
    manifest: Arc<DeploymentManifest>,
    matcher: HostMatcher,
    cache: RwLock<HashMap<String, Ipv4Addr>>,
}

pub struct Router {
    control_plane_host: String,
    container_port: u16,
    runtime: Arc<dyn RuntimeClient>,
    active: RwLock<Option<Arc<Active>>>,
    published_hosts: watch::Sender<Vec<String>>,
}

impl Router {
    pub fn new(control_plane_host: &str, container_port: u16, runtime: Arc<dyn RuntimeClient>) -> Self {
        let control_plane_host = normalize_host(control_plane_host);
        let (published_hosts, _) = watch::channel(vec![control_plane_host.clone()]);
        Self {
            control_plane_host,
            container_port,
            runtime,
            active: RwLock::new(None),
            published_hosts,
        }
    }

    pub fn container_port(&self) -> u16 {
        self.container_port
    }

    pub fn control_plane_host(&self) -> &str {
        &self.control_plane_host
    }

    pub fn is_control_plane(&self, host: &str) -> bool {
        normalize_host(host) == self.control_plane_host
    }

    fn current(&self) -> Option<Arc<Active>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Routes traffic to `manifest` from now on, dropping every cached address.
    ///
    /// A manifest older than the active one is ignored, so concurrent deployments that finish
    /// out of order still leave the newest one active. Returns whether it was installed.
    pub fn activate(&self, manifest: Arc<DeploymentManifest>) -> Result<bool, RouteError> {
        let matcher = HostMatcher::new(manifest.config())?;
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = active.as_ref() {
            if current.manifest.id() > manifest.id() {
                debug!(
                    "Router: keeping {}, ignoring older deployment {}",
                    current.manifest.id(),
                    manifest.id()
                );
                return Ok(false);
            }
        }

        info!("Router: routing to deployment {}", manifest.id());
        *active = Some(Arc::new(Active {
            manifest,
            matcher,
            cache: RwLock::new(HashMap::new()),
        }));
        drop(active);

        let hosts = self.certificate_hosts();
        self.published_hosts.send_if_modified(|current| {
            if *current == hosts {
                return false;
            }
            info!("Router: certificate hosts are now {}", hosts.join(", "));
            *current = hosts;
            true
        });
        Ok(true)
    }

    /// Follows [`Router::certificate_hosts`] across activations.
    pub fn subscribe_certificate_hosts(&self) -> watch::Receiver<Vec<String>> {
        self.published_hosts.subscribe()
    }

    pub fn active_manifest(&self) -> Option<Arc<DeploymentManifest>> {
        self.current().map(|active| Arc::clone(&active.manifest))
    }

    /// The service owning `host` in the active deployment.
    pub fn service_for(&self, host: &str) -> Result<Arc<Service>, RouteError> {
        let active = self.current().ok_or(RouteError::NoActiveDeployment)?;
        let host = normalize_host(host);
        active
            .matcher
            .service_for(&host)
            .cloned()
            .ok_or(RouteError::UnknownHost(host))
    }

    /// Whether a request for `host` would be served, either by a service or the API.
    pub fn accepts(&self, host: &str) -> bool {
        self.is_control_plane(host) || self.service_for(host).is_ok()
    }

    /// Hosts a certificate may be requested for: the control plane plus every service host
    /// pattern without a wildcard.
    pub fn certificate_hosts(&self) -> Vec<String> {
        let mut hosts = vec![self.control_plane_host.clone()];
        if let Some(active) = self.current() {
            for host in active.matcher.exact_hosts() {
                let host = normalize_host(host);
                if !hosts.contains(&host) {
                    hosts.push(host);
                }
            }
        }
        hosts
    }

    /// The address of the container serving `host`.
    pub async fn resolve(&self, host: &str) -> Result<Ipv4Addr, RouteError> {
        let active = self.current().ok_or(RouteError::NoActiveDeployment)?;
        let host = normalize_host(host);

        let cached = active
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host)
            .copied();
        if let Some(ip) = cached {
            return Ok(ip);
        }

        let service = active
            .matcher
            .service_for(&host)
            .ok_or_else(|| RouteError::UnknownHost(host.clone()))?;
        let resources = active.manifest.resources();
        let container_id = resources.container_id(service.name())?;

        let state = self.runtime.container_inspect(container_id).await?;
        let ip = state
            .address(resources.network_name(service.name()))
            .ok_or_else(|| RouteError::NoAddress(container_id.to_string()))?;

        debug!("Router: {} -> {} ({})", host, ip, service.name());
        // Goes into this activation's cache; if another deployment was activated meanwhile,
        // the entry is dropped with it.
        active
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host, ip);
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{Category, DeploymentId, Outcome, Resource, ResourceTable};
    use crate::runtime::fake::{Call, FakeRuntime};
    use crate::runtime::{ContainerSpec, NetworkAttachment};
    use chrono::Utc;
    use harbor_protocol::{Config, ControlPlane};
    use std::collections::BTreeMap;

    async fn deployed(
        runtime: &FakeRuntime,
        nanos: u64,
        subnet: &str,
    ) -> Arc<DeploymentManifest> {
        let config = Config::new(
            vec![
                Service::new("web", "web:1")
                    .with_hosts(["www.example.com", "*.apps.example.com"])
                    .with_requires(["db"]),
                Service::new("db", "db:1"),
            ],
            ControlPlane {
                host: "harbor.example.com".into(),
            },
        )
        .unwrap();

        let subnet = subnet.parse().unwrap();
        let network = runtime
            .network_create(&format!("web-{}", nanos), &subnet, &BTreeMap::new())
            .await
            .unwrap();
        let web = runtime
            .container_create(&ContainerSpec {
                image: "web:1".into(),
                name: format!("web-{}", nanos),
                env: BTreeMap::new(),
                labels: BTreeMap::new(),
                registry_auth: None,
                network: Some(NetworkAttachment {
                    network: network.clone(),
                    alias: "web".into(),
                }),
                command: None,
            })
            .await
            .unwrap();

        let mut resources = ResourceTable::new();
        resources.record(
            Category::CreatedNetworks,
            "web",
            Resource::Network {
                id: network,
                name: format!("web-{}", nanos),
                subnet,
            },
        );
        resources.record(
            Category::CreatedContainers,
            "web",
            Resource::Container {
                id: web.id,
                name: web.name,
            },
        );

        Arc::new(DeploymentManifest::new(
            DeploymentId::from_nanos(nanos),
            Utc::now(),
            config,
            resources,
            Outcome::Succeeded,
        ))
    }

    fn inspections(runtime: &FakeRuntime) -> usize {
        runtime
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::ContainerInspect { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_resolve_uses_service_network_and_caches() {
        let runtime = Arc::new(FakeRuntime::new());
        let router = Router::new("harbor.example.com", 80, runtime.clone());
        router.activate(deployed(&runtime, 1, "10.0.1.0/24").await).unwrap();

        let ip = router.resolve("WWW.example.com:443").await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(router.resolve("www.example.com").await.unwrap(), ip);
        assert_eq!(inspections(&runtime), 1);

        assert_eq!(
            router.resolve("x.apps.example.com").await.unwrap(),
            Ipv4Addr::new(10, 0, 1, 2)
        );
        assert_eq!(inspections(&runtime), 2);
    }

    #[tokio::test]
    async fn test_activation_invalidates_cache() {
        let runtime = Arc::new(FakeRuntime::new());
        let router = Router::new("harbor.example.com", 80, runtime.clone());

        router.activate(deployed(&runtime, 1, "10.0.1.0/24").await).unwrap();
        assert_eq!(
            router.resolve("www.example.com").await.unwrap(),
            Ipv4Addr::new(10, 0, 1, 2)
        );

        router.activate(deployed(&runtime, 2, "10.0.2.0/24").await).unwrap();
        assert_eq!(
            router.resolve("www.example.com").await.unwrap(),
            Ipv4Addr::new(10, 0, 2, 2)
        );
    }

    #[tokio::test]
    async fn test_older_deployment_does_not_replace_newer() {
        let runtime = Arc::new(FakeRuntime::new());
        let router = Router::new("harbor.example.com", 80, runtime.clone());

        assert!(router.activate(deployed(&runtime, 5, "10.0.5.0/24").await).unwrap());
        assert!(!router.activate(deployed(&runtime, 3, "10.0.3.0/24").await).unwrap());
        assert_eq!(router.active_manifest().unwrap().id().as_nanos(), 5);
    }

    #[tokio::test]
    async fn test_unknown_hosts_and_host_policy() {
        let runtime = Arc::new(FakeRuntime::new());
        let router = Router::new("Harbor.Example.com", 80, runtime.clone());

        assert!(matches!(
            router.resolve("www.example.com").await,
            Err(RouteError::NoActiveDeployment)
        ));
        assert!(router.accepts("harbor.example.com:443"));

        router.activate(deployed(&runtime, 1, "10.0.1.0/24").await).unwrap();
        assert!(matches!(
            router.resolve("db.example.com").await,
            Err(RouteError::UnknownHost(host)) if host == "db.example.com"
        ));
        assert!(router.accepts("a.apps.example.com"));
        assert!(!router.accepts("a.b.apps.example.com"));
        assert_eq!(
            router.certificate_hosts(),
            vec!["harbor.example.com".to_string(), "www.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_container_record_is_an_error() {
        let runtime = Arc::new(FakeRuntime::new());
        let router = Router::new("harbor.example.com", 80, runtime.clone());
        let manifest = deployed(&runtime, 1, "10.0.1.0/24").await;
        let stripped = DeploymentManifest::new(
            manifest.id(),
            manifest.created_at(),
            manifest.config().clone(),
            ResourceTable::new(),
            Outcome::Succeeded,
        );
        router.activate(Arc::new(stripped)).unwrap();

        assert!(matches!(
            router.resolve("www.example.com").await,
            Err(RouteError::Manifest(_))
        ));
    }
}
