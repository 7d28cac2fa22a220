//! Wires the allocator, runtime, store and router together for the daemon and the API.

use harbor_protocol::{Config, RegistryAuth};
use log::{info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::deployment::{Deployment, DeploymentId, DeploymentManifest, DeploymentSummary};
use crate::error::{DeploymentError, RuntimeError, SettingsError, StoreError};
use crate::event_bus::{EventBus, EventStream};
use crate::network::SubnetManager;
use crate::router::Router;
use crate::runtime::RuntimeClient;
use crate::settings::{self, Settings};
use crate::store::ManifestStore;

/// A deployment running in the background.
pub struct DeploymentHandle {
    pub id: DeploymentId,
    /// Closes once the deployment has finished and the router has been updated.
    pub events: EventStream,
    pub task: JoinHandle<Result<DeploymentManifest, DeploymentError>>,
}

pub struct Orchestrator {
    settings: Settings,
    runtime: Arc<dyn RuntimeClient>,
    subnets: SubnetManager,
    store: ManifestStore,
    router: Arc<Router>,
    /// Newest stored id as of the last [`Orchestrator::refresh`].
    seen: Mutex<Option<DeploymentId>>,
}

impl Orchestrator {
    /// `control_plane_host` is the reserved host of the embedded API.
    pub fn new(
        settings: Settings,
        control_plane_host: &str,
        runtime: Arc<dyn RuntimeClient>,
    ) -> Result<Self, SettingsError> {
        let subnets = SubnetManager::with_supernets(settings.subnet_record(), settings.supernets()?);
        let store = ManifestStore::new(settings.deployments_dir());
        let router = Arc::new(Router::new(
            control_plane_host,
            settings.container_port,
            Arc::clone(&runtime),
        ));

        Ok(Self {
            settings,
            runtime,
            subnets,
            store,
            router,
            seen: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn subnets(&self) -> &SubnetManager {
        &self.subnets
    }

    /// Re-reads the services file.
    pub fn load_config(&self) -> Result<Config, SettingsError> {
        settings::load_services(&self.settings.services_file)
    }

    /// Routes to the newest successful deployment on disk, if there is one.
    pub fn restore(&self) -> Result<Option<DeploymentId>, StoreError> {
        let Some(manifest) = self.store.latest_successful()? else {
            info!("Orchestrator: no previous deployment to route to");
            return Ok(None);
        };

        let id = manifest.id();
        match self.router.activate(Arc::new(manifest)) {
            Ok(_) => Ok(Some(id)),
            Err(e) => {
                warn!("Orchestrator: cannot route to deployment {}: {}", id, e);
                Ok(None)
            }
        }
    }

    /// Routes to the newest successful deployment on disk if the store changed since the last
    /// call, so deployments written by another process sharing the data directory go live.
    /// Returns the id the router switched to.
    pub fn refresh(&self) -> Result<Option<DeploymentId>, StoreError> {
        let newest = self.store.ids()?.last().copied();
        if *self.seen.lock().unwrap_or_else(PoisonError::into_inner) == newest {
            return Ok(None);
        }

        let switched = match self.store.latest_successful()? {
            Some(manifest) if self.router.active_manifest().map(|m| m.id()) != Some(manifest.id()) => {
                let id = manifest.id();
                match self.router.activate(Arc::new(manifest)) {
                    Ok(true) => Some(id),
                    Ok(false) => None,
                    Err(e) => {
                        warn!("Orchestrator: cannot route to deployment {}: {}", id, e);
                        None
                    }
                }
            }
            _ => None,
        };

        *self.seen.lock().unwrap_or_else(PoisonError::into_inner) = newest;
        Ok(switched)
    }

    /// Refreshes from the store every `period` until the task is aborted.
    pub fn watch_store(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            info!("Orchestrator: watching {} every {:?}", orchestrator.store.dir().display(), period);
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match orchestrator.refresh() {
                    Ok(Some(id)) => info!("Orchestrator: picked up deployment {} from the store", id),
                    Ok(None) => {}
                    Err(e) => warn!("Orchestrator: cannot read the store: {}", e),
                }
            }
        })
    }

    /// Starts a deployment of `config` in the background.
    ///
    /// A successful deployment becomes the router's active one before the event stream closes.
    pub fn deploy(self: &Arc<Self>, config: Config) -> DeploymentHandle {
        let (events, stream) = EventBus::channel();
        let deployment = Arc::new(Deployment::new(
            config,
            Arc::clone(&self.runtime),
            self.subnets.clone(),
            events,
        ));
        let id = deployment.id();

        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(async move {
            let manifest = deployment.run(&orchestrator.store).await?;
            if let Err(e) = orchestrator.router.activate(Arc::new(manifest.clone())) {
                warn!("Orchestrator: deployment {} not routable: {}", manifest.id(), e);
            }
            Ok(manifest)
        });

        DeploymentHandle {
            id,
            events: stream,
            task,
        }
    }

    pub fn list(&self) -> Result<Vec<DeploymentSummary>, StoreError> {
        Ok(self.store.list()?.iter().map(DeploymentManifest::summary).collect())
    }

    pub fn get(&self, id: DeploymentId) -> Result<DeploymentManifest, StoreError> {
        self.store.get(id)
    }

    /// Deletes a manifest from history. The deployment being routed to cannot be deleted.
    pub fn delete(&self, id: DeploymentId) -> Result<(), StoreError> {
        if self.router.active_manifest().map(|m| m.id()) == Some(id) {
            return Err(StoreError::InUse(id.to_string()));
        }
        self.store.delete(id)
    }

    /// Checks the credentials of every distinct registry used by `config`.
    pub async fn check_registries(&self, config: &Config) -> Vec<(RegistryAuth, Result<(), RuntimeError>)> {
        let mut registries: Vec<RegistryAuth> = Vec::new();
        for service in config.services().values() {
            if let Some(auth) = service.registry() {
                if !registries.contains(auth) {
                    registries.push(auth.clone());
                }
            }
        }

        let mut results = Vec::with_capacity(registries.len());
        for auth in registries {
            let result = self.runtime.registry_login(&auth).await;
            results.push((auth, result));
        }
        results
    }
}
