//! One run of the deployment pipeline.
//!
//! Layers from the [`GraphResolver`] execute strictly one after the other; the services of a
//! layer run concurrently, one task each. A failing layer is always joined completely and
//! nothing after it starts. Whatever happened, the manifest is saved exactly once.

pub mod health;
pub mod id;
pub mod manifest;
mod service;

pub use id::DeploymentId;
pub use manifest::{Category, DeploymentManifest, DeploymentSummary, Outcome, Resource, ResourceTable};
pub use service::{DEPLOYMENT_LABEL, SERVICE_LABEL};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use harbor_protocol::{Config, Event, EventPayload, Stage};
use log::{error, info};
use std::sync::{Arc, Mutex, PoisonError};

use self::service::ServiceDeployer;
use crate::error::{DeploymentError, ManifestError, ServiceError, ServiceFailure};
use crate::event_bus::EventBus;
use crate::graph::GraphResolver;
use crate::network::SubnetManager;
use crate::runtime::RuntimeClient;
use crate::store::ManifestStore;

pub struct Deployment {
    id: DeploymentId,
    created_at: DateTime<Utc>,
    config: Config,
    runtime: Arc<dyn RuntimeClient>,
    subnets: SubnetManager,
    resources: Mutex<ResourceTable>,
    events: EventBus,
}

impl Deployment {
    pub fn new(
        config: Config,
        runtime: Arc<dyn RuntimeClient>,
        subnets: SubnetManager,
        events: EventBus,
    ) -> Self {
        Self {
            id: DeploymentId::generate(),
            created_at: Utc::now(),
            config,
            runtime,
            subnets,
            resources: Mutex::new(ResourceTable::new()),
            events,
        }
    }

    pub fn id(&self) -> DeploymentId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A snapshot of the resources created so far.
    pub fn resources(&self) -> ResourceTable {
        self.table().clone()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, ResourceTable> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, category: Category, label: &str, resource: Resource) {
        self.table().record(category, label, resource);
    }

    fn container_id(&self, service: &str) -> Result<String, ManifestError> {
        self.table().container_id(service).map(str::to_string)
    }

    fn publish_error(&self, message: String) {
        self.events
            .publish(Event::global(Stage::Error, EventPayload::Error { message }));
    }

    /// Runs the deployment to the end and persists its manifest to `store`.
    ///
    /// Returns the saved manifest on success. On failure the manifest is still saved,
    /// recording whatever was created, so it can be inspected later.
    pub async fn run(self: &Arc<Self>, store: &ManifestStore) -> Result<DeploymentManifest, DeploymentError> {
        info!("Deployment: {} starting", self.id);
        self.events.publish(Event::global(
            Stage::Start,
            EventPayload::Deployment {
                id: self.id.to_string(),
            },
        ));

        let result = self.execute().await;
        let outcome = match &result {
            Ok(()) => Outcome::Succeeded,
            Err(e) => Outcome::Failed {
                message: e.to_string(),
            },
        };

        let manifest = DeploymentManifest::new(
            self.id,
            self.created_at,
            self.config.clone(),
            self.resources(),
            outcome,
        );
        let saved = store.save(&manifest);
        if let Err(e) = &saved {
            error!("Deployment: failed to save manifest {}: {}", self.id, e);
            self.publish_error(format!("Failed to persist deployment: {}", e));
        }

        let success = result.is_ok() && saved.is_ok();
        match &result {
            Ok(()) => info!("Deployment: {} finished (saved: {})", self.id, saved.is_ok()),
            Err(e) => error!("Deployment: {} failed: {}", self.id, e),
        }
        self.events.publish(Event::global(
            Stage::FinishDeployment,
            EventPayload::Finished {
                id: self.id.to_string(),
                success,
            },
        ));

        result?;
        saved?;
        Ok(manifest)
    }

    async fn execute(self: &Arc<Self>) -> Result<(), DeploymentError> {
        let layers = GraphResolver::layered(self.config.services()).map_err(|e| {
            self.publish_error(e.to_string());
            e
        })?;

        for (index, layer) in layers.into_iter().enumerate() {
            let names: Vec<String> = layer.iter().map(|s| s.name().to_string()).collect();
            info!("Deployment: layer {} [{}]", index, names.join(", "));
            self.events.publish(Event::global(
                Stage::StartLayer,
                EventPayload::Layer {
                    index,
                    services: names,
                },
            ));

            let tasks = layer.into_iter().map(|service| {
                let deployment = Arc::clone(self);
                let name = service.name().to_string();
                let handle = tokio::spawn(async move {
                    ServiceDeployer::new(&deployment, &service).run().await
                });
                async move { (name, handle.await) }
            });

            // Every task of the layer is joined, failed or not, before deciding.
            let mut failures = Vec::new();
            for (service, joined) in join_all(tasks).await {
                let error = match joined {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(e) => {
                        let error = ServiceError::Aborted(e.to_string());
                        self.publish_error(format!("{}: {}", service, error));
                        error
                    }
                };
                failures.push(ServiceFailure { service, error });
            }

            if !failures.is_empty() {
                return Err(DeploymentError::ServicesFailed(failures));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HealthError, RuntimeError};
    use crate::event_bus::EventStream;
    use crate::runtime::fake::{Call, FakeRuntime, Op};
    use crate::runtime::{ContainerState, HealthCheckConfig, HealthStatus};
    use harbor_protocol::{ControlPlane, Hooks, Service};
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        runtime: Arc<FakeRuntime>,
        subnets: SubnetManager,
        store: ManifestStore,
    }

    impl Harness {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let dir = tempfile::tempdir().unwrap();
            Self {
                subnets: SubnetManager::with_supernets(
                    dir.path().join("subnets"),
                    vec!["10.0.0.0/16".parse().unwrap()],
                ),
                store: ManifestStore::new(dir.path().join("deployments")),
                runtime: Arc::new(FakeRuntime::new()),
                _dir: dir,
            }
        }

        fn deployment(&self, services: Vec<Service>) -> (Arc<Deployment>, EventStream) {
            let config = Config::new(
                services,
                ControlPlane {
                    host: "harbor.example.com".into(),
                },
            )
            .unwrap();
            let (events, stream) = EventBus::channel();
            let runtime: Arc<dyn RuntimeClient> = self.runtime.clone();
            let deployment = Deployment::new(config, runtime, self.subnets.clone(), events);
            (Arc::new(deployment), stream)
        }
    }

    fn drain(mut stream: EventStream) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = stream.try_recv() {
            events.push(event);
        }
        events
    }

    fn stages_of(events: &[Event], service: &str) -> Vec<Stage> {
        events
            .iter()
            .filter(|e| e.service_name() == Some(service))
            .map(Event::stage)
            .filter(|stage| *stage != Stage::PullImage)
            .collect()
    }

    fn web_stack() -> Vec<Service> {
        vec![
            Service::new("web", "nginx:1.27")
                .with_requires(["db"])
                .with_hooks(Hooks {
                    pre_start: vec!["echo pre".into()],
                    post_start: vec!["echo post-1".into(), "echo post-2".into()],
                    ..Default::default()
                }),
            Service::new("db", "postgres:16"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run_records_everything() {
        let harness = Harness::new();
        let (deployment, stream) = harness.deployment(web_stack());

        let manifest = deployment.run(&harness.store).await.unwrap();
        let events = drain(stream);

        assert!(manifest.outcome().is_success());
        assert_eq!(harness.store.get(deployment.id()).unwrap(), manifest);

        let resources = manifest.resources();
        assert_eq!(resources.entries(Category::CreatedContainers).len(), 2);
        assert_eq!(resources.entries(Category::CreatedNetworks).len(), 1);
        assert_eq!(
            resources.network_name("web"),
            Some(format!("web-{}", deployment.id()).as_str())
        );

        assert_eq!(events.first().unwrap().stage(), Stage::Start);
        assert_eq!(events.last().unwrap().stage(), Stage::FinishDeployment);
        assert_eq!(
            stages_of(&events, "web"),
            vec![
                Stage::AcquireSubnet,
                Stage::CreateNetwork,
                Stage::ConnectDependency,
                Stage::CreateContainer,
                Stage::RunHook,
                Stage::StartContainer,
                Stage::RunHook,
                Stage::RunHook,
                Stage::FinishService,
            ]
        );
        assert_eq!(
            stages_of(&events, "db"),
            vec![Stage::CreateContainer, Stage::StartContainer, Stage::FinishService]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_container_wiring() {
        let harness = Harness::new();
        let (deployment, _stream) = harness.deployment(web_stack());
        deployment.run(&harness.store).await.unwrap();

        let web = harness
            .runtime
            .created(&format!("web-{}", deployment.id()))
            .unwrap();
        let attachment = web.network.expect("web joins its own network");
        assert_eq!(attachment.alias, "web");
        assert_eq!(web.labels[SERVICE_LABEL], "web");
        assert_eq!(web.labels[DEPLOYMENT_LABEL], deployment.id().to_string());

        // Dependencies never get a network of their own at creation.
        let db = harness
            .runtime
            .created(&format!("db-{}", deployment.id()))
            .unwrap();
        assert!(db.network.is_none());

        let connect = harness.runtime.position(&Call::NetworkConnect {
            network: format!("web-{}", deployment.id()),
            container: format!("db-{}", deployment.id()),
        });
        let db_start = harness.runtime.position(&Call::ContainerStart {
            name: format!("db-{}", deployment.id()),
        });
        assert!(db_start.unwrap() < connect.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_run_as_shell_lines_in_order() {
        let harness = Harness::new();
        let (deployment, _stream) = harness.deployment(web_stack());
        deployment.run(&harness.store).await.unwrap();

        let web = format!("web-{}", deployment.id());
        let execs: Vec<Vec<String>> = harness
            .runtime
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ContainerExec { name, command } if name == web => Some(command),
                _ => None,
            })
            .collect();

        assert_eq!(
            execs,
            vec![
                vec!["sh".to_string(), "-c".into(), "echo post-1".into()],
                vec!["sh".to_string(), "-c".into(), "echo post-2".into()],
            ]
        );

        // The pre-start hook runs to completion in its own container before the service starts.
        let hook = format!("{}-pre-start-0", web);
        let spec = harness.runtime.created(&hook).unwrap();
        assert_eq!(
            spec.command,
            Some(vec!["sh".to_string(), "-c".into(), "echo pre".into()])
        );
        assert_eq!(spec.image, "nginx:1.27");
        assert_eq!(spec.network.unwrap().network, harness.runtime.created(&web).unwrap().network.unwrap().network);

        let position = |call: Call| harness.runtime.position(&call).unwrap();
        let hook_wait = position(Call::ContainerWait { name: hook.clone() });
        let hook_removed = position(Call::ContainerRemove { name: hook });
        let web_start = position(Call::ContainerStart { name: web });
        assert!(hook_wait < hook_removed);
        assert!(hook_removed < web_start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pre_start_hook_keeps_service_stopped() {
        let harness = Harness::new();
        harness.runtime.fail(Op::Exec, "echo pre");
        let (deployment, _stream) = harness.deployment(web_stack());

        let err = deployment.run(&harness.store).await.unwrap_err();
        let DeploymentError::ServicesFailed(failures) = err else {
            panic!("expected service failure");
        };
        assert!(matches!(
            &failures[0].error,
            ServiceError::Hook {
                phase: harbor_protocol::HookPhase::PreStart,
                source: RuntimeError::ExecFailed { exit_code: 1, .. },
                ..
            }
        ));

        let web = format!("web-{}", deployment.id());
        assert!(harness
            .runtime
            .position(&Call::ContainerRemove {
                name: format!("{}-pre-start-0", web),
            })
            .is_some());
        assert!(harness
            .runtime
            .position(&Call::ContainerStart { name: web })
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_reports_completion() {
        let harness = Harness::new();
        let (deployment, stream) = harness.deployment(vec![Service::new("solo", "solo:1")]);
        deployment.run(&harness.store).await.unwrap();
        let events = drain(stream);

        let pulls = events.iter().filter(|e| e.stage() == Stage::PullImage).count();
        // Two progress lines from the engine, then the completion.
        assert_eq!(pulls, 3);
        let completed = events
            .iter()
            .rposition(|e| e.stage() == Stage::PullImage)
            .unwrap();
        assert_eq!(
            events[completed].payload(),
            &EventPayload::PullProgress {
                status: "Pulled solo:1".into(),
                progress: None,
            }
        );
        assert_eq!(events[completed + 1].stage(), Stage::CreateContainer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_layer_is_joined_but_stops_the_run() {
        let harness = Harness::new();
        harness.runtime.fail(Op::Pull, "broken:1");
        let (deployment, stream) = harness.deployment(vec![
            Service::new("app", "app:1").with_requires(["broken", "fine"]),
            Service::new("broken", "broken:1"),
            Service::new("fine", "fine:1"),
        ]);

        let err = deployment.run(&harness.store).await.unwrap_err();
        let events = drain(stream);

        match err {
            DeploymentError::ServicesFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].service, "broken");
                assert!(matches!(
                    failures[0].error,
                    ServiceError::Runtime(RuntimeError::Refused(_))
                ));
            }
            other => panic!("unexpected error: {}", other),
        }

        // The sibling finished; the next layer never started.
        assert!(stages_of(&events, "fine").contains(&Stage::FinishService));
        assert!(stages_of(&events, "app").is_empty());
        assert_eq!(stages_of(&events, "broken"), vec![Stage::Error]);

        let saved = harness.store.get(deployment.id()).unwrap();
        assert!(!saved.outcome().is_success());
        assert_eq!(saved.resources().entries(Category::CreatedContainers).len(), 1);

        match events.last().unwrap().payload() {
            EventPayload::Finished { success, .. } => assert!(!success),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_failure_aborts_remaining_hooks() {
        let harness = Harness::new();
        harness.runtime.fail(Op::Exec, "echo post-1");
        let (deployment, _stream) = harness.deployment(web_stack());

        let err = deployment.run(&harness.store).await.unwrap_err();
        let DeploymentError::ServicesFailed(failures) = err else {
            panic!("expected service failure");
        };
        assert!(matches!(
            &failures[0].error,
            ServiceError::Hook { phase: harbor_protocol::HookPhase::PostStart, command, .. } if command == "echo post-1"
        ));

        let ran_second = harness.runtime.calls().into_iter().any(|call| {
            matches!(call, Call::ContainerExec { command, .. } if command[2] == "echo post-2")
        });
        assert!(!ran_second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_container_is_stopped() {
        let harness = Harness::new();
        let (deployment, _stream) = harness.deployment(vec![Service::new("api", "api:1")]);
        let name = format!("api-{}", deployment.id());
        let check = HealthCheckConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            retries: 1,
        };
        harness.runtime.script_inspect(
            name.clone(),
            vec![ContainerState {
                status: "running".into(),
                health: Some(HealthStatus::Starting),
                health_check: Some(check),
                ..Default::default()
            }],
        );

        let err = deployment.run(&harness.store).await.unwrap_err();
        let DeploymentError::ServicesFailed(failures) = err else {
            panic!("expected service failure");
        };
        assert!(matches!(
            failures[0].error,
            ServiceError::Health(HealthError::Timeout { .. })
        ));
        assert!(harness
            .runtime
            .position(&Call::ContainerStop { name })
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stop_is_reported_with_health_failure() {
        let harness = Harness::new();
        let (deployment, _stream) = harness.deployment(vec![Service::new("api", "api:1")]);
        let name = format!("api-{}", deployment.id());
        harness.runtime.script_inspect(
            name.clone(),
            vec![ContainerState {
                status: "exited".into(),
                exit_code: 1,
                ..Default::default()
            }],
        );
        harness.runtime.fail(Op::Stop, name);

        let err = deployment.run(&harness.store).await.unwrap_err();
        let DeploymentError::ServicesFailed(failures) = err else {
            panic!("expected service failure");
        };
        match &failures[0].error {
            ServiceError::HealthAndStop { health, stop } => {
                assert!(matches!(health, HealthError::NotRunning(_)));
                assert!(matches!(stop, RuntimeError::Refused(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_side_effect() {
        let harness = Harness::new();
        let (deployment, stream) = harness.deployment(vec![
            Service::new("a", "a:1").with_requires(["b"]),
            Service::new("b", "b:1").with_requires(["a"]),
        ]);

        let err = deployment.run(&harness.store).await.unwrap_err();
        assert!(matches!(err, DeploymentError::Graph(_)));
        assert!(harness.runtime.calls().is_empty());
        assert!(harness.subnets.allocated().unwrap().is_empty());

        let stages: Vec<Stage> = drain(stream).iter().map(Event::stage).collect();
        assert_eq!(stages, vec![Stage::Start, Stage::Error, Stage::FinishDeployment]);
        assert!(harness.store.get(deployment.id()).unwrap().resources().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_reported_but_resources_stay() {
        let harness = Harness::new();
        let (deployment, stream) = harness.deployment(vec![Service::new("solo", "solo:1")]);
        // A directory where the manifest file belongs.
        std::fs::create_dir_all(
            harness
                .store
                .dir()
                .join(format!("{}.json", deployment.id())),
        )
        .unwrap();

        let err = deployment.run(&harness.store).await.unwrap_err();
        assert!(matches!(err, DeploymentError::Store(_)));
        assert!(harness.runtime.position(&Call::ContainerStop {
            name: format!("solo-{}", deployment.id()),
        }).is_none());

        let events = drain(stream);
        let global_errors = events
            .iter()
            .filter(|e| e.is_error() && e.service().is_none())
            .count();
        assert_eq!(global_errors, 1);
    }
}
