pub mod docker;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod traits;

pub use docker::DockerRuntime;
#[cfg(any(test, feature = "test-utils"))]
pub use fake::FakeRuntime;
pub use traits::{
    ContainerRef, ContainerSpec, ContainerState, HealthCheckConfig, HealthStatus,
    NetworkAttachment, PullProgress, RuntimeClient,
};
