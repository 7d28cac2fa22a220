//! Health-check wait protocol.
//!
//! After a container is started, block until the engine confirms it is up. The wait budget
//! comes from the container's own health check when it has one.

use log::debug;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::HealthError;
use crate::runtime::{ContainerRef, ContainerState, HealthCheckConfig, HealthStatus, RuntimeClient};

/// Budget for containers without a health check.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(10);

pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on any wait, whatever the image declares.
pub const MAX_BUDGET: Duration = Duration::from_secs(60 * 60);

/// `retries × (interval + timeout)`, summed in fractional seconds and capped at [`MAX_BUDGET`].
pub fn budget(check: Option<&HealthCheckConfig>) -> Duration {
    match check {
        None => DEFAULT_BUDGET,
        Some(check) => {
            let attempt = check.interval.as_secs_f64() + check.timeout.as_secs_f64();
            Duration::try_from_secs_f64(attempt * f64::from(check.retries))
                .map_or(MAX_BUDGET, |budget| budget.min(MAX_BUDGET))
        }
    }
}

/// `Some` once the state settles the wait one way or the other.
fn verdict(container: &ContainerRef, state: &ContainerState, checked: bool) -> Option<Result<(), HealthError>> {
    let not_running = || Some(Err(HealthError::NotRunning(container.name.clone())));

    if state.restart_count > 0 || state.exit_code != 0 {
        return not_running();
    }

    if !checked {
        return if state.is_running() {
            Some(Ok(()))
        } else {
            not_running()
        };
    }

    match state.health {
        Some(HealthStatus::Healthy) => Some(Ok(())),
        Some(HealthStatus::Unhealthy) => not_running(),
        Some(HealthStatus::Starting) | None => None,
    }
}

/// Polls `container` every [`POLL_INTERVAL`] until it is running (and healthy, if it has a
/// health check) or the budget runs out.
pub async fn wait_until_ready(
    runtime: &dyn RuntimeClient,
    container: &ContainerRef,
) -> Result<(), HealthError> {
    let configured = runtime.container_inspect(&container.id).await?.health_check;
    let checked = configured.is_some();
    let budget = budget(configured.as_ref());
    let deadline = Instant::now() + budget;

    debug!(
        "Health: waiting up to {:?} for {} (health check: {})",
        budget, container.name, checked
    );

    loop {
        sleep(POLL_INTERVAL).await;
        if Instant::now() > deadline {
            return Err(HealthError::Timeout {
                container: container.name.clone(),
                budget,
            });
        }

        let state = runtime.container_inspect(&container.id).await?;
        if let Some(outcome) = verdict(container, &state, checked) {
            return outcome;
        }
    }
}
