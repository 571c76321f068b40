use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
  handle::InstanceHandle,
  lifecycle::activity::KeepAlive,
  message::{HealthReport, InstancePayload, InstanceResponse, InstanceState},
  registry::InstanceRegistry,
};
use crate::domain::config::Config;

/// Configuration for idle shutdown behavior (Project Server mode only).
///
/// A server with no connected clients and no traffic for `timeout` stops
/// itself, which releases the engine and its licence.
#[derive(Debug)]
pub struct IdleShutdownConfig {
  pub timeout: Duration,
  pub activity: Arc<KeepAlive>,
}

#[derive(Debug)]
pub struct SupervisorConfig {
  /// Time between health probe rounds; `None` disables probing
  pub probe_interval: Option<Duration>,
  pub idle_shutdown: Option<IdleShutdownConfig>,
}

impl SupervisorConfig {
  pub fn from_config(config: &Config, activity: Arc<KeepAlive>) -> Self {
    let probe_secs = config.health.probe_interval_secs;
    let idle_secs = config.server.idle_timeout_secs;
    Self {
      probe_interval: (probe_secs > 0).then(|| Duration::from_secs(probe_secs)),
      idle_shutdown: (idle_secs > 0).then(|| IdleShutdownConfig {
        timeout: Duration::from_secs(idle_secs),
        activity,
      }),
    }
  }
}

/// Background health checks for every instance in the registry.
///
/// Handles:
/// - Periodic liveness probes (failures mark the instance unhealthy)
/// - Idle shutdown check (Project Server mode only)
pub struct HealthSupervisor {
  registry: Arc<InstanceRegistry>,
  config: SupervisorConfig,
}

impl HealthSupervisor {
  pub fn new(registry: Arc<InstanceRegistry>, config: SupervisorConfig) -> Self {
    Self { registry, config }
  }

  /// Run until cancelled. Cancels `cancel` itself on idle shutdown.
  pub async fn run(self, cancel: CancellationToken) {
    let mut probe_timer = self.config.probe_interval.map(tokio::time::interval);
    let idle_check = self
      .config
      .idle_shutdown
      .as_ref()
      .map(|idle| (idle.timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(30)));
    let mut idle_timer = idle_check.map(tokio::time::interval);

    // Skip the immediate ticks
    if let Some(timer) = probe_timer.as_mut() {
      timer.tick().await;
    }
    if let Some(timer) = idle_timer.as_mut() {
      timer.tick().await;
    }

    info!(
      probe_interval_secs = ?self.config.probe_interval.map(|d| d.as_secs()),
      idle_shutdown = self.config.idle_shutdown.is_some(),
      "Health supervisor started"
    );

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("Health supervisor shutting down (cancelled)");
          break;
        }

        _ = tick(probe_timer.as_mut()) => {
          self.probe_all().await;
        }

        _ = tick(idle_timer.as_mut()) => {
          if self.check_idle_shutdown(&cancel) {
            break;
          }
        }
      }
    }

    info!("Health supervisor stopped");
  }

  async fn probe_all(&self) {
    let handles = self.registry.handles();
    if handles.is_empty() {
      return;
    }

    debug!(count = handles.len(), "Probing instances");
    for handle in &handles {
      // A busy instance answered recently enough; don't queue behind it
      if matches!(handle.state(), InstanceState::Busy | InstanceState::Starting) {
        continue;
      }
      let report = check_health(handle).await;
      if !report.alive {
        warn!(project_id = %handle.project_id(), state = ?report.state, "Instance failed health probe");
      }
    }
  }

  fn check_idle_shutdown(&self, cancel: &CancellationToken) -> bool {
    let Some(idle) = &self.config.idle_shutdown else {
      return false;
    };

    if idle.activity.clients() > 0 || !idle.activity.is_idle(idle.timeout) {
      return false;
    }

    info!(
      idle_secs = idle.activity.idle_for().as_secs(),
      "No clients and no activity, shutting down"
    );
    cancel.cancel();
    true
  }
}

/// Probe one instance through its command queue.
///
/// A failed or timed-out probe leaves the instance `unhealthy`; the next
/// command then restarts it.
pub async fn check_health(handle: &InstanceHandle) -> HealthReport {
  match handle.request(format!("probe-{}", handle.project_id()), InstancePayload::Probe).await {
    Ok(InstanceResponse::Health(report)) => report,
    Ok(other) => {
      warn!(project_id = %handle.project_id(), response = ?other, "Unexpected probe response");
      HealthReport {
        alive: false,
        latency_ms: None,
        state: handle.state(),
      }
    }
    Err(_) => HealthReport {
      alive: false,
      latency_ms: None,
      state: InstanceState::Shutdown,
    },
  }
}

async fn tick(timer: Option<&mut tokio::time::Interval>) {
  match timer {
    Some(timer) => {
      timer.tick().await;
    }
    None => std::future::pending().await,
  }
}
