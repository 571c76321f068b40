//! Health supervisor tests: periodic probes and idle shutdown.

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use crate::actor::{
    __tests__::helpers::{RegistryTestContext, project},
    HealthSupervisor, SupervisorConfig,
    lifecycle::activity::KeepAlive,
    message::InstanceState,
    supervisor::IdleShutdownConfig,
  };

  fn idle_only(timeout: Duration, activity: Arc<KeepAlive>) -> SupervisorConfig {
    SupervisorConfig {
      probe_interval: None,
      idle_shutdown: Some(IdleShutdownConfig { timeout, activity }),
    }
  }

  #[tokio::test]
  async fn test_idle_server_cancels_itself() {
    let ctx = RegistryTestContext::new();
    let activity = Arc::new(KeepAlive::new());
    let supervisor = HealthSupervisor::new(
      Arc::clone(&ctx.registry),
      idle_only(Duration::from_millis(100), activity),
    );

    let cancel = ctx.cancel.child_token();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(2), cancel.cancelled())
      .await
      .expect("idle shutdown should fire");
    task.await.expect("supervisor task");
  }

  #[tokio::test]
  async fn test_connected_client_prevents_idle_shutdown() {
    let ctx = RegistryTestContext::new();
    let activity = Arc::new(KeepAlive::new());
    activity.client_connected();
    let supervisor = HealthSupervisor::new(
      Arc::clone(&ctx.registry),
      idle_only(Duration::from_millis(50), Arc::clone(&activity)),
    );

    let cancel = ctx.cancel.child_token();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!cancel.is_cancelled());

    cancel.cancel();
    task.await.expect("supervisor task");
  }

  #[tokio::test]
  async fn test_periodic_probe_marks_failing_instance_unhealthy() {
    let ctx = RegistryTestContext::new();
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");
    ctx.engine.fail_pings.store(true, std::sync::atomic::Ordering::SeqCst);

    let supervisor = HealthSupervisor::new(
      Arc::clone(&ctx.registry),
      SupervisorConfig {
        probe_interval: Some(Duration::from_millis(50)),
        idle_shutdown: None,
      },
    );
    let cancel = ctx.cancel.child_token();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while handle.state() != InstanceState::Unhealthy {
      assert!(tokio::time::Instant::now() < deadline, "probe never ran");
      tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    task.await.expect("supervisor task");
  }
}
