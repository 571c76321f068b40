//! Registry tests: one instance per project, shutdown semantics.

#[cfg(test)]
mod tests {
  use std::{sync::atomic::Ordering, time::Duration};

  use pretty_assertions::assert_eq;

  use crate::{
    actor::{
      __tests__::helpers::{RegistryTestContext, project},
      message::InstanceState,
    },
    error::ErrorKind,
  };

  #[tokio::test]
  async fn test_concurrent_get_or_create_spawns_one_engine() {
    let ctx = RegistryTestContext::new();
    ctx.engine.set_launch_delay(Duration::from_millis(100));
    let model = project("model.ver");

    let (a, b, c) = tokio::join!(
      ctx.registry.get_or_create(&model),
      ctx.registry.get_or_create(&model),
      ctx.registry.get_or_create(&model),
    );
    let (a, b, c) = (a.expect("first"), b.expect("second"), c.expect("third"));

    assert_eq!(ctx.engine.launches(), 1);
    assert_eq!(a.pid(), b.pid());
    assert_eq!(b.pid(), c.pid());
    assert_eq!(a.state(), InstanceState::Ready);
  }

  #[tokio::test]
  async fn test_existing_instance_is_reused() {
    let ctx = RegistryTestContext::new();
    let model = project("model.ver");

    let first = ctx.registry.get_or_create(&model).await.expect("create");
    let second = ctx.registry.get_or_create(&model).await.expect("reuse");

    assert_eq!(ctx.engine.launches(), 1);
    assert_eq!(first.pid(), second.pid());
    let ids: Vec<_> = ctx.registry.handles().iter().map(|h| h.project_id().clone()).collect();
    assert_eq!(ids, vec![model.id.clone()]);
  }

  #[tokio::test]
  async fn test_projects_get_separate_instances() {
    let ctx = RegistryTestContext::new();

    let a = ctx.registry.get_or_create(&project("a.ver")).await.expect("a");
    let b = ctx.registry.get_or_create(&project("b.ver")).await.expect("b");

    assert_eq!(ctx.engine.launches(), 2);
    assert_ne!(a.pid(), b.pid());
    assert_eq!(ctx.registry.handles().len(), 2);
  }

  #[tokio::test]
  async fn test_shutdown_is_idempotent() {
    let ctx = RegistryTestContext::new();
    let model = project("model.ver");
    let handle = ctx.registry.get_or_create(&model).await.expect("create");

    ctx.registry.shutdown(&model.id).await;
    ctx.registry.shutdown(&model.id).await;
    ctx.registry.shutdown(&project("never-opened.ver").id).await;

    assert_eq!(ctx.engine.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), InstanceState::Shutdown);
    assert!(ctx.registry.handles().is_empty());

    // Stopping an already stopped handle is fine too
    handle.shutdown().await;
  }

  #[tokio::test]
  async fn test_get_or_create_after_shutdown_starts_fresh() {
    let ctx = RegistryTestContext::new();
    let model = project("model.ver");

    let first = ctx.registry.get_or_create(&model).await.expect("create");
    ctx.registry.shutdown(&model.id).await;
    let second = ctx.registry.get_or_create(&model).await.expect("recreate");

    assert_eq!(ctx.engine.launches(), 2);
    assert_ne!(first.pid(), second.pid());
  }

  #[tokio::test]
  async fn test_stopped_handle_is_replaced() {
    let ctx = RegistryTestContext::new();
    let model = project("model.ver");

    let first = ctx.registry.get_or_create(&model).await.expect("create");
    // Stopped behind the registry's back
    first.shutdown().await;

    let second = ctx.registry.get_or_create(&model).await.expect("replace");
    assert_eq!(ctx.engine.launches(), 2);
    assert_ne!(first.pid(), second.pid());
  }

  #[tokio::test]
  async fn test_shutdown_all_stops_every_instance() {
    let ctx = RegistryTestContext::new();
    let a = ctx.registry.get_or_create(&project("a.ver")).await.expect("a");
    let b = ctx.registry.get_or_create(&project("b.ver")).await.expect("b");

    ctx.registry.shutdown_all().await;

    assert_eq!(ctx.engine.shutdowns.load(Ordering::SeqCst), 2);
    assert_eq!(a.state(), InstanceState::Shutdown);
    assert_eq!(b.state(), InstanceState::Shutdown);
    assert!(ctx.registry.handles().is_empty());
  }

  #[tokio::test]
  async fn test_shutdown_all_with_no_instances() {
    let ctx = RegistryTestContext::new();
    ctx.registry.shutdown_all().await;
    assert!(ctx.registry.handles().is_empty());
  }

  #[tokio::test]
  async fn test_launch_failure_is_reported_and_retried() {
    let ctx = RegistryTestContext::new();
    let model = project("model.ver");

    ctx.engine.fail_launches.store(true, Ordering::SeqCst);
    let err = ctx.registry.get_or_create(&model).await.expect_err("launch should fail");
    assert_eq!(err.kind(), ErrorKind::SpawnFailure);
    assert!(ctx.registry.handles().is_empty());

    ctx.engine.fail_launches.store(false, Ordering::SeqCst);
    ctx.registry.get_or_create(&model).await.expect("second attempt");
    assert_eq!(ctx.engine.launches(), 1);
  }

  #[tokio::test]
  async fn test_cancellation_stops_actors() {
    let ctx = RegistryTestContext::new();
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    ctx.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), async {
      while handle.state() != InstanceState::Shutdown {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("actor should stop on cancel");

    assert_eq!(ctx.engine.shutdowns.load(Ordering::SeqCst), 1);
  }
}
