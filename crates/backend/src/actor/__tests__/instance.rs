//! Instance actor tests: command serialization, health transitions,
//! restarts and the capability cache.

#[cfg(test)]
mod tests {
  use std::time::{Duration, Instant};

  use futures::future::join_all;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  use crate::{
    actor::{
      __tests__::helpers::{FakeOutcome, RegistryTestContext, fake_network, project, test_settings},
      message::InstanceState,
      supervisor::check_health,
    },
    channel::{Command, CommandChannel},
    domain::config::BrokerSettings,
    engine::{EngineError, bootstrap},
    error::ErrorKind,
    ipc::{RequestKind, ResponseKind},
  };

  // ==========================================================================
  // Serialization
  // ==========================================================================

  #[tokio::test]
  async fn test_concurrent_commands_run_one_at_a_time_in_order() {
    let ctx = RegistryTestContext::new();
    ctx.engine.set_command_delay(Duration::from_millis(30));
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let submissions = (0..5).map(|i| {
      let handle = handle.clone();
      async move { handle.submit(Command::query(format!("q{i}"))).await }
    });
    let responses = join_all(submissions).await;

    for response in &responses {
      assert!(response.as_ref().expect("submit").is_success());
    }

    let calls = ctx.engine.calls();
    let codes: Vec<_> = calls.iter().filter_map(|c| c.code.clone()).collect();
    assert_eq!(codes, vec!["q0", "q1", "q2", "q3", "q4"]);

    for pair in calls.windows(2) {
      assert!(pair[0].end <= pair[1].start, "commands overlapped: {pair:?}");
    }
  }

  #[tokio::test]
  async fn test_query_result_and_status() {
    let ctx = RegistryTestContext::new();
    ctx.engine.script([FakeOutcome::Reply(json!({"nodes": 42}))]);
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let response = handle
      .submit(Command::query("result = {'nodes': Visum.Net.Nodes.Count}").with_description("count nodes"))
      .await
      .expect("submit");

    assert_eq!(response.kind, ResponseKind::QueryResult);
    assert_eq!(response.result, Some(json!({"nodes": 42})));
    assert!(response.execution_time_ms.is_some());

    let status = handle.status();
    assert_eq!(status.state, InstanceState::Ready);
    assert_eq!(status.commands_executed, 1);
    assert_eq!(status.network, fake_network());
    assert!(status.last_used_at >= status.started_at);
  }

  #[tokio::test]
  async fn test_status_request_does_not_touch_engine() {
    let ctx = RegistryTestContext::new();
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let response = handle.submit(Command::new(RequestKind::Status)).await.expect("submit");

    assert_eq!(response.kind, ResponseKind::Status);
    let result = response.result.expect("status result");
    assert_eq!(result["state"], json!("ready"));
    assert!(result.get("uptimeSecs").is_some());
    assert!(ctx.engine.calls().is_empty());
  }

  #[tokio::test]
  async fn test_mode_mappings_runs_canned_script() {
    let ctx = RegistryTestContext::new();
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let response = handle
      .submit(Command::new(RequestKind::ModeMappings))
      .await
      .expect("submit");

    assert_eq!(response.kind, ResponseKind::ModeMappings);
    assert_eq!(ctx.engine.queries(), vec![bootstrap::MODE_MAPPINGS.to_string()]);
  }

  #[tokio::test]
  async fn test_project_info_merges_status_and_engine() {
    let ctx = RegistryTestContext::new();
    let model = project("model.ver");
    let handle = ctx.registry.get_or_create(&model).await.expect("create");

    let response = handle
      .submit(Command::new(RequestKind::ProjectInfo))
      .await
      .expect("submit");

    let result = response.result.expect("info");
    assert_eq!(result["projectId"], json!(model.id.as_str()));
    assert_eq!(result["engine"]["version"], json!("2024.01-fake"));
  }

  // ==========================================================================
  // Failures and health
  // ==========================================================================

  #[tokio::test]
  async fn test_engine_reported_error_keeps_instance_ready() {
    let ctx = RegistryTestContext::new();
    ctx.engine.script([FakeOutcome::Fail(EngineError::EngineReported {
      message: "no attribute TSYSTYPE".to_string(),
      payload: json!({"success": false, "error": "no attribute TSYSTYPE"}),
    })]);
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let response = handle.submit(Command::query("bad")).await.expect("submit");

    assert!(!response.is_success());
    assert_eq!(response.error_kind, Some(ErrorKind::EngineReportedError));
    assert_eq!(response.result, Some(json!({"success": false, "error": "no attribute TSYSTYPE"})));
    assert_eq!(handle.state(), InstanceState::Ready);
    assert_eq!(handle.status().consecutive_failures, 0);
  }

  #[tokio::test]
  async fn test_single_timeout_does_not_mark_unhealthy() {
    let ctx = RegistryTestContext::new();
    ctx.engine.script([FakeOutcome::Hang]);
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let response = handle
      .submit(Command::query("slow").with_timeout(Duration::from_millis(20)))
      .await
      .expect("submit");

    assert_eq!(response.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(handle.state(), InstanceState::Ready);
    assert_eq!(handle.status().consecutive_failures, 1);

    // The next command succeeds on the same engine and clears the counter
    let response = handle.submit(Command::query("fast")).await.expect("submit");
    assert!(response.is_success());
    assert_eq!(handle.status().consecutive_failures, 0);
    assert_eq!(ctx.engine.launches(), 1);
  }

  #[tokio::test]
  async fn test_queued_command_times_out_while_waiting() {
    let ctx = RegistryTestContext::new();
    ctx.engine.script([FakeOutcome::Hang]);
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let slow = tokio::spawn({
      let handle = handle.clone();
      async move {
        handle
          .submit(Command::query("slow").with_timeout(Duration::from_millis(1500)))
          .await
      }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let queued = handle
      .submit(Command::query("queued").with_timeout(Duration::from_millis(100)))
      .await
      .expect("submit");
    let elapsed = started.elapsed();

    assert_eq!(queued.error_kind, Some(ErrorKind::Timeout));
    assert!(elapsed < Duration::from_millis(400), "queued command waited {elapsed:?}");

    let slow = slow.await.expect("join").expect("submit");
    assert_eq!(slow.error_kind, Some(ErrorKind::Timeout));

    // The expired command is skipped, not run late, and does not count as a failure
    let after = handle.submit(Command::query("after")).await.expect("submit");
    assert!(after.is_success());
    assert_eq!(ctx.engine.queries(), vec!["slow", "after"]);
    assert_eq!(handle.status().commands_executed, 1);
  }

  #[tokio::test]
  async fn test_cancel_interrupts_running_command() {
    let ctx = RegistryTestContext::new();
    ctx.engine.script([FakeOutcome::Hang]);
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let running = tokio::spawn({
      let handle = handle.clone();
      async move {
        handle
          .submit(Command::query("slow").with_timeout(Duration::from_secs(30)))
          .await
      }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    ctx.cancel.cancel();
    let response = tokio::time::timeout(Duration::from_secs(2), running)
      .await
      .expect("command should be interrupted")
      .expect("join")
      .expect("submit");

    assert_eq!(response.error_kind, Some(ErrorKind::InstanceUnhealthy));
    assert!(started.elapsed() < Duration::from_secs(1));
  }

  #[tokio::test]
  async fn test_repeated_timeouts_mark_unhealthy_then_restart() {
    let ctx = RegistryTestContext::new();
    ctx.engine.script([FakeOutcome::Hang, FakeOutcome::Hang]);
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");
    let first_pid = handle.pid();

    for _ in 0..2 {
      let response = handle
        .submit(Command::query("slow").with_timeout(Duration::from_millis(20)))
        .await
        .expect("submit");
      assert_eq!(response.error_kind, Some(ErrorKind::Timeout));
    }
    assert_eq!(handle.state(), InstanceState::Unhealthy);

    let response = handle.submit(Command::query("after restart")).await.expect("submit");
    assert!(response.is_success());
    assert_eq!(ctx.engine.launches(), 2);
    assert_ne!(handle.pid(), first_pid);

    let status = handle.status();
    assert_eq!(status.state, InstanceState::Ready);
    assert_eq!(status.restarts, 1);
  }

  #[tokio::test]
  async fn test_process_exit_restarts_on_next_command() {
    let ctx = RegistryTestContext::new();
    ctx.engine.script([FakeOutcome::Exit]);
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let response = handle.submit(Command::query("boom")).await.expect("submit");
    assert_eq!(response.error_kind, Some(ErrorKind::ProcessExited));
    assert_eq!(handle.state(), InstanceState::Unhealthy);

    let response = handle.submit(Command::query("again")).await.expect("submit");
    assert!(response.is_success());
    assert_eq!(ctx.engine.launches(), 2);
  }

  #[tokio::test]
  async fn test_unhealthy_without_restart_budget() {
    let ctx = RegistryTestContext::with_settings(BrokerSettings {
      max_restarts: 0,
      ..test_settings()
    });
    ctx.engine.script([FakeOutcome::Exit]);
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let response = handle.submit(Command::query("boom")).await.expect("submit");
    assert_eq!(response.error_kind, Some(ErrorKind::ProcessExited));

    let response = handle.submit(Command::query("again")).await.expect("submit");
    assert_eq!(response.error_kind, Some(ErrorKind::InstanceUnhealthy));
    assert!(response.error.expect("message").contains("engine process exited"));
    assert_eq!(ctx.engine.launches(), 1);
  }

  #[tokio::test]
  async fn test_restart_budget_is_bounded() {
    let ctx = RegistryTestContext::with_settings(BrokerSettings {
      max_restarts: 1,
      ..test_settings()
    });
    ctx.engine.script([FakeOutcome::Exit, FakeOutcome::Exit]);
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    // exit, restart + exit, then no budget left
    let kinds: Vec<_> = [
      handle.submit(Command::query("1")).await,
      handle.submit(Command::query("2")).await,
      handle.submit(Command::query("3")).await,
    ]
    .into_iter()
    .map(|r| r.expect("submit").error_kind)
    .collect();

    assert_eq!(
      kinds,
      vec![
        Some(ErrorKind::ProcessExited),
        Some(ErrorKind::ProcessExited),
        Some(ErrorKind::InstanceUnhealthy)
      ]
    );
    assert_eq!(ctx.engine.launches(), 2);
  }

  #[tokio::test]
  async fn test_health_probe_reports_latency() {
    let ctx = RegistryTestContext::new();
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");

    let report = check_health(&handle).await;
    assert!(report.alive);
    assert!(report.latency_ms.is_some());
    assert_eq!(report.state, InstanceState::Ready);

    let pong = handle.submit(Command::new(RequestKind::Ping)).await.expect("ping");
    assert_eq!(pong.kind, ResponseKind::Pong);
    assert!(pong.is_success());
  }

  #[tokio::test]
  async fn test_failed_probe_marks_unhealthy() {
    let ctx = RegistryTestContext::new();
    let handle = ctx.registry.get_or_create(&project("model.ver")).await.expect("create");
    ctx.engine.fail_pings.store(true, std::sync::atomic::Ordering::SeqCst);

    let report = check_health(&handle).await;

    assert!(!report.alive);
    assert_eq!(report.state, InstanceState::Unhealthy);
    assert_eq!(handle.state(), InstanceState::Unhealthy);

    let pong = handle.submit(Command::new(RequestKind::Ping)).await.expect("ping");
    assert_eq!(pong.error_kind, Some(ErrorKind::InstanceUnhealthy));
  }

  // ==========================================================================
  // Capabilities
  // ==========================================================================

  #[tokio::test]
  async fn test_capabilities_are_cached_per_engine_version() {
    let ctx = RegistryTestContext::new();
    ctx.engine.script([FakeOutcome::Reply(json!({"tsystemTypeAttribute": "TYPE"}))]);
    let a = ctx.registry.get_or_create(&project("a.ver")).await.expect("a");
    let b = ctx.registry.get_or_create(&project("b.ver")).await.expect("b");

    let first = a.submit(Command::new(RequestKind::Capabilities)).await.expect("first");
    let again = a.submit(Command::new(RequestKind::Capabilities)).await.expect("again");
    let other = b.submit(Command::new(RequestKind::Capabilities)).await.expect("other");

    let expected = Some(json!({"tsystemTypeAttribute": "TYPE"}));
    assert_eq!(first.result, expected);
    assert_eq!(again.result, expected);
    assert_eq!(other.result, expected);
    assert_eq!(ctx.engine.queries(), vec![bootstrap::CAPABILITY_PROBE.to_string()]);
  }
}
