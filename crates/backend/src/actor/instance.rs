//! InstanceActor - owns the one engine process of a project
//!
//! The actor is the only thing that ever talks to its engine session. All
//! callers go through the actor's mailbox, so commands run strictly one at a
//! time in the order they were queued; the mailbox is the lock.
//!
//! # State machine
//!
//! ```text
//!  spawn() --launch--> ready --command--> busy --reply--> ready
//!  ready|busy --probe fail / exit / repeated failures--> unhealthy
//!  unhealthy --next command (bounded restarts)--> starting --> ready
//!  any --Shutdown--> shutdown
//! ```
//!
//! A single command timeout only counts towards `failure_threshold`; the
//! engine keeps running so a slow query does not cost a full reload.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
  handle::InstanceHandle,
  message::{HealthReport, InstanceMessage, InstancePayload, InstanceResponse, InstanceState, InstanceStatus},
};
use crate::{
  domain::{
    config::BrokerSettings,
    project::{NetworkStats, ProjectMetadata},
  },
  engine::{EngineCommand, EngineError, EngineLauncher, EngineReply, EngineSession, bootstrap},
  error::ErrorKind,
};

/// Capability probe results keyed by engine version, shared by all instances
pub type CapabilityCache = moka::future::Cache<String, Value>;

pub fn capability_cache() -> CapabilityCache {
  moka::future::Cache::builder().max_capacity(64).build()
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
  #[error(transparent)]
  Engine(#[from] EngineError),
  #[error("instance is unhealthy after {restarts} restart attempt(s): {last_error}")]
  Unhealthy { restarts: u32, last_error: String },
  #[error("instance is shutting down")]
  ShuttingDown,
}

impl InstanceError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      InstanceError::Engine(e) => e.kind(),
      InstanceError::Unhealthy { .. } | InstanceError::ShuttingDown => ErrorKind::InstanceUnhealthy,
    }
  }
}

impl From<InstanceError> for InstanceResponse {
  fn from(err: InstanceError) -> Self {
    let payload = match &err {
      InstanceError::Engine(e) => e.payload(),
      _ => None,
    };
    InstanceResponse::Error {
      kind: err.kind(),
      message: err.to_string(),
      payload,
    }
  }
}

// ============================================================================
// Actor
// ============================================================================

/// Time a command may still take, measured from when it was queued
#[derive(Debug, Clone, Copy)]
struct Budget {
  timeout: Duration,
  deadline: Instant,
}

impl Budget {
  fn remaining(&self) -> Duration {
    self.deadline.saturating_duration_since(Instant::now())
  }
}

pub struct InstanceActorConfig {
  pub project: ProjectMetadata,
  pub settings: Arc<BrokerSettings>,
  pub launcher: Arc<dyn EngineLauncher>,
  pub capabilities: CapabilityCache,
}

pub struct InstanceActor {
  config: InstanceActorConfig,
  engine: Option<Box<dyn EngineSession>>,
  rx: mpsc::Receiver<InstanceMessage>,
  status: watch::Sender<InstanceStatus>,
  cancel: CancellationToken,
  /// Restarts since the last successful command
  restart_attempts: u32,
  last_error: Option<String>,
}

impl InstanceActor {
  /// Launch the engine and start the actor.
  ///
  /// Resolves once the engine reported ready, so the returned handle always
  /// points at a loaded project.
  pub async fn spawn(config: InstanceActorConfig, cancel: CancellationToken) -> Result<InstanceHandle, InstanceError> {
    let project = &config.project;
    info!(project_id = %project.id, path = %project.path.display(), "Starting engine");

    let started = Instant::now();
    let launched = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(InstanceError::ShuttingDown),
      launched = config.launcher.launch(project, config.settings.startup_timeout) => launched?,
    };

    info!(
      project_id = %project.id,
      pid = ?launched.session.pid(),
      version = ?launched.version,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "Engine ready"
    );

    let now = Utc::now();
    let status = InstanceStatus {
      project_id: project.id.clone(),
      project_name: project.name.clone(),
      project_path: project.path.display().to_string(),
      state: InstanceState::Ready,
      pid: launched.session.pid(),
      started_at: now,
      last_used_at: now,
      network: launched.network.unwrap_or_default(),
      engine_version: launched.version,
      restarts: 0,
      consecutive_failures: 0,
      commands_executed: 0,
    };

    let (tx, rx) = mpsc::channel(256);
    let (status_tx, status_rx) = watch::channel(status);
    let handle = InstanceHandle::new(project.id.clone(), tx, status_rx, config.settings.command_timeout);

    let actor = Self {
      config,
      engine: Some(launched.session),
      rx,
      status: status_tx,
      cancel,
      restart_attempts: 0,
      last_error: None,
    };
    tokio::spawn(actor.run());

    Ok(handle)
  }

  async fn run(mut self) {
    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!(project_id = %self.config.project.id, "InstanceActor shutting down (cancelled)");
          break;
        }

        msg = self.rx.recv() => {
          match msg {
            Some(InstanceMessage { id, submitted_at, reply, payload }) => {
              // A cancelled launch or command is dropped mid-flight; the
              // engine is stopped below either way
              let cancel = self.cancel.clone();
              let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = self.handle_message(&id, submitted_at, payload) => Some(outcome),
              };

              let Some((response, keep_running)) = outcome else {
                info!(project_id = %self.config.project.id, request_id = %id, "InstanceActor cancelled mid-command");
                let _ = reply.send(InstanceError::ShuttingDown.into());
                break;
              };
              if reply.send(response).is_err() {
                debug!(project_id = %self.config.project.id, request_id = %id, "Caller went away before the reply");
              }
              if !keep_running {
                break;
              }
            }
            None => {
              info!(project_id = %self.config.project.id, "InstanceActor shutting down (channel closed)");
              break;
            }
          }
        }
      }
    }

    self.stop_engine().await;
    self.set_state(InstanceState::Shutdown);

    // Anything still queued gets a definite answer instead of a dropped channel
    self.rx.close();
    while let Ok(msg) = self.rx.try_recv() {
      let response = match msg.payload {
        InstancePayload::Shutdown => InstanceResponse::Stopped,
        _ => InstanceError::ShuttingDown.into(),
      };
      let _ = msg.reply.send(response);
    }

    info!(project_id = %self.config.project.id, "InstanceActor stopped");
  }

  /// Returns the reply and whether the actor keeps running
  async fn handle_message(
    &mut self,
    id: &str,
    submitted_at: Instant,
    payload: InstancePayload,
  ) -> (InstanceResponse, bool) {
    debug!(project_id = %self.config.project.id, request_id = %id, payload = ?payload, "Handling message");

    match payload {
      InstancePayload::Execute { command, timeout } => {
        let budget = self.budget(submitted_at, timeout);
        (self.execute(id, command, budget).await, true)
      }
      InstancePayload::ProjectInfo { timeout } => {
        let budget = self.budget(submitted_at, timeout);
        (self.project_info(id, budget).await, true)
      }
      InstancePayload::Capabilities { timeout } => {
        let budget = self.budget(submitted_at, timeout);
        (self.capabilities(id, budget).await, true)
      }
      InstancePayload::Probe => (InstanceResponse::Health(self.probe().await), true),
      InstancePayload::Shutdown => {
        self.stop_engine().await;
        self.set_state(InstanceState::Shutdown);
        (InstanceResponse::Stopped, false)
      }
    }
  }

  fn budget(&self, submitted_at: Instant, timeout: Option<Duration>) -> Budget {
    let timeout = timeout.unwrap_or(self.config.settings.command_timeout);
    Budget {
      timeout,
      deadline: submitted_at + timeout,
    }
  }

  // ==========================================================================
  // Commands
  // ==========================================================================

  async fn execute(&mut self, id: &str, command: EngineCommand, budget: Budget) -> InstanceResponse {
    let started = Instant::now();
    match self.run_command(id, command, budget).await {
      Ok(reply) => InstanceResponse::Done {
        result: reply.result,
        output: reply.output,
        elapsed: started.elapsed(),
      },
      Err(e) => e.into(),
    }
  }

  async fn project_info(&mut self, id: &str, budget: Budget) -> InstanceResponse {
    let started = Instant::now();
    let engine_info = match self.run_command(id, EngineCommand::project_info(), budget).await {
      Ok(reply) => reply.result,
      Err(e) => return e.into(),
    };

    let mut info = serde_json::to_value(&*self.status.borrow()).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut info {
      map.insert("engine".to_string(), engine_info);
    }

    InstanceResponse::Done {
      result: info,
      output: None,
      elapsed: started.elapsed(),
    }
  }

  async fn capabilities(&mut self, id: &str, budget: Budget) -> InstanceResponse {
    let started = Instant::now();

    if let Some(version) = self.engine_version()
      && let Some(cached) = self.config.capabilities.get(&version).await
    {
      debug!(project_id = %self.config.project.id, %version, "Capability cache hit");
      return InstanceResponse::Done {
        result: cached,
        output: None,
        elapsed: started.elapsed(),
      };
    }

    let command = EngineCommand::query(bootstrap::CAPABILITY_PROBE, Some("capability probe".to_string()));
    match self.run_command(id, command, budget).await {
      Ok(reply) => {
        // Re-read: a restart inside run_command may have changed the engine
        match self.engine_version() {
          Some(version) => {
            self.config.capabilities.insert(version, reply.result.clone()).await;
          }
          None => debug!(project_id = %self.config.project.id, "Engine version unknown, not caching capabilities"),
        }
        InstanceResponse::Done {
          result: reply.result,
          output: reply.output,
          elapsed: started.elapsed(),
        }
      }
      Err(e) => e.into(),
    }
  }

  async fn run_command(
    &mut self,
    id: &str,
    command: EngineCommand,
    budget: Budget,
  ) -> Result<EngineReply, InstanceError> {
    // Expired while queued: the caller has already been told, skip the work
    if budget.remaining().is_zero() {
      debug!(project_id = %self.config.project.id, request_id = %id, "Command expired in queue");
      return Err(EngineError::timeout(budget.timeout).into());
    }

    self.ensure_engine().await?;
    let Some(engine) = self.engine.as_ref() else {
      return Err(InstanceError::ShuttingDown);
    };

    let timeout = budget.remaining();
    if timeout.is_zero() {
      return Err(EngineError::timeout(budget.timeout).into());
    }
    debug!(
      project_id = %self.config.project.id,
      request_id = %id,
      op = ?command.op,
      description = ?command.description,
      timeout_ms = timeout.as_millis() as u64,
      "Executing command"
    );

    self.set_state(InstanceState::Busy);
    let result = engine.execute(command, timeout).await;
    self.record(&result);
    Ok(result?)
  }

  /// Fold a command outcome into the health counters
  fn record(&mut self, result: &Result<EngineReply, EngineError>) {
    let threshold = self.config.settings.failure_threshold;

    match result {
      Ok(reply) => {
        self.restart_attempts = 0;
        self.status.send_modify(|s| {
          s.state = InstanceState::Ready;
          s.consecutive_failures = 0;
          s.last_used_at = Utc::now();
          s.commands_executed += 1;
          if let Some(network) = reply.network {
            s.network = network;
          }
        });
      }
      // The engine is fine, the user code was not
      Err(EngineError::EngineReported { .. }) => {
        self.restart_attempts = 0;
        self.status.send_modify(|s| {
          s.state = InstanceState::Ready;
          s.consecutive_failures = 0;
          s.last_used_at = Utc::now();
          s.commands_executed += 1;
        });
      }
      Err(e @ (EngineError::ProcessExited { .. } | EngineError::SpawnFailure { .. })) => {
        warn!(project_id = %self.config.project.id, error = %e, "Engine process lost");
        self.last_error = Some(e.to_string());
        self.status.send_modify(|s| {
          s.state = InstanceState::Unhealthy;
          s.last_used_at = Utc::now();
        });
      }
      Err(e) => {
        self.last_error = Some(e.to_string());
        self.status.send_modify(|s| {
          s.consecutive_failures += 1;
          s.last_used_at = Utc::now();
          s.state = if s.consecutive_failures >= threshold {
            InstanceState::Unhealthy
          } else {
            InstanceState::Ready
          };
        });
        let failures = self.status.borrow().consecutive_failures;
        warn!(
          project_id = %self.config.project.id,
          error = %e,
          consecutive_failures = failures,
          threshold,
          "Command failed"
        );
      }
    }
  }

  /// Make sure a healthy engine is running, restarting it within budget
  async fn ensure_engine(&mut self) -> Result<(), InstanceError> {
    let alive = self.engine.as_ref().is_some_and(|e| e.is_alive());
    if alive && self.state() != InstanceState::Unhealthy {
      return Ok(());
    }
    if !alive && self.engine.is_some() {
      self.last_error.get_or_insert_with(|| "engine process exited".to_string());
    }

    let max_restarts = self.config.settings.max_restarts;
    if self.restart_attempts >= max_restarts {
      self.set_state(InstanceState::Unhealthy);
      return Err(InstanceError::Unhealthy {
        restarts: self.restart_attempts,
        last_error: self
          .last_error
          .clone()
          .unwrap_or_else(|| "engine is not running".to_string()),
      });
    }

    self.restart_attempts += 1;
    warn!(
      project_id = %self.config.project.id,
      attempt = self.restart_attempts,
      max_restarts,
      last_error = ?self.last_error,
      "Restarting engine"
    );

    if let Some(old) = self.engine.take() {
      old.shutdown(self.config.settings.kill_grace).await;
    }
    self.set_state(InstanceState::Starting);

    match self
      .config
      .launcher
      .launch(&self.config.project, self.config.settings.startup_timeout)
      .await
    {
      Ok(launched) => {
        info!(project_id = %self.config.project.id, pid = ?launched.session.pid(), "Engine restarted");
        let pid = launched.session.pid();
        self.engine = Some(launched.session);
        self.status.send_modify(|s| {
          s.state = InstanceState::Ready;
          s.pid = pid;
          s.started_at = Utc::now();
          s.restarts += 1;
          s.consecutive_failures = 0;
          if launched.version.is_some() {
            s.engine_version = launched.version;
          }
          if let Some(network) = launched.network {
            s.network = network;
          }
        });
        Ok(())
      }
      Err(e) => {
        warn!(project_id = %self.config.project.id, error = %e, "Engine restart failed");
        self.last_error = Some(e.to_string());
        self.set_state(InstanceState::Unhealthy);
        Err(e.into())
      }
    }
  }

  // ==========================================================================
  // Health
  // ==========================================================================

  async fn probe(&mut self) -> HealthReport {
    let Some(engine) = self.engine.as_ref() else {
      return self.health(false, None);
    };
    if !engine.is_alive() {
      self.last_error = Some("engine process exited".to_string());
      self.set_state(InstanceState::Unhealthy);
      return self.health(false, None);
    }

    let started = Instant::now();
    match engine.execute(EngineCommand::ping(), self.config.settings.probe_timeout).await {
      Ok(reply) => {
        let latency_ms = started.elapsed().as_millis() as u64;
        let network = reply
          .network
          .or_else(|| reply.result.get("network").and_then(NetworkStats::from_value));
        self.status.send_modify(|s| {
          s.state = InstanceState::Ready;
          s.consecutive_failures = 0;
          if let Some(network) = network {
            s.network = network;
          }
        });
        debug!(project_id = %self.config.project.id, latency_ms, "Health probe ok");
        self.health(true, Some(latency_ms))
      }
      Err(e) => {
        warn!(project_id = %self.config.project.id, error = %e, "Health probe failed");
        self.last_error = Some(e.to_string());
        self.set_state(InstanceState::Unhealthy);
        self.health(false, None)
      }
    }
  }

  fn health(&self, alive: bool, latency_ms: Option<u64>) -> HealthReport {
    HealthReport {
      alive,
      latency_ms,
      state: self.state(),
    }
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  async fn stop_engine(&mut self) {
    if let Some(engine) = self.engine.take() {
      info!(project_id = %self.config.project.id, pid = ?engine.pid(), "Stopping engine");
      engine.shutdown(self.config.settings.shutdown_grace).await;
    }
  }

  fn state(&self) -> InstanceState {
    self.status.borrow().state
  }

  fn engine_version(&self) -> Option<String> {
    self.status.borrow().engine_version.clone()
  }

  fn set_state(&self, state: InstanceState) {
    self.status.send_if_modified(|s| {
      if s.state == state {
        return false;
      }
      debug!(project_id = %s.project_id, from = ?s.state, to = ?state, "State change");
      s.state = state;
      true
    });
  }
}
