//! Project Server process lifecycle.
//!
//! Two sides live here:
//!
//! - [`ServerLauncher`]: used by short-lived CLI invocations to find or start
//!   the Project Server for a project, and to stop it again.
//! - [`Daemon`]: the body of a `vbroker serve` process, which owns one engine
//!   instance and exposes it over TCP until shutdown.
//!
//! # Lifecycle of `serve`
//!
//! 1. Create master `CancellationToken`, hook ctrl-c / SIGTERM to it
//! 2. Create `InstanceRegistry` with the configured engine launcher
//! 3. Start the project's instance (may take minutes)
//! 4. Bind the TCP listener, mark the registry entry `ready`
//! 5. Print `VBROKER_SERVER_READY port=<n>` on stderr
//! 6. Run server and health supervisor until cancelled
//! 7. Stop the engine, remove our registry entry

use std::{
  io::Write,
  path::{Path, PathBuf},
  process::Stdio,
  sync::Arc,
  time::Duration,
};

use serde::Serialize;
use tokio::{
  io::{AsyncBufReadExt, BufReader},
  process::{Child, Command},
  signal,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  actor::{HealthSupervisor, InstanceRegistry, InstanceRegistryError, SupervisorConfig, lifecycle::activity::KeepAlive},
  domain::{
    config::{BrokerSettings, Config},
    project::{ProjectId, ProjectMetadata},
  },
  engine::EngineLauncher,
  error::ErrorKind,
  ipc::{IpcError, ProjectClient, Request, RequestKind},
  server::{ProjectServer, ProjectServerConfig},
  servers::{RegistryError, Reservation, ServerEntry, ServerRegistry, ServerStatus, pid_alive, terminate_pid},
};

/// Prefix of the single line a Project Server writes to stderr once it accepts clients
pub const READY_PREFIX: &str = "VBROKER_SERVER_READY port=";

const REGISTRY_POLL: Duration = Duration::from_millis(250);
const STOP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Lines of child stderr kept for the error message when startup fails
const STDERR_TAIL: usize = 20;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
  #[error("failed to start project server: {0}")]
  SpawnFailure(String),
  #[error("project server did not become ready within {timeout_secs}s")]
  Timeout { timeout_secs: u64 },
  #[error(transparent)]
  Registry(#[from] RegistryError),
  #[error(transparent)]
  Ipc(#[from] IpcError),
  #[error(transparent)]
  Instance(#[from] InstanceRegistryError),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

impl LaunchError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      LaunchError::SpawnFailure(_) => ErrorKind::SpawnFailure,
      LaunchError::Timeout { .. } => ErrorKind::Timeout,
      LaunchError::Registry(e) => e.kind(),
      LaunchError::Ipc(IpcError::Timeout { .. }) => ErrorKind::Timeout,
      LaunchError::Ipc(_) => ErrorKind::InstanceUnhealthy,
      LaunchError::Instance(e) => e.kind(),
      LaunchError::Io(_) => ErrorKind::Internal,
    }
  }
}

// ============================================================================
// Configuration
// ============================================================================

/// Everything a `serve` process needs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  pub project: ProjectMetadata,
  /// Port to bind; 0 picks a free one
  pub port: u16,
  /// Path of the shared server registry
  pub registry_path: PathBuf,
  /// Full configuration (engine, timeouts, health, server, logging)
  pub config: Config,
}

impl RuntimeConfig {
  pub async fn load(project_path: &Path, port: u16) -> Self {
    // Auto-create user config on first run if it doesn't exist
    ensure_user_config().await;

    let project = ProjectMetadata::from_path(project_path);
    let config = Config::load_for_project(&project.path);

    Self {
      project,
      port,
      registry_path: crate::dirs::server_registry_path(),
      config,
    }
  }

  fn server_registry(&self) -> ServerRegistry {
    ServerRegistry::new(self.registry_path.clone(), self.config.server.base_port)
  }
}

/// Ensure user config file exists, creating it with defaults if not.
async fn ensure_user_config() {
  let Some(user_config_path) = Config::user_config_path() else {
    return;
  };

  if user_config_path.exists() {
    return;
  }

  if let Some(parent) = user_config_path.parent()
    && let Err(e) = tokio::fs::create_dir_all(parent).await
  {
    warn!("Failed to create config directory: {}", e);
    return;
  }

  match tokio::fs::write(&user_config_path, Config::generate_template()).await {
    Ok(()) => info!("Created user config: {:?}", user_config_path),
    Err(e) => warn!("Failed to create user config: {}", e),
  }
}

// ============================================================================
// Launcher (client side)
// ============================================================================

/// Result of opening a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedProject {
  pub project_id: ProjectId,
  pub project_name: String,
  pub port: u16,
  pub pid: u32,
  /// True when an already running server was reused
  pub reused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
  NotRunning,
  /// The server acknowledged a shutdown request and exited
  Graceful,
  /// The server had to be killed
  Killed,
}

/// Finds, starts and stops Project Server processes
pub struct ServerLauncher {
  registry: ServerRegistry,
  host: String,
  program: PathBuf,
  /// Arguments placed before `serve --project P --port N`
  args: Vec<String>,
  open_timeout: Duration,
  shutdown_grace: Duration,
  kill_grace: Duration,
}

impl ServerLauncher {
  /// Launch servers by re-executing the current binary
  pub fn from_config(config: &Config) -> Result<Self, LaunchError> {
    Ok(Self {
      registry: ServerRegistry::open_default(config),
      host: config.server.host.clone(),
      program: std::env::current_exe()?,
      args: Vec::new(),
      open_timeout: Duration::from_secs(config.timeouts.open_secs),
      shutdown_grace: Duration::from_secs(config.timeouts.shutdown_grace_secs),
      kill_grace: Duration::from_millis(config.timeouts.kill_grace_ms),
    })
  }

  pub fn with_registry(mut self, registry: ServerRegistry) -> Self {
    self.registry = registry;
    self
  }

  pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
    self.program = program.into();
    self.args = args;
    self
  }

  pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
    self.open_timeout = timeout;
    self
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn registry(&self) -> &ServerRegistry {
    &self.registry
  }

  /// Return the running server for `project_path`, starting one if needed.
  ///
  /// Idempotent: a live registry entry is reused. A dead one is pruned and a
  /// fresh server is started on a newly allocated port.
  pub async fn open(&self, project_path: &Path) -> Result<OpenedProject, LaunchError> {
    let project = ProjectMetadata::from_path(project_path);
    let deadline = tokio::time::Instant::now() + self.open_timeout;

    loop {
      match self.registry.reserve(&project, &self.host, std::process::id()).await? {
        Reservation::Existing(entry) if entry.status == ServerStatus::Ready => {
          debug!(project_id = %project.id, port = entry.port, pid = entry.pid, "Reusing running project server");
          return Ok(opened(&project, &entry, true));
        }
        Reservation::Existing(entry) => {
          // Another opener is starting this server; wait for it
          if tokio::time::Instant::now() >= deadline {
            return Err(LaunchError::Timeout {
              timeout_secs: self.open_timeout.as_secs(),
            });
          }
          debug!(project_id = %project.id, pid = entry.pid, "Project server is starting elsewhere, waiting");
          tokio::time::sleep(REGISTRY_POLL).await;
        }
        Reservation::Reserved(port) => return self.start(&project, port).await,
      }
    }
  }

  /// Open the project and connect a client to its server
  pub async fn connect(&self, project_path: &Path) -> Result<(OpenedProject, ProjectClient), LaunchError> {
    let opened = self.open(project_path).await?;
    let client = ProjectClient::connect(&self.host, opened.port).await?;
    Ok((opened, client))
  }

  async fn start(&self, project: &ProjectMetadata, port: u16) -> Result<OpenedProject, LaunchError> {
    info!(project_id = %project.id, port, program = %self.program.display(), "Starting project server");

    let mut child = match self.spawn(project, port) {
      Ok(child) => child,
      Err(e) => {
        let _ = self.registry.remove(&project.id, Some(std::process::id())).await;
        return Err(LaunchError::SpawnFailure(format!("{}: {e}", self.program.display())));
      }
    };
    let pid = child.id().unwrap_or_default();

    // The entry was reserved under our pid; hand it to the child
    self
      .registry
      .register(ServerEntry::new(project, port, pid, ServerStatus::Starting))
      .await?;

    match tokio::time::timeout(self.open_timeout, wait_for_ready(&mut child)).await {
      Ok(Ok(ready_port)) => {
        info!(project_id = %project.id, port = ready_port, pid, "Project server ready");
        Ok(OpenedProject {
          project_id: project.id.clone(),
          project_name: project.name.clone(),
          port: ready_port,
          pid,
          reused: false,
        })
      }
      Ok(Err(e)) => {
        error!(project_id = %project.id, pid, error = %e, "Project server failed to start");
        self.abandon(project, &mut child, pid).await;
        Err(e)
      }
      Err(_) => {
        error!(project_id = %project.id, pid, timeout_secs = self.open_timeout.as_secs(), "Project server startup timed out");
        self.abandon(project, &mut child, pid).await;
        Err(LaunchError::Timeout {
          timeout_secs: self.open_timeout.as_secs(),
        })
      }
    }
  }

  fn spawn(&self, project: &ProjectMetadata, port: u16) -> std::io::Result<Child> {
    let mut command = Command::new(&self.program);
    command
      .args(&self.args)
      .arg("serve")
      .arg("--project")
      .arg(&project.path)
      .arg("--port")
      .arg(port.to_string())
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped());

    // Detach from the opener's process group so terminal signals do not reach it
    #[cfg(unix)]
    command.process_group(0);

    command.spawn()
  }

  async fn abandon(&self, project: &ProjectMetadata, child: &mut Child, pid: u32) {
    terminate_pid(pid, true);
    let _ = child.kill().await;
    if let Err(e) = self.registry.remove(&project.id, Some(pid)).await {
      warn!(project_id = %project.id, error = %e, "Failed to remove server entry");
    }
  }

  /// Stop the server for `project_path`: ask politely, then kill
  pub async fn stop(&self, project_path: &Path) -> Result<StopOutcome, LaunchError> {
    let project = ProjectMetadata::from_path(project_path);
    let Some(entry) = self.registry.get_live(&project.id).await? else {
      return Ok(StopOutcome::NotRunning);
    };

    info!(project_id = %project.id, pid = entry.pid, port = entry.port, "Stopping project server");
    match self.request_shutdown(entry.port).await {
      Ok(()) => {
        if wait_for_exit(entry.pid, self.shutdown_grace).await {
          self.registry.remove(&project.id, Some(entry.pid)).await?;
          return Ok(StopOutcome::Graceful);
        }
        warn!(pid = entry.pid, "Project server did not exit after shutdown request");
      }
      Err(e) => warn!(pid = entry.pid, error = %e, "Shutdown request failed, killing server"),
    }

    terminate_pid(entry.pid, false);
    if !wait_for_exit(entry.pid, self.kill_grace).await {
      terminate_pid(entry.pid, true);
    }
    self.registry.remove(&project.id, Some(entry.pid)).await?;
    Ok(StopOutcome::Killed)
  }

  async fn request_shutdown(&self, port: u16) -> Result<(), IpcError> {
    let client = ProjectClient::connect(&self.host, port).await?;
    let response = client
      .request(Request::new(0, RequestKind::Shutdown), STOP_REQUEST_TIMEOUT)
      .await?;
    if response.is_success() {
      Ok(())
    } else {
      Err(IpcError::Protocol(response.error.unwrap_or_else(|| "shutdown refused".into())))
    }
  }
}

fn opened(project: &ProjectMetadata, entry: &ServerEntry, reused: bool) -> OpenedProject {
  OpenedProject {
    project_id: project.id.clone(),
    project_name: project.name.clone(),
    port: entry.port,
    pid: entry.pid,
    reused,
  }
}

/// Read the child's stderr until the readiness line
async fn wait_for_ready(child: &mut Child) -> Result<u16, LaunchError> {
  let stderr = child
    .stderr
    .take()
    .ok_or_else(|| LaunchError::SpawnFailure("stderr not captured".into()))?;
  let mut lines = BufReader::new(stderr).lines();
  let mut tail: Vec<String> = Vec::new();

  while let Some(line) = lines.next_line().await? {
    if let Some(port) = line.trim().strip_prefix(READY_PREFIX) {
      return port
        .trim()
        .parse()
        .map_err(|_| LaunchError::SpawnFailure(format!("invalid readiness line: {line}")));
    }
    debug!(line = %line, "project server stderr");
    if tail.len() == STDERR_TAIL {
      tail.remove(0);
    }
    tail.push(line);
  }

  let status = child.wait().await?;
  Err(LaunchError::SpawnFailure(format!(
    "server exited ({status}) before becoming ready: {}",
    tail.join("\n")
  )))
}

async fn wait_for_exit(pid: u32, grace: Duration) -> bool {
  let deadline = tokio::time::Instant::now() + grace;
  while pid_alive(pid) {
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  true
}

// ============================================================================
// Daemon (server side)
// ============================================================================

/// A running `vbroker serve` process.
///
/// # Usage
///
/// ```ignore
/// let daemon = Daemon::new(RuntimeConfig::load(&path, port).await);
/// daemon.run().await?;
/// ```
pub struct Daemon {
  runtime_config: RuntimeConfig,
}

impl Daemon {
  pub fn new(runtime_config: RuntimeConfig) -> Self {
    Self { runtime_config }
  }

  /// Open-or-reuse the Project Server for `project_path`
  pub async fn open_project(project_path: &Path) -> Result<OpenedProject, LaunchError> {
    let config = Config::load_for_project(project_path);
    ServerLauncher::from_config(&config)?.open(project_path).await
  }

  /// Open the project and connect to its server
  pub async fn connect(project_path: &Path) -> Result<ProjectClient, LaunchError> {
    let config = Config::load_for_project(project_path);
    let (_, client) = ServerLauncher::from_config(&config)?.connect(project_path).await?;
    Ok(client)
  }

  /// Run the Project Server until shutdown
  pub async fn run(self) -> Result<(), LaunchError> {
    let RuntimeConfig {
      project,
      port,
      config,
      ..
    } = &self.runtime_config;
    let servers = self.runtime_config.server_registry();
    let pid = std::process::id();

    info!(project_id = %project.id, path = %project.path.display(), pid, "Starting project server");

    // Master cancellation token - propagates to all children
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let launcher = <dyn EngineLauncher>::from_config(config);
    let registry = Arc::new(InstanceRegistry::new(
      launcher,
      BrokerSettings::from_config(config),
      cancel.child_token(),
    ));

    let instance = tokio::select! {
      _ = cancel.cancelled() => {
        info!("Cancelled during startup");
        registry.shutdown_all().await;
        servers.remove(&project.id, Some(pid)).await?;
        return Ok(());
      }
      result = registry.get_or_create(project) => match result {
        Ok(handle) => handle,
        Err(e) => {
          error!(project_id = %project.id, error = %e, "Engine instance failed to start");
          servers.remove(&project.id, Some(pid)).await?;
          return Err(e.into());
        }
      },
    };

    let activity = Arc::new(KeepAlive::new());
    let server = match ProjectServer::bind(ProjectServerConfig {
      host: config.server.host.clone(),
      port: *port,
      project: project.clone(),
      instance,
      activity: Arc::clone(&activity),
    })
    .await
    {
      Ok(server) => server,
      Err(e) => {
        registry.shutdown_all().await;
        servers.remove(&project.id, Some(pid)).await?;
        return Err(e.into());
      }
    };

    servers
      .register(ServerEntry::new(project, server.port(), pid, ServerStatus::Ready))
      .await?;
    announce_ready(server.port());

    let supervisor_handle = {
      let supervisor = HealthSupervisor::new(Arc::clone(&registry), SupervisorConfig::from_config(config, activity));
      let cancel = cancel.clone();
      tokio::spawn(async move { supervisor.run(cancel).await })
    };

    if let Err(e) = server.run(cancel.child_token()).await {
      warn!("Server error: {}", e);
    }

    info!("Shutting down...");
    cancel.cancel();

    let _ = supervisor_handle.await;
    registry.shutdown_all().await;
    servers.remove(&project.id, Some(pid)).await?;

    info!(project_id = %project.id, "Project server shutdown complete");
    Ok(())
  }
}

fn announce_ready(port: u16) {
  let mut stderr = std::io::stderr().lock();
  if let Err(e) = writeln!(stderr, "{READY_PREFIX}{port}").and_then(|_| stderr.flush()) {
    warn!(error = %e, "Failed to write readiness line");
  }
}

fn spawn_signal_handler(cancel: CancellationToken) {
  tokio::spawn(async move {
    #[cfg(unix)]
    {
      let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
          warn!("Failed to listen for SIGTERM: {}", e);
          if signal::ctrl_c().await.is_ok() {
            cancel.cancel();
          }
          return;
        }
      };
      tokio::select! {
        result = signal::ctrl_c() => {
          if let Err(e) = result {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
          }
          info!("Received ctrl-c, shutting down...");
        }
        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
      }
    }

    #[cfg(not(unix))]
    {
      if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        return;
      }
      info!("Received ctrl-c, shutting down...");
    }

    cancel.cancel();
  });
}
