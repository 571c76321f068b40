//! Persistent engine process.
//!
//! A `ProcessSession` keeps one interpreter alive with the project loaded
//! and talks to it over stdin/stdout, one JSON object per line. Three tasks
//! run beside the session:
//!
//! - the stdout reader routes reply lines to waiting callers by `requestId`
//!   and logs everything else as console noise
//! - the stderr reader logs engine diagnostics and keeps a short tail for
//!   startup failures
//! - the wait task owns the `Child`, records its exit and kills it on demand
//!
//! Replies that arrive for a request nobody is waiting on (because it
//! already timed out) are dropped with a warning instead of being handed to
//! the next caller.

use std::{
  collections::VecDeque,
  process::Stdio,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::{
  process::{ChildStderr, ChildStdin, ChildStdout},
  sync::{Mutex, oneshot, watch},
  task::JoinHandle,
};
use tokio_util::{
  codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError},
  sync::CancellationToken,
};
use tracing::{debug, info, trace, warn};

use super::{
  EngineCommand, EngineError, EngineLauncher, EngineReply, EngineSession, LaunchedEngine,
  bootstrap::{FATAL_TYPE, READY_TYPE, REQUEST_LOOP},
  extract::extract_json,
  script::{TempScript, engine_command, terminate},
};
use crate::domain::{
  config::EngineConfig,
  project::{NetworkStats, ProjectMetadata},
};

/// Longest single line accepted from the engine
const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Stderr lines kept for startup diagnostics
const STDERR_TAIL_LINES: usize = 20;

type Pending = Arc<DashMap<u64, oneshot::Sender<Value>>>;

// ============================================================================
// Launcher
// ============================================================================

/// Launches engines as child processes of the broker
pub struct ProcessLauncher {
  engine: EngineConfig,
  kill_grace: Duration,
}

impl ProcessLauncher {
  pub fn new(engine: EngineConfig, kill_grace: Duration) -> Self {
    Self { engine, kill_grace }
  }
}

#[async_trait::async_trait]
impl EngineLauncher for ProcessLauncher {
  async fn launch(&self, project: &ProjectMetadata, timeout: Duration) -> Result<LaunchedEngine, EngineError> {
    ProcessSession::start(&self.engine, project, timeout, self.kill_grace).await
  }
}

// ============================================================================
// Line routing
// ============================================================================

/// What a single stdout line turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineKind {
  Noise,
  Ready,
  Reply(u64),
  Orphan(u64),
}

#[derive(Serialize)]
struct EngineRequest<'a> {
  #[serde(rename = "requestId")]
  request_id: u64,
  #[serde(flatten)]
  command: &'a EngineCommand,
}

fn route_line(line: &str, pending: &Pending, ready: &mut Option<oneshot::Sender<Value>>) -> LineKind {
  let trimmed = line.trim();
  if trimmed.is_empty() {
    return LineKind::Noise;
  }

  let Some(value) = extract_json(trimmed) else {
    debug!(target: "engine", "{}", trimmed);
    return LineKind::Noise;
  };

  if let Some(id) = value.get("requestId").and_then(Value::as_u64) {
    return match pending.remove(&id) {
      Some((_, tx)) => {
        if tx.send(value).is_err() {
          debug!(request_id = id, "Caller stopped waiting before the reply arrived");
        }
        LineKind::Reply(id)
      }
      None => {
        warn!(request_id = id, "Dropping engine reply for unknown request");
        LineKind::Orphan(id)
      }
    };
  }

  let kind = value.get("type").and_then(Value::as_str);
  if matches!(kind, Some(READY_TYPE) | Some(FATAL_TYPE))
    && let Some(tx) = ready.take()
  {
    let _ = tx.send(value);
    return LineKind::Ready;
  }

  debug!(target: "engine", json = %value, "Uncorrelated JSON from engine");
  LineKind::Noise
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ExitInfo {
  code: Option<i32>,
}

pub struct ProcessSession {
  pid: Option<u32>,
  writer: Mutex<Option<FramedWrite<ChildStdin, LinesCodec>>>,
  pending: Pending,
  next_id: AtomicU64,
  exit: watch::Receiver<Option<ExitInfo>>,
  kill: CancellationToken,
  kill_grace: Duration,
  bootstrap: Mutex<Option<TempScript>>,
}

impl ProcessSession {
  /// Spawn the engine and wait until it reports the project as loaded
  pub async fn start(
    engine: &EngineConfig,
    project: &ProjectMetadata,
    timeout: Duration,
    kill_grace: Duration,
  ) -> Result<LaunchedEngine, EngineError> {
    let spawn_failure = |message: String| EngineError::SpawnFailure {
      program: engine.interpreter.clone(),
      message,
    };

    let (script_path, owned_script) = match &engine.bootstrap {
      Some(path) => (path.clone(), None),
      None => {
        let script = TempScript::create(&engine.scripts_dir(), "engine", REQUEST_LOOP)
          .await
          .map_err(|e| spawn_failure(format!("failed to write bootstrap script: {e}")))?;
        (script.path().to_path_buf(), Some(script))
      }
    };

    let project_arg = project.path.to_string_lossy().to_string();
    let mut cmd = engine_command(&engine.interpreter, &engine.args, &script_path, &[project_arg]);
    cmd.stdin(Stdio::piped());

    let mut child = match cmd.spawn() {
      Ok(child) => child,
      Err(e) => {
        if let Some(script) = owned_script {
          script.remove().await;
        }
        return Err(spawn_failure(e.to_string()));
      }
    };

    let pid = child.id();
    info!(project_id = %project.id, ?pid, interpreter = %engine.interpreter, "Engine process spawned");

    let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
      terminate(&mut child, kill_grace).await;
      if let Some(script) = owned_script {
        script.remove().await;
      }
      return Err(spawn_failure("engine stdio was not captured".to_string()));
    };

    let pending: Pending = Arc::new(DashMap::new());
    let (ready_tx, ready_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    let kill = CancellationToken::new();

    tokio::spawn(read_stdout(stdout, Arc::clone(&pending), ready_tx));
    let stderr_task = tokio::spawn(read_stderr(stderr, pid));

    {
      let pending = Arc::clone(&pending);
      let kill = kill.clone();
      tokio::spawn(async move {
        let finished = tokio::select! {
          status = child.wait() => Some(status),
          _ = kill.cancelled() => None,
        };

        let code = match finished {
          Some(Ok(status)) => status.code(),
          Some(Err(e)) => {
            warn!(?pid, error = %e, "Failed to wait for engine process");
            None
          }
          None => {
            terminate(&mut child, kill_grace).await;
            None
          }
        };

        info!(?pid, ?code, "Engine process exited");
        // Dropping the senders wakes every waiting caller
        pending.clear();
        let _ = exit_tx.send(Some(ExitInfo { code }));
      });
    }

    let session = ProcessSession {
      pid,
      writer: Mutex::new(Some(FramedWrite::new(stdin, LinesCodec::new()))),
      pending,
      next_id: AtomicU64::new(1),
      exit: exit_rx,
      kill,
      kill_grace,
      bootstrap: Mutex::new(owned_script),
    };

    let ready = match tokio::time::timeout(timeout, ready_rx).await {
      Ok(Ok(ready)) => ready,
      Ok(Err(_)) => {
        session.wait_exit(kill_grace).await;
        let tail = stderr_tail(stderr_task, kill_grace).await;
        session.cleanup().await;
        return Err(spawn_failure(format!(
          "engine exited before becoming ready (code {:?}){}",
          session.exit_code(),
          tail
        )));
      }
      Err(_) => {
        warn!(?pid, timeout_secs = timeout.as_secs(), "Engine did not become ready in time, killing");
        session.kill().await;
        session.cleanup().await;
        return Err(EngineError::timeout(timeout));
      }
    };

    if ready.get("type").and_then(Value::as_str) == Some(FATAL_TYPE) {
      let message = ready
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("engine failed to load the project")
        .to_string();
      session.kill().await;
      session.cleanup().await;
      return Err(spawn_failure(message));
    }

    let version = ready.get("version").and_then(Value::as_str).map(String::from);
    let network = ready.get("network").and_then(NetworkStats::from_value);
    info!(project_id = %project.id, ?pid, ?version, ?network, "Engine ready");

    Ok(LaunchedEngine {
      session: Box::new(session),
      network,
      version,
    })
  }

  fn exit_code(&self) -> Option<i32> {
    self.exit.borrow().and_then(|e| e.code)
  }

  fn exited_error(&self) -> EngineError {
    EngineError::ProcessExited {
      code: self.exit_code(),
      detail: String::new(),
    }
  }

  /// Wait up to `limit` for the process to exit; true if it did
  async fn wait_exit(&self, limit: Duration) -> bool {
    let mut exit = self.exit.clone();
    let wait = async move {
      loop {
        if exit.borrow().is_some() {
          return;
        }
        if exit.changed().await.is_err() {
          return;
        }
      }
    };
    tokio::time::timeout(limit, wait).await.is_ok() && !self.is_alive()
  }

  async fn kill(&self) {
    self.kill.cancel();
    self.wait_exit(self.kill_grace + Duration::from_secs(1)).await;
  }

  async fn cleanup(&self) {
    self.writer.lock().await.take();
    if let Some(script) = self.bootstrap.lock().await.take() {
      script.remove().await;
    }
  }
}

#[async_trait::async_trait]
impl EngineSession for ProcessSession {
  fn pid(&self) -> Option<u32> {
    self.pid
  }

  fn is_alive(&self) -> bool {
    self.exit.borrow().is_none()
  }

  async fn execute(&self, command: EngineCommand, timeout: Duration) -> Result<EngineReply, EngineError> {
    if !self.is_alive() {
      return Err(self.exited_error());
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let line = serde_json::to_string(&EngineRequest {
      request_id: id,
      command: &command,
    })
    .map_err(|e| EngineError::Io(e.to_string()))?;

    let (tx, rx) = oneshot::channel();
    self.pending.insert(id, tx);

    // The wait task may have cleared `pending` just before the insert
    if !self.is_alive() {
      self.pending.remove(&id);
      return Err(self.exited_error());
    }

    {
      let mut writer = self.writer.lock().await;
      let sent = match writer.as_mut() {
        Some(w) => w.send(line).await.map_err(|e| e.to_string()),
        None => Err("stdin already closed".to_string()),
      };
      if let Err(e) = sent {
        self.pending.remove(&id);
        return Err(EngineError::ProcessExited {
          code: self.exit_code(),
          detail: format!(": {e}"),
        });
      }
    }

    trace!(pid = ?self.pid, request_id = id, op = ?command.op, "Command written to engine");

    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(payload)) => EngineReply::from_payload(payload),
      Ok(Err(_)) => Err(self.exited_error()),
      Err(_) => {
        self.pending.remove(&id);
        warn!(pid = ?self.pid, request_id = id, timeout_ms = timeout.as_millis() as u64, "Engine command timed out");
        Err(EngineError::timeout(timeout))
      }
    }
  }

  async fn shutdown(&self, grace: Duration) {
    if self.is_alive() {
      if let Err(e) = self.execute(EngineCommand::shutdown(), grace).await {
        debug!(pid = ?self.pid, error = %e, "Engine did not acknowledge shutdown");
      }

      // EOF on stdin ends a request loop blocked on read
      self.writer.lock().await.take();

      if !self.wait_exit(grace).await {
        warn!(pid = ?self.pid, "Engine ignored shutdown request, killing");
        self.kill().await;
      }
    }

    self.cleanup().await;
  }
}

impl Drop for ProcessSession {
  fn drop(&mut self) {
    self.kill.cancel();
  }
}

// ============================================================================
// Reader tasks
// ============================================================================

async fn read_stdout(stdout: ChildStdout, pending: Pending, ready_tx: oneshot::Sender<Value>) {
  let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
  let mut ready = Some(ready_tx);

  while let Some(line) = lines.next().await {
    match line {
      Ok(line) => {
        route_line(&line, &pending, &mut ready);
      }
      Err(LinesCodecError::MaxLineLengthExceeded) => {
        warn!(max_bytes = MAX_LINE_BYTES, "Discarding oversized engine output line");
      }
      Err(e) => {
        debug!(error = %e, "Engine stdout read failed");
        break;
      }
    }
  }

  debug!("Engine stdout closed");
}

async fn read_stderr(stderr: ChildStderr, pid: Option<u32>) -> Vec<String> {
  let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
  let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

  while let Some(Ok(line)) = lines.next().await {
    debug!(target: "engine", ?pid, "stderr: {}", line);
    if tail.len() == STDERR_TAIL_LINES {
      tail.pop_front();
    }
    tail.push_back(line);
  }

  tail.into_iter().collect()
}

async fn stderr_tail(task: JoinHandle<Vec<String>>, wait: Duration) -> String {
  match tokio::time::timeout(wait, task).await {
    Ok(Ok(lines)) if !lines.is_empty() => format!(": {}", lines.join("\n").trim()),
    _ => String::new(),
  }
}
