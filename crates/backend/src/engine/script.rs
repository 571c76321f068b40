//! One-shot script execution.
//!
//! `ScriptRunner::run` writes the code to a uniquely named temp file, runs
//! `<interpreter> <file>` in its own process group, and turns whatever the
//! process printed into a [`RunOutput`]. It never returns an error: every
//! failure mode is folded into `success: false` plus an [`ErrorKind`].

use std::{
  path::{Path, PathBuf},
  process::Stdio,
  time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
  io::{AsyncRead, AsyncReadExt},
  process::{Child, Command},
  task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EngineError, EngineReply, extract::extract_json};
use crate::{domain::config::EngineConfig, error::ErrorKind};

// ============================================================================
// Temp scripts
// ============================================================================

/// A script materialized on disk for the interpreter to run.
///
/// Names carry a random v4 uuid, so concurrent runs never collide, even
/// across processes sharing the directory.
#[derive(Debug)]
pub struct TempScript {
  path: PathBuf,
}

impl TempScript {
  pub async fn create(dir: &Path, prefix: &str, contents: &str) -> std::io::Result<Self> {
    tokio::fs::create_dir_all(dir).await?;

    let path = dir.join(format!("vbroker-{}-{}.py", prefix, Uuid::new_v4().simple()));

    tokio::fs::write(&path, contents).await?;
    Ok(Self { path })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Delete the script; failures are logged, never fatal
  pub async fn remove(self) {
    if let Err(e) = tokio::fs::remove_file(&self.path).await {
      warn!(path = %self.path.display(), error = %e, "Failed to delete temp script");
    }
  }
}

// ============================================================================
// Process helpers
// ============================================================================

/// Build a command for `<interpreter> [args] <script> [extra]` with piped output
pub(crate) fn engine_command(interpreter: &str, args: &[String], script: &Path, extra: &[String]) -> Command {
  let mut cmd = Command::new(interpreter);
  cmd
    .args(args)
    .arg(script)
    .args(extra)
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  // Own process group so a kill also reaches anything the script spawned
  #[cfg(unix)]
  cmd.process_group(0);

  cmd
}

/// Terminate a child: polite signal first, hard kill after `grace`.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
  #[cfg(unix)]
  if let Some(pid) = child.id() {
    unsafe {
      libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
    }
    if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
      debug!(pid, ?status, "Engine exited after SIGTERM");
      kill_group(pid);
      return;
    }
    kill_group(pid);
  }

  if let Err(e) = child.start_kill() {
    debug!(error = %e, "Kill failed (process may already be gone)");
  }
  let _ = child.wait().await;
}

#[cfg(unix)]
fn kill_group(pid: u32) {
  unsafe {
    libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
  }
}

fn collect<R: AsyncRead + Unpin + Send + 'static>(reader: Option<R>) -> JoinHandle<String> {
  tokio::spawn(async move {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
      let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
  })
}

async fn join_output(handle: JoinHandle<String>, wait: Duration) -> String {
  match tokio::time::timeout(wait, handle).await {
    Ok(Ok(text)) => text,
    _ => String::new(),
  }
}

// ============================================================================
// Run output
// ============================================================================

/// Outcome of a one-shot run
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
  pub success: bool,
  /// Everything the script printed to stdout
  pub output: String,
  pub stderr: Option<String>,
  /// Extracted JSON result
  pub result: Option<Value>,
  pub error: Option<ErrorKind>,
  pub message: Option<String>,
  pub exit_code: Option<i32>,
  pub pid: Option<u32>,
  pub duration_ms: u64,
}

impl RunOutput {
  fn failed(kind: ErrorKind, message: impl Into<String>, started: Instant) -> Self {
    Self {
      success: false,
      output: String::new(),
      stderr: None,
      result: None,
      error: Some(kind),
      message: Some(message.into()),
      exit_code: None,
      pid: None,
      duration_ms: started.elapsed().as_millis() as u64,
    }
  }
}

// ============================================================================
// Script runner
// ============================================================================

pub struct ScriptRunner {
  interpreter: String,
  args: Vec<String>,
  scripts_dir: PathBuf,
  kill_grace: Duration,
}

impl ScriptRunner {
  pub fn new(engine: &EngineConfig, kill_grace: Duration) -> Self {
    Self {
      interpreter: engine.interpreter.clone(),
      args: engine.args.clone(),
      scripts_dir: engine.scripts_dir(),
      kill_grace,
    }
  }

  /// Run `code` in a fresh interpreter and extract its JSON result.
  ///
  /// Succeeds only when the process exits with status 0 and its stdout
  /// contains a JSON object that does not itself report failure. On timeout
  /// the whole process group is killed before returning.
  pub async fn run(&self, code: &str, timeout: Duration) -> RunOutput {
    let started = Instant::now();

    let script = match TempScript::create(&self.scripts_dir, "run", code).await {
      Ok(s) => s,
      Err(e) => {
        return RunOutput::failed(
          ErrorKind::SpawnFailure,
          format!("failed to write script to {}: {}", self.scripts_dir.display(), e),
          started,
        );
      }
    };

    let output = self.run_script(script.path(), timeout, started).await;
    script.remove().await;
    output
  }

  async fn run_script(&self, script: &Path, timeout: Duration, started: Instant) -> RunOutput {
    let mut cmd = engine_command(&self.interpreter, &self.args, script, &[]);
    cmd.stdin(Stdio::null());

    let mut child = match cmd.spawn() {
      Ok(child) => child,
      Err(e) => {
        let err = EngineError::SpawnFailure {
          program: self.interpreter.clone(),
          message: e.to_string(),
        };
        warn!(error = %err, "One-shot spawn failed");
        return RunOutput::failed(err.kind(), err.to_string(), started);
      }
    };

    let pid = child.id();
    debug!(?pid, script = %script.display(), "One-shot script started");

    let stdout = collect(child.stdout.take());
    let stderr = collect(child.stderr.take());

    let status = match tokio::time::timeout(timeout, child.wait()).await {
      Ok(Ok(status)) => status,
      Ok(Err(e)) => {
        terminate(&mut child, self.kill_grace).await;
        let mut out = RunOutput::failed(ErrorKind::Internal, format!("failed to wait for engine: {e}"), started);
        out.pid = pid;
        return out;
      }
      Err(_) => {
        info!(?pid, timeout_ms = timeout.as_millis() as u64, "One-shot script timed out, killing");
        terminate(&mut child, self.kill_grace).await;

        let err = EngineError::timeout(timeout);
        let mut out = RunOutput::failed(err.kind(), err.to_string(), started);
        out.output = join_output(stdout, self.kill_grace).await.trim_end().to_string();
        out.pid = pid;
        return out;
      }
    };

    let stdout = join_output(stdout, self.kill_grace).await;
    let stderr = join_output(stderr, self.kill_grace).await;

    let mut out = interpret(stdout.trim_end(), status.code());
    out.stderr = Some(stderr).filter(|s| !s.trim().is_empty());
    out.pid = pid;
    out.duration_ms = started.elapsed().as_millis() as u64;

    if !out.success && out.error == Some(ErrorKind::EngineReportedError) && out.message.is_none() {
      out.message = out.stderr.as_deref().map(last_line);
    }

    debug!(
      ?pid,
      success = out.success,
      exit_code = ?out.exit_code,
      elapsed_ms = out.duration_ms,
      "One-shot script finished"
    );
    out
  }
}

/// Decide success from stdout and exit status
fn interpret(stdout: &str, exit_code: Option<i32>) -> RunOutput {
  let mut out = RunOutput {
    success: false,
    output: stdout.to_string(),
    stderr: None,
    result: None,
    error: None,
    message: None,
    exit_code,
    pid: None,
    duration_ms: 0,
  };

  let Some(payload) = extract_json(stdout) else {
    out.error = Some(if exit_code == Some(0) {
      ErrorKind::MalformedResponse
    } else {
      ErrorKind::EngineReportedError
    });
    if exit_code == Some(0) {
      out.message = Some("no JSON object found in engine output".to_string());
    }
    return out;
  };

  match EngineReply::from_payload(payload) {
    Ok(reply) if exit_code == Some(0) => {
      out.success = true;
      out.result = Some(reply.result);
    }
    Ok(reply) => {
      out.result = Some(reply.result);
      out.error = Some(ErrorKind::EngineReportedError);
      out.message = Some(format!("engine exited with status {exit_code:?}"));
    }
    Err(e) => {
      out.error = Some(e.kind());
      out.result = e.payload();
      out.message = Some(e.to_string());
    }
  }

  out
}

fn last_line(text: &str) -> String {
  text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or_default().trim().to_string()
}
