//! Engine process adapter
//!
//! The engine is an external interpreter hosting the Visum COM object. This
//! module owns everything about talking to it:
//!
//! - [`script`]: one-shot execution (`run`) of a script in a fresh process
//! - [`process`]: a persistent engine child driven over stdin/stdout
//! - [`extract`]: pulling JSON out of noisy console output
//! - [`bootstrap`]: the built-in request loop and canned probe scripts
//!
//! Instance actors only see the [`EngineLauncher`] / [`EngineSession`]
//! traits, so tests can swap the real process for an in-memory double.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  domain::{
    config::Config,
    project::{NetworkStats, ProjectMetadata},
  },
  error::ErrorKind,
};

pub mod bootstrap;
pub mod extract;
pub mod process;
pub mod script;

pub use process::{ProcessLauncher, ProcessSession};
pub use script::{RunOutput, ScriptRunner};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
  #[error("failed to spawn engine `{program}`: {message}")]
  SpawnFailure { program: String, message: String },
  #[error("engine did not answer within {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },
  #[error("no JSON object found in engine output")]
  MalformedResponse { output: String },
  #[error("engine reported an error: {message}")]
  EngineReported { message: String, payload: Value },
  #[error("engine process exited (code {code:?}){detail}")]
  ProcessExited { code: Option<i32>, detail: String },
  #[error("engine I/O error: {0}")]
  Io(String),
}

impl EngineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      EngineError::SpawnFailure { .. } => ErrorKind::SpawnFailure,
      EngineError::Timeout { .. } => ErrorKind::Timeout,
      EngineError::MalformedResponse { .. } => ErrorKind::MalformedResponse,
      EngineError::EngineReported { .. } => ErrorKind::EngineReportedError,
      EngineError::ProcessExited { .. } => ErrorKind::ProcessExited,
      EngineError::Io(_) => ErrorKind::Internal,
    }
  }

  pub(crate) fn timeout(timeout: Duration) -> Self {
    EngineError::Timeout {
      timeout_ms: timeout.as_millis() as u64,
    }
  }

  /// Structured payload to hand back to the caller alongside the message
  pub fn payload(&self) -> Option<Value> {
    match self {
      EngineError::EngineReported { payload, .. } => Some(payload.clone()),
      EngineError::MalformedResponse { output } => Some(Value::String(output.clone())),
      _ => None,
    }
  }
}

impl From<std::io::Error> for EngineError {
  fn from(err: std::io::Error) -> Self {
    EngineError::Io(err.to_string())
  }
}

// ============================================================================
// Commands and replies
// ============================================================================

/// Operation understood by the engine request loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineOp {
  Query,
  Ping,
  ProjectInfo,
  SaveProject,
  Shutdown,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCommand {
  pub op: EngineOp,
  pub code: Option<String>,
  pub description: Option<String>,
  pub path: Option<String>,
}

impl EngineCommand {
  fn op(op: EngineOp) -> Self {
    Self {
      op,
      code: None,
      description: None,
      path: None,
    }
  }

  pub fn query(code: impl Into<String>, description: Option<String>) -> Self {
    Self {
      code: Some(code.into()),
      description,
      ..Self::op(EngineOp::Query)
    }
  }

  pub fn ping() -> Self {
    Self::op(EngineOp::Ping)
  }

  pub fn project_info() -> Self {
    Self::op(EngineOp::ProjectInfo)
  }

  pub fn save(path: Option<String>) -> Self {
    Self {
      path,
      ..Self::op(EngineOp::SaveProject)
    }
  }

  pub fn shutdown() -> Self {
    Self::op(EngineOp::Shutdown)
  }
}

/// Successful answer from the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineReply {
  /// The command's result (the `result` field, or the whole object when absent)
  pub result: Value,
  /// Console output the engine captured while running the command
  pub output: Option<String>,
  /// Fresh network statistics, when the engine attached them
  pub network: Option<NetworkStats>,
}

impl EngineReply {
  pub fn new(result: Value) -> Self {
    Self {
      result,
      output: None,
      network: None,
    }
  }

  /// Interpret an engine payload, turning explicit failures into errors.
  ///
  /// A payload fails when `success` is `false` or `status` is an error
  /// word; a payload with neither field counts as success.
  pub fn from_payload(payload: Value) -> Result<Self, EngineError> {
    let Value::Object(mut obj) = payload else {
      return Ok(Self::new(payload));
    };

    let failed = match (obj.get("success"), obj.get("status")) {
      (Some(Value::Bool(ok)), _) => !ok,
      (_, Some(Value::String(status))) => matches!(status.as_str(), "error" | "failed" | "failure"),
      _ => false,
    };

    if failed {
      let message = obj
        .get("error")
        .map(|e| match e {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        })
        .unwrap_or_else(|| "engine reported failure".to_string());
      obj.remove("requestId");
      return Err(EngineError::EngineReported {
        message,
        payload: Value::Object(obj),
      });
    }

    let output = match obj.remove("output") {
      Some(Value::String(s)) if !s.is_empty() => Some(s),
      _ => None,
    };
    let network = obj.remove("network").as_ref().and_then(NetworkStats::from_value);

    let result = match obj.remove("result") {
      Some(result) => result,
      None => {
        for key in ["requestId", "success", "status", "type"] {
          obj.remove(key);
        }
        Value::Object(obj)
      }
    };

    Ok(Self {
      result,
      output,
      network,
    })
  }
}

// ============================================================================
// Engine traits
// ============================================================================

/// A running engine that accepts commands.
///
/// Sessions are driven by exactly one instance actor, which serializes
/// commands; implementations may still be called from several tasks (health
/// probes read `is_alive`), hence `Sync`.
#[async_trait::async_trait]
pub trait EngineSession: Send + Sync {
  /// OS process id, when the session is backed by a process
  fn pid(&self) -> Option<u32>;

  /// Whether the engine process is still running
  fn is_alive(&self) -> bool;

  /// Run one command and wait for its correlated reply
  async fn execute(&self, command: EngineCommand, timeout: Duration) -> Result<EngineReply, EngineError>;

  /// Ask the engine to exit, killing it after `grace`
  async fn shutdown(&self, grace: Duration);
}

/// A freshly started engine with the facts it reported while loading
pub struct LaunchedEngine {
  pub session: Box<dyn EngineSession>,
  pub network: Option<NetworkStats>,
  pub version: Option<String>,
}

/// Starts engines for projects
#[async_trait::async_trait]
pub trait EngineLauncher: Send + Sync {
  /// Start an engine with the project loaded; resolves once it is ready
  async fn launch(&self, project: &ProjectMetadata, timeout: Duration) -> Result<LaunchedEngine, EngineError>;
}

impl dyn EngineLauncher {
  /// Create the process-backed launcher described by `config`
  pub fn from_config(config: &Config) -> Arc<dyn EngineLauncher> {
    Arc::new(ProcessLauncher::new(
      config.engine.clone(),
      Duration::from_millis(config.timeouts.kill_grace_ms),
    ))
  }
}
