//! Actor message types for the broker
//!
//! Every request carries a `oneshot::Sender` for its single reply. Engine
//! commands never stream, so there is nothing to multiplex on the way back.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
  domain::project::{NetworkStats, ProjectId},
  engine::EngineCommand,
  error::ErrorKind,
};

// ============================================================================
// Instance Actor Messages
// ============================================================================

/// A message sent to an InstanceActor
#[derive(Debug)]
pub struct InstanceMessage {
  /// Request ID for correlation in logs
  pub id: String,
  /// When the caller queued the message; command timeouts count from here
  pub submitted_at: Instant,
  pub reply: oneshot::Sender<InstanceResponse>,
  pub payload: InstancePayload,
}

#[derive(Debug, Clone)]
pub enum InstancePayload {
  /// Run a command on the engine; `None` uses the configured command timeout
  Execute {
    command: EngineCommand,
    timeout: Option<Duration>,
  },
  /// Instance status merged with what the engine reports about the project
  ProjectInfo { timeout: Option<Duration> },
  /// Attribute capabilities of the engine version (cached per version)
  Capabilities { timeout: Option<Duration> },
  /// Liveness probe (supervisor-triggered or an explicit ping)
  Probe,
  /// Stop the engine and the actor
  Shutdown,
}

/// Response from an InstanceActor
#[derive(Debug, Clone)]
pub enum InstanceResponse {
  Done {
    result: Value,
    output: Option<String>,
    elapsed: Duration,
  },
  Health(HealthReport),
  Error {
    kind: ErrorKind,
    message: String,
    payload: Option<Value>,
  },
  Stopped,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
  /// Engine is loading the project
  Starting,
  /// Idle and accepting commands
  Ready,
  /// Executing a command
  Busy,
  /// Failed health checks or exited; restarted on next use
  Unhealthy,
  Shutdown,
}

/// Snapshot of one instance, published by the actor on every state change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
  pub project_id: ProjectId,
  pub project_name: String,
  pub project_path: String,
  pub state: InstanceState,
  pub pid: Option<u32>,
  pub started_at: DateTime<Utc>,
  pub last_used_at: DateTime<Utc>,
  pub network: NetworkStats,
  pub engine_version: Option<String>,
  pub restarts: u32,
  pub consecutive_failures: u32,
  pub commands_executed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
  pub alive: bool,
  pub latency_ms: Option<u64>,
  pub state: InstanceState,
}
