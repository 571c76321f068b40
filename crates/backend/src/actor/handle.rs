//! Actor handles for communicating with instance actors
//!
//! Handles are cheap to clone. Every clone feeds the same mailbox, which is
//! what serializes concurrent callers onto the single engine.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use super::message::{InstanceMessage, InstancePayload, InstanceResponse, InstanceState, InstanceStatus};
use crate::{
  channel::{ChannelError, Command, CommandChannel},
  domain::project::ProjectId,
  engine::{EngineCommand, EngineError, bootstrap},
  error::ErrorKind,
  ipc::{RequestKind, Response},
};

/// Grace on top of a command's timeout before the caller stops waiting, so
/// the actor's own timeout reply normally arrives first
const REPLY_SLACK: Duration = Duration::from_millis(50);

// ============================================================================
// Instance Handle
// ============================================================================

#[derive(Clone, Debug)]
pub struct InstanceHandle {
  project_id: ProjectId,
  tx: mpsc::Sender<InstanceMessage>,
  status: watch::Receiver<InstanceStatus>,
  /// Applied to commands that carry no timeout of their own
  command_timeout: Duration,
}

impl InstanceHandle {
  pub fn new(
    project_id: ProjectId,
    tx: mpsc::Sender<InstanceMessage>,
    status: watch::Receiver<InstanceStatus>,
    command_timeout: Duration,
  ) -> Self {
    Self {
      project_id,
      tx,
      status,
      command_timeout,
    }
  }

  pub fn project_id(&self) -> &ProjectId {
    &self.project_id
  }

  /// Queue a request and wait for its reply
  pub async fn request(&self, id: String, payload: InstancePayload) -> Result<InstanceResponse, SendError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let msg = InstanceMessage {
      id,
      submitted_at: Instant::now(),
      reply: reply_tx,
      payload,
    };
    self.tx.send(msg).await.map_err(|_| SendError::ActorGone)?;
    reply_rx.await.map_err(|_| SendError::ActorGone)
  }

  /// Latest status published by the actor
  pub fn status(&self) -> InstanceStatus {
    self.status.borrow().clone()
  }

  pub fn state(&self) -> InstanceState {
    self.status.borrow().state
  }

  pub fn pid(&self) -> Option<u32> {
    self.status.borrow().pid
  }

  /// Whether the actor has exited
  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Stop the engine and the actor. Stopping a stopped instance is a no-op.
  pub async fn shutdown(&self) {
    let _ = self
      .request(format!("shutdown-{}", self.project_id), InstancePayload::Shutdown)
      .await;
  }
}

#[async_trait::async_trait]
impl CommandChannel for InstanceHandle {
  async fn submit(&self, command: Command) -> Result<Response, ChannelError> {
    let started = Instant::now();
    let kind = command.kind.response_kind();
    let id = Uuid::new_v4().to_string();
    let timeout = command.timeout.unwrap_or(self.command_timeout);

    let payload = match command.kind {
      RequestKind::Query { code } => InstancePayload::Execute {
        command: EngineCommand::query(code, command.description),
        timeout: Some(timeout),
      },
      RequestKind::SaveProject { path } => InstancePayload::Execute {
        command: EngineCommand::save(path),
        timeout: Some(timeout),
      },
      RequestKind::ModeMappings => InstancePayload::Execute {
        command: EngineCommand::query(bootstrap::MODE_MAPPINGS, Some("mode mappings".to_string())),
        timeout: Some(timeout),
      },
      RequestKind::ProjectInfo => InstancePayload::ProjectInfo { timeout: Some(timeout) },
      RequestKind::Capabilities => InstancePayload::Capabilities { timeout: Some(timeout) },
      RequestKind::Ping => InstancePayload::Probe,
      RequestKind::Status => {
        let status = self.status();
        let uptime_secs = (chrono::Utc::now() - status.started_at).num_seconds().max(0);
        let mut result = serde_json::to_value(&status).unwrap_or_default();
        if let Some(map) = result.as_object_mut() {
          map.insert("uptimeSecs".to_string(), json!(uptime_secs));
        }
        return Ok(Response::ok(kind, result).with_execution_time(started.elapsed()));
      }
      RequestKind::Shutdown => InstancePayload::Shutdown,
    };

    // Probes and shutdown are bounded by the actor; commands by their own
    // timeout, which includes time spent queued behind other commands
    let bounded = matches!(
      payload,
      InstancePayload::Execute { .. } | InstancePayload::ProjectInfo { .. } | InstancePayload::Capabilities { .. }
    );
    let reply = if bounded {
      match tokio::time::timeout(timeout + REPLY_SLACK, self.request(id, payload)).await {
        Ok(reply) => reply,
        Err(_) => {
          let err = EngineError::timeout(timeout);
          return Ok(Response::failure(kind, err.kind(), err.to_string()).with_execution_time(started.elapsed()));
        }
      }
    } else {
      self.request(id, payload).await
    };

    let response = match reply.map_err(|_| ChannelError::Gone)? {
      InstanceResponse::Done { result, output, elapsed } => {
        return Ok(Response::ok(kind, result).with_output(output).with_execution_time(elapsed));
      }
      InstanceResponse::Health(report) => {
        let result = serde_json::to_value(report).unwrap_or_default();
        if report.alive {
          Response::ok(kind, result)
        } else {
          Response::failure(kind, ErrorKind::InstanceUnhealthy, "engine did not answer the health probe")
            .with_result(Some(result))
        }
      }
      InstanceResponse::Error { kind: error_kind, message, payload } => {
        Response::failure(kind, error_kind, message).with_result(payload)
      }
      InstanceResponse::Stopped => Response::ok(kind, json!({"stopped": true})),
    };

    Ok(response.with_execution_time(started.elapsed()))
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Error when sending to an actor
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
  #[error("Actor has shut down")]
  ActorGone,
}
