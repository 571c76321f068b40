//! Command channel abstraction
//!
//! Two things can carry a command to an engine: an [`InstanceHandle`] inside
//! the server process, and a [`ProjectClient`] talking to a Project Server
//! over TCP. Both answer with the same wire [`Response`], so callers (and the
//! server's dispatch loop) do not care which one they hold.
//!
//! [`InstanceHandle`]: crate::actor::handle::InstanceHandle
//! [`ProjectClient`]: crate::ipc::ProjectClient

use std::time::Duration;

use crate::{
  error::ErrorKind,
  ipc::{IpcError, Request, RequestKind, Response},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
  pub kind: RequestKind,
  /// Human-readable label, used for logging only
  pub description: Option<String>,
  /// Per-command timeout; `None` means the channel's default
  pub timeout: Option<Duration>,
}

impl Command {
  pub fn new(kind: RequestKind) -> Self {
    Self {
      kind,
      description: None,
      timeout: None,
    }
  }

  pub fn query(code: impl Into<String>) -> Self {
    Self::new(RequestKind::Query { code: code.into() })
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  /// Wire request carrying this command under `request_id`
  pub fn into_request(self, request_id: u64) -> Request {
    Request {
      request_id: Some(request_id),
      kind: self.kind,
      description: self.description,
      timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
    }
  }
}

impl From<Request> for Command {
  fn from(request: Request) -> Self {
    Self {
      timeout: request.timeout(),
      kind: request.kind,
      description: request.description,
    }
  }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
  #[error("instance is gone")]
  Gone,
  #[error("connection error: {0}")]
  Connection(String),
  #[error("no response within {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },
  #[error("protocol error: {0}")]
  Protocol(String),
}

impl ChannelError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ChannelError::Timeout { .. } => ErrorKind::Timeout,
      ChannelError::Gone | ChannelError::Connection(_) => ErrorKind::InstanceUnhealthy,
      ChannelError::Protocol(_) => ErrorKind::MalformedResponse,
    }
  }
}

impl From<IpcError> for ChannelError {
  fn from(err: IpcError) -> Self {
    match err {
      IpcError::Timeout { timeout_ms } => ChannelError::Timeout { timeout_ms },
      IpcError::Serde(msg) | IpcError::Protocol(msg) => ChannelError::Protocol(msg),
      IpcError::Io(msg) | IpcError::Connection(msg) | IpcError::Codec(msg) => ChannelError::Connection(msg),
    }
  }
}

/// Anything that accepts commands for one project and answers each with
/// exactly one correlated response
#[async_trait::async_trait]
pub trait CommandChannel: Send + Sync {
  async fn submit(&self, command: Command) -> Result<Response, ChannelError>;
}
