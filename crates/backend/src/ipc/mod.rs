//! IPC module - Project Server wire protocol and client
//!
//! Every message is one JSON object on one line (`LinesCodec` framing).
//! Requests carry a client-chosen `requestId` that the server echoes on the
//! matching response; the only unsolicited message is `project_welcome`,
//! sent once when a client connects.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{domain::project::NetworkStats, error::ErrorKind};

pub mod client;

pub use client::ProjectClient;

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum IpcError {
  #[error("Ser/de error: {0}")]
  Serde(String),
  #[error("IO error: {0}")]
  Io(String),
  #[error("Connection error: {0}")]
  Connection(String),
  #[error("Codec error: {0}")]
  Codec(String),
  #[error("No response within {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },
  #[error("Protocol error: {0}")]
  Protocol(String),
}

impl From<serde_json::Error> for IpcError {
  fn from(err: serde_json::Error) -> Self {
    IpcError::Serde(err.to_string())
  }
}

impl From<std::io::Error> for IpcError {
  fn from(err: std::io::Error) -> Self {
    IpcError::Io(err.to_string())
  }
}

impl From<tokio_util::codec::LinesCodecError> for IpcError {
  fn from(err: tokio_util::codec::LinesCodecError) -> Self {
    IpcError::Codec(err.to_string())
  }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
  /// Run code against the loaded project; the code assigns `result`
  Query { code: String },
  Ping,
  ProjectInfo,
  SaveProject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
  },
  Capabilities,
  ModeMappings,
  Status,
  Shutdown,
}

impl RequestKind {
  /// Response type answering this request
  pub fn response_kind(&self) -> ResponseKind {
    match self {
      RequestKind::Query { .. } => ResponseKind::QueryResult,
      RequestKind::Ping => ResponseKind::Pong,
      RequestKind::ProjectInfo => ResponseKind::ProjectInfo,
      RequestKind::SaveProject { .. } => ResponseKind::SaveResult,
      RequestKind::Capabilities => ResponseKind::Capabilities,
      RequestKind::ModeMappings => ResponseKind::ModeMappings,
      RequestKind::Status => ResponseKind::Status,
      RequestKind::Shutdown => ResponseKind::ShutdownAck,
    }
  }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
  pub request_id: Option<u64>,
  #[serde(flatten)]
  pub kind: RequestKind,
  pub description: Option<String>,
  pub timeout_ms: Option<u64>,
}

impl Request {
  pub fn new(request_id: u64, kind: RequestKind) -> Self {
    Self {
      request_id: Some(request_id),
      kind,
      description: None,
      timeout_ms: None,
    }
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_ms.map(Duration::from_millis)
  }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
  ProjectWelcome,
  QueryResult,
  Pong,
  ProjectInfo,
  SaveResult,
  Capabilities,
  ModeMappings,
  Status,
  ShutdownAck,
  Error,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
  #[serde(rename = "type")]
  pub kind: ResponseKind,
  pub request_id: Option<u64>,
  pub success: Option<bool>,
  pub result: Option<Value>,
  pub error: Option<String>,
  pub error_kind: Option<ErrorKind>,
  /// Console output captured while the engine ran the command
  pub output: Option<String>,
  pub execution_time_ms: Option<u64>,
  pub client_id: Option<String>,
  pub project_id: Option<String>,
  pub project_name: Option<String>,
  pub network: Option<NetworkStats>,
}

impl Response {
  fn empty(kind: ResponseKind) -> Self {
    Self {
      kind,
      request_id: None,
      success: None,
      result: None,
      error: None,
      error_kind: None,
      output: None,
      execution_time_ms: None,
      client_id: None,
      project_id: None,
      project_name: None,
      network: None,
    }
  }

  pub fn ok(kind: ResponseKind, result: Value) -> Self {
    Self {
      success: Some(true),
      result: Some(result),
      ..Self::empty(kind)
    }
  }

  pub fn failure(kind: ResponseKind, error_kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      success: Some(false),
      error: Some(message.into()),
      error_kind: Some(error_kind),
      ..Self::empty(kind)
    }
  }

  /// Protocol-level error for a request that could not be dispatched
  pub fn invalid(request_id: Option<u64>, message: impl Into<String>) -> Self {
    Self {
      request_id,
      ..Self::failure(ResponseKind::Error, ErrorKind::InvalidRequest, message)
    }
  }

  pub fn welcome(client_id: String, project_id: String, project_name: String, network: NetworkStats) -> Self {
    Self {
      client_id: Some(client_id),
      project_id: Some(project_id),
      project_name: Some(project_name),
      network: Some(network),
      ..Self::empty(ResponseKind::ProjectWelcome)
    }
  }

  pub fn with_request_id(mut self, request_id: Option<u64>) -> Self {
    self.request_id = request_id;
    self
  }

  pub fn with_result(mut self, result: Option<Value>) -> Self {
    self.result = result;
    self
  }

  pub fn with_output(mut self, output: Option<String>) -> Self {
    self.output = output;
    self
  }

  pub fn with_execution_time(mut self, elapsed: Duration) -> Self {
    self.execution_time_ms = Some(elapsed.as_millis() as u64);
    self
  }

  pub fn is_success(&self) -> bool {
    self.success.unwrap_or(false)
  }
}

/// Best-effort `requestId` from a line that failed to parse as a [`Request`]
pub fn salvage_request_id(line: &str) -> Option<u64> {
  serde_json::from_str::<Value>(line)
    .ok()?
    .get("requestId")
    .and_then(Value::as_u64)
}
