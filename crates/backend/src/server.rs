//! Project Server: one engine instance, reachable over TCP.
//!
//! Every accepted client first receives a `project_welcome` with the last
//! known network statistics. After that each newline-delimited JSON request
//! gets exactly one response carrying the request's `requestId`, including
//! requests that fail to parse.
//!
//! All connections share the single [`InstanceHandle`]; a second client never
//! causes a second engine. Commands from different clients interleave only at
//! command boundaries, in the order the instance queue received them.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
  codec::{Framed, LinesCodec},
  sync::CancellationToken,
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
  actor::{handle::InstanceHandle, lifecycle::activity::KeepAlive},
  channel::{Command, CommandChannel},
  domain::project::ProjectMetadata,
  ipc::{IpcError, Request, RequestKind, Response, ResponseKind, salvage_request_id},
};

/// Longest accepted request line; longer lines end the connection
const MAX_REQUEST_LINE: usize = 8 * 1024 * 1024;

// ============================================================================
// Server Configuration
// ============================================================================

/// Everything a Project Server needs, provided up front
pub struct ProjectServerConfig {
  pub host: String,
  /// Port to bind; 0 picks a free one
  pub port: u16,
  pub project: ProjectMetadata,
  pub instance: InstanceHandle,
  /// Activity tracker for idle detection
  pub activity: Arc<KeepAlive>,
}

struct Shared {
  project: ProjectMetadata,
  instance: InstanceHandle,
  activity: Arc<KeepAlive>,
}

// ============================================================================
// Server
// ============================================================================

pub struct ProjectServer {
  listener: TcpListener,
  port: u16,
  shared: Arc<Shared>,
}

impl ProjectServer {
  /// Bind the listening socket.
  ///
  /// Binding happens before the readiness line is printed, so a client that
  /// sees the line can always connect.
  pub async fn bind(config: ProjectServerConfig) -> Result<Self, IpcError> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let port = listener.local_addr()?.port();
    info!(host = %config.host, port, project_id = %config.project.id, "Project server listening");

    Ok(Self {
      listener,
      port,
      shared: Arc::new(Shared {
        project: config.project,
        instance: config.instance,
        activity: config.activity,
      }),
    })
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// Accept connections until `cancel` fires (or a client asks for shutdown)
  pub async fn run(self, cancel: CancellationToken) -> Result<(), IpcError> {
    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("Project server shutting down (cancelled)");
          break;
        }

        result = self.listener.accept() => {
          match result {
            Ok((stream, peer)) => {
              debug!(%peer, "Client connected");
              let shared = Arc::clone(&self.shared);
              let cancel = cancel.clone();
              tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, shared, cancel).await {
                  debug!(error = %e, "Connection ended with error");
                }
              });
            }
            Err(e) => {
              error!("Accept error: {}", e);
            }
          }
        }
      }
    }

    Ok(())
  }
}

// ============================================================================
// Connection Handler
// ============================================================================

/// Serve one client.
///
/// - Parse errors are answered with an `error` response; the connection stays open
/// - Undecodable lines (invalid UTF-8, too long) are answered, then the connection closes
/// - Instance failures are answered with a failed response of the request's type
/// - IO errors close the connection
async fn handle_connection(stream: TcpStream, shared: Arc<Shared>, cancel: CancellationToken) -> Result<(), IpcError> {
  let client_id = Uuid::new_v4().to_string();
  shared.activity.client_connected();

  let result = serve_client(stream, &shared, &client_id, &cancel).await;

  shared.activity.client_disconnected();
  debug!(%client_id, "Client disconnected");
  result
}

async fn serve_client(
  stream: TcpStream,
  shared: &Shared,
  client_id: &str,
  cancel: &CancellationToken,
) -> Result<(), IpcError> {
  let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REQUEST_LINE));
  let (mut sink, mut stream) = framed.split();

  let welcome = Response::welcome(
    client_id.to_string(),
    shared.project.id.to_string(),
    shared.project.name.clone(),
    shared.instance.status().network,
  );
  sink.send(serde_json::to_string(&welcome)?).await?;

  let mut request_count = 0u64;
  loop {
    let line = tokio::select! {
      biased;

      _ = cancel.cancelled() => break,

      next = stream.next() => match next {
        Some(Ok(line)) => line,
        // The codec stops after its first error, so answer and close
        Some(Err(e)) => {
          warn!(%client_id, error = %e, "Unreadable request line, closing connection");
          let response = Response::invalid(None, format!("Unreadable request: {e}"));
          let _ = sink.send(serde_json::to_string(&response)?).await;
          break;
        }
        None => break,
      },
    };

    shared.activity.touch();
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }
    request_count += 1;

    let request: Request = match serde_json::from_str(trimmed) {
      Ok(r) => r,
      Err(e) => {
        warn!(%client_id, "Invalid request JSON: {}", e);
        let response = Response::invalid(salvage_request_id(trimmed), format!("Parse error: {e}"));
        sink.send(serde_json::to_string(&response)?).await?;
        continue;
      }
    };

    let request_id = request.request_id;
    let shutdown = matches!(request.kind, RequestKind::Shutdown);
    trace!(%client_id, request_id = ?request_id, kind = ?request.kind, "Processing request");

    let response = dispatch(request, shared).await.with_request_id(request_id);
    debug!(
      %client_id,
      request_id = ?request_id,
      kind = ?response.kind,
      success = ?response.success,
      elapsed_ms = ?response.execution_time_ms,
      "Request completed"
    );
    sink.send(serde_json::to_string(&response)?).await?;
    shared.activity.touch();

    if shutdown {
      info!(%client_id, "Shutdown requested by client");
      cancel.cancel();
      break;
    }
  }

  debug!(%client_id, requests_handled = request_count, "Connection closed");
  Ok(())
}

async fn dispatch(request: Request, shared: &Shared) -> Response {
  let kind = request.kind.response_kind();

  match request.kind {
    // The server owns its lifetime; the instance is stopped on the way out
    RequestKind::Shutdown => Response::ok(ResponseKind::ShutdownAck, json!({"stopping": true})),
    RequestKind::Status => {
      let mut response = submit(shared, Command::from(request), kind).await;
      if let Some(result) = response.result.as_mut().and_then(|r| r.as_object_mut()) {
        result.insert("connectedClients".to_string(), json!(shared.activity.clients()));
      }
      response
    }
    _ => submit(shared, Command::from(request), kind).await,
  }
}

async fn submit(shared: &Shared, command: Command, kind: ResponseKind) -> Response {
  match shared.instance.submit(command).await {
    Ok(response) => response,
    Err(e) => Response::failure(kind, e.kind(), e.to_string()),
  }
}
