use std::{
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
  },
  time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
  net::TcpStream,
  sync::{mpsc, oneshot},
};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, warn};

use super::{IpcError, Request, Response, ResponseKind};
use crate::channel::{ChannelError, Command, CommandChannel};

type FramedStream = Framed<TcpStream, LinesCodec>;

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Extra wait on top of a command's own timeout, so the server's timeout
/// response arrives before the client gives up
const RESPONSE_SLACK: Duration = Duration::from_secs(5);

enum Outbound {
  Request {
    request: Request,
    response_tx: oneshot::Sender<Result<Response, IpcError>>,
  },
  /// The caller stopped waiting; forget the pending entry
  Abandon(u64),
}

/// Client for one Project Server.
///
/// Responses are matched to requests by `requestId`, so any number of
/// requests may be in flight on one connection.
#[derive(Clone)]
pub struct ProjectClient {
  request_tx: mpsc::Sender<Outbound>,
  counter: Arc<AtomicU64>,
  /// Requests sent and not yet answered or abandoned
  in_flight: Arc<AtomicUsize>,
  welcome: Response,
  timeout: Duration,
}

impl ProjectClient {
  /// Connect and wait for the server's `project_welcome`
  pub async fn connect(host: &str, port: u16) -> Result<Self, IpcError> {
    let stream = TcpStream::connect((host, port)).await?;
    let framed = Framed::new(stream, LinesCodec::new());
    let (sink, mut read_stream) = framed.split();

    let welcome = match tokio::time::timeout(WELCOME_TIMEOUT, read_stream.next()).await {
      Ok(Some(Ok(line))) => serde_json::from_str::<Response>(&line)?,
      Ok(Some(Err(e))) => return Err(e.into()),
      Ok(None) => return Err(IpcError::Connection("server closed the connection".into())),
      Err(_) => {
        return Err(IpcError::Timeout {
          timeout_ms: WELCOME_TIMEOUT.as_millis() as u64,
        });
      }
    };
    if welcome.kind != ResponseKind::ProjectWelcome {
      return Err(IpcError::Protocol(format!("expected project_welcome, got {:?}", welcome.kind)));
    }
    debug!(client_id = ?welcome.client_id, project_id = ?welcome.project_id, "Connected to project server");

    let (request_tx, request_rx) = mpsc::channel(64);
    let in_flight = Arc::new(AtomicUsize::new(0));
    tokio::spawn(Self::multiplexer(sink, read_stream, request_rx, Arc::clone(&in_flight)));

    Ok(Self {
      request_tx,
      counter: Arc::new(AtomicU64::new(1)),
      in_flight,
      welcome,
      timeout: DEFAULT_TIMEOUT,
    })
  }

  /// Wait at most `timeout` for responses to commands without their own timeout
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// The `project_welcome` message received on connect
  pub fn welcome(&self) -> &Response {
    &self.welcome
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.load(Ordering::Relaxed)
  }

  async fn multiplexer(
    mut sink: futures::stream::SplitSink<FramedStream, String>,
    mut stream: futures::stream::SplitStream<FramedStream>,
    mut request_rx: mpsc::Receiver<Outbound>,
    in_flight: Arc<AtomicUsize>,
  ) {
    let mut pending: HashMap<u64, oneshot::Sender<Result<Response, IpcError>>> = HashMap::new();

    loop {
      tokio::select! {
        outbound = request_rx.recv() => {
          let (request, response_tx) = match outbound {
            Some(Outbound::Request { request, response_tx }) => (request, response_tx),
            Some(Outbound::Abandon(id)) => {
              if pending.remove(&id).is_some() {
                debug!(request_id = id, "Abandoned pending request");
              }
              in_flight.store(pending.len(), Ordering::Relaxed);
              continue;
            }
            None => {
              debug!("all client handles dropped");
              break;
            }
          };
          let Some(id) = request.request_id else {
            let _ = response_tx.send(Err(IpcError::Protocol("request without requestId".into())));
            continue;
          };
          match serde_json::to_string(&request) {
            Ok(json) => {
              pending.insert(id, response_tx);
              in_flight.store(pending.len(), Ordering::Relaxed);
              if let Err(e) = sink.send(json).await {
                error!("failed to send request: {e}");
                if let Some(tx) = pending.remove(&id) {
                  in_flight.store(pending.len(), Ordering::Relaxed);
                  let _ = tx.send(Err(IpcError::Connection(e.to_string())));
                }
              }
            }
            Err(e) => {
              let _ = response_tx.send(Err(e.into()));
            }
          }
        }

        result = stream.next() => {
          match result {
            Some(Ok(line)) => {
              // A reply to an abandoned request ends up as "unknown request id"
              match serde_json::from_str::<Response>(&line) {
                Ok(response) => match response.request_id {
                  Some(id) => match pending.remove(&id) {
                    Some(tx) => {
                      in_flight.store(pending.len(), Ordering::Relaxed);
                      if tx.send(Ok(response)).is_err() {
                        debug!("receiver dropped for request {id}");
                      }
                    }
                    None => warn!("received response for unknown request id: {id}"),
                  },
                  None => warn!(kind = ?response.kind, "dropping response without requestId"),
                },
                Err(e) => {
                  error!("failed to parse response: {e}");
                }
              }
            }
            Some(Err(e)) => {
              error!("connection error: {e}");
              break;
            }
            None => {
              debug!("connection closed");
              break;
            }
          }
        }
      }
    }

    in_flight.store(0, Ordering::Relaxed);
    for (_, tx) in pending {
      let _ = tx.send(Err(IpcError::Connection("connection closed".into())));
    }

    debug!("multiplexer exited");
  }

  /// Send one request and wait up to `timeout` for its response
  pub async fn request(&self, mut request: Request, timeout: Duration) -> Result<Response, IpcError> {
    let id = self.counter.fetch_add(1, Ordering::Relaxed);
    request.request_id = Some(id);

    let (response_tx, response_rx) = oneshot::channel();
    self
      .request_tx
      .send(Outbound::Request { request, response_tx })
      .await
      .map_err(|_| IpcError::Connection("connection closed".into()))?;

    match tokio::time::timeout(timeout, response_rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(IpcError::Connection("connection closed".into())),
      Err(_) => {
        warn!(request_id = id, timeout_ms = timeout.as_millis() as u64, "No response in time, abandoning request");
        let _ = self.request_tx.send(Outbound::Abandon(id)).await;
        Err(IpcError::Timeout {
          timeout_ms: timeout.as_millis() as u64,
        })
      }
    }
  }
}

#[async_trait::async_trait]
impl CommandChannel for ProjectClient {
  async fn submit(&self, command: Command) -> Result<Response, ChannelError> {
    let wait = command.timeout.map(|t| t + RESPONSE_SLACK).unwrap_or(self.timeout);
    Ok(self.request(command.into_request(0), wait).await?)
  }
}
