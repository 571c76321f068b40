//! Project Server end-to-end tests over real TCP sockets, with the fake engine
//! behind the instance.

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use pretty_assertions::assert_eq;
  use serde_json::{Value, json};
  use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
      TcpStream,
      tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinHandle,
  };
  use tokio_util::sync::CancellationToken;

  use crate::{
    actor::{
      __tests__::helpers::{FakeOutcome, RegistryTestContext, fake_network, project},
      lifecycle::activity::KeepAlive,
    },
    channel::{Command, CommandChannel},
    error::ErrorKind,
    ipc::{ProjectClient, RequestKind, ResponseKind},
    server::{ProjectServer, ProjectServerConfig},
  };

  const READ_TIMEOUT: Duration = Duration::from_secs(5);

  struct ServerFixture {
    ctx: RegistryTestContext,
    port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
  }

  impl ServerFixture {
    async fn start() -> Self {
      Self::start_with(|_| {}).await
    }

    async fn start_with(setup: impl FnOnce(&RegistryTestContext)) -> Self {
      let ctx = RegistryTestContext::new();
      setup(&ctx);
      let model = project("model.ver");
      let instance = ctx.registry.get_or_create(&model).await.expect("create instance");

      let server = ProjectServer::bind(ProjectServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        project: model,
        instance,
        activity: Arc::new(KeepAlive::new()),
      })
      .await
      .expect("bind");
      let port = server.port();

      let cancel = CancellationToken::new();
      let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
          server.run(cancel).await.expect("server run");
        })
      };

      Self { ctx, port, cancel, task }
    }

    async fn raw(&self) -> RawClient {
      let stream = TcpStream::connect(("127.0.0.1", self.port)).await.expect("connect");
      let (read, write) = stream.into_split();
      let mut client = RawClient {
        lines: BufReader::new(read).lines(),
        write,
      };
      let welcome = client.next().await;
      assert_eq!(welcome["type"], json!("project_welcome"));
      client
    }
  }

  struct RawClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
  }

  impl RawClient {
    async fn send_raw(&mut self, bytes: &str) {
      self.write.write_all(bytes.as_bytes()).await.expect("write");
      self.write.flush().await.expect("flush");
    }

    async fn next(&mut self) -> Value {
      let line = tokio::time::timeout(READ_TIMEOUT, self.lines.next_line())
        .await
        .expect("response in time")
        .expect("read")
        .expect("line");
      serde_json::from_str(&line).expect("valid JSON response")
    }
  }

  // ==========================================================================
  // Protocol
  // ==========================================================================

  #[tokio::test]
  async fn test_welcome_carries_network_stats() {
    let fixture = ServerFixture::start().await;
    let stream = TcpStream::connect(("127.0.0.1", fixture.port)).await.expect("connect");
    let mut lines = BufReader::new(stream).lines();

    let line = lines.next_line().await.expect("read").expect("welcome");
    let welcome: Value = serde_json::from_str(&line).expect("json");

    let network = fake_network();
    assert_eq!(welcome["type"], json!("project_welcome"));
    assert_eq!(welcome["projectId"], json!(project("model.ver").id.as_str()));
    assert_eq!(welcome["projectName"], json!("model.ver"));
    assert_eq!(
      welcome["network"],
      json!({"nodes": network.nodes, "links": network.links, "zones": network.zones})
    );
    assert!(welcome["clientId"].is_string());
  }

  #[tokio::test]
  async fn test_query_round_trip() {
    let fixture = ServerFixture::start_with(|ctx| ctx.engine.script([FakeOutcome::Reply(json!({"nodes": 42}))])).await;
    let mut client = fixture.raw().await;

    client
      .send_raw("{\"type\":\"query\",\"requestId\":1,\"code\":\"result = {'nodes': 42}\"}\n")
      .await;
    let response = client.next().await;

    assert_eq!(response["type"], json!("query_result"));
    assert_eq!(response["requestId"], json!(1));
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["result"], json!({"nodes": 42}));
    assert!(response["executionTimeMs"].is_u64());
  }

  #[tokio::test]
  async fn test_request_split_across_writes() {
    let fixture = ServerFixture::start().await;
    let mut client = fixture.raw().await;

    client.send_raw("{\"type\":\"ping\",").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send_raw("\"requestId\":7}\n").await;

    let response = client.next().await;
    assert_eq!(response["type"], json!("pong"));
    assert_eq!(response["requestId"], json!(7));
  }

  #[tokio::test]
  async fn test_two_requests_in_one_write() {
    let fixture = ServerFixture::start().await;
    let mut client = fixture.raw().await;

    client
      .send_raw("{\"type\":\"ping\",\"requestId\":1}\n{\"type\":\"query\",\"requestId\":2,\"code\":\"x\"}\n")
      .await;

    let first = client.next().await;
    let second = client.next().await;
    assert_eq!((first["type"].clone(), first["requestId"].clone()), (json!("pong"), json!(1)));
    assert_eq!(
      (second["type"].clone(), second["requestId"].clone()),
      (json!("query_result"), json!(2))
    );
  }

  #[tokio::test]
  async fn test_invalid_json_gets_error_response() {
    let fixture = ServerFixture::start().await;
    let mut client = fixture.raw().await;

    client.send_raw("{\"type\":\"query\",\"requestId\":5,\"code\":\n").await;
    let response = client.next().await;

    assert_eq!(response["type"], json!("error"));
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["errorKind"], json!("InvalidRequest"));

    // Unknown request types are answered too, with their id
    client.send_raw("{\"type\":\"launch_rockets\",\"requestId\":6}\n").await;
    let response = client.next().await;
    assert_eq!(response["type"], json!("error"));
    assert_eq!(response["requestId"], json!(6));

    // And the connection is still usable
    client.send_raw("{\"type\":\"ping\",\"requestId\":8}\n").await;
    assert_eq!(client.next().await["type"], json!("pong"));
  }

  #[tokio::test]
  async fn test_undecodable_line_is_answered_before_close() {
    let fixture = ServerFixture::start().await;
    let mut client = fixture.raw().await;

    client.write.write_all(b"{\"type\":\"ping\",\"code\":\"\xff\xfe\"}\n").await.expect("write");
    client.write.flush().await.expect("flush");
    let response = client.next().await;

    assert_eq!(response["type"], json!("error"));
    assert_eq!(response["errorKind"], json!("InvalidRequest"));
    assert!(response.get("requestId").is_none());

    let closed = tokio::time::timeout(READ_TIMEOUT, client.lines.next_line())
      .await
      .expect("close in time");
    assert!(matches!(closed, Ok(None) | Err(_)), "connection should be closed: {closed:?}");
  }

  #[tokio::test]
  async fn test_engine_error_is_structured() {
    let fixture = ServerFixture::start_with(|ctx| {
      ctx.engine.script([FakeOutcome::Fail(crate::engine::EngineError::EngineReported {
        message: "name 'Visum' is not defined".to_string(),
        payload: json!({"success": false, "error": "name 'Visum' is not defined"}),
      })])
    })
    .await;
    let mut client = fixture.raw().await;

    client.send_raw("{\"type\":\"query\",\"requestId\":3,\"code\":\"Visum\"}\n").await;
    let response = client.next().await;

    assert_eq!(response["type"], json!("query_result"));
    assert_eq!(response["requestId"], json!(3));
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["errorKind"], json!("EngineReportedError"));
    assert!(response["error"].as_str().expect("message").contains("name 'Visum' is not defined"));
    assert_eq!(response["result"], json!({"success": false, "error": "name 'Visum' is not defined"}));
  }

  // ==========================================================================
  // Sharing and lifecycle
  // ==========================================================================

  #[tokio::test]
  async fn test_clients_share_one_instance() {
    let fixture = ServerFixture::start().await;

    let a = ProjectClient::connect("127.0.0.1", fixture.port).await.expect("a");
    let b = ProjectClient::connect("127.0.0.1", fixture.port).await.expect("b");

    let (ra, rb) = tokio::join!(a.submit(Command::query("from a")), b.submit(Command::query("from b")));
    assert!(ra.expect("a response").is_success());
    assert!(rb.expect("b response").is_success());

    assert_eq!(fixture.ctx.engine.launches(), 1);
    let mut queries = fixture.ctx.engine.queries();
    queries.sort();
    assert_eq!(queries, vec!["from a".to_string(), "from b".to_string()]);
    assert_eq!(a.welcome().project_id, b.welcome().project_id);
    assert_ne!(a.welcome().client_id, b.welcome().client_id);
  }

  #[tokio::test]
  async fn test_status_reports_connected_clients() {
    let fixture = ServerFixture::start().await;
    let a = ProjectClient::connect("127.0.0.1", fixture.port).await.expect("a");
    let _b = ProjectClient::connect("127.0.0.1", fixture.port).await.expect("b");

    let response = a.submit(Command::new(RequestKind::Status)).await.expect("status");

    assert_eq!(response.kind, ResponseKind::Status);
    let result = response.result.expect("status result");
    assert_eq!(result["connectedClients"], json!(2));
    assert_eq!(result["state"], json!("ready"));
  }

  #[tokio::test]
  async fn test_shutdown_request_stops_server() {
    let fixture = ServerFixture::start().await;
    let client = ProjectClient::connect("127.0.0.1", fixture.port).await.expect("connect");

    let response = client.submit(Command::new(RequestKind::Shutdown)).await.expect("ack");

    assert_eq!(response.kind, ResponseKind::ShutdownAck);
    assert!(response.is_success());
    tokio::time::timeout(READ_TIMEOUT, fixture.cancel.cancelled())
      .await
      .expect("server cancelled");
    tokio::time::timeout(READ_TIMEOUT, fixture.task)
      .await
      .expect("server stops")
      .expect("server task");
  }

  #[tokio::test]
  async fn test_unhealthy_instance_answers_with_error_kind() {
    let fixture = ServerFixture::start().await;
    fixture.ctx.registry.shutdown_all().await;
    let client = ProjectClient::connect("127.0.0.1", fixture.port).await.expect("connect");

    let response = client.submit(Command::query("after stop")).await.expect("response");

    assert!(!response.is_success());
    assert_eq!(response.kind, ResponseKind::QueryResult);
    assert_eq!(response.error_kind, Some(ErrorKind::InstanceUnhealthy));
  }
}
