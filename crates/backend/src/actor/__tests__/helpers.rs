//! Test helpers for actor tests.
//!
//! Provides an in-memory engine double that records every command it runs
//! (with entry/exit timestamps) and can be scripted to fail, hang or exit.

use std::{
  collections::VecDeque,
  path::Path,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU32, Ordering},
  },
  time::{Duration, Instant},
};

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::{
  actor::InstanceRegistry,
  domain::{
    config::BrokerSettings,
    project::{NetworkStats, ProjectMetadata},
  },
  engine::{EngineCommand, EngineError, EngineLauncher, EngineOp, EngineReply, EngineSession, LaunchedEngine},
};

pub const FAKE_VERSION: &str = "2024.01-fake";

pub fn fake_network() -> NetworkStats {
  NetworkStats {
    nodes: 42,
    links: 120,
    zones: 7,
  }
}

/// What the fake engine does with the next query
#[derive(Debug, Clone)]
pub enum FakeOutcome {
  Reply(Value),
  Fail(EngineError),
  /// Never answer; the caller's timeout fires
  Hang,
  /// The process dies mid-command
  Exit,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
  pub op: EngineOp,
  pub code: Option<String>,
  pub start: Instant,
  pub end: Instant,
}

/// Shared state behind every session the fake launcher hands out
#[derive(Debug, Default)]
pub struct FakeEngine {
  pub launches: AtomicU32,
  pub shutdowns: AtomicU32,
  pub fail_pings: AtomicBool,
  pub fail_launches: AtomicBool,
  launch_delay: Mutex<Duration>,
  command_delay: Mutex<Duration>,
  outcomes: Mutex<VecDeque<FakeOutcome>>,
  calls: Mutex<Vec<CallRecord>>,
}

impl FakeEngine {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn set_launch_delay(&self, delay: Duration) {
    *self.launch_delay.lock().unwrap() = delay;
  }

  pub fn set_command_delay(&self, delay: Duration) {
    *self.command_delay.lock().unwrap() = delay;
  }

  /// Queue outcomes for upcoming queries; unscripted queries echo their code
  pub fn script(&self, outcomes: impl IntoIterator<Item = FakeOutcome>) {
    self.outcomes.lock().unwrap().extend(outcomes);
  }

  pub fn launches(&self) -> u32 {
    self.launches.load(Ordering::SeqCst)
  }

  pub fn calls(&self) -> Vec<CallRecord> {
    self.calls.lock().unwrap().clone()
  }

  pub fn queries(&self) -> Vec<String> {
    self
      .calls()
      .into_iter()
      .filter(|c| c.op == EngineOp::Query)
      .filter_map(|c| c.code)
      .collect()
  }
}

pub struct FakeLauncher {
  pub engine: Arc<FakeEngine>,
}

#[async_trait::async_trait]
impl EngineLauncher for FakeLauncher {
  async fn launch(&self, _project: &ProjectMetadata, timeout: Duration) -> Result<LaunchedEngine, EngineError> {
    let delay = *self.engine.launch_delay.lock().unwrap();
    if delay > timeout {
      tokio::time::sleep(timeout).await;
      return Err(EngineError::timeout(timeout));
    }
    tokio::time::sleep(delay).await;

    if self.engine.fail_launches.load(Ordering::SeqCst) {
      return Err(EngineError::SpawnFailure {
        program: "fake".to_string(),
        message: "launch disabled".to_string(),
      });
    }

    let n = self.engine.launches.fetch_add(1, Ordering::SeqCst) + 1;
    Ok(LaunchedEngine {
      session: Box::new(FakeSession {
        pid: 1000 + n,
        engine: Arc::clone(&self.engine),
        alive: AtomicBool::new(true),
      }),
      network: Some(fake_network()),
      version: Some(FAKE_VERSION.to_string()),
    })
  }
}

struct FakeSession {
  pid: u32,
  engine: Arc<FakeEngine>,
  alive: AtomicBool,
}

impl FakeSession {
  fn record(&self, command: &EngineCommand, start: Instant) {
    self.engine.calls.lock().unwrap().push(CallRecord {
      op: command.op,
      code: command.code.clone(),
      start,
      end: Instant::now(),
    });
  }
}

#[async_trait::async_trait]
impl EngineSession for FakeSession {
  fn pid(&self) -> Option<u32> {
    Some(self.pid)
  }

  fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  async fn execute(&self, command: EngineCommand, timeout: Duration) -> Result<EngineReply, EngineError> {
    if !self.is_alive() {
      return Err(EngineError::ProcessExited {
        code: Some(1),
        detail: String::new(),
      });
    }

    let start = Instant::now();
    let result = match command.op {
      EngineOp::Ping => {
        if self.engine.fail_pings.load(Ordering::SeqCst) {
          tokio::time::sleep(timeout).await;
          Err(EngineError::timeout(timeout))
        } else {
          let mut reply = EngineReply::new(json!({"alive": true}));
          reply.network = Some(fake_network());
          Ok(reply)
        }
      }
      EngineOp::ProjectInfo => Ok(EngineReply::new(json!({"version": FAKE_VERSION}))),
      EngineOp::SaveProject => Ok(EngineReply::new(json!({"path": command.path.clone()}))),
      EngineOp::Shutdown => Ok(EngineReply::new(json!({"stopping": true}))),
      EngineOp::Query => {
        let outcome = self.engine.outcomes.lock().unwrap().pop_front();
        let delay = *self.engine.command_delay.lock().unwrap();
        match outcome {
          None => {
            tokio::time::sleep(delay).await;
            Ok(EngineReply::new(json!({"echo": command.code.clone()})))
          }
          Some(FakeOutcome::Reply(value)) => {
            tokio::time::sleep(delay).await;
            Ok(EngineReply::new(value))
          }
          Some(FakeOutcome::Fail(err)) => Err(err),
          Some(FakeOutcome::Hang) => {
            tokio::time::sleep(timeout).await;
            Err(EngineError::timeout(timeout))
          }
          Some(FakeOutcome::Exit) => {
            self.alive.store(false, Ordering::SeqCst);
            Err(EngineError::ProcessExited {
              code: Some(1),
              detail: ": killed".to_string(),
            })
          }
        }
      }
    };

    self.record(&command, start);
    result
  }

  async fn shutdown(&self, _grace: Duration) {
    if self.alive.swap(false, Ordering::SeqCst) {
      self.engine.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
  }
}

pub fn test_settings() -> BrokerSettings {
  BrokerSettings {
    startup_timeout: Duration::from_secs(5),
    command_timeout: Duration::from_secs(2),
    probe_timeout: Duration::from_millis(100),
    kill_grace: Duration::from_millis(10),
    shutdown_grace: Duration::from_millis(10),
    failure_threshold: 2,
    max_restarts: 2,
  }
}

pub fn project(name: &str) -> ProjectMetadata {
  ProjectMetadata::from_path(&Path::new("/tmp/vbroker-tests").join(name))
}

/// Registry wired to a fresh fake engine
pub struct RegistryTestContext {
  pub engine: Arc<FakeEngine>,
  pub registry: Arc<InstanceRegistry>,
  pub cancel: CancellationToken,
}

impl RegistryTestContext {
  pub fn new() -> Self {
    Self::with_settings(test_settings())
  }

  pub fn with_settings(settings: BrokerSettings) -> Self {
    let engine = FakeEngine::new();
    let launcher = Arc::new(FakeLauncher {
      engine: Arc::clone(&engine),
    });
    let cancel = CancellationToken::new();
    let registry = Arc::new(InstanceRegistry::new(launcher, settings, cancel.clone()));
    Self {
      engine,
      registry,
      cancel,
    }
  }
}
