//! Commands that talk to a project server

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::debug;
use vbroker::{
  Daemon, ServerLauncher,
  channel::{Command, CommandChannel},
  config::Config,
  ipc::RequestKind,
};

use super::print_json;

const RESPONSE_SLACK: Duration = Duration::from_secs(5);

/// A request against a project's server
pub enum ProjectRequest {
  Query {
    code: String,
    description: Option<String>,
    timeout_ms: Option<u64>,
  },
  Ping,
  Info,
  Save {
    path: Option<String>,
  },
  Capabilities,
  ModeMappings,
  Status,
}

impl ProjectRequest {
  fn into_command(self) -> Command {
    match self {
      ProjectRequest::Query {
        code,
        description,
        timeout_ms,
      } => {
        let mut command = Command::query(code);
        if let Some(description) = description {
          command = command.with_description(description);
        }
        if let Some(ms) = timeout_ms {
          command = command.with_timeout(Duration::from_millis(ms));
        }
        command
      }
      ProjectRequest::Ping => Command::new(RequestKind::Ping),
      ProjectRequest::Info => Command::new(RequestKind::ProjectInfo),
      ProjectRequest::Save { path } => Command::new(RequestKind::SaveProject { path }),
      ProjectRequest::Capabilities => Command::new(RequestKind::Capabilities),
      ProjectRequest::ModeMappings => Command::new(RequestKind::ModeMappings),
      ProjectRequest::Status => Command::new(RequestKind::Status),
    }
  }
}

/// Open (or reuse) the project server and print where it listens
pub async fn cmd_open(project: &Path) -> Result<()> {
  let opened = Daemon::open_project(project).await?;
  print_json(&opened)
}

/// Send one request to the project's server, starting it if necessary
pub async fn cmd_project_request(project: &Path, request: ProjectRequest) -> Result<()> {
  let config = Config::load_for_project(project);
  // Leave room for the server's own timeout response
  let wait = Duration::from_secs(config.timeouts.command_secs) + RESPONSE_SLACK;
  let client = Daemon::connect(project).await?.with_timeout(wait);
  let command = request.into_command();
  debug!(kind = ?command.kind, "Sending request");

  let response = client.submit(command).await.context("Request failed")?;
  print_json(&response)?;

  if !response.is_success() {
    std::process::exit(1);
  }
  Ok(())
}

/// Stop the project's server
pub async fn cmd_stop(project: &Path) -> Result<()> {
  let config = Config::load_for_project(project);
  let launcher = ServerLauncher::from_config(&config)?;
  let outcome = launcher.stop(project).await?;

  print_json(&json!({
    "success": true,
    "project": project.display().to_string(),
    "outcome": outcome,
  }))
}
