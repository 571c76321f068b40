//! Project server process

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use vbroker::{Daemon, RuntimeConfig};

/// Run a project server until it is stopped or goes idle
pub async fn cmd_serve(project: &Path, port: u16) -> Result<()> {
  let runtime_config = RuntimeConfig::load(project, port).await;
  info!(
    project_id = %runtime_config.project.id,
    port,
    "Starting vbroker project server"
  );

  Daemon::new(runtime_config)
    .run()
    .await
    .context("Project server failed")?;

  Ok(())
}
