//! One-shot script execution

use std::{path::Path, time::Duration};

use anyhow::Result;
use vbroker::{config::Config, engine::script::ScriptRunner};

use super::print_json;

/// Run code in a fresh engine process and print the extracted result.
///
/// `anchor` is the script file, if any; its directory decides which
/// project config applies.
pub async fn cmd_run(code: &str, anchor: Option<&Path>, timeout_ms: Option<u64>) -> Result<()> {
  let config = match anchor {
    Some(path) => Config::load_for_project(path),
    None => Config::load_global(),
  };

  let timeout = timeout_ms
    .map(Duration::from_millis)
    .unwrap_or(Duration::from_secs(config.timeouts.command_secs));
  let runner = ScriptRunner::new(&config.engine, Duration::from_millis(config.timeouts.kill_grace_ms));

  let output = runner.run(code, timeout).await;
  print_json(&output)?;

  if !output.success {
    std::process::exit(1);
  }
  Ok(())
}
