//! Server registry listing

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use vbroker::{config::Config, servers::ServerRegistry};

use super::print_json;

/// List registered project servers, or prune the dead ones
pub async fn cmd_servers(prune: bool) -> Result<()> {
  let config = Config::load_global();
  let registry = ServerRegistry::open_default(&config);

  if prune {
    let removed = registry.prune().await.context("Failed to prune server registry")?;
    return print_json(&json!({
      "registry": registry.path().display().to_string(),
      "pruned": removed,
    }));
  }

  let now = Utc::now();
  let servers: Vec<_> = registry
    .list()
    .await
    .context("Failed to read server registry")?
    .into_iter()
    .map(|(entry, alive)| {
      let uptime_secs = (now - entry.start_time).num_seconds().max(0);
      let mut value = serde_json::to_value(&entry).unwrap_or_default();
      if let Some(map) = value.as_object_mut() {
        map.insert("alive".to_string(), json!(alive));
        map.insert("uptimeSecs".to_string(), json!(uptime_secs));
      }
      value
    })
    .collect();

  print_json(&json!({
    "registry": registry.path().display().to_string(),
    "servers": servers,
  }))
}
