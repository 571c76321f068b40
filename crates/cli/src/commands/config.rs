//! Configuration commands

use std::path::Path;

use anyhow::{Context, Result, bail};
use vbroker::config::Config;

/// Show the effective configuration as TOML
pub async fn cmd_config_show(project: Option<&Path>) -> Result<()> {
  let (config, project_config) = match project {
    Some(path) => (
      Config::load_for_project(path),
      path.parent().map(Config::project_config_path),
    ),
    None => (Config::load_global(), None),
  };
  let user_config = Config::user_config_path();

  if let Some(ref project_path) = project_config
    && project_path.exists()
  {
    println!("# Using project config: {}", project_path.display());
  } else if let Some(ref user_path) = user_config
    && user_path.exists()
  {
    println!("# Using user config: {}", user_path.display());
  } else {
    println!("# Using default configuration (no config file found)");
  }
  println!();

  let toml_str = toml::to_string_pretty(&config)?;
  println!("{}", toml_str);

  Ok(())
}

/// Write a commented default config for a project or for the user
pub async fn cmd_config_init(project: Option<&Path>) -> Result<()> {
  let config_path = match project {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      Config::project_config_path(dir)
    }
    None => Config::user_config_path().context("Could not determine the user config directory")?,
  };

  if config_path.exists() {
    bail!(
      "Config file already exists: {} (delete it first to regenerate)",
      config_path.display()
    );
  }

  if let Some(parent) = config_path.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  tokio::fs::write(&config_path, Config::generate_template()).await?;

  eprintln!("Created config: {}", config_path.display());
  Ok(())
}
