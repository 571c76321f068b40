//! Configuration for the broker with per-project overrides.
//!
//! Config priority: project-relative (`<project dir>/.vbroker.toml`) > user
//! (`~/.config/vbroker/config.toml`) > built-in defaults.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Engine Configuration
// ============================================================================

/// How the engine interpreter is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Interpreter executable (must be able to import VisumPy)
  pub interpreter: String,

  /// Extra arguments placed before the script path
  pub args: Vec<String>,

  /// Custom bootstrap script; the built-in loop is used when unset
  pub bootstrap: Option<PathBuf>,

  /// Where temporary scripts are written; defaults to `<data dir>/scripts`
  pub scripts_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      interpreter: "python".to_string(),
      args: Vec::new(),
      bootstrap: None,
      scripts_dir: None,
    }
  }
}

impl EngineConfig {
  pub fn scripts_dir(&self) -> PathBuf {
    self.scripts_dir.clone().unwrap_or_else(crate::dirs::default_scripts_dir)
  }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Timeout budget for every blocking step
///
/// Loading a large network takes minutes, regular commands take seconds, and
/// a health probe must answer almost immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
  /// Engine startup, including loading the version file
  pub startup_secs: u64,
  /// Default per-command timeout
  pub command_secs: u64,
  /// Health probe timeout
  pub probe_secs: u64,
  /// How long `open` waits for a freshly spawned Project Server
  pub open_secs: u64,
  /// Grace period between a polite terminate and a hard kill
  pub kill_grace_ms: u64,
  /// How long an engine gets to exit after a shutdown request
  pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
  fn default() -> Self {
    Self {
      startup_secs: 300,
      command_secs: 60,
      probe_secs: 5,
      open_secs: 600,
      kill_grace_ms: 2000,
      shutdown_grace_secs: 10,
    }
  }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
  /// Seconds between background health probes (0 disables probing)
  pub probe_interval_secs: u64,
  /// Consecutive command failures before an instance is marked unhealthy
  pub failure_threshold: u32,
  /// Restart attempts for an unhealthy instance before giving up
  pub max_restarts: u32,
}

impl Default for HealthConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 30,
      failure_threshold: 3,
      max_restarts: 2,
    }
  }
}

// ============================================================================
// Project Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Interface the Project Server binds to
  pub host: String,
  /// First port handed out when the registry is empty
  pub base_port: u16,
  /// Shut down after this many idle seconds with no clients (0 = never)
  pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      base_port: 7100,
      idle_timeout_secs: 0,
    }
  }
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log level for Project Server processes (off, error, warn, info, debug, trace)
  pub log_level: String,
  /// Log rotation (daily, hourly, never)
  pub log_rotation: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      log_level: "info".to_string(),
      log_rotation: "daily".to_string(),
    }
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub engine: EngineConfig,
  pub timeouts: TimeoutConfig,
  pub health: HealthConfig,
  pub server: ServerConfig,
  pub logging: LoggingConfig,
}

impl Config {
  /// Load config for a project file (project override > user > defaults)
  pub fn load_for_project(project_file: &Path) -> Self {
    if let Some(dir) = project_file.parent() {
      let project_config = Self::project_config_path(dir);
      if let Some(config) = Self::read(&project_config) {
        return config;
      }
    }

    Self::load_global()
  }

  /// Load the user config, falling back to defaults
  pub fn load_global() -> Self {
    Self::user_config_path()
      .and_then(|path| Self::read(&path))
      .unwrap_or_default()
  }

  fn read(path: &Path) -> Option<Self> {
    if !path.exists() {
      return None;
    }

    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
      Ok(config) => Some(config),
      Err(e) => {
        tracing::warn!(path = %path.display(), error = %e, "Ignoring invalid config file");
        None
      }
    }
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("VBROKER_CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("vbroker").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("vbroker").join("config.toml"))
  }

  /// Get the project-relative config path for a project directory
  pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".vbroker.toml")
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let d = Self::default();
    format!(
      r#"# Visum broker configuration
# Place next to a version file as .vbroker.toml (project) or in ~/.config/vbroker/config.toml (user)

# ============================================================================
# Engine
# ============================================================================

[engine]
# Interpreter that can import VisumPy
interpreter = "{interpreter}"
# Extra interpreter arguments
args = []
# Custom bootstrap script (the built-in request loop is used when unset)
# bootstrap = "C:/tools/visum_loop.py"
# Directory for temporary scripts (defaults to the data directory)
# scripts_dir = "C:/temp/vbroker"

# ============================================================================
# Timeouts
# ============================================================================

[timeouts]
# Engine startup including loading the version file
startup_secs = {startup}
# Default per-command timeout
command_secs = {command}
# Health probe timeout
probe_secs = {probe}
# How long `open` waits for a spawned Project Server
open_secs = {open}
# Grace between terminate and kill
kill_grace_ms = {kill_grace}
# How long an engine gets to exit after a shutdown request
shutdown_grace_secs = {shutdown_grace}

# ============================================================================
# Health
# ============================================================================

[health]
# Seconds between background probes (0 disables probing)
probe_interval_secs = {probe_interval}
# Consecutive failures before an instance is unhealthy
failure_threshold = {threshold}
# Restart attempts before giving up on an instance
max_restarts = {max_restarts}

# ============================================================================
# Project Server
# ============================================================================

[server]
host = "{host}"
# First port handed out when the registry is empty
base_port = {base_port}
# Idle seconds without clients before the server exits (0 = never)
idle_timeout_secs = {idle}

# ============================================================================
# Logging
# ============================================================================

[logging]
# off, error, warn, info, debug, trace
log_level = "{log_level}"
# daily, hourly, never
log_rotation = "{log_rotation}"
"#,
      interpreter = d.engine.interpreter,
      startup = d.timeouts.startup_secs,
      command = d.timeouts.command_secs,
      probe = d.timeouts.probe_secs,
      open = d.timeouts.open_secs,
      kill_grace = d.timeouts.kill_grace_ms,
      shutdown_grace = d.timeouts.shutdown_grace_secs,
      probe_interval = d.health.probe_interval_secs,
      threshold = d.health.failure_threshold,
      max_restarts = d.health.max_restarts,
      host = d.server.host,
      base_port = d.server.base_port,
      idle = d.server.idle_timeout_secs,
      log_level = d.logging.log_level,
      log_rotation = d.logging.log_rotation,
    )
  }
}

// ============================================================================
// Broker Settings
// ============================================================================

/// Resolved runtime settings handed to every instance actor.
///
/// Durations are computed once from [`Config`] so actors never deal with raw
/// second counts.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
  pub startup_timeout: Duration,
  pub command_timeout: Duration,
  pub probe_timeout: Duration,
  pub kill_grace: Duration,
  pub shutdown_grace: Duration,
  pub failure_threshold: u32,
  pub max_restarts: u32,
}

impl BrokerSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      startup_timeout: Duration::from_secs(config.timeouts.startup_secs),
      command_timeout: Duration::from_secs(config.timeouts.command_secs),
      probe_timeout: Duration::from_secs(config.timeouts.probe_secs),
      kill_grace: Duration::from_millis(config.timeouts.kill_grace_ms),
      shutdown_grace: Duration::from_secs(config.timeouts.shutdown_grace_secs),
      failure_threshold: config.health.failure_threshold.max(1),
      max_restarts: config.health.max_restarts,
    }
  }
}

impl Default for BrokerSettings {
  fn default() -> Self {
    Self::from_config(&Config::default())
  }
}
