use std::path::PathBuf;

/// Get the default base path for broker data (server registry, logs, temp scripts)
///
/// Respects the following environment variables (in order of precedence):
/// 1. VBROKER_DATA_DIR - explicit data directory override
/// 2. XDG_DATA_HOME - standard XDG data home directory
/// 3. dirs::data_local_dir() - platform default
pub fn default_data_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("VBROKER_DATA_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
    return PathBuf::from(xdg_data).join("vbroker");
  }

  dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("vbroker")
}

/// Get the default config directory
///
/// Respects the following environment variables (in order of precedence):
/// 1. VBROKER_CONFIG_DIR - explicit config directory override
/// 2. XDG_CONFIG_HOME - standard XDG config home directory
/// 3. dirs::config_dir() - platform default
pub fn default_config_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("VBROKER_CONFIG_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
    return PathBuf::from(xdg_config).join("vbroker");
  }

  dirs::config_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("vbroker")
}

/// Path of the shared on-disk server registry
pub fn server_registry_path() -> PathBuf {
  default_data_dir().join("servers.json")
}

/// Directory for rolling Project Server log files
pub fn log_dir() -> PathBuf {
  default_data_dir().join("logs")
}

/// Directory where engine scripts are materialized before execution
pub fn default_scripts_dir() -> PathBuf {
  default_data_dir().join("scripts")
}
