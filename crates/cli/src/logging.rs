//! Logging setup for CLI commands and project servers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use vbroker::{config::Config, project::ProjectMetadata};

/// Initialize logging for CLI commands.
///
/// Logs go to stderr; stdout is reserved for JSON results.
pub fn init_cli_logging() {
  let env_filter = EnvFilter::builder()
    .with_default_directive(tracing::Level::WARN.into())
    .from_env_lossy();

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .init();
}

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// Initialize logging for a project server.
///
/// In foreground mode: console (stderr) with colors
/// In background mode: rolling file `logs/server-<projectId>.log`, no ANSI.
/// Stderr then only carries the readiness line.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_server_logging(project_path: &Path, foreground: bool) -> Option<WorkerGuard> {
  let project = ProjectMetadata::from_path(project_path);
  let config = Config::load_for_project(&project.path);
  let level = parse_log_level(&config.logging.log_level);

  // Build env filter (allows RUST_LOG override)
  let env_filter = EnvFilter::builder()
    .with_default_directive(level.into())
    .from_env_lossy();

  if foreground {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .with_writer(std::io::stderr)
      .init();
    return None;
  }

  let log_dir = vbroker::dirs::log_dir();
  if std::fs::create_dir_all(&log_dir).is_err() {
    // Without a log directory, stay silent rather than pollute stderr
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_writer(std::io::sink)
      .init();
    return None;
  }

  let file_name = format!("server-{}.log", project.id);
  let file_appender = match config.logging.log_rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(&log_dir, &file_name),
    "never" => tracing_appender::rolling::never(&log_dir, &file_name),
    _ => tracing_appender::rolling::daily(&log_dir, &file_name),
  };

  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
