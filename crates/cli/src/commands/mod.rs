//! CLI command implementations
//!
//! Every command prints one JSON document on stdout. Failures are printed as
//! `{"success": false, "error": ..., "errorKind": ...}` and exit with status 1.

mod config;
mod project;
mod run;
mod serve;
mod servers;

pub use config::{cmd_config_init, cmd_config_show};
pub use project::{ProjectRequest, cmd_open, cmd_project_request, cmd_stop};
pub use run::cmd_run;
pub use serve::cmd_serve;
pub use servers::cmd_servers;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use vbroker::{LaunchError, channel::ChannelError, error::ErrorKind, servers::RegistryError};

/// Print a value as pretty JSON on stdout
pub(crate) fn print_json(value: &impl Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Error category of a top-level failure, looking through added context
fn error_kind(err: &anyhow::Error) -> ErrorKind {
  if let Some(e) = err.downcast_ref::<LaunchError>() {
    e.kind()
  } else if let Some(e) = err.downcast_ref::<ChannelError>() {
    e.kind()
  } else if let Some(e) = err.downcast_ref::<RegistryError>() {
    e.kind()
  } else {
    ErrorKind::Internal
  }
}

/// Print a top-level error as structured JSON
pub fn report_error(err: &anyhow::Error) {
  let kind = error_kind(err);

  let body = json!({
    "success": false,
    "error": format!("{err:#}"),
    "errorKind": kind,
  });
  println!("{body}");
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use anyhow::Context;

  use super::*;

  #[test]
  fn test_client_timeout_keeps_its_kind() {
    let err = Err::<(), _>(ChannelError::Timeout { timeout_ms: 5000 })
      .context("Request failed")
      .unwrap_err();
    assert_eq!(error_kind(&err), ErrorKind::Timeout);

    let err = anyhow::Error::new(ChannelError::Connection("reset".into())).context("Request failed");
    assert_eq!(error_kind(&err), ErrorKind::InstanceUnhealthy);
  }

  #[test]
  fn test_registry_errors_are_not_corruption() {
    let lock = anyhow::Error::new(RegistryError::LockTimeout {
      path: PathBuf::from("servers.json.lock"),
    })
    .context("Failed to read server registry");
    assert_eq!(error_kind(&lock), ErrorKind::Timeout);

    let io = anyhow::Error::new(RegistryError::Io(std::io::Error::other("disk full")));
    assert_eq!(error_kind(&io), ErrorKind::Internal);

    let launch = anyhow::Error::new(LaunchError::Registry(RegistryError::LockTimeout {
      path: PathBuf::from("servers.json.lock"),
    }));
    assert_eq!(error_kind(&launch), ErrorKind::Timeout);
  }

  #[test]
  fn test_unknown_errors_are_internal() {
    assert_eq!(error_kind(&anyhow::anyhow!("boom")), ErrorKind::Internal);
  }
}
