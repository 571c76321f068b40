mod actor;
mod server;

mod domain;
pub use domain::{config, project};

pub mod channel;
pub mod dirs;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod servers;

mod daemon;
pub use daemon::{Daemon, LaunchError, OpenedProject, READY_PREFIX, RuntimeConfig, ServerLauncher, StopOutcome};

#[cfg(test)]
mod __tests__;
