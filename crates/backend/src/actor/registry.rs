//! InstanceRegistry - one engine instance per project, started on demand
//!
//! The registry maps project ids to their [`InstanceActor`]. Each entry is a
//! `OnceCell` slot: the first caller for a project launches the engine while
//! every concurrent caller for the same project waits on the same cell, so a
//! burst of requests never starts a second engine.
//!
//! Engine startup can take minutes. The DashMap shard lock is only held long
//! enough to clone the slot; the launch itself runs outside of it, so other
//! projects are never blocked by a slow load.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InstanceRegistry::new(launcher, settings, cancel);
//! let handle = registry.get_or_create(&ProjectMetadata::from_path(path)).await?;
//! let response = handle.submit(Command::query("result = Visum.Net.Nodes.Count")).await?;
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
  handle::InstanceHandle,
  instance::{CapabilityCache, InstanceActor, InstanceActorConfig, InstanceError, capability_cache},
  message::InstanceState,
};
use crate::{
  domain::{
    config::BrokerSettings,
    project::{ProjectId, ProjectMetadata},
  },
  engine::EngineLauncher,
  error::ErrorKind,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum InstanceRegistryError {
  #[error("Failed to start engine instance: {0}")]
  SpawnFailed(#[source] InstanceError),
  #[error("Instance {0} was shut down while starting")]
  ShutDown(ProjectId),
}

impl InstanceRegistryError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      InstanceRegistryError::SpawnFailed(e) => e.kind(),
      InstanceRegistryError::ShutDown(_) => ErrorKind::InstanceUnhealthy,
    }
  }
}

// ============================================================================
// InstanceRegistry
// ============================================================================

type Slot = Arc<OnceCell<InstanceHandle>>;

/// Owns every running instance of this process.
///
/// Constructed once at startup and shared via `Arc`; there is no global.
pub struct InstanceRegistry {
  instances: DashMap<ProjectId, Slot>,
  launcher: Arc<dyn EngineLauncher>,
  settings: Arc<BrokerSettings>,
  /// Capability probe results, shared across instances with the same engine version
  capabilities: CapabilityCache,
  /// Parent token; each actor gets a child
  cancel: CancellationToken,
}

impl InstanceRegistry {
  pub fn new(launcher: Arc<dyn EngineLauncher>, settings: BrokerSettings, cancel: CancellationToken) -> Self {
    Self {
      instances: DashMap::new(),
      launcher,
      settings: Arc::new(settings),
      capabilities: capability_cache(),
      cancel,
    }
  }

  /// Return the running instance for `project`, starting it if needed.
  ///
  /// Blocks until the engine is ready (or failed to start). Instances that
  /// have stopped are replaced by a fresh one.
  pub async fn get_or_create(&self, project: &ProjectMetadata) -> Result<InstanceHandle, InstanceRegistryError> {
    loop {
      let slot: Slot = self.instances.entry(project.id.clone()).or_default().value().clone();

      let handle = slot
        .get_or_try_init(|| self.spawn(project))
        .await
        .map_err(InstanceRegistryError::SpawnFailed)?
        .clone();

      let still_registered = self
        .instances
        .get(&project.id)
        .is_some_and(|current| Arc::ptr_eq(current.value(), &slot));

      if !still_registered {
        // shutdown() ran while we were starting; nobody can reach this instance
        warn!(project_id = %project.id, "Instance removed while starting, stopping it");
        handle.shutdown().await;
        return Err(InstanceRegistryError::ShutDown(project.id.clone()));
      }

      if handle.is_closed() || handle.state() == InstanceState::Shutdown {
        debug!(project_id = %project.id, "Dropping stopped instance");
        self.instances.remove_if(&project.id, |_, current| Arc::ptr_eq(current, &slot));
        continue;
      }

      return Ok(handle);
    }
  }

  async fn spawn(&self, project: &ProjectMetadata) -> Result<InstanceHandle, InstanceError> {
    let config = InstanceActorConfig {
      project: project.clone(),
      settings: Arc::clone(&self.settings),
      launcher: Arc::clone(&self.launcher),
      capabilities: self.capabilities.clone(),
    };
    let handle = InstanceActor::spawn(config, self.cancel.child_token()).await?;
    info!(project_id = %project.id, pid = ?handle.pid(), "Spawned new InstanceActor");
    Ok(handle)
  }

  /// Handles of all live instances (snapshot)
  pub fn handles(&self) -> Vec<InstanceHandle> {
    self
      .instances
      .iter()
      .filter_map(|entry| entry.value().get().cloned())
      .filter(|handle| !handle.is_closed())
      .collect()
  }

  /// Stop one instance and forget it. Unknown ids are a no-op.
  pub async fn shutdown(&self, id: &ProjectId) {
    let Some((_, slot)) = self.instances.remove(id) else {
      debug!(project_id = %id, "No instance to shut down");
      return;
    };

    if let Some(handle) = slot.get() {
      info!(project_id = %id, "Shutting down InstanceActor");
      handle.shutdown().await;
    }
  }

  /// Stop every instance, waiting for all of them
  pub async fn shutdown_all(&self) {
    let ids: Vec<ProjectId> = self.instances.iter().map(|entry| entry.key().clone()).collect();
    if ids.is_empty() {
      return;
    }

    info!(count = ids.len(), "Shutting down all InstanceActors");
    let futures: Vec<_> = ids.iter().map(|id| self.shutdown(id)).collect();
    futures::future::join_all(futures).await;
    info!("All InstanceActors shut down");
  }
}
