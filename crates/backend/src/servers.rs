//! On-disk registry of running Project Servers.
//!
//! `servers.json` is shared by every broker process on the machine and is the
//! only way an `open` call learns that a server for a project already runs.
//! Each read-modify-write happens under a lock file and the new content is
//! written to a temp file and renamed into place, so readers never observe a
//! half-written registry.
//!
//! ```json
//! {
//!   "servers": {
//!     "model-3f2a9c1b0d4e": {
//!       "projectId": "model-3f2a9c1b0d4e", "projectPath": "C:\\models\\model.ver",
//!       "projectName": "model.ver", "port": 7100, "pid": 4242,
//!       "startTime": "2026-03-01T09:30:00Z", "status": "ready"
//!     }
//!   },
//!   "nextPort": 7101
//! }
//! ```

use std::{
  collections::BTreeMap,
  io::ErrorKind as IoErrorKind,
  path::{Path, PathBuf},
  time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{
  dirs,
  domain::{
    config::Config,
    project::{ProjectId, ProjectMetadata},
  },
  error::ErrorKind,
};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// A lock file older than this belongs to a crashed process
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_RETRY: Duration = Duration::from_millis(20);

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
  Starting,
  Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
  pub project_id: ProjectId,
  pub project_path: String,
  pub project_name: String,
  pub port: u16,
  pub pid: u32,
  pub start_time: DateTime<Utc>,
  pub status: ServerStatus,
}

impl ServerEntry {
  pub fn new(project: &ProjectMetadata, port: u16, pid: u32, status: ServerStatus) -> Self {
    Self {
      project_id: project.id.clone(),
      project_path: project.path.display().to_string(),
      project_name: project.name.clone(),
      port,
      pid,
      start_time: Utc::now(),
      status,
    }
  }

  pub fn is_alive(&self) -> bool {
    pid_alive(self.pid)
  }
}

/// Outcome of [`ServerRegistry::reserve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
  /// A live server (ready or still starting) already owns the project
  Existing(ServerEntry),
  /// The caller owns the project's entry and should start a server on this port
  Reserved(u16),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RegistryFile {
  servers: BTreeMap<String, ServerEntry>,
  next_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("registry I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("registry serialization error: {0}")]
  Serde(#[from] serde_json::Error),
  #[error("timed out waiting for registry lock {}", path.display())]
  LockTimeout { path: PathBuf },
  #[error("no free port at or above {start}")]
  NoFreePort { start: u16 },
}

impl RegistryError {
  /// Corrupt content never gets here: it is recovered as an empty registry
  pub fn kind(&self) -> ErrorKind {
    match self {
      RegistryError::LockTimeout { .. } => ErrorKind::Timeout,
      RegistryError::Io(_) | RegistryError::Serde(_) | RegistryError::NoFreePort { .. } => ErrorKind::Internal,
    }
  }
}

// ============================================================================
// Lock
// ============================================================================

/// Exclusive registry lock, released on drop
struct RegistryLock {
  path: PathBuf,
}

impl RegistryLock {
  async fn acquire(path: &Path) -> Result<Self, RegistryError> {
    let started = Instant::now();
    loop {
      match tokio::fs::OpenOptions::new().write(true).create_new(true).open(path).await {
        Ok(mut file) => {
          let _ = file.write_all(std::process::id().to_string().as_bytes()).await;
          return Ok(Self { path: path.to_path_buf() });
        }
        Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
          if lock_is_stale(path).await {
            warn!(path = %path.display(), "Breaking stale registry lock");
            let _ = tokio::fs::remove_file(path).await;
            continue;
          }
          if started.elapsed() > LOCK_TIMEOUT {
            return Err(RegistryError::LockTimeout { path: path.to_path_buf() });
          }
          tokio::time::sleep(LOCK_RETRY).await;
        }
        Err(e) => return Err(e.into()),
      }
    }
  }
}

impl Drop for RegistryLock {
  fn drop(&mut self) {
    if let Err(e) = std::fs::remove_file(&self.path) {
      warn!(path = %self.path.display(), error = %e, "Failed to release registry lock");
    }
  }
}

async fn lock_is_stale(path: &Path) -> bool {
  let Ok(meta) = tokio::fs::metadata(path).await else {
    return false;
  };
  meta
    .modified()
    .ok()
    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
    .is_some_and(|age| age > LOCK_STALE_AFTER)
}

// ============================================================================
// ServerRegistry
// ============================================================================

pub struct ServerRegistry {
  path: PathBuf,
  lock_path: PathBuf,
  base_port: u16,
}

impl ServerRegistry {
  pub fn new(path: PathBuf, base_port: u16) -> Self {
    let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    lock_name.push(".lock");
    Self {
      lock_path: path.with_file_name(lock_name),
      path,
      base_port,
    }
  }

  /// The machine-wide registry in the data directory
  pub fn open_default(config: &Config) -> Self {
    Self::new(dirs::server_registry_path(), config.server.base_port)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// The live entry for `id`, removing it first if its process is gone
  pub async fn get_live(&self, id: &ProjectId) -> Result<Option<ServerEntry>, RegistryError> {
    self
      .update(|file| {
        let entry = file.servers.get(id.as_str())?.clone();
        if entry.is_alive() {
          return Some(entry);
        }
        warn!(project_id = %id, pid = entry.pid, port = entry.port, "Removing stale server entry");
        file.servers.remove(id.as_str());
        None
      })
      .await
  }

  /// Atomically either find the live server for `project` or claim a port
  /// for a new one.
  ///
  /// The claim is recorded as a `starting` entry owned by `owner_pid`, so a
  /// concurrent opener sees it and waits instead of spawning a second server.
  pub async fn reserve(
    &self,
    project: &ProjectMetadata,
    host: &str,
    owner_pid: u32,
  ) -> Result<Reservation, RegistryError> {
    let base_port = self.base_port;
    self
      .update(|file| {
        if let Some(entry) = file.servers.get(project.id.as_str()) {
          if entry.is_alive() {
            return Ok(Reservation::Existing(entry.clone()));
          }
          warn!(project_id = %project.id, pid = entry.pid, port = entry.port, "Replacing stale server entry");
          file.servers.remove(project.id.as_str());
        }

        let port = next_free_port(file, base_port, host)?;
        file.servers.insert(
          project.id.to_string(),
          ServerEntry::new(project, port, owner_pid, ServerStatus::Starting),
        );
        Ok(Reservation::Reserved(port))
      })
      .await?
  }

  /// Insert or replace the entry for a project.
  ///
  /// A `starting` entry never overwrites a `ready` entry of the same process,
  /// since the server may register itself before its launcher gets here.
  pub async fn register(&self, entry: ServerEntry) -> Result<(), RegistryError> {
    self
      .update(|file| {
        let key = entry.project_id.to_string();
        if let Some(existing) = file.servers.get(&key)
          && existing.pid == entry.pid
          && existing.status == ServerStatus::Ready
          && entry.status == ServerStatus::Starting
        {
          return;
        }
        info!(project_id = %entry.project_id, port = entry.port, pid = entry.pid, status = ?entry.status, "Registering server");
        file.servers.insert(key, entry);
      })
      .await
  }

  /// Remove the entry for `id`; with `pid`, only if it still belongs to that process
  pub async fn remove(&self, id: &ProjectId, pid: Option<u32>) -> Result<bool, RegistryError> {
    self
      .update(|file| {
        let matches = file
          .servers
          .get(id.as_str())
          .is_some_and(|entry| pid.is_none_or(|pid| entry.pid == pid));
        if matches {
          file.servers.remove(id.as_str());
        }
        matches
      })
      .await
  }

  /// All entries with their liveness
  pub async fn list(&self) -> Result<Vec<(ServerEntry, bool)>, RegistryError> {
    let _lock = self.lock().await?;
    let file = self.load().await;
    Ok(
      file
        .servers
        .into_values()
        .map(|entry| {
          let alive = entry.is_alive();
          (entry, alive)
        })
        .collect(),
    )
  }

  /// Drop every entry whose process is gone; returns what was removed
  pub async fn prune(&self) -> Result<Vec<ServerEntry>, RegistryError> {
    self
      .update(|file| {
        let stale: Vec<String> = file
          .servers
          .iter()
          .filter(|(_, entry)| !entry.is_alive())
          .map(|(key, _)| key.clone())
          .collect();
        stale.iter().filter_map(|key| file.servers.remove(key)).collect()
      })
      .await
  }

  // ==========================================================================
  // File handling
  // ==========================================================================

  async fn lock(&self) -> Result<RegistryLock, RegistryError> {
    if let Some(parent) = self.path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    RegistryLock::acquire(&self.lock_path).await
  }

  async fn update<T>(&self, f: impl FnOnce(&mut RegistryFile) -> T) -> Result<T, RegistryError> {
    let _lock = self.lock().await?;
    let mut file = self.load().await;
    let result = f(&mut file);
    self.store(&file).await?;
    Ok(result)
  }

  /// Read the registry; a missing or unreadable file is an empty registry
  async fn load(&self) -> RegistryFile {
    let content = match tokio::fs::read_to_string(&self.path).await {
      Ok(content) => content,
      Err(e) if e.kind() == IoErrorKind::NotFound => return RegistryFile::default(),
      Err(e) => {
        warn!(path = %self.path.display(), error = %e, "Failed to read server registry");
        return RegistryFile::default();
      }
    };

    if content.trim().is_empty() {
      return RegistryFile::default();
    }

    match serde_json::from_str(&content) {
      Ok(file) => file,
      Err(e) => {
        warn!(
          path = %self.path.display(),
          error = %e,
          error_kind = %ErrorKind::RegistryCorruption,
          "Server registry is corrupt, starting from an empty registry"
        );
        RegistryFile::default()
      }
    }
  }

  async fn store(&self, file: &RegistryFile) -> Result<(), RegistryError> {
    let data = serde_json::to_vec_pretty(file)?;
    let mut tmp_name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = self.path.with_file_name(tmp_name);

    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(&data).await?;
    f.flush().await?;
    drop(f);
    tokio::fs::rename(&tmp, &self.path).await?;
    Ok(())
  }
}

fn next_free_port(file: &mut RegistryFile, base_port: u16, host: &str) -> Result<u16, RegistryError> {
  let start = file.next_port.unwrap_or(base_port).max(base_port);
  let mut port = start;
  loop {
    let taken = file.servers.values().any(|s| s.port == port);
    if !taken && port_is_free(host, port) {
      break;
    }
    debug!(port, "Port unavailable, trying next");
    port = port.checked_add(1).ok_or(RegistryError::NoFreePort { start })?;
  }
  file.next_port = Some(port.checked_add(1).unwrap_or(base_port));
  Ok(port)
}

fn port_is_free(host: &str, port: u16) -> bool {
  std::net::TcpListener::bind((host, port)).is_ok()
}

// ============================================================================
// Process liveness
// ============================================================================

/// Zero-signal liveness probe
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
  let Ok(pid) = libc::pid_t::try_from(pid) else {
    return false;
  };
  if pid <= 0 {
    return false;
  }
  // SAFETY: signal 0 performs error checking only; nothing is delivered
  let rc = unsafe { libc::kill(pid, 0) };
  rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn pid_alive(pid: u32) -> bool {
  use windows_sys::Win32::{
    Foundation::{CloseHandle, STILL_ACTIVE},
    System::Threading::{GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION},
  };

  // SAFETY: the handle is checked for null and closed before returning
  unsafe {
    let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
    if handle.is_null() {
      return false;
    }
    let mut code = 0u32;
    let ok = GetExitCodeProcess(handle, &mut code);
    CloseHandle(handle);
    ok != 0 && code == STILL_ACTIVE as u32
  }
}

/// Ask a process to terminate; with `force`, kill it and its process group
#[cfg(unix)]
pub fn terminate_pid(pid: u32, force: bool) -> bool {
  let Ok(pid) = libc::pid_t::try_from(pid) else {
    return false;
  };
  if pid <= 0 {
    return false;
  }
  // SAFETY: plain signal delivery to a pid we were told about
  unsafe {
    if force {
      libc::kill(-pid, libc::SIGKILL);
      libc::kill(pid, libc::SIGKILL) == 0
    } else {
      libc::kill(pid, libc::SIGTERM) == 0
    }
  }
}

#[cfg(windows)]
pub fn terminate_pid(pid: u32, _force: bool) -> bool {
  use windows_sys::Win32::{
    Foundation::CloseHandle,
    System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess},
  };

  // SAFETY: the handle is checked for null and closed before returning
  unsafe {
    let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
    if handle.is_null() {
      return false;
    }
    let ok = TerminateProcess(handle, 1);
    CloseHandle(handle);
    ok != 0
  }
}
