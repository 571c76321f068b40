use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Resolve a project file path to an absolute, symlink-free form.
///
/// Falls back to a lexically absolute path when the file does not exist
/// (canonicalize requires the target to be present).
pub fn resolve_project_path(path: &Path) -> PathBuf {
  path
    .canonicalize()
    .or_else(|_| std::path::absolute(path))
    .unwrap_or_else(|_| path.to_path_buf())
}

/// Stable identity of a Visum project file.
///
/// Derived from the absolute path and the file's base name, so opening the
/// same file through different relative paths maps to the same id while two
/// different files never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
  /// Create a ProjectId from a project file path
  pub fn from_path(path: &Path) -> Self {
    let resolved = resolve_project_path(path);
    Self::from_resolved(&resolved)
  }

  fn from_resolved(path: &Path) -> Self {
    let stem = path
      .file_stem()
      .map(|s| s.to_string_lossy().to_string())
      .unwrap_or_else(|| "project".to_string());

    let hash = Self::hash_path(path);
    ProjectId(format!("{}-{}", sanitize(&stem), &hash[..12]))
  }

  fn hash_path(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for ProjectId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for ProjectId {
  fn from(s: &str) -> Self {
    ProjectId(s.to_string())
  }
}

fn sanitize(stem: &str) -> String {
  let cleaned: String = stem
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .take(40)
    .collect();

  if cleaned.is_empty() { "project".to_string() } else { cleaned }
}

/// Everything the broker knows about a project before an engine is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectMetadata {
  pub id: ProjectId,
  pub path: PathBuf,
  pub name: String,
}

impl ProjectMetadata {
  pub fn from_path(path: &Path) -> Self {
    let resolved = resolve_project_path(path);
    let name = resolved
      .file_name()
      .map(|n| n.to_string_lossy().to_string())
      .unwrap_or_else(|| resolved.to_string_lossy().to_string());

    Self {
      id: ProjectId::from_resolved(&resolved),
      path: resolved,
      name,
    }
  }
}

/// Coarse network size reported by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkStats {
  pub nodes: u64,
  pub links: u64,
  pub zones: u64,
}

impl NetworkStats {
  /// Pull `{nodes, links, zones}` out of an engine payload, if present
  pub fn from_value(value: &serde_json::Value) -> Option<Self> {
    let obj = value.as_object()?;
    if !obj.contains_key("nodes") && !obj.contains_key("links") && !obj.contains_key("zones") {
      return None;
    }
    serde_json::from_value(value.clone()).ok()
  }
}
