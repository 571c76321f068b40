use serde::{Deserialize, Serialize};

/// Failure categories surfaced to callers.
///
/// Every failed response carries one of these next to its human-readable
/// message so clients can branch without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
  /// The engine process could not be started
  SpawnFailure,
  /// A command or startup exceeded its time budget
  Timeout,
  /// The engine answered, but no JSON object could be found in its output
  MalformedResponse,
  /// The engine ran the command and reported a failure
  EngineReportedError,
  /// The instance failed too often and was not restarted
  InstanceUnhealthy,
  /// The on-disk server registry could not be parsed
  RegistryCorruption,
  /// The engine process went away while a command was outstanding
  ProcessExited,
  /// The request itself could not be understood
  InvalidRequest,
  Internal,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::SpawnFailure => "SpawnFailure",
      ErrorKind::Timeout => "Timeout",
      ErrorKind::MalformedResponse => "MalformedResponse",
      ErrorKind::EngineReportedError => "EngineReportedError",
      ErrorKind::InstanceUnhealthy => "InstanceUnhealthy",
      ErrorKind::RegistryCorruption => "RegistryCorruption",
      ErrorKind::ProcessExited => "ProcessExited",
      ErrorKind::InvalidRequest => "InvalidRequest",
      ErrorKind::Internal => "Internal",
    }
  }
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_kind_serializes_as_name() {
    let json = serde_json::to_string(&ErrorKind::MalformedResponse).expect("serialize");
    assert_eq!(json, "\"MalformedResponse\"");
    assert_eq!(ErrorKind::Timeout.to_string(), "Timeout");
  }
}
