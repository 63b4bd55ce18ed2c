use std::fmt;

/// Lifecycle of a worker version.
///
/// Transitions are driven by the host, never by page code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activating,
  Activated,
  /// Failed to install, or replaced
  Redundant,
}

impl WorkerState {
  pub fn can_transition_to(self, next: WorkerState) -> bool {
    use WorkerState::*;
    matches!(
      (self, next),
      (Parsed, Installing)
        | (Installing, Installed)
        | (Installing, Redundant)
        | (Installed, Activating)
        | (Installed, Redundant)
        | (Activating, Activated)
        | (Activating, Redundant)
        | (Activated, Redundant)
    )
  }

  /// Only an active worker sees fetches.
  pub fn can_intercept_fetch(self) -> bool {
    self == WorkerState::Activated
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
