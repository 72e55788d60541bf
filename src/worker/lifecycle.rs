use std::collections::BTreeMap;
use std::fmt;

use super::manifest::CacheVersion;
use crate::error::WorkerError;

/// Lifecycle of one deployed worker version.
///
/// `Installing → Installed → Activating → Activated`. A failed install and a superseded worker
/// both end in `Redundant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Installed,
  Activating,
  Activated,
  Redundant,
}

impl WorkerState {
  pub fn can_transition_to(self, next: WorkerState) -> bool {
    use WorkerState::*;
    matches!(
      (self, next),
      (Installing, Installed)
        | (Installing, Redundant)
        | (Installed, Activating)
        | (Installed, Redundant)
        | (Activating, Activated)
        | (Activated, Redundant)
    )
  }

  pub fn transition(self, next: WorkerState) -> Result<WorkerState, WorkerError> {
    if self.can_transition_to(next) {
      Ok(next)
    } else {
      Err(WorkerError::Lifecycle {
        from: self,
        to: next,
      })
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "client-{}", self.0)
  }
}

/// Open client sessions (tabs) and the version controlling each.
#[derive(Debug, Default)]
pub struct Clients {
  next_id: u64,
  sessions: BTreeMap<ClientId, Option<CacheVersion>>,
}

impl Clients {
  pub fn connect(&mut self, controller: Option<&CacheVersion>) -> ClientId {
    self.next_id += 1;
    let id = ClientId(self.next_id);
    self.sessions.insert(id, controller.cloned());
    id
  }

  /// Returns whether the session existed.
  pub fn disconnect(&mut self, id: ClientId) -> bool {
    self.sessions.remove(&id).is_some()
  }

  pub fn controller(&self, id: ClientId) -> Option<&CacheVersion> {
    self.sessions.get(&id).and_then(Option::as_ref)
  }

  pub fn controlled_by(&self, version: &CacheVersion) -> usize {
    self
      .sessions
      .values()
      .filter(|c| c.as_ref() == Some(version))
      .count()
  }

  /// Put every session under `version`. Returns how many changed controller.
  pub fn claim(&mut self, version: &CacheVersion) -> usize {
    let mut changed = 0;
    for controller in self.sessions.values_mut() {
      if controller.as_ref() != Some(version) {
        *controller = Some(version.clone());
        changed += 1;
      }
    }
    changed
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }
}
