//! Version rollover: delete every store the current version does not own.

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::manifest::CacheVersion;
use crate::cache::CacheStorage;
use crate::error::WorkerError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActivateOptions {
  /// Take control of every open client once activated
  pub claim_clients: bool,
  /// Store names to preserve besides the current version
  pub keep: Vec<String>,
}

impl Default for ActivateOptions {
  fn default() -> Self {
    Self {
      claim_clients: true,
      keep: Vec::new(),
    }
  }
}

#[derive(Debug, Default)]
pub struct ActivationReport {
  pub kept: Vec<String>,
  pub deleted: Vec<String>,
  pub failed: Vec<WorkerError>,
}

/// Delete every store except `current` and the names in `keep`.
///
/// Never fails as a whole: each deletion stands alone, and failures are logged and collected in
/// the report.
pub fn on_activate<S: CacheStorage>(
  storage: &S,
  current: &CacheVersion,
  keep: &[String],
) -> ActivationReport {
  let mut report = ActivationReport::default();

  let names = match storage.keys() {
    Ok(names) => names,
    Err(e) => {
      error!(version = %current, error = %e, "Could not enumerate cache stores");
      return report;
    }
  };

  for name in names {
    if name == current.as_str() || keep.contains(&name) {
      report.kept.push(name);
      continue;
    }

    match storage.delete(&name) {
      Ok(true) => {
        info!(store = %name, "Cleared old cache");
        report.deleted.push(name);
      }
      // Gone between listing and deleting
      Ok(false) => debug!(store = %name, "Store already removed"),
      Err(e) => {
        let failure = WorkerError::CacheDeletion {
          store: name,
          reason: format!("{:#}", e),
        };
        warn!(error = %failure, "Rollover continues");
        report.failed.push(failure);
      }
    }
  }

  report
}
