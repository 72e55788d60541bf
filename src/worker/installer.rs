//! Pre-caching of the app shell.

use color_eyre::{eyre::WrapErr, Result};
use futures::future::try_join_all;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use super::manifest::CacheVersion;
use crate::cache::{CacheStorage, RequestKey};
use crate::error::WorkerError;
use crate::net::{FetchOptions, Network, Request, Response};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallOptions {
  /// Revalidate manifest entries with the origin instead of trusting HTTP caches
  pub bypass_http_cache: bool,
  /// Activate as soon as the install completes, without waiting for old clients to close
  pub skip_waiting: bool,
}

impl Default for InstallOptions {
  fn default() -> Self {
    Self {
      bypass_http_cache: true,
      skip_waiting: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub version: CacheVersion,
  pub stored: usize,
}

/// Fetch every manifest URL and store the responses under `version`.
///
/// All-or-nothing: the first unreachable entry, non-2xx status or opaque response fails the install,
/// and then no store is created for `version`.
pub async fn on_install<S: CacheStorage, N: Network>(
  storage: &S,
  network: &N,
  version: &CacheVersion,
  manifest: &[Url],
  options: &InstallOptions,
) -> Result<InstallReport> {
  info!(version = %version, entries = manifest.len(), "Pre-caching app shell");

  let fetch_options = if options.bypass_http_cache {
    FetchOptions::reload()
  } else {
    FetchOptions::default()
  };

  let entries = try_join_all(
    manifest
      .iter()
      .map(|url| fetch_entry(network, url, fetch_options)),
  )
  .await?;

  let stored = entries.len();
  storage
    .put_all(version.as_str(), entries)
    .wrap_err_with(|| format!("Failed to write cache store {}", version))?;

  info!(version = %version, stored, "App shell cached");

  Ok(InstallReport {
    version: version.clone(),
    stored,
  })
}

async fn fetch_entry<N: Network>(
  network: &N,
  url: &Url,
  options: FetchOptions,
) -> Result<(RequestKey, Response), WorkerError> {
  let request = Request::get(url.clone());

  let response = network.fetch(&request, options).await.map_err(|e| {
    warn!(url = %url, error = %e, "Manifest entry unreachable");
    WorkerError::ManifestFetch {
      url: url.to_string(),
      reason: e.to_string(),
    }
  })?;

  if !response.is_ok() {
    warn!(url = %url, status = response.status().as_u16(), "Manifest entry not ok");
    return Err(WorkerError::ManifestFetch {
      url: url.to_string(),
      reason: format!("status {}", response.status()),
    });
  }

  if !response.response_type().is_readable() {
    warn!(url = %url, kind = response.response_type().as_str(), "Manifest entry not readable");
    return Err(WorkerError::ManifestFetch {
      url: url.to_string(),
      reason: format!("{} response", response.response_type().as_str()),
    });
  }

  Ok((RequestKey::for_request(&request), response))
}
