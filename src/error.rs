//! Failure kinds reported by the lifecycle hooks and the network boundary.
//!
//! Plumbing (config, storage) reports through `color_eyre::Report`. The kinds below are the ones a
//! caller may want to tell apart; lifecycle operations wrap them in a report, so recover them with
//! `report.downcast_ref::<WorkerError>()`.

use thiserror::Error;

use crate::worker::lifecycle::WorkerState;

/// Errors produced by a [`Network`](crate::net::Network) implementation.
#[derive(Error, Debug)]
pub enum NetworkError {
  /// Connection, DNS, TLS or timeout failure.
  #[error("request to {url} failed: {source}")]
  Transport {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  /// Cross-origin response without an `Access-Control-Allow-Origin` covering this origin.
  #[error("cross-origin response from {0} is not shared with this origin")]
  CorsRejected(String),

  /// A `same-origin` request pointed somewhere else.
  #[error("same-origin request to {0} leaves the serving origin")]
  ModeViolation(String),

  /// No connection could be made to the host (refused, unreachable, name resolution).
  #[error("network unavailable for {0}")]
  Unavailable(String),
}

/// Errors from the install, fetch and activate hooks.
#[derive(Error, Debug)]
pub enum WorkerError {
  /// A manifest entry was unreachable or answered with a non-success status.
  #[error("manifest entry {url} could not be cached: {reason}")]
  ManifestFetch { url: String, reason: String },

  /// A runtime fetch failed and nothing cached could stand in for it.
  #[error("fetch of {url} failed with no cached copy: {source}")]
  NetworkFetch {
    url: String,
    #[source]
    source: NetworkError,
  },

  /// A stale store could not be deleted during rollover.
  #[error("failed to delete cache store {store}: {reason}")]
  CacheDeletion { store: String, reason: String },

  #[error("invalid worker transition from {from} to {to}")]
  Lifecycle { from: WorkerState, to: WorkerState },
}
