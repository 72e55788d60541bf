//! Versioned offline asset cache.
//!
//! An app shell is pre-cached under a named version when a deployment installs. Once active, the
//! version answers intercepted `GET` requests from its cache first and fills misses from the
//! network. Activating a new version deletes every store the old ones left behind.
//!
//! ```no_run
//! # async fn run() -> color_eyre::Result<()> {
//! let config = shellcache::Config::load(None)?;
//! let _guard = shellcache::logging::init(&config.logging)?;
//! let (registration, deployment) = shellcache::bootstrap(&config)?;
//! registration.install(deployment).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod worker;

#[cfg(test)]
mod testing;

use color_eyre::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use cache::{CacheStorage, MemoryStorage, SqliteStorage};
pub use config::Config;
pub use error::{NetworkError, WorkerError};
pub use net::{HttpNetwork, Network, Request, Response};
pub use worker::{Deployment, Registration, ResponseSource, Served, WorkerState};

const IN_MEMORY: &str = ":memory:";

/// Build the registration described by `config`, plus the deployment to install into it.
///
/// A version cached by an earlier run is resumed, so it serves until the deployment installs.
pub fn bootstrap(config: &Config) -> Result<(Registration<SqliteStorage, HttpNetwork>, Deployment)> {
  let storage = match config.storage.path.as_deref() {
    Some(path) if path == Path::new(IN_MEMORY) => SqliteStorage::open_in_memory()?,
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  let network = HttpNetwork::new(&config.http, config.origin.clone())?;

  let registration = Registration::new(config.origin.clone(), Arc::new(storage), network);
  let deployment = config.deployment();
  registration.resume(&deployment)?;

  info!(origin = %config.origin, version = %config.version, "Registration ready");

  Ok((registration, deployment))
}
