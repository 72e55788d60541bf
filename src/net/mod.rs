//! Network boundary: request/response values and the client the cache falls back to.

mod client;
mod types;

use std::future::Future;

pub use client::HttpNetwork;
pub use types::{Request, RequestMode, Response, ResponseType};

use crate::error::NetworkError;

/// How a fetch interacts with intermediate HTTP caches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
  #[default]
  Default,
  /// Revalidate with the origin instead of accepting a cached copy
  Reload,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
  pub cache: CacheMode,
}

impl FetchOptions {
  pub fn reload() -> Self {
    Self {
      cache: CacheMode::Reload,
    }
  }
}

/// Anything that can turn a request into a response.
///
/// Implementations classify responses (`basic` / `cors` / `opaque`) relative to the origin
/// they serve.
pub trait Network: Send + Sync {
  fn fetch(
    &self,
    request: &Request,
    options: FetchOptions,
  ) -> impl Future<Output = Result<Response, NetworkError>> + Send;
}
