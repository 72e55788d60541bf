//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::net::{Request, Response};

/// Identity of a cached request: method plus URL, fragment excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: Method,
  url: Url,
}

impl RequestKey {
  pub fn new(method: Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self { method, url }
  }

  pub fn get(url: &Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn for_request(request: &Request) -> Self {
    Self::new(request.method.clone(), &request.url)
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A stored response.
#[derive(Debug)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn duplicate(&self) -> Self {
    Self {
      response: self.response.duplicate(),
      cached_at: self.cached_at,
    }
  }
}

/// Named, versioned cache stores.
///
/// A backend holds any number of stores; each store maps [`RequestKey`]s to responses. Writes to
/// an existing key replace it.
pub trait CacheStorage: Send + Sync {
  /// Create the store if it does not exist.
  fn open(&self, name: &str) -> Result<()>;

  fn has(&self, name: &str) -> Result<bool>;

  /// Store names, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Drop a store with all its entries. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Write one entry, creating the store if needed.
  fn put(&self, name: &str, key: &RequestKey, response: Response) -> Result<()>;

  /// Write one entry only if the store still exists. Returns whether it was written.
  fn put_existing(&self, name: &str, key: &RequestKey, response: Response) -> Result<bool>;

  /// Write a batch atomically: afterwards either the store holds every entry, or nothing changed.
  fn put_all(&self, name: &str, entries: Vec<(RequestKey, Response)>) -> Result<()>;

  /// Keys held by a store, empty when the store does not exist.
  fn entries(&self, name: &str) -> Result<Vec<RequestKey>>;
}
