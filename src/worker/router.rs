//! Request interception: pass-through, cache-first, network-fallback.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, error, warn};
use url::Url;

use super::manifest::CacheVersion;
use crate::cache::{CacheStorage, CachedResponse, RequestKey};
use crate::error::WorkerError;
use crate::net::{FetchOptions, Network, Request, Response};

/// How exclusion patterns are matched against a request's hostname
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMatch {
  /// Pattern appears anywhere in the hostname
  #[default]
  Substring,
  /// Hostname equals the pattern or is a subdomain of it
  Suffix,
}

/// Backends that must never be intercepted (real-time sync, push channels).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Exclusions {
  #[serde(default, deserialize_with = "deserialize_lowercase_vec")]
  pub hosts: Vec<String>,
  #[serde(default, rename = "match")]
  pub host_match: HostMatch,
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  let hosts: Vec<String> = v.into_iter().map(|s| s.trim().to_lowercase()).collect();
  if hosts.iter().any(String::is_empty) {
    return Err(serde::de::Error::custom(
      "exclusion host patterns must not be blank",
    ));
  }
  Ok(hosts)
}

impl Exclusions {
  pub fn new<I, T>(hosts: I, host_match: HostMatch) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<String>,
  {
    Self {
      hosts: hosts
        .into_iter()
        .map(|h| {
          let h: String = h.into();
          h.trim().to_lowercase()
        })
        .filter(|h| !h.is_empty())
        .collect(),
      host_match,
    }
  }

  pub fn matches(&self, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
      return false;
    };
    // A blank pattern would match every host
    self
      .hosts
      .iter()
      .filter(|pattern| !pattern.is_empty())
      .any(|pattern| match self.host_match {
        HostMatch::Substring => host.contains(pattern.as_str()),
        HostMatch::Suffix => {
          host == pattern
            || host
              .strip_suffix(pattern.as_str())
              .is_some_and(|rest| rest.ends_with('.'))
        }
      })
  }
}

/// Everything the router needs to know about the active deployment.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
  origin: Url,
  manifest: Vec<Url>,
  manifest_set: HashSet<String>,
  exclusions: Exclusions,
  offline_fallback: Option<Url>,
}

impl RoutePolicy {
  pub fn new(
    origin: Url,
    manifest: Vec<Url>,
    exclusions: Exclusions,
    offline_fallback: Option<Url>,
  ) -> Self {
    let manifest_set = manifest.iter().map(|u| u.as_str().to_string()).collect();
    Self {
      origin,
      manifest,
      manifest_set,
      exclusions,
      offline_fallback,
    }
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn manifest(&self) -> &[Url] {
    &self.manifest
  }

  pub fn offline_fallback(&self) -> Option<&Url> {
    self.offline_fallback.as_ref()
  }

  pub fn in_manifest(&self, url: &Url) -> bool {
    let mut url = url.clone();
    url.set_fragment(None);
    self.manifest_set.contains(url.as_str())
  }

  fn same_host(&self, url: &Url) -> bool {
    url.host_str() == self.origin.host_str()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThroughReason {
  NonGet,
  /// Another host, and not part of the manifest
  CrossOrigin,
  Excluded,
  /// No active version yet
  NoController,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  PassThrough(PassThroughReason),
  Intercept,
}

/// Decide whether a request is handled by the cache at all.
pub fn classify(request: &Request, policy: &RoutePolicy) -> Disposition {
  if !request.is_get() {
    return Disposition::PassThrough(PassThroughReason::NonGet);
  }

  // Applies to same-origin requests too
  if policy.exclusions.matches(&request.url) {
    return Disposition::PassThrough(PassThroughReason::Excluded);
  }

  if !policy.same_host(&request.url) && !policy.in_manifest(&request.url) {
    return Disposition::PassThrough(PassThroughReason::CrossOrigin);
  }

  Disposition::Intercept
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Cache,
  Network,
  /// Offline placeholder served after a failed navigation
  Fallback,
  /// Not intercepted, straight from the network
  PassThrough,
}

/// Result of handling a request, including where the response came from.
#[derive(Debug)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn fallback(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::Fallback,
      cached_at: Some(cached.cached_at),
    }
  }

  pub fn pass_through(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::PassThrough,
      cached_at: None,
    }
  }
}

/// Only readable 200s are worth keeping.
pub fn is_cacheable(response: &Response) -> bool {
  response.status() == StatusCode::OK && response.response_type().is_readable()
}

/// Serve an intercepted request cache-first, falling back to the network.
///
/// 1. Look the request up in `store` - a hit returns immediately, no network access
/// 2. On a miss, fetch from the network
/// 3. Store a duplicate of a cacheable response, then return the original. A store deleted in the
///    meantime is not recreated
/// 4. On network failure, serve the offline fallback to navigations, otherwise fail
pub async fn on_fetch<S: CacheStorage, N: Network>(
  request: &Request,
  storage: &S,
  store: &CacheVersion,
  network: &N,
  policy: &RoutePolicy,
) -> Result<Served, WorkerError> {
  let key = RequestKey::for_request(request);

  match storage.match_entry(store.as_str(), &key) {
    Ok(Some(cached)) => {
      debug!(url = %request.url, store = %store, "Served from cache");
      return Ok(Served::from_cache(cached));
    }
    Ok(None) => {}
    Err(e) => warn!(url = %request.url, store = %store, error = %e, "Cache lookup failed, treating as miss"),
  }

  match network.fetch(request, FetchOptions::default()).await {
    Ok(response) => {
      if is_cacheable(&response) {
        match storage.put_existing(store.as_str(), &key, response.duplicate()) {
          Ok(true) => {}
          // Rolled over while the fetch was in flight
          Ok(false) => debug!(url = %request.url, store = %store, "Store gone, response not cached"),
          Err(e) => {
            warn!(url = %request.url, store = %store, error = %e, "Failed to cache response")
          }
        }
      } else {
        debug!(
          url = %request.url,
          status = response.status().as_u16(),
          kind = response.response_type().as_str(),
          "Response not cacheable"
        );
      }
      Ok(Served::from_network(response))
    }
    Err(source) => {
      error!(url = %request.url, error = %source, "Fetch failed");

      if let Some(served) = offline_fallback(request, storage, store, policy) {
        return Ok(served);
      }

      Err(WorkerError::NetworkFetch {
        url: request.url.to_string(),
        source,
      })
    }
  }
}

fn offline_fallback<S: CacheStorage>(
  request: &Request,
  storage: &S,
  store: &CacheVersion,
  policy: &RoutePolicy,
) -> Option<Served> {
  if !request.is_navigation() {
    return None;
  }
  let fallback = policy.offline_fallback()?;

  match storage.match_entry(store.as_str(), &RequestKey::get(fallback)) {
    Ok(Some(cached)) => {
      debug!(url = %request.url, fallback = %fallback, "Serving offline fallback");
      Some(Served::fallback(cached))
    }
    Ok(None) => None,
    Err(e) => {
      warn!(fallback = %fallback, error = %e, "Offline fallback lookup failed");
      None
    }
  }
}
