//! Test doubles shared by the unit tests.

use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use url::Url;

use crate::cache::{CacheStorage, CachedResponse, MemoryStorage, RequestKey};
use crate::error::NetworkError;
use crate::net::{CacheMode, FetchOptions, Network, Request, Response, ResponseType};

pub fn url(s: &str) -> Url {
  Url::parse(s).unwrap()
}

#[derive(Debug, Clone)]
enum Route {
  Respond {
    status: u16,
    kind: ResponseType,
    body: String,
  },
  /// Answers 200 once released
  Held {
    body: String,
    release: Arc<Notify>,
  },
  Fail,
}

#[derive(Default)]
struct FakeState {
  routes: HashMap<String, Route>,
  calls: Vec<(String, CacheMode)>,
}

/// Scripted network: every URL must be registered, anything else is unreachable.
#[derive(Default)]
pub struct FakeNetwork {
  state: Mutex<FakeState>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, target: &str, status: u16, body: &str) {
    self.respond_with(target, status, ResponseType::Basic, body);
  }

  pub fn respond_with(&self, target: &str, status: u16, kind: ResponseType, body: &str) {
    self.route(
      target,
      Route::Respond {
        status,
        kind,
        body: body.to_string(),
      },
    );
  }

  /// Park fetches of `target` until the returned handle is notified.
  pub fn hold(&self, target: &str, body: &str) -> Arc<Notify> {
    let release = Arc::new(Notify::new());
    self.route(
      target,
      Route::Held {
        body: body.to_string(),
        release: Arc::clone(&release),
      },
    );
    release
  }

  /// Simulate the host being offline.
  pub fn fail(&self, target: &str) {
    self.route(target, Route::Fail);
  }

  pub fn calls(&self) -> Vec<(String, CacheMode)> {
    self.state.lock().unwrap().calls.clone()
  }

  pub fn calls_to(&self, target: &str) -> usize {
    let target = url(target);
    self
      .calls()
      .iter()
      .filter(|(called, _)| called == target.as_str())
      .count()
  }

  fn route(&self, target: &str, route: Route) {
    let key = url(target).to_string();
    self.state.lock().unwrap().routes.insert(key, route);
  }
}

impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request, options: FetchOptions) -> Result<Response, NetworkError> {
    let key = request.url.to_string();
    let route = {
      let mut state = self.state.lock().unwrap();
      state.calls.push((key.clone(), options.cache));
      state.routes.get(&key).cloned()
    };

    let respond = |status: u16, kind: ResponseType, body: String| {
      Response::new(
        StatusCode::from_u16(status).unwrap(),
        kind,
        request.url.clone(),
        body,
      )
    };

    match route {
      Some(Route::Respond { status, kind, body }) => Ok(respond(status, kind, body)),
      Some(Route::Held { body, release }) => {
        release.notified().await;
        Ok(respond(200, ResponseType::Basic, body))
      }
      Some(Route::Fail) | None => Err(NetworkError::Unavailable(key)),
    }
  }
}

/// In-memory storage whose deletes fail for the listed stores.
#[derive(Default)]
pub struct FlakyStorage {
  inner: MemoryStorage,
  undeletable: HashSet<String>,
}

impl FlakyStorage {
  pub fn failing_delete<I, T>(names: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<String>,
  {
    Self {
      inner: MemoryStorage::new(),
      undeletable: names.into_iter().map(Into::into).collect(),
    }
  }
}

impl CacheStorage for FlakyStorage {
  fn open(&self, name: &str) -> Result<()> {
    self.inner.open(name)
  }

  fn has(&self, name: &str) -> Result<bool> {
    self.inner.has(name)
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.inner.keys()
  }

  fn delete(&self, name: &str) -> Result<bool> {
    if self.undeletable.contains(name) {
      return Err(eyre!("disk I/O error deleting {}", name));
    }
    self.inner.delete(name)
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.inner.match_entry(name, key)
  }

  fn put(&self, name: &str, key: &RequestKey, response: Response) -> Result<()> {
    self.inner.put(name, key, response)
  }

  fn put_existing(&self, name: &str, key: &RequestKey, response: Response) -> Result<bool> {
    self.inner.put_existing(name, key, response)
  }

  fn put_all(&self, name: &str, entries: Vec<(RequestKey, Response)>) -> Result<()> {
    self.inner.put_all(name, entries)
  }

  fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
    self.inner.entries(name)
  }
}
