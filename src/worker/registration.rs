//! One scope's registration: installs deployments, decides when they take over, and routes
//! requests to whichever version is active.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use url::Url;

use super::collector::{self, ActivateOptions};
use super::installer::{self, InstallOptions};
use super::lifecycle::{ClientId, Clients, WorkerState};
use super::manifest::{resolve_entry, AssetManifest, CacheVersion};
use super::router::{self, Disposition, Exclusions, PassThroughReason, RoutePolicy, Served};
use crate::cache::CacheStorage;
use crate::error::WorkerError;
use crate::net::{FetchOptions, Network, Request};

/// Everything one release ships: its version, its app shell and how it behaves.
#[derive(Debug, Clone)]
pub struct Deployment {
  pub version: CacheVersion,
  pub manifest: AssetManifest,
  pub exclusions: Exclusions,
  /// Page served to failed navigations, relative to the origin
  pub offline_fallback: Option<String>,
  pub install: InstallOptions,
  pub activate: ActivateOptions,
}

impl Deployment {
  pub fn new(version: CacheVersion, manifest: AssetManifest) -> Self {
    Self {
      version,
      manifest,
      exclusions: Exclusions::default(),
      offline_fallback: None,
      install: InstallOptions::default(),
      activate: ActivateOptions::default(),
    }
  }

  pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
    self.exclusions = exclusions;
    self
  }

  pub fn with_offline_fallback(mut self, path: impl Into<String>) -> Self {
    self.offline_fallback = Some(path.into());
    self
  }

  pub fn skip_waiting(mut self) -> Self {
    self.install.skip_waiting = true;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
  pub version: CacheVersion,
  pub state: WorkerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
  pub active: Option<WorkerInfo>,
  pub waiting: Option<WorkerInfo>,
  pub clients: usize,
}

struct Worker {
  deployment: Deployment,
  policy: Arc<RoutePolicy>,
  state: WorkerState,
}

impl Worker {
  fn version(&self) -> &CacheVersion {
    &self.deployment.version
  }

  fn info(&self) -> WorkerInfo {
    WorkerInfo {
      version: self.version().clone(),
      state: self.state,
    }
  }
}

#[derive(Default)]
struct Host {
  active: Option<Worker>,
  waiting: Option<Worker>,
  clients: Clients,
}

impl Host {
  /// No open client depends on the active version.
  fn idle(&self) -> bool {
    self
      .active
      .as_ref()
      .map_or(true, |active| self.clients.controlled_by(active.version()) == 0)
  }
}

pub struct Registration<S: CacheStorage, N: Network> {
  origin: Url,
  storage: Arc<S>,
  network: N,
  host: Mutex<Host>,
}

impl<S: CacheStorage, N: Network> Registration<S, N> {
  pub fn new(origin: Url, storage: Arc<S>, network: N) -> Self {
    Self {
      origin,
      storage,
      network,
      host: Mutex::new(Host::default()),
    }
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  /// Adopt a store left by an earlier run as the active version, so it keeps serving until a new
  /// install succeeds.
  ///
  /// Prefers the store named by `deployment`, otherwise the newest store outside its keep list.
  /// Does nothing when a version is already active or nothing is stored.
  pub fn resume(&self, deployment: &Deployment) -> Result<Option<CacheVersion>> {
    let mut host = self.lock()?;
    if host.active.is_some() {
      return Ok(None);
    }

    let stores = self.storage.keys()?;
    let name = if stores.iter().any(|s| s == deployment.version.as_str()) {
      deployment.version.as_str().to_string()
    } else {
      match stores
        .into_iter()
        .rev()
        .find(|s| !deployment.activate.keep.contains(s))
      {
        Some(name) => name,
        None => return Ok(None),
      }
    };

    let resumed = Deployment {
      version: CacheVersion::new(name)?,
      ..deployment.clone()
    };
    let version = resumed.version.clone();
    let policy = policy_for(&self.origin, &resumed)?;
    host.active = Some(Worker {
      deployment: resumed,
      policy: Arc::new(policy),
      state: WorkerState::Activated,
    });

    info!(version = %version, "Resumed cached version");
    Ok(Some(version))
  }

  /// Install a deployment and, when nothing holds the old version open, activate it.
  ///
  /// Returns the state the new worker ended in: `Activated`, or `Installed` while it waits. On
  /// failure the worker is discarded and the active version keeps serving.
  pub async fn install(&self, deployment: Deployment) -> Result<WorkerState> {
    let policy = policy_for(&self.origin, &deployment)?;
    let version = deployment.version.clone();
    let state = WorkerState::Installing;
    info!(version = %version, "Installing");

    if let Err(e) = installer::on_install(
      self.storage.as_ref(),
      &self.network,
      &version,
      policy.manifest(),
      &deployment.install,
    )
    .await
    {
      let state = state.transition(WorkerState::Redundant)?;
      error!(version = %version, state = %state, error = %e, "Install failed, keeping current version");
      return Err(e);
    }

    let skip_waiting = deployment.install.skip_waiting;
    let worker = Worker {
      deployment,
      policy: Arc::new(policy),
      state: state.transition(WorkerState::Installed)?,
    };

    let mut host = self.lock()?;
    if let Some(mut replaced) = host.waiting.replace(worker) {
      replaced.state = replaced.state.transition(WorkerState::Redundant)?;
      info!(version = %replaced.version(), "Waiting worker replaced");
    }

    if skip_waiting || host.idle() {
      self.activate(&mut host)?;
      return Ok(WorkerState::Activated);
    }

    info!(version = %version, "Installed, waiting for open clients to close");
    Ok(WorkerState::Installed)
  }

  /// Activate the waiting deployment without waiting for clients.
  pub fn skip_waiting(&self) -> Result<Option<CacheVersion>> {
    let mut host = self.lock()?;
    self.activate(&mut host)
  }

  fn activate(&self, host: &mut Host) -> Result<Option<CacheVersion>> {
    let Some(mut worker) = host.waiting.take() else {
      return Ok(None);
    };
    worker.state = worker.state.transition(WorkerState::Activating)?;
    let version = worker.version().clone();
    info!(version = %version, "Activating");

    let report = collector::on_activate(
      self.storage.as_ref(),
      &version,
      &worker.deployment.activate.keep,
    );
    worker.state = worker.state.transition(WorkerState::Activated)?;
    let claim = worker.deployment.activate.claim_clients;

    if let Some(mut previous) = host.active.replace(worker) {
      previous.state = previous.state.transition(WorkerState::Redundant)?;
      debug!(version = %previous.version(), "Superseded");
    }

    if claim {
      let claimed = host.clients.claim(&version);
      debug!(version = %version, claimed, "Claimed clients");
    }

    info!(
      version = %version,
      deleted = report.deleted.len(),
      failed = report.failed.len(),
      "Activated"
    );
    Ok(Some(version))
  }

  /// Open a client session, controlled by the active version if there is one.
  pub fn connect_client(&self) -> Result<ClientId> {
    let mut host = self.lock()?;
    let controller = host.active.as_ref().map(|w| w.version().clone());
    let id = host.clients.connect(controller.as_ref());
    debug!(client = %id, "Client connected");
    Ok(id)
  }

  /// Close a client session. Returns the version activated as a result, if any.
  pub fn disconnect_client(&self, id: ClientId) -> Result<Option<CacheVersion>> {
    let mut host = self.lock()?;
    if !host.clients.disconnect(id) {
      warn!(client = %id, "Unknown client");
      return Ok(None);
    }
    debug!(client = %id, "Client disconnected");

    if host.waiting.is_some() && host.idle() {
      return self.activate(&mut host);
    }
    Ok(None)
  }

  pub fn controller(&self, id: ClientId) -> Result<Option<CacheVersion>> {
    let host = self.lock()?;
    Ok(host.clients.controller(id).cloned())
  }

  /// Handle a request the way the active version would.
  pub async fn fetch(&self, request: &Request) -> Result<Served> {
    let active = {
      let host = self.lock()?;
      host
        .active
        .as_ref()
        .map(|w| (w.version().clone(), Arc::clone(&w.policy)))
    };

    let Some((version, policy)) = active else {
      return self
        .pass_through(request, PassThroughReason::NoController)
        .await;
    };

    match router::classify(request, &policy) {
      Disposition::PassThrough(reason) => self.pass_through(request, reason).await,
      Disposition::Intercept => Ok(
        router::on_fetch(
          request,
          self.storage.as_ref(),
          &version,
          &self.network,
          &policy,
        )
        .await?,
      ),
    }
  }

  async fn pass_through(&self, request: &Request, reason: PassThroughReason) -> Result<Served> {
    debug!(url = %request.url, method = %request.method, ?reason, "Not intercepted");
    let response = self
      .network
      .fetch(request, FetchOptions::default())
      .await
      .map_err(|source| WorkerError::NetworkFetch {
        url: request.url.to_string(),
        source,
      })?;
    Ok(Served::pass_through(response))
  }

  pub fn status(&self) -> Result<Status> {
    let host = self.lock()?;
    Ok(Status {
      active: host.active.as_ref().map(Worker::info),
      waiting: host.waiting.as_ref().map(Worker::info),
      clients: host.clients.len(),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Host>> {
    self
      .host
      .lock()
      .map_err(|e| eyre!("Registration state poisoned: {}", e))
  }
}

fn policy_for(origin: &Url, deployment: &Deployment) -> Result<RoutePolicy> {
  let manifest = deployment.manifest.resolve(origin)?;
  let fallback = deployment
    .offline_fallback
    .as_deref()
    .map(|path| resolve_entry(origin, path))
    .transpose()?;

  if let Some(fallback) = &fallback {
    if !manifest.contains(fallback) {
      warn!(fallback = %fallback, "Offline fallback is not in the manifest and may not be cached");
    }
  }

  Ok(RoutePolicy::new(
    origin.clone(),
    manifest,
    deployment.exclusions.clone(),
    fallback,
  ))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, SqliteStorage};
  use crate::net::RequestMode;
  use crate::testing::{url, FakeNetwork};
  use crate::worker::router::{HostMatch, ResponseSource};
  use reqwest::Method;

  const ORIGIN: &str = "https://app.example.com/";

  fn shell_network() -> FakeNetwork {
    let network = FakeNetwork::new();
    network.respond("https://app.example.com/", 200, "<html>v</html>");
    network.respond("https://app.example.com/app.css", 200, "body {}");
    network.respond("https://app.example.com/new.js", 200, "init()");
    network
  }

  fn registration() -> Registration<MemoryStorage, FakeNetwork> {
    Registration::new(url(ORIGIN), Arc::new(MemoryStorage::new()), shell_network())
  }

  fn deployment(version: &str, entries: &[&str]) -> Deployment {
    Deployment::new(
      CacheVersion::new(version).unwrap(),
      AssetManifest::new(entries.iter().copied()),
    )
  }

  fn v(name: &str) -> CacheVersion {
    CacheVersion::new(name).unwrap()
  }

  fn get(path: &str) -> Request {
    Request::get(url(ORIGIN).join(path).unwrap())
  }

  #[tokio::test]
  async fn test_installed_shell_is_served_without_network() {
    let reg = registration();
    let state = reg
      .install(deployment("v1", &[".", "/app.css"]))
      .await
      .unwrap();
    assert_eq!(state, WorkerState::Activated);

    let calls = reg.network().calls().len();
    for path in ["/", "/app.css"] {
      let served = reg.fetch(&get(path)).await.unwrap();
      assert_eq!(served.source, ResponseSource::Cache);
    }
    assert_eq!(reg.network().calls().len(), calls);
  }

  #[tokio::test]
  async fn test_rollover_waits_for_clients_then_collects() {
    let reg = registration();
    reg
      .install(deployment("v1", &[".", "/app.css"]))
      .await
      .unwrap();
    let tab = reg.connect_client().unwrap();

    let state = reg
      .install(deployment("v2", &[".", "/app.css", "/new.js"]))
      .await
      .unwrap();
    assert_eq!(state, WorkerState::Installed);

    let status = reg.status().unwrap();
    assert_eq!(status.active.unwrap().version, v("v1"));
    assert_eq!(status.waiting.unwrap().state, WorkerState::Installed);
    assert_eq!(
      reg.storage().keys().unwrap(),
      vec!["v1".to_string(), "v2".to_string()]
    );

    // v1 keeps serving while its client is open
    let served = reg.fetch(&get("/")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(reg.controller(tab).unwrap(), Some(v("v1")));

    assert_eq!(reg.disconnect_client(tab).unwrap(), Some(v("v2")));
    assert_eq!(reg.storage().keys().unwrap(), vec!["v2".to_string()]);
    assert_eq!(reg.storage().entries("v2").unwrap().len(), 3);

    let status = reg.status().unwrap();
    assert_eq!(
      status.active,
      Some(WorkerInfo {
        version: v("v2"),
        state: WorkerState::Activated,
      })
    );
    assert!(status.waiting.is_none());
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_version() {
    let reg = registration();
    reg
      .install(deployment("v1", &[".", "/app.css"]))
      .await
      .unwrap();
    reg
      .network()
      .respond("https://app.example.com/new.js", 404, "not found");

    let err = reg
      .install(deployment("v2", &[".", "/app.css", "/new.js"]))
      .await
      .unwrap_err();

    assert!(matches!(
      err.downcast_ref::<WorkerError>(),
      Some(WorkerError::ManifestFetch { .. })
    ));
    assert!(!reg.storage().has("v2").unwrap());
    let status = reg.status().unwrap();
    assert_eq!(status.active.unwrap().version, v("v1"));
    assert!(status.waiting.is_none());

    let served = reg.fetch(&get("/app.css")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_runtime_miss_is_fetched_once() {
    let reg = registration();
    reg.install(deployment("v1", &["."])).await.unwrap();
    reg
      .network()
      .respond("https://app.example.com/data.json", 200, "[]");

    let first = reg.fetch(&get("/data.json")).await.unwrap();
    let second = reg.fetch(&get("/data.json")).await.unwrap();

    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(
      reg.network().calls_to("https://app.example.com/data.json"),
      1
    );
    assert_eq!(reg.storage().entries("v1").unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_post_is_never_intercepted() {
    let reg = registration();
    reg.install(deployment("v1", &["."])).await.unwrap();
    assert_eq!(reg.network().calls_to(ORIGIN), 1);

    let post = Request::new(Method::POST, url(ORIGIN));
    let served = reg.fetch(&post).await.unwrap();

    assert_eq!(served.source, ResponseSource::PassThrough);
    assert_eq!(reg.network().calls_to(ORIGIN), 2);
    assert_eq!(reg.storage().entries("v1").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_excluded_backend_is_never_cached() {
    let reg = registration();
    let realtime = "https://my-app.firebaseio.com/rooms.json";
    reg.network().respond(realtime, 200, "{}");
    reg
      .install(
        deployment("v1", &["."]).with_exclusions(Exclusions::new(["firebase"], HostMatch::Substring)),
      )
      .await
      .unwrap();

    for _ in 0..2 {
      let served = reg
        .fetch(&Request::get(url(realtime)).with_mode(RequestMode::Cors))
        .await
        .unwrap();
      assert_eq!(served.source, ResponseSource::PassThrough);
    }
    assert_eq!(reg.network().calls_to(realtime), 2);
    assert_eq!(reg.storage().entries("v1").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_without_active_version_requests_pass_through() {
    let reg = registration();
    let served = reg.fetch(&get("/")).await.unwrap();
    assert_eq!(served.source, ResponseSource::PassThrough);
    assert!(reg.storage().keys().unwrap().is_empty());

    reg.network().fail("https://app.example.com/down");
    let err = reg.fetch(&get("/down")).await.unwrap_err();
    assert!(matches!(
      err.downcast_ref::<WorkerError>(),
      Some(WorkerError::NetworkFetch { .. })
    ));
  }

  #[tokio::test]
  async fn test_skip_waiting_takes_over_open_clients() {
    let reg = registration();
    reg.install(deployment("v1", &["."])).await.unwrap();
    let tab = reg.connect_client().unwrap();

    let state = reg
      .install(deployment("v2", &[".", "/new.js"]).skip_waiting())
      .await
      .unwrap();

    assert_eq!(state, WorkerState::Activated);
    assert_eq!(reg.controller(tab).unwrap(), Some(v("v2")));
    assert_eq!(reg.storage().keys().unwrap(), vec!["v2".to_string()]);
  }

  #[tokio::test]
  async fn test_manual_skip_waiting_and_newer_waiting_replaces_older() {
    let reg = registration();
    reg.install(deployment("v1", &["."])).await.unwrap();
    let _tab = reg.connect_client().unwrap();

    reg.install(deployment("v2", &["."])).await.unwrap();
    reg
      .install(deployment("v3", &[".", "/app.css"]))
      .await
      .unwrap();
    assert_eq!(reg.status().unwrap().waiting.unwrap().version, v("v3"));

    assert_eq!(reg.skip_waiting().unwrap(), Some(v("v3")));
    assert_eq!(reg.skip_waiting().unwrap(), None);
    // The discarded v2 store is collected with v1
    assert_eq!(reg.storage().keys().unwrap(), vec!["v3".to_string()]);
  }

  #[tokio::test]
  async fn test_first_install_claims_uncontrolled_clients() {
    let reg = registration();
    let tab = reg.connect_client().unwrap();
    assert_eq!(reg.controller(tab).unwrap(), None);

    reg.install(deployment("v1", &["."])).await.unwrap();

    assert_eq!(reg.controller(tab).unwrap(), Some(v("v1")));
    assert_eq!(reg.status().unwrap().clients, 1);
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_fallback_page() {
    let reg = registration();
    reg
      .network()
      .respond("https://app.example.com/offline.html", 200, "offline");
    reg
      .install(deployment("v1", &[".", "/offline.html"]).with_offline_fallback("/offline.html"))
      .await
      .unwrap();
    reg.network().fail("https://app.example.com/reports");

    let served = reg
      .fetch(&get("/reports").with_mode(RequestMode::Navigate))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(&served.response.into_body()[..], b"offline");
  }

  #[tokio::test]
  async fn test_fetch_in_flight_during_rollover_leaves_old_store_deleted() {
    let reg = registration();
    reg.install(deployment("v1", &["."])).await.unwrap();
    let release = reg.network().hold("https://app.example.com/slow.json", "{}");
    let request = get("/slow.json");

    let rollover = async {
      let state = reg
        .install(deployment("v2", &["."]).skip_waiting())
        .await
        .unwrap();
      assert_eq!(state, WorkerState::Activated);
      assert_eq!(reg.storage().keys().unwrap(), vec!["v2".to_string()]);
      release.notify_one();
    };
    let (served, ()) = tokio::join!(reg.fetch(&request), rollover);

    assert_eq!(served.unwrap().source, ResponseSource::Network);
    assert_eq!(reg.storage().keys().unwrap(), vec!["v2".to_string()]);
    assert_eq!(reg.storage().entries("v2").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_resume_serves_persisted_version_when_install_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
      let storage = Arc::new(SqliteStorage::open_at(&path).unwrap());
      let reg = Registration::new(url(ORIGIN), storage, shell_network());
      reg
        .install(deployment("v1", &[".", "/app.css"]))
        .await
        .unwrap();
    }

    let storage = Arc::new(SqliteStorage::open_at(&path).unwrap());
    let reg = Registration::new(url(ORIGIN), storage, FakeNetwork::new());
    let next = deployment("v2", &[".", "/app.css", "/new.js"]);

    assert_eq!(reg.resume(&next).unwrap(), Some(v("v1")));
    assert!(reg.install(next).await.is_err());

    let served = reg.fetch(&get("/app.css")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(reg.status().unwrap().active.unwrap().version, v("v1"));
    assert_eq!(reg.storage().keys().unwrap(), vec!["v1".to_string()]);
  }

  #[tokio::test]
  async fn test_resumed_version_is_collected_by_next_install() {
    let first = registration();
    first.install(deployment("v1", &["."])).await.unwrap();

    let reg = Registration::new(url(ORIGIN), Arc::clone(first.storage()), shell_network());
    let next = deployment("v2", &[".", "/new.js"]);
    assert_eq!(reg.resume(&next).unwrap(), Some(v("v1")));
    // Already active
    assert_eq!(reg.resume(&next).unwrap(), None);

    assert_eq!(reg.install(next).await.unwrap(), WorkerState::Activated);
    assert_eq!(reg.storage().keys().unwrap(), vec!["v2".to_string()]);
  }

  #[test]
  fn test_resume_without_stores_does_nothing() {
    let reg = registration();
    assert_eq!(reg.resume(&deployment("v1", &["."])).unwrap(), None);
    assert!(reg.status().unwrap().active.is_none());
  }
}
