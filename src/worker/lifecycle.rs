//! Worker lifecycle: install, activate, takeover, retirement.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, info, warn};
use url::Url;

use super::types::{Request, StoredResponse};
use crate::cache::{CacheStorage, CacheStores, GenerationMarker};
use crate::error::NetworkError;

/// Store names considered current. Any other store is evicted on activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub version: String,
  pub shell: String,
  pub assets: String,
  pub api: String,
}

impl Generation {
  pub fn new(
    version: impl Into<String>,
    shell: impl Into<String>,
    assets: impl Into<String>,
    api: impl Into<String>,
  ) -> Self {
    Self {
      version: version.into(),
      shell: shell.into(),
      assets: assets.into(),
      api: api.into(),
    }
  }

  /// Default store names for a version label.
  pub fn from_version(version: &str) -> Self {
    Self::new(
      version,
      format!("transport-portal-{}", version),
      format!("assets-cache-{}", version),
      format!("api-cache-{}", version),
    )
  }

  pub fn known_names(&self) -> Vec<&str> {
    vec![
      self.shell.as_str(),
      self.assets.as_str(),
      self.api.as_str(),
    ]
  }

  /// Exact, case-sensitive membership.
  pub fn is_known(&self, name: &str) -> bool {
    self.known_names().contains(&name)
  }
}

/// Lifecycle states of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, install not yet attempted
  Parsed,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  Activated,
  /// Failed to install, or replaced by a newer worker
  Redundant,
}

impl WorkerState {
  pub fn can_intercept_fetch(&self) -> bool {
    matches!(self, WorkerState::Activated)
  }
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

/// Open pages and the generation controlling each of them.
#[derive(Debug, Clone, Default)]
pub struct Clients {
  controllers: BTreeMap<String, Option<String>>,
}

impl Clients {
  pub fn register(&mut self, id: impl Into<String>, controller: Option<String>) {
    self.controllers.insert(id.into(), controller);
  }

  pub fn controller_of(&self, id: &str) -> Option<&str> {
    self.controllers.get(id).and_then(|c| c.as_deref())
  }

  /// Put every open page under `version`. Returns how many changed hands.
  fn claim(&mut self, version: &str) -> usize {
    let mut changed = 0;
    for controller in self.controllers.values_mut() {
      if controller.as_deref() != Some(version) {
        *controller = Some(version.to_string());
        changed += 1;
      }
    }
    changed
  }
}

/// Drives one worker instance through its states.
#[derive(Debug)]
pub struct LifecycleController {
  generation: Generation,
  /// Shell resources pre-populated on install
  shell: Vec<Url>,
  state: WorkerState,
  skip_waiting: bool,
  claim_clients: bool,
  clients: Clients,
}

impl LifecycleController {
  pub fn new(generation: Generation, shell: Vec<Url>) -> Self {
    Self {
      generation,
      shell,
      state: WorkerState::Parsed,
      skip_waiting: true,
      claim_clients: true,
      clients: Clients::default(),
    }
  }

  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  pub fn with_claim_clients(mut self, claim_clients: bool) -> Self {
    self.claim_clients = claim_clients;
    self
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  pub fn skip_waiting(&self) -> bool {
    self.skip_waiting
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  /// Register an open page. Pages opened while this worker is active are
  /// controlled by it; earlier pages wait for a claim or a reload.
  pub fn register_client(&mut self, id: impl Into<String>) {
    let controller = self
      .state
      .can_intercept_fetch()
      .then(|| self.generation.version.clone());
    self.clients.register(id, controller);
  }

  /// Register a page that is already controlled by an older generation.
  pub fn adopt_client(&mut self, id: impl Into<String>, version: impl Into<String>) {
    self.clients.register(id, Some(version.into()));
  }

  /// Pre-populate the shell store.
  ///
  /// Every shell resource is fetched before anything is written, and the
  /// shell is then written in one step. One network failure, non-success
  /// status or storage error fails the install, leaves no new shell store
  /// behind and makes the worker redundant.
  pub async fn install<S, F, Fut>(&mut self, stores: &CacheStores<S>, fetch: F) -> Result<()>
  where
    S: CacheStorage,
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<StoredResponse, NetworkError>>,
  {
    if self.state != WorkerState::Parsed {
      return Err(eyre!("Cannot install a worker that is {}", self.state));
    }

    info!(generation = %self.generation.version, "Installing");
    self.state = WorkerState::Installing;
    let preexisting = stores.has_store(&self.generation.shell).unwrap_or(true);

    match self.populate_shell(stores, fetch).await {
      Ok(count) => {
        info!(resources = count, store = %self.generation.shell, "Cached app shell");
        self.state = WorkerState::Installed;
        Ok(())
      }
      Err(e) => {
        warn!("Install failed: {}", e);
        if !preexisting {
          if let Err(cleanup) = stores.delete_store(&self.generation.shell) {
            warn!(store = %self.generation.shell, "Failed to remove incomplete shell: {}", cleanup);
          }
        }
        self.state = WorkerState::Redundant;
        Err(e)
      }
    }
  }

  async fn populate_shell<S, F, Fut>(&self, stores: &CacheStores<S>, fetch: F) -> Result<usize>
  where
    S: CacheStorage,
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<StoredResponse, NetworkError>>,
  {
    let requests: Vec<Request> = self.shell.iter().cloned().map(Request::get).collect();
    let responses = join_all(requests.iter().cloned().map(&fetch)).await;

    let mut fetched = Vec::with_capacity(requests.len());
    for (request, response) in requests.iter().zip(responses) {
      let response =
        response.map_err(|e| eyre!("Failed to fetch shell resource {}: {}", request.url, e))?;
      if !response.ok() {
        return Err(eyre!(
          "Shell resource {} returned status {}",
          request.url,
          response.status
        ));
      }
      fetched.push((request.identity(), response));
    }

    stores.put_all(&self.generation.shell, &fetched)?;

    // Reinstalling an active generation must not send it back to waiting
    if stores.generation_marker(&self.generation.shell)? != Some(GenerationMarker::Activated) {
      stores.mark_generation(&self.generation.shell, GenerationMarker::Installed)?;
    }

    Ok(fetched.len())
  }

  /// Evict every store outside the current generation, then become active.
  ///
  /// Returns the evicted store names. The state only reaches `Activated`
  /// once every eviction has finished.
  pub fn activate<S: CacheStorage>(&mut self, stores: &CacheStores<S>) -> Result<Vec<String>> {
    if self.state != WorkerState::Installed {
      return Err(eyre!("Cannot activate a worker that is {}", self.state));
    }

    info!(generation = %self.generation.version, "Activating");
    self.state = WorkerState::Activating;

    let activated = self.evict_stale(stores).and_then(|evicted| {
      stores.mark_generation(&self.generation.shell, GenerationMarker::Activated)?;
      Ok(evicted)
    });

    match activated {
      Ok(evicted) => {
        self.state = WorkerState::Activated;
        if self.claim_clients {
          let claimed = self.clients.claim(&self.generation.version);
          info!(claimed, "Claimed clients");
        }
        Ok(evicted)
      }
      Err(e) => {
        warn!("Activation failed: {}", e);
        self.state = WorkerState::Installed;
        Err(e)
      }
    }
  }

  fn evict_stale<S: CacheStorage>(&self, stores: &CacheStores<S>) -> Result<Vec<String>> {
    let mut evicted = Vec::new();
    for name in stores.list_store_names()? {
      if self.generation.is_known(&name) {
        continue;
      }
      info!(store = %name, "Removing old cache");
      stores.delete_store(&name)?;
      evicted.push(name);
    }
    Ok(evicted)
  }

  /// Resume a generation an earlier process activated, without re-running
  /// install. Fails unless its persisted marker says `activated`.
  pub fn resume<S: CacheStorage>(&mut self, stores: &CacheStores<S>) -> Result<()> {
    let marker = self.persisted_marker(stores)?;
    if marker != GenerationMarker::Activated {
      return Err(eyre!(
        "Generation {} is {} but has not been activated",
        self.generation.version,
        marker
      ));
    }
    debug!(generation = %self.generation.version, "Resuming active generation");
    self.state = WorkerState::Activated;
    Ok(())
  }

  /// Pick up a generation installed by an earlier process that is still
  /// waiting, so it can be activated.
  pub fn restore_waiting<S: CacheStorage>(&mut self, stores: &CacheStores<S>) -> Result<()> {
    self.persisted_marker(stores)?;
    debug!(generation = %self.generation.version, "Restoring waiting generation");
    self.state = WorkerState::Installed;
    Ok(())
  }

  /// The marker left by an earlier process. A shell store without one is
  /// the remains of an aborted install and does not count.
  fn persisted_marker<S: CacheStorage>(
    &self,
    stores: &CacheStores<S>,
  ) -> Result<GenerationMarker> {
    if self.state != WorkerState::Parsed {
      return Err(eyre!("Cannot restore a worker that is {}", self.state));
    }
    stores
      .generation_marker(&self.generation.shell)?
      .ok_or_else(|| {
        eyre!(
          "Generation {} is not installed (no completed install of {})",
          self.generation.version,
          self.generation.shell
        )
      })
  }

  /// Mark this worker as replaced.
  pub fn retire(&mut self) {
    debug!(generation = %self.generation.version, "Worker is now redundant");
    self.state = WorkerState::Redundant;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn shell() -> Vec<Url> {
    ["/", "/offline.html", "/manifest.json"]
      .iter()
      .map(|p| Url::parse("https://app.test").unwrap().join(p).unwrap())
      .collect()
  }

  fn stores() -> CacheStores<SqliteStorage> {
    CacheStores::new(SqliteStorage::in_memory().unwrap())
  }

  fn generation(v: &str) -> Generation {
    Generation::new(
      v,
      format!("{}-shell", v),
      format!("{}-assets", v),
      format!("{}-api", v),
    )
  }

  async fn serve(request: Request) -> Result<StoredResponse, NetworkError> {
    Ok(StoredResponse::new(200, vec![], request.url.path()))
  }

  #[tokio::test]
  async fn test_install_populates_shell() {
    let stores = stores();
    let mut lifecycle = LifecycleController::new(generation("v1"), shell());

    lifecycle.install(&stores, serve).await.unwrap();

    assert_eq!(lifecycle.state(), WorkerState::Installed);
    assert_eq!(stores.entry_count("v1-shell").unwrap(), 3);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let stores = stores();
    let mut lifecycle = LifecycleController::new(generation("v1"), shell());

    let result = lifecycle
      .install(&stores, |request: Request| async move {
        if request.url.path() == "/manifest.json" {
          Err(NetworkError::Unavailable("offline".into()))
        } else {
          serve(request).await
        }
      })
      .await;

    assert!(result.is_err());
    assert_eq!(lifecycle.state(), WorkerState::Redundant);
    assert_eq!(stores.entry_count("v1-shell").unwrap(), 0);
    assert!(lifecycle.activate(&stores).is_err());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let stores = stores();
    let mut lifecycle = LifecycleController::new(generation("v1"), shell());

    let result = lifecycle
      .install(&stores, |request: Request| async move {
        let status = if request.url.path() == "/" { 500 } else { 200 };
        Ok(StoredResponse::new(status, vec![], "x"))
      })
      .await;

    assert!(result.is_err());
    assert_eq!(stores.entry_count("v1-shell").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_install_twice_is_idempotent() {
    let stores = stores();
    let calls = AtomicUsize::new(0);
    let fetch = |request: Request| {
      calls.fetch_add(1, Ordering::SeqCst);
      serve(request)
    };

    let mut first = LifecycleController::new(generation("v1"), shell());
    first.install(&stores, &fetch).await.unwrap();
    let snapshot: Vec<_> = stores
      .list_store_names()
      .unwrap()
      .into_iter()
      .map(|n| (n.clone(), stores.entry_count(&n).unwrap()))
      .collect();

    let mut second = LifecycleController::new(generation("v1"), shell());
    second.install(&stores, &fetch).await.unwrap();
    let again: Vec<_> = stores
      .list_store_names()
      .unwrap()
      .into_iter()
      .map(|n| (n.clone(), stores.entry_count(&n).unwrap()))
      .collect();

    assert_eq!(snapshot, again);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
  }

  #[tokio::test]
  async fn test_install_only_once_per_instance() {
    let stores = stores();
    let mut lifecycle = LifecycleController::new(generation("v1"), shell());
    lifecycle.install(&stores, serve).await.unwrap();
    assert!(lifecycle.install(&stores, serve).await.is_err());
  }

  #[tokio::test]
  async fn test_activation_evicts_previous_generation() {
    let stores = stores();
    for name in ["v1-shell", "v1-assets", "v1-api"] {
      stores.open_store(name).unwrap();
    }

    let mut lifecycle = LifecycleController::new(generation("v2"), vec![]);
    lifecycle.install(&stores, serve).await.unwrap();
    // Install writes the shell store, even for an empty manifest, so only the
    // shell store of the new generation exists before activation
    let before = stores.list_store_names().unwrap();
    assert!(before.contains(&"v2-shell".to_string()));
    assert!(!before.contains(&"v2-assets".to_string()));
    assert!(!before.contains(&"v2-api".to_string()));

    let mut evicted = lifecycle.activate(&stores).unwrap();
    evicted.sort();

    assert_eq!(evicted, vec!["v1-api", "v1-assets", "v1-shell"]);
    assert_eq!(lifecycle.state(), WorkerState::Activated);
    assert_eq!(stores.list_store_names().unwrap(), vec!["v2-shell"]);
  }

  #[tokio::test]
  async fn test_eviction_is_exact_match() {
    let stores = stores();
    for name in ["V2-shell", "v2-shell-old", "v2-shel", "v2-assets"] {
      stores.open_store(name).unwrap();
    }

    let mut lifecycle = LifecycleController::new(generation("v2"), vec![]);
    lifecycle.install(&stores, serve).await.unwrap();
    let mut evicted = lifecycle.activate(&stores).unwrap();
    evicted.sort();

    assert_eq!(evicted, vec!["V2-shell", "v2-shel", "v2-shell-old"]);
    assert_eq!(
      stores.list_store_names().unwrap(),
      vec!["v2-assets", "v2-shell"]
    );
  }

  #[tokio::test]
  async fn test_claim_takes_over_open_pages() {
    let stores = stores();
    let mut lifecycle = LifecycleController::new(generation("v2"), vec![]);
    lifecycle.adopt_client("tab-1", "v1");
    lifecycle.register_client("tab-2");
    assert_eq!(lifecycle.clients().controller_of("tab-2"), None);

    lifecycle.install(&stores, serve).await.unwrap();
    lifecycle.activate(&stores).unwrap();

    assert_eq!(lifecycle.clients().controller_of("tab-1"), Some("v2"));
    assert_eq!(lifecycle.clients().controller_of("tab-2"), Some("v2"));
  }

  #[tokio::test]
  async fn test_without_claim_open_pages_keep_old_controller() {
    let stores = stores();
    let mut lifecycle =
      LifecycleController::new(generation("v2"), vec![]).with_claim_clients(false);
    lifecycle.adopt_client("tab-1", "v1");

    lifecycle.install(&stores, serve).await.unwrap();
    lifecycle.activate(&stores).unwrap();
    lifecycle.register_client("tab-2");

    assert_eq!(lifecycle.clients().controller_of("tab-1"), Some("v1"));
    assert_eq!(lifecycle.clients().controller_of("tab-2"), Some("v2"));
  }

  #[tokio::test]
  async fn test_resume_requires_activated_generation() {
    let stores = stores();
    let mut lifecycle = LifecycleController::new(generation("v1"), vec![]);
    assert!(lifecycle.resume(&stores).is_err());

    // A bare shell store is not an install
    stores.open_store("v1-shell").unwrap();
    assert!(lifecycle.resume(&stores).is_err());

    stores
      .mark_generation("v1-shell", GenerationMarker::Installed)
      .unwrap();
    assert!(lifecycle.resume(&stores).is_err());
    assert_eq!(lifecycle.state(), WorkerState::Parsed);

    stores
      .mark_generation("v1-shell", GenerationMarker::Activated)
      .unwrap();
    lifecycle.resume(&stores).unwrap();
    assert!(lifecycle.state().can_intercept_fetch());

    lifecycle.retire();
    assert_eq!(lifecycle.state(), WorkerState::Redundant);
    assert!(!lifecycle.state().can_intercept_fetch());
  }

  #[tokio::test]
  async fn test_restored_waiting_generation_can_activate() {
    let stores = stores();
    stores.open_store("v0-shell").unwrap();
    let mut first = LifecycleController::new(generation("v1"), shell()).with_skip_waiting(false);
    first.install(&stores, serve).await.unwrap();

    let mut lifecycle = LifecycleController::new(generation("v1"), vec![]);
    // Installed but never activated: not resumable as active
    assert!(lifecycle.resume(&stores).is_err());
    lifecycle.restore_waiting(&stores).unwrap();
    assert_eq!(lifecycle.state(), WorkerState::Installed);
    assert!(!lifecycle.state().can_intercept_fetch());

    let evicted = lifecycle.activate(&stores).unwrap();
    assert_eq!(evicted, vec!["v0-shell"]);
    assert_eq!(lifecycle.state(), WorkerState::Activated);

    let mut later = LifecycleController::new(generation("v1"), vec![]);
    later.resume(&stores).unwrap();
    assert!(later.state().can_intercept_fetch());
  }

  #[tokio::test]
  async fn test_failed_install_cannot_be_restored() {
    let stores = stores();
    for name in ["v0-shell", "v0-assets"] {
      stores.open_store(name).unwrap();
    }

    let mut failed = LifecycleController::new(generation("v1"), shell());
    let result = failed
      .install(&stores, |_request: Request| async {
        Err::<StoredResponse, _>(NetworkError::Unavailable("offline".into()))
      })
      .await;
    assert!(result.is_err());
    assert!(!stores.has_store("v1-shell").unwrap());

    let mut next = LifecycleController::new(generation("v1"), shell());
    assert!(next.restore_waiting(&stores).is_err());
    assert!(next.activate(&stores).is_err());
    assert_eq!(
      stores.list_store_names().unwrap(),
      vec!["v0-assets", "v0-shell"]
    );
  }

  #[tokio::test]
  async fn test_storage_failure_during_install_leaves_no_shell() {
    let stores = CacheStores::new(SqliteStorage::in_memory().unwrap().with_quota(16));
    let mut lifecycle = LifecycleController::new(generation("v1"), shell());

    // Each body is 10 bytes; the second write breaks the quota
    let result = lifecycle
      .install(&stores, |_request: Request| async {
        Ok(StoredResponse::new(200, vec![], "0123456789"))
      })
      .await;

    assert!(result.is_err());
    assert_eq!(lifecycle.state(), WorkerState::Redundant);
    assert!(!stores.has_store("v1-shell").unwrap());
    assert_eq!(stores.generation_marker("v1-shell").unwrap(), None);
  }

  #[test]
  fn test_generation_names() {
    let g = Generation::from_version("v3");
    assert!(g.is_known("assets-cache-v3"));
    assert!(!g.is_known("assets-cache-v2"));
    assert!(!g.is_known("Assets-Cache-v3"));
  }
}
