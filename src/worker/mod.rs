//! Offline worker that intercepts requests and answers them from named stores.
//!
//! This wraps a [`Fetcher`] and provides the same "request in, response out"
//! shape, but routes each request through a caching strategy and keeps the
//! stores of older generations out of the way.

pub mod dispatch;
pub mod fetcher;
pub mod lifecycle;
pub mod types;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, warn};

use crate::cache::{CacheLayer, CacheStorage, CacheStores, Handled, Store};
use crate::config::Config;
use crate::error::NetworkError;

pub use dispatch::{Classification, Dispatcher, Route, Strategy};
pub use fetcher::{Fetcher, HttpFetcher};
pub use lifecycle::{Generation, LifecycleController, WorkerState};
pub use types::{Destination, Request, RequestIdentity, RequestMode, StoredResponse};

/// What the worker did with a request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not intercepted; the caller performs the request itself
  PassThrough,
  Responded(Handled),
}

impl FetchOutcome {
  pub fn handled(&self) -> Option<&Handled> {
    match self {
      Self::PassThrough => None,
      Self::Responded(handled) => Some(handled),
    }
  }
}

/// Worker with transparent offline caching.
pub struct OfflineWorker<S: CacheStorage, F: Fetcher> {
  layer: CacheLayer<S>,
  dispatcher: Dispatcher,
  lifecycle: LifecycleController,
  fetcher: F,
}

impl<S: CacheStorage + 'static, F: Fetcher> OfflineWorker<S, F> {
  /// Create a worker for the configured generation. It starts in
  /// [`WorkerState::Parsed`] and intercepts nothing until activated.
  pub fn new(config: &Config, storage: S, fetcher: F) -> Result<Self> {
    let generation = config.generation();
    let dispatcher = Dispatcher::from_config(config)?;

    let stores = CacheStores::new(storage)
      .with_expiration(&generation.shell, config.expiration.shell)
      .with_expiration(&generation.assets, config.expiration.assets)
      .with_expiration(&generation.api, config.expiration.api);

    let origin = dispatch::parse_origin_url(&config.origin)?;
    let shell = config
      .shell
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid shell resource '{}': {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let layer = CacheLayer::new(stores).with_fallback_stores(generation.known_names());
    let lifecycle = LifecycleController::new(generation, shell)
      .with_skip_waiting(config.skip_waiting)
      .with_claim_clients(config.claim_clients);

    Ok(Self {
      layer,
      dispatcher,
      lifecycle,
      fetcher,
    })
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  pub fn generation(&self) -> &Generation {
    self.lifecycle.generation()
  }

  pub fn stores(&self) -> &CacheStores<S> {
    self.layer.stores()
  }

  pub fn lifecycle(&self) -> &LifecycleController {
    &self.lifecycle
  }

  pub fn lifecycle_mut(&mut self) -> &mut LifecycleController {
    &mut self.lifecycle
  }

  /// Pre-populate the shell; with skip-waiting, activate right away.
  ///
  /// Returns the stores evicted by that activation (empty when waiting).
  pub async fn install(&mut self) -> Result<Vec<String>> {
    let fetcher = self.fetcher.clone();
    self
      .lifecycle
      .install(self.layer.stores(), |request| {
        let fetcher = fetcher.clone();
        async move { fetcher.fetch(&request).await }
      })
      .await?;

    if self.lifecycle.skip_waiting() {
      debug!("Skipping the waiting phase");
      return self.activate();
    }
    Ok(Vec::new())
  }

  /// Evict stale generations and start intercepting.
  pub fn activate(&mut self) -> Result<Vec<String>> {
    self.lifecycle.activate(self.layer.stores())
  }

  /// Continue with a generation activated by an earlier process.
  pub fn resume(&mut self) -> Result<()> {
    self.lifecycle.resume(self.layer.stores())
  }

  /// Pick up a generation installed earlier that has not activated yet.
  pub fn restore_waiting(&mut self) -> Result<()> {
    self.lifecycle.restore_waiting(self.layer.stores())
  }

  /// Stop intercepting; a newer worker has taken over.
  pub fn retire(&mut self) {
    self.lifecycle.retire();
  }

  /// Route one request through its strategy.
  ///
  /// Only a cache-first miss with no network and no placeholder surfaces a
  /// [`NetworkError`]; network-first requests always produce a response.
  pub async fn handle(&self, request: &Request) -> Result<FetchOutcome, NetworkError> {
    if !self.lifecycle.state().can_intercept_fetch() {
      return Ok(FetchOutcome::PassThrough);
    }
    let Some(route) = self.dispatcher.route(request) else {
      return Ok(FetchOutcome::PassThrough);
    };

    debug!(
      url = %request.url,
      class = ?route.classification,
      strategy = ?route.strategy,
      "Intercepted request"
    );

    let store = self.open_route_store(&route);
    let fetcher = self.fetcher.clone();
    let owned = request.clone();
    let fetch = move || async move { fetcher.fetch(&owned).await };

    let handled = match route.strategy {
      Strategy::CacheFirst => self.layer.cache_first(&store, request, fetch).await?,
      Strategy::StaleWhileRevalidate => {
        self
          .layer
          .stale_while_revalidate(&store, request, fetch)
          .await?
      }
      Strategy::NetworkFirst => {
        let offline_page = self.dispatcher.offline_page_for(request);
        self
          .layer
          .network_first(&store, request, offline_page.as_ref(), fetch)
          .await
      }
    };

    Ok(FetchOutcome::Responded(handled))
  }

  /// Wait for background refreshes started by stale-while-revalidate.
  pub async fn flush_revalidations(&self) {
    self.layer.flush_revalidations().await;
  }

  /// Stores are created on first use. If that fails (e.g. quota), the
  /// strategy still runs against a handle; writes are then logged and dropped.
  fn open_route_store(&self, route: &Route) -> Store {
    match self.layer.stores().open_store(&route.store) {
      Ok(store) => store,
      Err(e) => {
        warn!(store = %route.store, "Failed to open store: {}", e);
        self.layer.stores().handle(&route.store)
      }
    }
  }
}
