//! Cache layer that orchestrates caching strategies with network fetching.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::stores::{CacheStores, Store};
use super::traits::Handled;
use crate::error::NetworkError;
use crate::worker::types::{Destination, Request, RequestIdentity, StoredResponse};

/// Cache layer that applies a strategy to one request.
///
/// Storage is best-effort from the strategies' point of view: a failed
/// lookup is a miss and a failed write is logged, never surfaced in place
/// of the response.
pub struct CacheLayer<S: CacheStorage> {
  stores: CacheStores<S>,
  /// Stores searched, in order, when the routed store misses
  fallback: Vec<String>,
  /// Background refreshes started by stale-while-revalidate
  pending: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(stores: CacheStores<S>) -> Self {
    Self {
      stores,
      fallback: Vec::new(),
      pending: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  /// Lookups that miss in the routed store also try these stores, so a
  /// resource cached by one strategy can answer a request routed to another.
  pub fn with_fallback_stores<I, N>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = N>,
    N: Into<String>,
  {
    self.fallback = names.into_iter().map(Into::into).collect();
    self
  }

  pub fn stores(&self) -> &CacheStores<S> {
    &self.stores
  }

  /// Serve from cache, falling back to the network on a miss.
  ///
  /// 1. Check cache - if present, return without a network call
  /// 2. On a miss, fetch and store a copy
  /// 3. On network failure, images get a placeholder; everything else fails
  pub async fn cache_first<F, Fut>(
    &self,
    store: &Store,
    request: &Request,
    fetcher: F,
  ) -> Result<Handled, NetworkError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse, NetworkError>>,
  {
    let identity = request.identity();

    if let Some(cached) = self.lookup(store, &identity) {
      debug!(%identity, store = store.name(), "Cache hit");
      return Ok(Handled::from_cache(cached));
    }

    self.fetch_and_store(store, request, &identity, fetcher).await
  }

  /// Prefer the network; fall back to the last stored copy, then to
  /// `offline_page` (looked up in the same store), then to a synthetic 408.
  pub async fn network_first<F, Fut>(
    &self,
    store: &Store,
    request: &Request,
    offline_page: Option<&RequestIdentity>,
    fetcher: F,
  ) -> Handled
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse, NetworkError>>,
  {
    let identity = request.identity();

    match fetcher().await {
      Ok(response) => {
        self.store_copy(store, &identity, &response);
        Handled::from_network(response)
      }
      Err(err) => {
        debug!(%identity, error = %err, "Network failed, falling back to cache");

        if let Some(cached) = self.lookup(store, &identity) {
          return Handled::offline(cached);
        }

        if let Some(page) = offline_page.and_then(|page| self.lookup(store, page)) {
          return Handled::fallback(page);
        }

        Handled::fallback(StoredResponse::network_error())
      }
    }
  }

  /// Serve a cached copy immediately and refresh it in the background.
  /// Without a cached copy this behaves like cache-first.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    store: &Store,
    request: &Request,
    fetcher: F,
  ) -> Result<Handled, NetworkError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse, NetworkError>> + Send + 'static,
  {
    let identity = request.identity();

    let Some(cached) = self.lookup(store, &identity) else {
      return self.fetch_and_store(store, request, &identity, fetcher).await;
    };

    let refresh = fetcher();
    let stores = self.stores.clone();
    let store = store.clone();
    let task = async move {
      match refresh.await {
        Ok(response) if response.ok() => {
          if let Err(e) = stores.put(&store, &identity, &response) {
            warn!(%identity, "Failed to store revalidated response: {}", e);
          }
        }
        Ok(response) => {
          debug!(%identity, status = response.status, "Revalidation returned non-success status");
        }
        Err(err) => {
          debug!(%identity, error = %err, "Revalidation failed, keeping cached copy");
        }
      }
    };
    {
      let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
      // Reap finished refreshes so the set only holds in-flight ones
      while let Some(result) = pending.try_join_next() {
        if let Err(e) = result {
          warn!("Revalidation task failed: {}", e);
        }
      }
      pending.spawn(task);
    }

    Ok(Handled::from_cache(cached))
  }

  /// Background refreshes spawned and not yet reaped.
  pub fn pending_revalidations(&self) -> usize {
    self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  /// Wait for every background refresh started so far.
  pub async fn flush_revalidations(&self) {
    loop {
      let mut set = {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *pending)
      };
      if set.is_empty() {
        break;
      }
      while let Some(result) = set.join_next().await {
        if let Err(e) = result {
          warn!("Revalidation task failed: {}", e);
        }
      }
    }
  }

  async fn fetch_and_store<F, Fut>(
    &self,
    store: &Store,
    request: &Request,
    identity: &RequestIdentity,
    fetcher: F,
  ) -> Result<Handled, NetworkError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse, NetworkError>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.store_copy(store, identity, &response);
        Ok(Handled::from_network(response))
      }
      Err(err) if request.destination == Destination::Image => {
        debug!(%identity, error = %err, "Serving placeholder image");
        Ok(Handled::fallback(StoredResponse::placeholder_image()))
      }
      Err(err) => Err(err),
    }
  }

  /// The routed store first, then the fallback stores.
  fn lookup(&self, store: &Store, identity: &RequestIdentity) -> Option<StoredResponse> {
    if !identity.is_cacheable() {
      return None;
    }
    if let Some(found) = self.lookup_in(store, identity) {
      return Some(found);
    }
    self
      .fallback
      .iter()
      .filter(|name| name.as_str() != store.name())
      .find_map(|name| self.lookup_in(&self.stores.handle(name), identity))
  }

  fn lookup_in(&self, store: &Store, identity: &RequestIdentity) -> Option<StoredResponse> {
    match self.stores.match_entry(store, identity) {
      Ok(found) => found,
      Err(e) => {
        warn!(%identity, store = store.name(), "Cache lookup failed: {}", e);
        None
      }
    }
  }

  /// Only successful responses to safe methods are stored.
  fn store_copy(&self, store: &Store, identity: &RequestIdentity, response: &StoredResponse) {
    if !identity.is_cacheable() || !response.ok() {
      return;
    }
    if let Err(e) = self.stores.put(store, identity, response) {
      warn!(%identity, store = store.name(), "Failed to cache response: {}", e);
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      stores: self.stores.clone(),
      fallback: self.fallback.clone(),
      pending: Arc::clone(&self.pending),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use reqwest::Method;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use url::Url;

  fn layer() -> CacheLayer<SqliteStorage> {
    CacheLayer::new(CacheStores::new(SqliteStorage::in_memory().unwrap()))
  }

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://app.test").unwrap().join(path).unwrap())
  }

  fn ok(body: &str) -> StoredResponse {
    StoredResponse::new(200, vec![], body)
  }

  fn offline() -> NetworkError {
    NetworkError::Unavailable("offline".into())
  }

  #[tokio::test]
  async fn test_cache_first_fetches_once() {
    let layer = layer();
    let store = layer.stores().open_store("assets").unwrap();
    let req = request("/logo.png");
    let calls = AtomicUsize::new(0);

    let first = layer
      .cache_first(&store, &req, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(ok("png"))
      })
      .await
      .unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    let second = layer
      .cache_first(&store, &req, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(ok("different"))
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response, first.response);
  }

  #[tokio::test]
  async fn test_cache_first_propagates_failure_for_scripts() {
    let layer = layer();
    let store = layer.stores().open_store("assets").unwrap();
    let req = request("/app.js").with_destination(Destination::Script);

    let result = layer
      .cache_first(&store, &req, || async { Err(offline()) })
      .await;
    assert_eq!(result.unwrap_err(), offline());
  }

  #[tokio::test]
  async fn test_cache_first_placeholder_for_images() {
    let layer = layer();
    let store = layer.stores().open_store("assets").unwrap();
    let req = request("/photo.jpg").with_destination(Destination::Image);

    let handled = layer
      .cache_first(&store, &req, || async { Err(offline()) })
      .await
      .unwrap();
    assert_eq!(handled.source, ResponseSource::Fallback);
    assert_eq!(handled.response.header("content-type"), Some("image/svg+xml"));
    // The placeholder is never stored
    assert_eq!(layer.stores().entry_count("assets").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_error_statuses_are_not_cached() {
    let layer = layer();
    let store = layer.stores().open_store("assets").unwrap();
    let req = request("/missing.css");

    let handled = layer
      .cache_first(&store, &req, || async {
        Ok(StoredResponse::new(404, vec![], "nope"))
      })
      .await
      .unwrap();
    assert_eq!(handled.response.status, 404);
    assert_eq!(layer.stores().entry_count("assets").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_network_first_prefers_fresh_and_updates_cache() {
    let layer = layer();
    let store = layer.stores().open_store("api").unwrap();
    let req = request("/api/entries");

    layer
      .network_first(&store, &req, None, || async { Ok(ok("old")) })
      .await;
    let handled = layer
      .network_first(&store, &req, None, || async { Ok(ok("new")) })
      .await;

    assert_eq!(handled.source, ResponseSource::Network);
    assert_eq!(handled.response.body, b"new");
    let cached = layer
      .stores()
      .match_entry(&store, &req.identity())
      .unwrap()
      .unwrap();
    assert_eq!(cached, handled.response);
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_latest_copy() {
    let layer = layer();
    let store = layer.stores().open_store("api").unwrap();
    let req = request("/api/entries");

    layer
      .network_first(&store, &req, None, || async { Ok(ok("one")) })
      .await;
    layer
      .network_first(&store, &req, None, || async { Ok(ok("two")) })
      .await;
    let handled = layer
      .network_first(&store, &req, None, || async { Err(offline()) })
      .await;

    assert_eq!(handled.source, ResponseSource::Offline);
    assert_eq!(handled.response.body, b"two");
  }

  #[tokio::test]
  async fn test_network_first_offline_page_then_synthetic() {
    let layer = layer();
    let store = layer.stores().open_store("shell").unwrap();
    let page = request("/offline.html").identity();

    let handled = layer
      .network_first(&store, &request("/reports"), Some(&page), || async {
        Err(offline())
      })
      .await;
    assert_eq!(handled.response.status, 408);

    layer
      .stores()
      .put(&store, &page, &ok("<h1>Offline</h1>"))
      .unwrap();
    let handled = layer
      .network_first(&store, &request("/reports"), Some(&page), || async {
        Err(offline())
      })
      .await;
    assert_eq!(handled.source, ResponseSource::Fallback);
    assert_eq!(handled.response.body, b"<h1>Offline</h1>");
  }

  #[tokio::test]
  async fn test_non_get_requests_bypass_stores() {
    let layer = layer();
    let store = layer.stores().open_store("api").unwrap();
    let req = request("/api/entries").with_method(Method::POST);

    layer
      .network_first(&store, &req, None, || async { Ok(ok("created")) })
      .await;
    assert_eq!(layer.stores().entry_count("api").unwrap(), 0);

    let handled = layer
      .network_first(&store, &req, None, || async { Err(offline()) })
      .await;
    assert_eq!(handled.response.status, 408);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_refreshes_in_background() {
    let layer = layer();
    let store = layer.stores().open_store("static").unwrap();
    let req = request("/app.js");

    let first = layer
      .stale_while_revalidate(&store, &req, || async { Ok(ok("v1")) })
      .await
      .unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    let second = layer
      .stale_while_revalidate(&store, &req, || async { Ok(ok("v2")) })
      .await
      .unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body, b"v1");

    layer.flush_revalidations().await;
    let cached = layer
      .stores()
      .match_entry(&store, &req.identity())
      .unwrap()
      .unwrap();
    assert_eq!(cached.body, b"v2");
  }

  #[tokio::test]
  async fn test_miss_falls_back_to_other_stores() {
    let layer = layer().with_fallback_stores(["shell", "assets", "api"]);
    let shell = layer.stores().open_store("shell").unwrap();
    let assets = layer.stores().open_store("assets").unwrap();
    let icon = request("/icons/icon-192x192.png").with_destination(Destination::Image);
    layer
      .stores()
      .put(&shell, &icon.identity(), &ok("icon"))
      .unwrap();

    let handled = layer
      .cache_first(&assets, &icon, || async { Err(offline()) })
      .await
      .unwrap();
    assert_eq!(handled.source, ResponseSource::Cache);
    assert_eq!(handled.response.body, b"icon");

    // Stores outside the fallback list are never consulted
    let other = layer.stores().open_store("other").unwrap();
    let orphan = request("/orphan.png");
    layer
      .stores()
      .put(&other, &orphan.identity(), &ok("orphan"))
      .unwrap();
    let result = layer
      .cache_first(&assets, &orphan, || async { Err(offline()) })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_finished_revalidations_are_reaped() {
    let layer = layer();
    let store = layer.stores().open_store("static").unwrap();
    let req = request("/app.js");
    layer
      .stale_while_revalidate(&store, &req, || async { Ok(ok("v1")) })
      .await
      .unwrap();

    for _ in 0..200 {
      layer
        .stale_while_revalidate(&store, &req, || async { Ok(ok("v1")) })
        .await
        .unwrap();
      tokio::task::yield_now().await;
    }

    assert!(layer.pending_revalidations() < 10);
    layer.flush_revalidations().await;
    assert_eq!(layer.pending_revalidations(), 0);
  }

  #[tokio::test]
  async fn test_failed_revalidation_keeps_copy() {
    let layer = layer();
    let store = layer.stores().open_store("static").unwrap();
    let req = request("/app.css");

    layer
      .stale_while_revalidate(&store, &req, || async { Ok(ok("v1")) })
      .await
      .unwrap();
    layer
      .stale_while_revalidate(&store, &req, || async { Err(offline()) })
      .await
      .unwrap();
    layer.flush_revalidations().await;

    let cached = layer
      .stores()
      .match_entry(&store, &req.identity())
      .unwrap()
      .unwrap();
    assert_eq!(cached.body, b"v1");
  }
}
