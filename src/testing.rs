//! Scripted fetcher for exercising the worker without a network.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::NetworkError;
use crate::worker::types::{Request, StoredResponse};
use crate::worker::Fetcher;

/// Serves canned responses by URL and counts every network attempt.
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
  routes: Arc<Mutex<HashMap<String, StoredResponse>>>,
  offline: Arc<AtomicBool>,
  calls: Arc<AtomicUsize>,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `body` with status 200 for `url`.
  pub fn serve(&self, url: &str, body: &str) {
    self.respond(url, StoredResponse::new(200, vec![], body));
  }

  pub fn respond(&self, url: &str, response: StoredResponse) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Fetcher for ScriptedFetcher {
  fn fetch(
    &self,
    request: &Request,
  ) -> impl Future<Output = Result<StoredResponse, NetworkError>> + Send {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let result = if self.offline.load(Ordering::SeqCst) {
      Err(NetworkError::Unavailable("offline".to_string()))
    } else {
      Ok(
        self
          .routes
          .lock()
          .unwrap()
          .get(request.url.as_str())
          .cloned()
          .unwrap_or_else(|| StoredResponse::new(404, vec![], "not found")),
      )
    };
    async move { result }
  }
}
