//! Named store manager: the only mutation path into the storage backend.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::storage::CacheStorage;
use super::traits::{ExpirationPolicy, GenerationMarker};
use crate::worker::types::{RequestIdentity, StoredResponse};

/// Handle to an opened store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Store {
  name: String,
}

impl Store {
  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Manages named stores on top of a storage backend.
pub struct CacheStores<S: CacheStorage> {
  storage: Arc<S>,
  /// Per-store limits; stores without an entry are unbounded
  expiration: HashMap<String, ExpirationPolicy>,
}

impl<S: CacheStorage> CacheStores<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      expiration: HashMap::new(),
    }
  }

  /// Apply size and age limits to the store called `name`.
  pub fn with_expiration(mut self, name: impl Into<String>, policy: ExpirationPolicy) -> Self {
    if !policy.is_unbounded() {
      self.expiration.insert(name.into(), policy);
    }
    self
  }

  /// Return a handle to the named store, creating it if absent.
  pub fn open_store(&self, name: &str) -> Result<Store> {
    self.storage.create_store(name)?;
    Ok(Store {
      name: name.to_string(),
    })
  }

  /// A handle to `name` without creating it; writes through it create the
  /// store implicitly.
  pub(crate) fn handle(&self, name: &str) -> Store {
    Store {
      name: name.to_string(),
    }
  }

  /// Insert or overwrite the response for an identity.
  pub fn put(
    &self,
    store: &Store,
    identity: &RequestIdentity,
    response: &StoredResponse,
  ) -> Result<()> {
    self.storage.put_entry(&store.name, identity, response)?;
    self.trim(store)
  }

  /// Write a batch into the named store in one step, creating the store with
  /// it. On error nothing is written and no store is created.
  pub fn put_all(
    &self,
    name: &str,
    entries: &[(RequestIdentity, StoredResponse)],
  ) -> Result<Store> {
    self.storage.put_entries(name, entries)?;
    let store = self.handle(name);
    self.trim(&store)?;
    Ok(store)
  }

  /// Look up an identity. Absence is `Ok(None)`.
  pub fn match_entry(
    &self,
    store: &Store,
    identity: &RequestIdentity,
  ) -> Result<Option<StoredResponse>> {
    self.match_entry_at(store, identity, Utc::now())
  }

  pub(crate) fn match_entry_at(
    &self,
    store: &Store,
    identity: &RequestIdentity,
    now: DateTime<Utc>,
  ) -> Result<Option<StoredResponse>> {
    let Some(entry) = self.storage.get_entry(&store.name, identity)? else {
      return Ok(None);
    };

    if let Some(policy) = self.expiration.get(&store.name) {
      if policy.is_expired(entry.cached_at, now) {
        debug!(store = %store.name, %identity, "Dropping expired entry");
        self.storage.delete_entry(&store.name, identity)?;
        return Ok(None);
      }
    }

    Ok(Some(entry.response))
  }

  /// Remove a store and everything in it. Returns whether it existed.
  pub fn delete_store(&self, name: &str) -> Result<bool> {
    self.storage.delete_store(name)
  }

  /// Names of all stores currently present.
  pub fn list_store_names(&self) -> Result<Vec<String>> {
    self.storage.store_names()
  }

  pub fn has_store(&self, name: &str) -> Result<bool> {
    self.storage.has_store(name)
  }

  pub fn entry_count(&self, name: &str) -> Result<usize> {
    self.storage.entry_count(name)
  }

  /// Persist lifecycle progress for the generation owning `shell_store`.
  pub fn mark_generation(&self, shell_store: &str, marker: GenerationMarker) -> Result<()> {
    self.storage.set_marker(shell_store, marker)
  }

  pub fn generation_marker(&self, shell_store: &str) -> Result<Option<GenerationMarker>> {
    self.storage.marker(shell_store)
  }

  /// Drop the oldest writes beyond `max_entries`.
  fn trim(&self, store: &Store) -> Result<()> {
    let Some(max_entries) = self
      .expiration
      .get(&store.name)
      .and_then(|policy| policy.max_entries)
    else {
      return Ok(());
    };

    let entries = self.storage.entries(&store.name)?;
    if entries.len() <= max_entries {
      return Ok(());
    }

    let excess = entries.len() - max_entries;
    for meta in entries.into_iter().take(excess) {
      debug!(store = %store.name, identity = %meta.identity, "Evicting entry over max_entries");
      self.storage.delete_entry(&store.name, &meta.identity)?;
    }

    Ok(())
  }
}

impl<S: CacheStorage> Clone for CacheStores<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      expiration: self.expiration.clone(),
    }
  }
}
