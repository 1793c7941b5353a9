//! Core types shared by the storage backend, the store manager and the strategies.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use serde::Deserialize;
use std::str::FromStr;

use crate::worker::types::{RequestIdentity, StoredResponse};

/// A stored response together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: StoredResponse,
  /// When the entry was (last) written
  pub cached_at: DateTime<Utc>,
  /// Insertion order across the whole backend; bumped on overwrite
  pub seq: i64,
}

/// Entry metadata without the body, used for expiration sweeps.
#[derive(Debug, Clone)]
pub struct EntryMeta {
  pub identity: RequestIdentity,
  pub cached_at: DateTime<Utc>,
  pub seq: i64,
}

/// Optional size and age limits for one store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ExpirationPolicy {
  /// Keep at most this many entries, dropping the oldest writes first
  pub max_entries: Option<usize>,
  /// Entries older than this are treated as missing
  pub max_age_secs: Option<u64>,
}

impl ExpirationPolicy {
  pub fn is_unbounded(&self) -> bool {
    self.max_entries.is_none() && self.max_age_secs.is_none()
  }

  /// Whether an entry written at `cached_at` has outlived `max_age_secs`.
  ///
  /// Ages too large to represent never expire.
  pub fn is_expired(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let Some(max_age) = self
      .max_age_secs
      .and_then(|secs| i64::try_from(secs).ok())
      .and_then(Duration::try_seconds)
    else {
      return false;
    };
    now - cached_at > max_age
  }
}

/// How far a generation got, persisted next to its stores so a later
/// process can tell an installed generation from an aborted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMarker {
  /// Shell fully written; waiting to activate
  Installed,
  Activated,
}

impl GenerationMarker {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installed => "installed",
      Self::Activated => "activated",
    }
  }
}

impl std::fmt::Display for GenerationMarker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for GenerationMarker {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "installed" => Ok(Self::Installed),
      "activated" => Ok(Self::Activated),
      other => Err(eyre!("Unknown generation marker: {}", other)),
    }
  }
}

/// Result of a strategy, including where the response came from.
#[derive(Debug, Clone)]
pub struct Handled {
  pub response: StoredResponse,
  pub source: ResponseSource,
}

impl Handled {
  pub fn from_network(response: StoredResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(response: StoredResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
    }
  }

  pub fn offline(response: StoredResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Offline,
    }
  }

  pub fn fallback(response: StoredResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Fallback,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Served from a store without touching the network
  Cache,
  /// Network failed, serving the last stored copy
  Offline,
  /// Nothing available: offline page, placeholder or synthetic error
  Fallback,
}

impl std::fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Fallback => "fallback",
    };
    f.write_str(s)
  }
}
